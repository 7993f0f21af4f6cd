//! Macro syntax embedded in connector text fields.
//!
//! - `${source::<path>}` references the table of another source. A path
//!   without `.` is relative to the stage that declares it.
//! - `${file::<name>}` inlines an embedded file of the connector.
//! - `%{HOSTNAME}`, `%{USERNAME}`, `%{PASSWORD}` are host macros expanded by
//!   extensions right before execution.

use crate::collections::OrderedMap;
use regex::{Captures, Regex};
use std::sync::OnceLock;

fn source_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{source::([^\s}]+)\}").expect("valid source reference pattern"))
}

fn file_ref_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{file::([^\s}]+)\}").expect("valid file reference pattern"))
}

/// Every `${source::...}` occurrence in `text`, as written.
pub fn find_source_references(text: &str) -> Vec<String> {
    source_ref_pattern().find_iter(text).map(|m| m.as_str().to_string()).collect()
}

/// Whether the whole (trimmed) value is a single source reference.
pub fn is_source_reference(value: &str) -> bool {
    let value = value.trim();
    source_ref_pattern().find(value).is_some_and(|m| m.start() == 0 && m.end() == value.len())
}

/// Registry path designated by a reference, qualified against `stage_prefix`
/// when the reference is relative.
pub fn qualify_reference(reference: &str, stage_prefix: &str) -> Option<String> {
    let path = source_ref_pattern().captures(reference.trim())?.get(1)?.as_str();
    Some(qualify_path(path, stage_prefix))
}

pub fn qualify_path(path: &str, stage_prefix: &str) -> String {
    if path.contains('.') || stage_prefix.is_empty() {
        path.to_string()
    } else {
        format!("{stage_prefix}.{path}")
    }
}

/// Replaces every source reference with what `resolve` returns for its
/// qualified path. Unresolved references become empty strings.
pub fn replace_source_references(text: &str, stage_prefix: &str, resolve: impl Fn(&str) -> Option<String>) -> String {
    source_ref_pattern()
        .replace_all(text, |caps: &Captures| {
            let path = qualify_path(&caps[1], stage_prefix);
            resolve(&path).unwrap_or_default()
        })
        .into_owned()
}

/// Inlines embedded files. Unknown files are left untouched.
pub fn replace_file_references(text: &str, files: &OrderedMap<String>) -> String {
    file_ref_pattern()
        .replace_all(text, |caps: &Captures| match files.get(&caps[1]) {
            Some(content) => content.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}

pub fn replace_host_macros(text: &str, hostname: &str, username: Option<&str>, password: Option<&str>) -> String {
    let mut result = text.replace("%{HOSTNAME}", hostname);
    if let Some(username) = username {
        result = result.replace("%{USERNAME}", username);
    }
    if let Some(password) = password {
        result = result.replace("%{PASSWORD}", password);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_references_are_qualified_against_the_stage() {
        let prefix = "monitors.fan.collect.sources";
        assert_eq!(
            qualify_reference("${source::fanTable}", prefix).as_deref(),
            Some("monitors.fan.collect.sources.fanTable")
        );
        assert_eq!(
            qualify_reference("${source::monitors.enclosure.discovery.sources.source(1)}", prefix).as_deref(),
            Some("monitors.enclosure.discovery.sources.source(1)")
        );
        assert_eq!(qualify_reference("a;b;c", prefix), None);
    }

    #[test]
    fn detects_whole_value_references_only() {
        assert!(is_source_reference(" ${source::beforeAll.ids} "));
        assert!(!is_source_reference("prefix ${source::ids}"));
        assert!(!is_source_reference("1;2;3"));
    }

    #[test]
    fn replaces_references_and_files() {
        let replaced = replace_source_references("ids=${source::ids}, missing=${source::nope}", "beforeAll", |path| {
            (path == "beforeAll.ids").then(|| "1;2".to_string())
        });
        assert_eq!(replaced, "ids=1;2, missing=");

        let files: OrderedMap<String> = [("script.awk", "{ print $1 }".to_string())].into_iter().collect();
        assert_eq!(replace_file_references("awk '${file::script.awk}'", &files), "awk '{ print $1 }'");
        assert_eq!(replace_file_references("${file::unknown}", &files), "${file::unknown}");
    }

    #[test]
    fn host_macros() {
        assert_eq!(
            replace_host_macros("ssh %{USERNAME}@%{HOSTNAME}", "srv-01", Some("admin"), None),
            "ssh admin@srv-01"
        );
    }
}
