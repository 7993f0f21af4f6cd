//! `$n` column references (1-based) shared by computes and mappings.

use regex::{Captures, Regex};
use std::sync::OnceLock;

fn whole_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^\s*\$(\d+)\s*$").expect("valid column pattern"))
}

fn inline_column_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$(\d+)").expect("valid inline column pattern"))
}

/// Column number of a value that is exactly `$n`.
pub fn column_number(value: &str) -> Option<usize> {
    whole_column_pattern().captures(value)?.get(1)?.as_str().parse().ok()
}

pub fn contains_column_references(value: &str) -> bool {
    inline_column_pattern().is_match(value)
}

/// Cell at 1-based `column`. `None` when out of range.
pub fn cell(row: &[String], column: usize) -> Option<&str> {
    column.checked_sub(1).and_then(|i| row.get(i)).map(String::as_str)
}

/// `$n` operands read the row, anything else is a literal.
pub fn resolve_operand(value: &str, row: &[String]) -> Option<String> {
    match column_number(value) {
        Some(column) => cell(row, column).map(str::to_string),
        None => Some(value.to_string()),
    }
}

/// Replaces every `$n` in `value`. Out-of-range columns become empty.
pub fn replace_column_references(value: &str, row: &[String]) -> String {
    inline_column_pattern()
        .replace_all(value, |caps: &Captures| {
            caps[1]
                .parse()
                .ok()
                .and_then(|column| cell(row, column))
                .unwrap_or_default()
                .to_string()
        })
        .into_owned()
}

/// Formats a computed number: integral values without a fractional part.
pub fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> Vec<String> {
        vec!["fan-1".into(), "3500".into(), "ok".into()]
    }

    #[test]
    fn whole_and_inline_references() {
        assert_eq!(column_number(" $2 "), Some(2));
        assert_eq!(column_number("$2 rpm"), None);
        assert_eq!(resolve_operand("$2", &row()).as_deref(), Some("3500"));
        assert_eq!(resolve_operand("$9", &row()), None);
        assert_eq!(resolve_operand("1000", &row()).as_deref(), Some("1000"));
        assert_eq!(replace_column_references("Fan $1 ($3) $7", &row()), "Fan fan-1 (ok) ");
    }

    #[test]
    fn number_formatting() {
        assert_eq!(format_number(3.0), "3");
        assert_eq!(format_number(0.25), "0.25");
        assert_eq!(format_number(-12.0), "-12");
    }
}
