//! Execution order of the sources of one job stage.
//!
//! Prerequisites come from the stage's explicit dependency map and from the
//! `${source::...}` references found in each source. Only references to
//! sibling sources of the same stage constrain the order: tables of other
//! stages (`beforeAll`, discovery) are already registered when the stage runs.

use crate::collections::OrderedMap;
use crate::connector::Source;
use crate::error::EngineError;
use crate::macros;
use std::collections::{BTreeSet, HashMap, HashSet};

/// Prerequisite sibling keys of every source of the stage.
pub fn prerequisites(
    sources: &OrderedMap<Source>,
    dependencies: &HashMap<String, BTreeSet<String>>,
    stage_prefix: &str,
) -> HashMap<String, BTreeSet<String>> {
    let sibling = |path: &str| -> Option<String> {
        let key = path.strip_prefix(stage_prefix)?.strip_prefix('.')?;
        sources.contains_key(key).then(|| key.to_string())
    };

    sources
        .iter()
        .map(|(key, source)| {
            let declared = dependencies
                .get(key)
                .into_iter()
                .flatten()
                .filter_map(|dep| {
                    let path = if macros::is_source_reference(dep) {
                        macros::qualify_reference(dep, stage_prefix)?
                    } else {
                        macros::qualify_path(dep, stage_prefix)
                    };
                    sibling(&path)
                });
            let referenced = source
                .references()
                .into_iter()
                .filter_map(|r| macros::qualify_reference(&r, stage_prefix))
                .filter_map(|path| sibling(&path));

            (key.to_string(), declared.chain(referenced).collect())
        })
        .collect()
}

/// Resolves the order in which the sources of a stage run.
///
/// Starting sequence: the keys of `execution_order` that exist, then every
/// other key in declaration order. Each round emits the first key of that
/// sequence whose prerequisites were all emitted, so the declared order is
/// kept wherever no dependency contradicts it. A round without progress
/// means a cycle (self references included) and fails the whole stage.
pub fn resolve_order(
    job: &str,
    sources: &OrderedMap<Source>,
    execution_order: &[String],
    dependencies: &HashMap<String, BTreeSet<String>>,
    stage_prefix: &str,
) -> Result<Vec<String>, EngineError> {
    let prerequisites = prerequisites(sources, dependencies, stage_prefix);

    let mut seen = HashSet::new();
    let mut remaining: Vec<String> = execution_order
        .iter()
        .map(String::as_str)
        .chain(sources.keys())
        .filter(|key| sources.contains_key(key) && seen.insert(key.to_string()))
        .map(str::to_string)
        .collect();

    let mut emitted: Vec<String> = Vec::with_capacity(remaining.len());
    let mut done: HashSet<String> = HashSet::new();

    while !remaining.is_empty() {
        let ready = remaining.iter().position(|key| {
            prerequisites
                .get(key)
                .map_or(true, |deps| deps.iter().all(|dep| done.contains(dep)))
        });

        let Some(index) = ready else {
            return Err(EngineError::CyclicDependency {
                job: job.to_string(),
                cycle: remaining.join(", "),
            });
        };

        let key = remaining.remove(index);
        done.insert(key.clone());
        emitted.push(key);
    }

    Ok(emitted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::source::{CopySource, StaticSource};
    use crate::connector::SourceDefinition;

    const PREFIX: &str = "monitors.disk.collect.sources";

    fn copy_of(from: &str) -> Source {
        Source::new(SourceDefinition::Copy(CopySource { from: format!("${{source::{from}}}") }))
    }

    fn literal() -> Source {
        Source::new(SourceDefinition::Static(StaticSource { value: "1;2".into() }))
    }

    fn resolve(sources: &OrderedMap<Source>, order: &[&str]) -> Result<Vec<String>, EngineError> {
        let order: Vec<String> = order.iter().map(|s| s.to_string()).collect();
        resolve_order("disk", sources, &order, &HashMap::new(), PREFIX)
    }

    #[test]
    fn keeps_insertion_order_without_constraints() {
        let sources: OrderedMap<Source> = [("c", literal()), ("a", literal()), ("b", literal())].into_iter().collect();
        assert_eq!(resolve(&sources, &[]).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn declared_order_comes_first_and_unknown_keys_are_ignored() {
        let sources: OrderedMap<Source> = [("a", literal()), ("b", literal()), ("c", literal())].into_iter().collect();
        assert_eq!(resolve(&sources, &["c", "ghost", "a", "c"]).unwrap(), vec!["c", "a", "b"]);
    }

    #[test]
    fn references_move_prerequisites_ahead_of_declared_order() {
        let sources: OrderedMap<Source> =
            [("merged", copy_of("raw")), ("raw", literal()), ("other", literal())].into_iter().collect();
        let order = resolve(&sources, &["merged", "other", "raw"]).unwrap();
        assert_eq!(order, vec!["other", "raw", "merged"]);
    }

    #[test]
    fn explicit_dependencies_accept_keys_and_full_paths() {
        let sources: OrderedMap<Source> = [("a", literal()), ("b", literal()), ("c", literal())].into_iter().collect();
        let dependencies = HashMap::from([
            ("a".to_string(), BTreeSet::from(["c".to_string()])),
            ("b".to_string(), BTreeSet::from([format!("{PREFIX}.a")])),
        ]);
        let order = resolve_order("disk", &sources, &[], &dependencies, PREFIX).unwrap();
        assert_eq!(order, vec!["c", "a", "b"]);
    }

    #[test]
    fn references_to_other_stages_do_not_constrain() {
        let sources: OrderedMap<Source> = [(
            "fromDiscovery",
            copy_of("monitors.disk.discovery.sources.raw"),
        )]
        .into_iter()
        .collect();
        assert_eq!(resolve(&sources, &[]).unwrap(), vec!["fromDiscovery"]);
    }

    #[test]
    fn every_source_follows_its_prerequisites() {
        let sources: OrderedMap<Source> = [
            ("e", copy_of("d")),
            ("d", copy_of("c")),
            ("c", literal()),
            ("b", copy_of("e")),
            ("a", literal()),
        ]
        .into_iter()
        .collect();
        let order = resolve(&sources, &["b", "a"]).unwrap();
        let position = |k: &str| order.iter().position(|o| o == k).unwrap();

        assert_eq!(order.len(), 5);
        assert!(position("c") < position("d"));
        assert!(position("d") < position("e"));
        assert!(position("e") < position("b"));
    }

    #[test]
    fn cycle_fails_deterministically() {
        let sources: OrderedMap<Source> =
            [("a", copy_of("b")), ("b", copy_of("a")), ("c", literal())].into_iter().collect();

        for _ in 0..3 {
            match resolve(&sources, &[]) {
                Err(EngineError::CyclicDependency { job, cycle }) => {
                    assert_eq!(job, "disk");
                    assert_eq!(cycle, "a, b");
                }
                other => panic!("expected a cycle, got {other:?}"),
            }
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let sources: OrderedMap<Source> = [("a", copy_of("a"))].into_iter().collect();
        assert!(matches!(resolve(&sources, &[]), Err(EngineError::CyclicDependency { .. })));
    }
}
