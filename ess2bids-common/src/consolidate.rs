//! Consolidation engine
//!
//! Collapses a field that holds the same value at every child of a scope into
//! a single entry at that scope. Runs bottom-up: scans into sessions, sessions
//! into subjects, subjects into the project. Only narrow-to-broad moves are
//! made; a broader entry is never pushed down.

use crate::field_store::{FieldStore, Scope};
use std::collections::{BTreeMap, BTreeSet, HashSet};

/// Subject -> session -> scan labels known to use one task
///
/// Children of a scope are the union of what the tree lists and what the
/// store already declares fields for.
#[derive(Debug, Clone, Default)]
pub struct ScopeTree {
    subjects: BTreeMap<String, BTreeMap<String, BTreeSet<String>>>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, subject: &str, session: &str, scan: &str) {
        self.subjects
            .entry(subject.to_string())
            .or_default()
            .entry(session.to_string())
            .or_default()
            .insert(scan.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// This tree extended with every scope `store` declares fields at
    fn with_scopes_of(&self, store: &FieldStore) -> ScopeTree {
        let mut tree = self.clone();
        for scope in store.scopes() {
            match scope {
                Scope::Project => {}
                Scope::Subject { subject } => {
                    tree.subjects.entry(subject).or_default();
                }
                Scope::Session { subject, session } => {
                    tree.subjects
                        .entry(subject)
                        .or_default()
                        .entry(session)
                        .or_default();
                }
                Scope::Scan {
                    subject,
                    session,
                    scan,
                } => tree.insert(&subject, &session, &scan),
            }
        }
        tree
    }
}

/// Collapse identical child values into their parent scope, in place
///
/// A field moves up only if every child of the parent declares it and all the
/// declared values are equal. Idempotent.
pub fn consolidate(store: &mut FieldStore, tree: &ScopeTree) {
    let children = tree.with_scopes_of(store);
    let subjects: Vec<&String> = children.subjects.keys().collect();

    for (subject, sessions) in children.subjects.iter().rev() {
        for (session, scans) in sessions.iter().rev() {
            let parent = Scope::session(subject, session);
            let scopes: Vec<Scope> = scans
                .iter()
                .map(|scan| Scope::scan(subject, session, scan))
                .collect();
            for name in names_declared_in(store, &scopes).iter().rev() {
                collapse(store, name, &parent, &scopes);
            }
        }

        let parent = Scope::subject(subject);
        let scopes: Vec<Scope> = sessions
            .keys()
            .map(|session| Scope::session(subject, session))
            .collect();
        for name in names_declared_in(store, &scopes).iter().rev() {
            collapse(store, name, &parent, &scopes);
        }
    }

    let scopes: Vec<Scope> = subjects.iter().map(|s| Scope::subject(s)).collect();
    for name in names_declared_in(store, &scopes) {
        collapse(store, &name, &Scope::Project, &scopes);
    }

    store.sort_canonical();
}

fn collapse(store: &mut FieldStore, name: &str, parent: &Scope, children: &[Scope]) -> bool {
    let mut shared = None;
    for child in children {
        match store.get(name, child) {
            Ok(value) => match shared {
                None => shared = Some(value),
                Some(existing) if existing == value => {}
                Some(_) => return false,
            },
            Err(_) => return false,
        }
    }
    let Some(value) = shared.cloned() else {
        return false;
    };

    store.remove_at_each(name, children);
    tracing::trace!(field = name, scope = %parent, "Consolidated field");
    store.set(name, value, parent.clone());
    true
}

fn names_declared_in(store: &FieldStore, scopes: &[Scope]) -> BTreeSet<String> {
    let scopes: HashSet<&Scope> = scopes.iter().collect();
    store
        .iter()
        .filter(|(key, _)| scopes.contains(&key.scope))
        .map(|(key, _)| key.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const SCAN_A: &str = "eeg/sub-01_ses-01_task-rest_run-1_eeg.set";
    const SCAN_B: &str = "eeg/sub-01_ses-01_task-rest_run-2_eeg.set";
    const SCAN_C: &str = "eeg/sub-02_ses-01_task-rest_run-1_eeg.set";

    fn two_subject_tree() -> ScopeTree {
        let mut tree = ScopeTree::new();
        tree.insert("01", "01", SCAN_A);
        tree.insert("01", "01", SCAN_B);
        tree.insert("02", "01", SCAN_C);
        tree
    }

    #[test]
    fn test_identical_scan_values_collapse_to_subject() {
        let tree = two_subject_tree();
        let mut store = FieldStore::new();
        store.set("F", json!("v"), Scope::scan("01", "01", SCAN_A));
        store.set("F", json!("v"), Scope::scan("01", "01", SCAN_B));
        store.set("F", json!("w"), Scope::scan("02", "01", SCAN_C));

        consolidate(&mut store, &tree);

        assert_eq!(store.get("F", &Scope::subject("01")).unwrap(), &json!("v"));
        assert_eq!(store.get("F", &Scope::subject("02")).unwrap(), &json!("w"));
        assert!(!store.contains("F", &Scope::scan("01", "01", SCAN_A)));
        assert!(!store.contains("F", &Scope::session("01", "01")));
        assert!(!store.contains("F", &Scope::Project));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_differing_scan_values_are_left_alone() {
        let tree = two_subject_tree();
        let mut store = FieldStore::new();
        store.set("F", json!(1), Scope::scan("01", "01", SCAN_A));
        store.set("F", json!(2), Scope::scan("01", "01", SCAN_B));

        consolidate(&mut store, &tree);

        assert_eq!(store.get("F", &Scope::scan("01", "01", SCAN_A)).unwrap(), &json!(1));
        assert_eq!(store.get("F", &Scope::scan("01", "01", SCAN_B)).unwrap(), &json!(2));
        assert!(!store.contains("F", &Scope::session("01", "01")));
    }

    #[test]
    fn test_missing_child_blocks_collapse() {
        let tree = two_subject_tree();
        let mut store = FieldStore::new();
        store.set("F", json!(1), Scope::scan("01", "01", SCAN_A));

        consolidate(&mut store, &tree);

        assert!(store.contains("F", &Scope::scan("01", "01", SCAN_A)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_agreeing_subjects_collapse_to_project() {
        let tree = two_subject_tree();
        let mut store = FieldStore::new();
        for (sub, scan) in [("01", SCAN_A), ("01", SCAN_B), ("02", SCAN_C)] {
            store.set("SamplingFrequency", json!(256.0), Scope::scan(sub, "01", scan));
        }

        consolidate(&mut store, &tree);

        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get("SamplingFrequency", &Scope::Project).unwrap(),
            &json!(256.0)
        );
    }

    #[test]
    fn test_consolidation_is_idempotent() {
        let tree = two_subject_tree();
        let mut store = FieldStore::new();
        store.set("TaskName", json!("rest"), Scope::Project);
        store.set("F", json!(1), Scope::scan("01", "01", SCAN_A));
        store.set("F", json!(2), Scope::scan("01", "01", SCAN_B));
        store.set("G", json!("x"), Scope::scan("01", "01", SCAN_A));
        store.set("G", json!("x"), Scope::scan("01", "01", SCAN_B));
        store.set("G", json!("y"), Scope::scan("02", "01", SCAN_C));

        consolidate(&mut store, &tree);
        let once = store.clone();
        consolidate(&mut store, &tree);

        assert_eq!(store, once);
    }

    #[test]
    fn test_store_scopes_outside_tree_count_as_children() {
        let mut tree = ScopeTree::new();
        tree.insert("01", "01", SCAN_A);
        let mut store = FieldStore::new();
        store.set("F", json!(1), Scope::subject("01"));
        store.set("F", json!(2), Scope::subject("03"));

        consolidate(&mut store, &tree);

        assert!(store.contains("F", &Scope::subject("01")));
        assert!(store.contains("F", &Scope::subject("03")));
        assert!(!store.contains("F", &Scope::Project));
    }
}
