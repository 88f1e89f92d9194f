//! Hierarchical field store
//!
//! Holds a task's sidecar fields. Every entry is tagged with the scope it is
//! declared at: the whole project, one subject, one session of a subject, or
//! one scan of a session. Reads are exact-scope only; an entry declared at a
//! broader scope is never returned for a narrower request.

use crate::{Error, Result};
use indexmap::IndexMap;
use serde_json::{Map, Value};
use std::collections::{BTreeSet, HashSet};
use std::fmt;

/// Ordered key/value mapping used for every flat field dictionary
pub type Fields = Map<String, Value>;

/// Modality-agnostic sidecar fields, in canonical output order
pub const GENERIC_FIELDS: &[&str] = &[
    "TaskName",
    "InstitutionName",
    "InstitutionAddress",
    "Manufacturer",
    "ManufacturersModelName",
    "SoftwareVersions",
    "TaskDescription",
    "Instructions",
    "CogAtlasID",
    "DeviceSerialNumber",
];

/// EEG sidecar fields, in canonical output order
pub const EEG_FIELDS: &[&str] = &[
    "EEGReference",
    "SamplingFrequency",
    "PowerLineFrequency",
    "SoftwareFilters",
    "CapManufacturer",
    "CapManufacturersModelName",
    "EEGChannelCount",
    "ECGChannelCount",
    "EMGChannelCount",
    "EOGChannelCount",
    "MiscChannelCount",
    "TriggerChannelCount",
    "RecordingDuration",
    "RecordingType",
    "EpochLength",
    "HeadCircumference",
    "EEGPlacementScheme",
    "EEGGround",
    "HardwareFilters",
    "SubjectArtefactDescription",
];

/// Modality-specific field tables, ranked after the generic fields
pub const MODALITY_FIELDS: &[(&str, &[&str])] = &[("eeg", EEG_FIELDS)];

/// Canonical rank of a field name; unknown names rank after every known one
pub fn field_order(name: &str) -> usize {
    if let Some(pos) = GENERIC_FIELDS.iter().position(|f| *f == name) {
        return pos;
    }
    let mut lower = GENERIC_FIELDS.len();
    for (_, fields) in MODALITY_FIELDS {
        if let Some(pos) = fields.iter().position(|f| *f == name) {
            return lower + pos;
        }
        lower += fields.len();
    }
    lower + 1
}

/// Specificity level of a field
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    Project,
    Subject {
        subject: String,
    },
    Session {
        subject: String,
        session: String,
    },
    Scan {
        subject: String,
        session: String,
        scan: String,
    },
}

impl Scope {
    pub fn subject(subject: &str) -> Self {
        Scope::Subject {
            subject: subject.to_string(),
        }
    }

    pub fn session(subject: &str, session: &str) -> Self {
        Scope::Session {
            subject: subject.to_string(),
            session: session.to_string(),
        }
    }

    pub fn scan(subject: &str, session: &str, scan: &str) -> Self {
        Scope::Scan {
            subject: subject.to_string(),
            session: session.to_string(),
            scan: scan.to_string(),
        }
    }

    /// Build a scope from optional identifiers
    ///
    /// A session requires a subject, a scan requires both.
    pub fn from_parts(
        subject: Option<&str>,
        session: Option<&str>,
        scan: Option<&str>,
    ) -> Result<Self> {
        match (subject, session, scan) {
            (None, None, None) => Ok(Scope::Project),
            (Some(subject), None, None) => Ok(Scope::subject(subject)),
            (Some(subject), Some(session), None) => Ok(Scope::session(subject, session)),
            (Some(subject), Some(session), Some(scan)) => {
                Ok(Scope::scan(subject, session, scan))
            }
            _ => Err(Error::InvalidInput(format!(
                "scope must be a prefix of subject/session/scan (got subject={:?}, session={:?}, scan={:?})",
                subject, session, scan
            ))),
        }
    }

    /// Number of scope identifiers (0 for project-wide)
    pub fn depth(&self) -> usize {
        match self {
            Scope::Project => 0,
            Scope::Subject { .. } => 1,
            Scope::Session { .. } => 2,
            Scope::Scan { .. } => 3,
        }
    }

    /// The next broader scope, `None` for project-wide
    pub fn parent(&self) -> Option<Scope> {
        match self {
            Scope::Project => None,
            Scope::Subject { .. } => Some(Scope::Project),
            Scope::Session { subject, .. } => Some(Scope::subject(subject)),
            Scope::Scan {
                subject, session, ..
            } => Some(Scope::session(subject, session)),
        }
    }

    pub fn subject_id(&self) -> Option<&str> {
        match self {
            Scope::Project => None,
            Scope::Subject { subject }
            | Scope::Session { subject, .. }
            | Scope::Scan { subject, .. } => Some(subject),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            Scope::Session { session, .. } | Scope::Scan { session, .. } => Some(session),
            _ => None,
        }
    }

    pub fn scan_label(&self) -> Option<&str> {
        match self {
            Scope::Scan { scan, .. } => Some(scan),
            _ => None,
        }
    }

    /// True when `self` lies strictly below `ancestor`
    pub fn is_within(&self, ancestor: &Scope) -> bool {
        let mut current = self.parent();
        while let Some(scope) = current {
            if &scope == ancestor {
                return true;
            }
            current = scope.parent();
        }
        false
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Project => write!(f, "root"),
            Scope::Subject { subject } => write!(f, "sub-{}", subject),
            Scope::Session { subject, session } => write!(f, "sub-{}/ses-{}", subject, session),
            Scope::Scan {
                subject,
                session,
                scan,
            } => write!(f, "sub-{}/ses-{}/{}", subject, session, scan),
        }
    }
}

/// Composite key: declaration scope plus field name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FieldKey {
    pub scope: Scope,
    pub name: String,
}

/// Flat store of scoped fields for one task
///
/// Entries keep their first insertion position; overwriting a key keeps its
/// slot. `sort_canonical` reorders entries by `field_order` (stable).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldStore {
    entries: IndexMap<FieldKey, Value>,
}

impl FieldStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&FieldKey, &Value)> {
        self.entries.iter()
    }

    fn key(name: &str, scope: &Scope) -> FieldKey {
        FieldKey {
            scope: scope.clone(),
            name: name.to_string(),
        }
    }

    /// Insert or overwrite `name` at exactly `scope`
    pub fn set(&mut self, name: &str, value: Value, scope: Scope) {
        self.entries.insert(
            FieldKey {
                scope,
                name: name.to_string(),
            },
            value,
        );
    }

    /// Insert or overwrite using optional scope identifiers
    pub fn set_at(
        &mut self,
        name: &str,
        value: Value,
        subject: Option<&str>,
        session: Option<&str>,
        scan: Option<&str>,
    ) -> Result<()> {
        let scope = Scope::from_parts(subject, session, scan)?;
        self.set(name, value, scope);
        Ok(())
    }

    /// Set `name` at `scope` and drop every entry of `name` declared below it
    ///
    /// Returns the scopes whose entries were dropped.
    pub fn set_overriding(&mut self, name: &str, value: Value, scope: Scope) -> Vec<Scope> {
        let mut dropped = Vec::new();
        self.entries.retain(|k, _| {
            if k.name == name && k.scope.is_within(&scope) {
                dropped.push(k.scope.clone());
                false
            } else {
                true
            }
        });
        self.set(name, value, scope);
        dropped
    }

    /// Merge every field of `fields` in at `scope`
    pub fn extend_at(&mut self, scope: &Scope, fields: Fields) {
        for (name, value) in fields {
            self.set(&name, value, scope.clone());
        }
    }

    /// Value declared at exactly `scope`
    pub fn get(&self, name: &str, scope: &Scope) -> Result<&Value> {
        self.entries
            .get(&Self::key(name, scope))
            .ok_or_else(|| Error::KeyNotFound(format!("{} at {}", name, scope)))
    }

    pub fn get_at(
        &self,
        name: &str,
        subject: Option<&str>,
        session: Option<&str>,
        scan: Option<&str>,
    ) -> Result<&Value> {
        let scope = Scope::from_parts(subject, session, scan)?;
        self.get(name, &scope)
    }

    pub fn contains(&self, name: &str, scope: &Scope) -> bool {
        self.entries.contains_key(&Self::key(name, scope))
    }

    /// True if `name` is declared at any scope
    pub fn contains_name(&self, name: &str) -> bool {
        self.entries.keys().any(|k| k.name == name)
    }

    /// Every field declared at exactly `scope`, in store order
    pub fn get_all(&self, scope: &Scope) -> Fields {
        self.entries
            .iter()
            .filter(|(k, _)| &k.scope == scope)
            .map(|(k, v)| (k.name.clone(), v.clone()))
            .collect()
    }

    pub fn remove(&mut self, name: &str, scope: &Scope) -> Option<Value> {
        self.entries.shift_remove(&Self::key(name, scope))
    }

    /// Remove `name` at each of `scopes` in one pass
    pub fn remove_at_each(&mut self, name: &str, scopes: &[Scope]) -> usize {
        let scopes: HashSet<&Scope> = scopes.iter().collect();
        let before = self.entries.len();
        self.entries
            .retain(|k, _| k.name != name || !scopes.contains(&k.scope));
        before - self.entries.len()
    }

    /// Remove `name` at every scope; returns how many entries went away
    pub fn remove_name(&mut self, name: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|k, _| k.name != name);
        before - self.entries.len()
    }

    /// Distinct scopes that hold at least one entry
    pub fn scopes(&self) -> BTreeSet<Scope> {
        self.entries.keys().map(|k| k.scope.clone()).collect()
    }

    /// Re-key scan-scoped entries after a scan label changed
    pub fn rename_scan(&mut self, subject: &str, session: &str, old_label: &str, new_label: &str) {
        let old = Scope::scan(subject, session, old_label);
        if !self.entries.keys().any(|k| k.scope == old) {
            return;
        }
        self.entries = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|(mut key, value)| {
                if key.scope == old {
                    key.scope = Scope::scan(subject, session, new_label);
                }
                (key, value)
            })
            .collect();
    }

    /// Stable sort by canonical field order
    pub fn sort_canonical(&mut self) {
        self.entries
            .sort_by(|a, _, b, _| field_order(&a.name).cmp(&field_order(&b.name)));
    }

    /// Same entries regardless of their order
    pub fn equivalent(&self, other: &FieldStore) -> bool {
        self.len() == other.len()
            && self
                .entries
                .iter()
                .all(|(k, v)| other.entries.get(k) == Some(v))
    }
}
