//! In-memory dataset model
//!
//! A `Project` owns subjects, their sessions and scans, and one field store
//! per task. Entity containers are insertion-ordered maps, so iteration order
//! equals assignment order no matter how many digits an id has.

use crate::consolidate::{consolidate, ScopeTree};
use crate::field_store::{FieldStore, Fields, Scope};
use crate::tabular::FieldRecord;
use serde::{Deserialize, Serialize};
use indexmap::IndexMap;
use serde_json::{json, Value};
use std::borrow::Cow;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::debug;

/// Reserved session id for subjects without distinguishable sessions
pub const SESSION_AGNOSTIC: &str = ".";

/// BIDS version targeted when the configuration does not say otherwise
pub const BIDS_VERSION: &str = "1.2.1";

/// Channel type vocabulary accepted in channels.tsv
pub const CHANNEL_TYPES: &[&str] = &[
    "AUDIO", "EEG", "EOG", "ECG", "EMG", "EYEGAZE", "GSR", "HEOG", "MISC", "PUPIL", "REF",
    "RESP", "SYSCLOCK", "TEMP", "TRIG", "VEOG",
];

/// Channel-count fields recomputed from channel types before every export
const CHANNEL_COUNTS: &[(&str, &str)] = &[
    ("EEGChannelCount", "EEG"),
    ("EOGChannelCount", "EOG"),
    ("ECGChannelCount", "ECG"),
    ("EMGChannelCount", "EMG"),
    ("MiscChannelCount", "MISC"),
];

/// Zero-padded sequence id, starting at 1
pub fn sequence_id(index: usize) -> String {
    format!("{:02}", index + 1)
}

/// Order of two entity ids: numeric ids by value, anything else as text
pub fn compare_ids(a: &str, b: &str) -> Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// One electrode position
#[derive(Debug, Clone, PartialEq)]
pub struct Electrode {
    pub name: String,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl FieldRecord for Electrode {
    fn record(&self) -> Cow<'_, Fields> {
        let mut fields = Fields::new();
        fields.insert("x".into(), json!(self.x));
        fields.insert("y".into(), json!(self.y));
        fields.insert("z".into(), json!(self.z));
        Cow::Owned(fields)
    }
}

/// One channel of a recording
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    pub name: String,
    /// `type`, `units`, `sampling_frequency` and any extra columns
    pub fields: Fields,
}

impl Channel {
    pub fn new(name: &str, kind: &str, units: &str, sampling_frequency: &str) -> Self {
        let mut fields = Fields::new();
        fields.insert("type".into(), Value::String(kind.to_string()));
        fields.insert("units".into(), Value::String(units.to_string()));
        fields.insert(
            "sampling_frequency".into(),
            Value::String(sampling_frequency.to_string()),
        );
        Self {
            name: name.to_string(),
            fields,
        }
    }

    pub fn channel_type(&self) -> Option<&str> {
        self.fields.get("type").and_then(Value::as_str)
    }
}

impl FieldRecord for Channel {
    fn record(&self) -> Cow<'_, Fields> {
        Cow::Borrowed(&self.fields)
    }
}

/// One row of an events table
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub onset: String,
    pub duration: String,
    pub event_code: String,
    pub hed: Option<String>,
}

impl Event {
    /// Rebuild an event from an imported row; absent cells become `n/a`
    pub fn from_record(record: &Fields) -> Self {
        let cell = |name: &str| {
            record
                .get(name)
                .and_then(Value::as_str)
                .unwrap_or(crate::tabular::NOT_AVAILABLE)
                .to_string()
        };
        Self {
            onset: cell("onset"),
            duration: cell("duration"),
            event_code: cell("event_code"),
            hed: record.get("HED").and_then(Value::as_str).map(str::to_string),
        }
    }
}

impl FieldRecord for Event {
    fn record(&self) -> Cow<'_, Fields> {
        let mut fields = Fields::new();
        fields.insert("onset".into(), Value::String(self.onset.clone()));
        fields.insert("duration".into(), Value::String(self.duration.clone()));
        fields.insert("event_code".into(), Value::String(self.event_code.clone()));
        if let Some(hed) = &self.hed {
            fields.insert("HED".into(), Value::String(hed.clone()));
        }
        Cow::Owned(fields)
    }
}

/// One recording
#[derive(Debug, Clone, PartialEq)]
pub struct Scan {
    pub task: String,
    /// Where the raw recording is copied from
    pub path: PathBuf,
    /// 0 when the task has a single recording in the session
    pub run: u32,
    pub fields: Fields,
    pub events: Vec<Event>,
    pub channels: Vec<Channel>,
}

impl Scan {
    pub fn new(task: &str, path: impl Into<PathBuf>, run: u32) -> Self {
        Self {
            task: task.to_string(),
            path: path.into(),
            run,
            fields: Fields::new(),
            events: Vec::new(),
            channels: Vec::new(),
        }
    }

    pub fn channel_mut(&mut self, name: &str) -> Option<&mut Channel> {
        self.channels.iter_mut().find(|c| c.name == name)
    }

    pub fn count_channels(&self, kind: &str) -> usize {
        self.channels
            .iter()
            .filter(|c| c.channel_type() == Some(kind))
            .count()
    }

    pub fn eeg_channel_names(&self) -> BTreeSet<&str> {
        self.channels
            .iter()
            .filter(|c| c.channel_type() == Some("EEG"))
            .map(|c| c.name.as_str())
            .collect()
    }
}

impl FieldRecord for Scan {
    fn record(&self) -> Cow<'_, Fields> {
        Cow::Borrowed(&self.fields)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Session {
    /// Scan label (relative path under the session directory) -> scan
    pub scans: IndexMap<String, Scan>,
    pub fields: Fields,
    pub field_definitions: Fields,
    pub electrodes: Vec<Electrode>,
    pub coordsystem: Fields,
}

impl FieldRecord for Session {
    fn record(&self) -> Cow<'_, Fields> {
        Cow::Borrowed(&self.fields)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subject {
    pub sessions: IndexMap<String, Session>,
    pub fields: Fields,
    pub field_definitions: Fields,
}

impl Subject {
    /// True when the subject's only session is the reserved agnostic one
    pub fn is_session_agnostic(&self) -> bool {
        self.sessions.len() == 1 && self.sessions.contains_key(SESSION_AGNOSTIC)
    }
}

impl FieldRecord for Subject {
    fn record(&self) -> Cow<'_, Fields> {
        Cow::Borrowed(&self.fields)
    }
}

/// Fields and event codes of one task
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Task {
    pub fields: FieldStore,
    /// Event code -> HED tag
    pub event_codes: Fields,
}

/// One patch entry of `field_replacements.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    /// Selector over subject and session fields
    #[serde(rename = "where", default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rename: Option<Value>,
    #[serde(flatten)]
    pub fields: Fields,
}

impl Directive {
    /// Directive limited to entities matching `selector`
    pub fn selecting(selector: Fields) -> Self {
        Self {
            selector: Some(Value::Object(selector)),
            ..Self::default()
        }
    }

    pub fn renaming(new_label: &str) -> Self {
        Self {
            rename: Some(Value::String(new_label.to_string())),
            ..Self::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: Value) -> Self {
        self.fields.insert(name.to_string(), value);
        self
    }
}

/// Contents of `field_replacements.json`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldReplacements {
    #[serde(default)]
    pub channels: BTreeMap<String, Vec<Directive>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, Vec<Directive>>,
}

impl FieldReplacements {
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty() && self.tasks.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub name: String,
    pub subjects: IndexMap<String, Subject>,
    pub tasks: BTreeMap<String, Task>,
    pub dataset_description: Fields,
    /// Definitions of participant fields (participants.json)
    pub field_definitions: Fields,
    pub readme: String,
    pub changes: String,
    /// Event codes not yet tied to one task
    pub event_codes: Fields,
    pub field_replacements: FieldReplacements,
    /// Large files and directories copied through untouched, listed in .bidsignore
    pub ignored_files: Vec<PathBuf>,
}

impl Project {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    /// Fill the dataset description with the required keys
    pub fn init_dataset_description(
        &mut self,
        bids_version: &str,
        license: &str,
        authors: Vec<String>,
        funding: Vec<String>,
    ) {
        let d = &mut self.dataset_description;
        d.insert("Name".into(), Value::String(self.name.clone()));
        d.insert("BIDSVersion".into(), Value::String(bids_version.to_string()));
        d.insert("License".into(), Value::String(license.to_string()));
        d.insert("Authors".into(), json!(authors));
        d.insert("Acknowledgments".into(), Value::String(String::new()));
        d.insert("HowToAcknowledge".into(), Value::String(String::new()));
        d.insert("Funding".into(), json!(funding));
        d.insert("ReferencesAndLinks".into(), json!([]));
        d.insert("DatasetDOI".into(), Value::String(String::new()));
    }

    /// Task entry, created empty on first use
    pub fn task_mut(&mut self, name: &str) -> &mut Task {
        self.tasks.entry(name.to_string()).or_default()
    }

    /// Subjects, sessions and scans that use `task`
    pub fn scope_tree(&self, task: &str) -> ScopeTree {
        let mut tree = ScopeTree::new();
        for (sub_id, subject) in &self.subjects {
            for (ses_id, session) in &subject.sessions {
                for (label, scan) in &session.scans {
                    if scan.task == task {
                        tree.insert(sub_id, ses_id, label);
                    }
                }
            }
        }
        tree
    }

    /// Normalize derived fields ahead of an export
    ///
    /// Recomputes channel counts from channel types, pushes project-wide event
    /// codes into every task, defaults SoftwareFilters, then consolidates each
    /// task's field store.
    pub fn preprocess(&mut self) {
        for task in self.tasks.values_mut() {
            for (field, _) in CHANNEL_COUNTS {
                task.fields.remove_name(field);
            }
        }

        for (sub_id, subject) in &self.subjects {
            for (ses_id, session) in &subject.sessions {
                for (label, scan) in &session.scans {
                    let task = self.tasks.entry(scan.task.clone()).or_default();
                    for (field, kind) in CHANNEL_COUNTS {
                        task.fields.set(
                            field,
                            json!(scan.count_channels(kind)),
                            Scope::scan(sub_id, ses_id, label),
                        );
                    }
                }
            }
        }

        let trees: BTreeMap<String, ScopeTree> = self
            .tasks
            .keys()
            .map(|name| (name.clone(), self.scope_tree(name)))
            .collect();

        for (name, task) in self.tasks.iter_mut() {
            for (code, tag) in &self.event_codes {
                task.event_codes.insert(code.clone(), tag.clone());
            }
            if !task.fields.contains_name("SoftwareFilters") {
                task.fields
                    .set("SoftwareFilters", json!("n/a"), Scope::Project);
            }
            if let Some(tree) = trees.get(name) {
                consolidate(&mut task.fields, tree);
            }
            debug!(task = %name, entries = task.fields.len(), "Preprocessed task");
        }
    }

    /// Consistency warnings worth surfacing in the report
    pub fn generate_warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for (sub_id, subject) in &self.subjects {
            for (ses_id, session) in &subject.sessions {
                if session.electrodes.is_empty() {
                    continue;
                }
                if session.coordsystem.is_empty() {
                    warnings.push(format!(
                        "Warning: session {} of subject {} specifies electrodes, but no coordinate system",
                        ses_id, sub_id
                    ));
                }
                let electrode_names: BTreeSet<&str> =
                    session.electrodes.iter().map(|e| e.name.as_str()).collect();
                for (label, scan) in &session.scans {
                    if scan.eeg_channel_names() != electrode_names {
                        warnings.push(format!(
                            "Warning: session {} of subject {} has electrodes that do not match the EEG channels of {}",
                            ses_id, sub_id, label
                        ));
                    }
                }
            }
        }

        if self.event_codes.len() > 1 && self.tasks.len() > 1 {
            warnings.push(
                "Warning: project-wide event codes were copied into every task; review them per task"
                    .to_string(),
            );
        }

        warnings
    }
}
