//! BIDS directory layout and file naming
//!
//! Every path the importer reads and the exporter writes is computed here so
//! both sides agree on the naming scheme.

use crate::field_store::Scope;
use crate::project::SESSION_AGNOSTIC;
use std::path::{Path, PathBuf};

pub const DATASET_DESCRIPTION: &str = "dataset_description.json";
pub const README: &str = "README";
pub const CHANGES: &str = "CHANGES";
pub const BIDSIGNORE: &str = ".bidsignore";
pub const FIELD_REPLACEMENTS: &str = "field_replacements.json";
pub const PARTICIPANTS_TSV: &str = "participants.tsv";
pub const PARTICIPANTS_JSON: &str = "participants.json";
pub const REPORT: &str = "REPORT.txt";
pub const VALIDATOR_OUTPUT: &str = "VALIDATOR_OUTPUT.txt";

/// Directory holding recordings and per-session spatial files
pub const RECORDING_DIR: &str = "eeg";

/// Extensions of raw recording files
pub const RAW_EXTENSIONS: &[&str] = &["set", "nii"];

/// True if `path` names a raw recording
pub fn is_raw_recording(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| RAW_EXTENSIONS.contains(&e))
        .unwrap_or(false)
}

/// Non-empty ASCII alphanumeric
pub fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric())
}

/// Identifier following `prefix` in `name`, e.g. `task-` or `_run-`
fn token_after<'a>(name: &'a str, prefix: &str) -> Option<&'a str> {
    let start = name.find(prefix)? + prefix.len();
    let rest = &name[start..];
    let end = rest
        .find(|c: char| !c.is_ascii_alphanumeric())
        .unwrap_or(rest.len());
    let token = &rest[..end];
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

/// Task label encoded in a file name
pub fn task_token(file_name: &str) -> Option<&str> {
    token_after(file_name, "task-")
}

/// Run index encoded in a file name; 0 when absent
pub fn run_index(file_name: &str) -> u32 {
    token_after(file_name, "_run-")
        .and_then(|run| run.parse().ok())
        .unwrap_or(0)
}

/// Replace a whole `task-{old}` token with `task-{new}`
///
/// Returns `None` when `name` carries no such token.
pub fn replace_task_token(name: &str, old: &str, new: &str) -> Option<String> {
    let needle = format!("task-{}", old);
    let mut out = String::with_capacity(name.len());
    let mut rest = name;
    let mut replaced = false;

    while let Some(pos) = rest.find(&needle) {
        let after = &rest[pos + needle.len()..];
        let whole = !after
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false);
        out.push_str(&rest[..pos]);
        if whole {
            out.push_str("task-");
            out.push_str(new);
            replaced = true;
        } else {
            out.push_str(&needle);
        }
        rest = after;
    }
    out.push_str(rest);

    replaced.then_some(out)
}

/// File-name stem shared by a session's files
pub fn session_stem(subject: &str, session: &str) -> String {
    if session == SESSION_AGNOSTIC {
        format!("sub-{}", subject)
    } else {
        format!("sub-{}_ses-{}", subject, session)
    }
}

/// Canonical scan label relative to the session directory
///
/// Run 0 means the task has a single recording and no run entity is written.
pub fn scan_label(subject: &str, session: &str, task: &str, run: u32) -> String {
    let stem = session_stem(subject, session);
    if run == 0 {
        format!("{}/{}_task-{}_eeg.set", RECORDING_DIR, stem, task)
    } else {
        format!("{}/{}_task-{}_run-{}_eeg.set", RECORDING_DIR, stem, task, run)
    }
}

/// Scan label without its trailing `_suffix.ext`
pub fn scan_label_base(label: &str) -> &str {
    match label.rfind('_') {
        Some(pos) => &label[..pos],
        None => label.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(label),
    }
}

/// Paths inside one dataset root
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// A file directly under the root
    pub fn file(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn task_sidecar(&self, task: &str) -> PathBuf {
        self.root.join(format!("task-{}_eeg.json", task))
    }

    pub fn task_events(&self, task: &str) -> PathBuf {
        self.root.join(format!("task-{}_events.json", task))
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(format!("sub-{}", subject))
    }

    /// Session directory; the subject directory for a session-agnostic subject
    pub fn session_dir(&self, subject: &str, session: &str) -> PathBuf {
        if session == SESSION_AGNOSTIC {
            self.subject_dir(subject)
        } else {
            self.subject_dir(subject).join(format!("ses-{}", session))
        }
    }

    pub fn recording_dir(&self, subject: &str, session: &str) -> PathBuf {
        self.session_dir(subject, session).join(RECORDING_DIR)
    }

    pub fn sessions_tsv(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("sub-{}_sessions.tsv", subject))
    }

    pub fn sessions_json(&self, subject: &str) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("sub-{}_sessions.json", subject))
    }

    pub fn subject_task_sidecar(&self, subject: &str, task: &str) -> PathBuf {
        self.subject_dir(subject)
            .join(format!("sub-{}_task-{}_eeg.json", subject, task))
    }

    pub fn scans_tsv(&self, subject: &str, session: &str) -> PathBuf {
        self.session_dir(subject, session)
            .join(format!("{}_scans.tsv", session_stem(subject, session)))
    }

    pub fn scans_json(&self, subject: &str, session: &str) -> PathBuf {
        self.session_dir(subject, session)
            .join(format!("{}_scans.json", session_stem(subject, session)))
    }

    pub fn session_task_sidecar(&self, subject: &str, session: &str, task: &str) -> PathBuf {
        self.session_dir(subject, session).join(format!(
            "{}_task-{}_eeg.json",
            session_stem(subject, session),
            task
        ))
    }

    pub fn coordsystem(&self, subject: &str, session: &str) -> PathBuf {
        self.recording_dir(subject, session)
            .join(format!("{}_coordsystem.json", session_stem(subject, session)))
    }

    pub fn electrodes(&self, subject: &str, session: &str) -> PathBuf {
        self.recording_dir(subject, session)
            .join(format!("{}_electrodes.tsv", session_stem(subject, session)))
    }

    /// Raw recording location of a scan
    pub fn recording(&self, subject: &str, session: &str, label: &str) -> PathBuf {
        self.session_dir(subject, session).join(label)
    }

    fn scan_file(&self, subject: &str, session: &str, label: &str, suffix: &str) -> PathBuf {
        self.session_dir(subject, session)
            .join(format!("{}_{}", scan_label_base(label), suffix))
    }

    pub fn channels(&self, subject: &str, session: &str, label: &str) -> PathBuf {
        self.scan_file(subject, session, label, "channels.tsv")
    }

    pub fn events(&self, subject: &str, session: &str, label: &str) -> PathBuf {
        self.scan_file(subject, session, label, "events.tsv")
    }

    pub fn scan_sidecar(&self, subject: &str, session: &str, label: &str) -> PathBuf {
        self.scan_file(subject, session, label, "eeg.json")
    }

    /// Sidecar holding the fields of `task` declared at `scope`
    ///
    /// `None` for the session level of a session-agnostic subject, which has
    /// no file of its own.
    pub fn sidecar_for(&self, task: &str, scope: &Scope) -> Option<PathBuf> {
        match scope {
            Scope::Project => Some(self.task_sidecar(task)),
            Scope::Subject { subject } => Some(self.subject_task_sidecar(subject, task)),
            Scope::Session { session, .. } if session == SESSION_AGNOSTIC => None,
            Scope::Session { subject, session } => {
                Some(self.session_task_sidecar(subject, session, task))
            }
            Scope::Scan {
                subject,
                session,
                scan,
            } => Some(self.scan_sidecar(subject, session, scan)),
        }
    }
}
