//! Exporter / merger: write a Project to a BIDS layout
//!
//! A full export (no changeset) writes every file. A scoped export writes
//! only changeset paths and appends its report to REPORT.txt. Existing JSON
//! sidecars whose content would change are archived first; byte-identical
//! files are never rewritten.

use crate::archive::{send_to_archive, ARCHIVE_DIR};
use crate::field_store::{Fields, Scope};
use crate::layout::{
    is_raw_recording, task_token, Layout, BIDSIGNORE, CHANGES, DATASET_DESCRIPTION,
    FIELD_REPLACEMENTS, PARTICIPANTS_JSON, PARTICIPANTS_TSV, README, REPORT, VALIDATOR_OUTPUT,
};
use crate::project::{Project, Session, Subject, SESSION_AGNOSTIC};
use crate::report::generation_header;
use crate::tabular::{
    self, render_json, render_keyed_tsv, render_tsv, should_write, Changeset, WriteOutcome,
};
use crate::{Error, Result};
use chrono::Utc;
use serde_json::{json, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Entries every .bidsignore starts with
pub const BIDSIGNORE_BASE: &[&str] = &[FIELD_REPLACEMENTS, ARCHIVE_DIR, VALIDATOR_OUTPUT, REPORT];

const EVENT_CODES_DESCRIPTION: &str = "Maps Event Code IDS to their respective HED tags";

/// How an export pass behaves
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    /// Paths allowed to be overwritten; `None` writes everything
    pub changes: Option<Changeset>,
    /// Files to move before writing, as (old, new)
    pub renamed: Vec<(PathBuf, PathBuf)>,
    /// Skip copying raw recordings and ignored files
    pub stub: bool,
    /// Text added to REPORT.txt
    pub report: String,
}

/// Files touched by an export pass
#[derive(Debug, Clone, Default)]
pub struct ExportSummary {
    pub written: Vec<PathBuf>,
    pub archived: Vec<PathBuf>,
    pub renamed: Vec<PathBuf>,
}

/// Write `project` under `root`
///
/// Runs `Project::preprocess` first, so the project is left consolidated.
pub fn export_project(
    project: &mut Project,
    root: &Path,
    options: &ExportOptions,
) -> Result<ExportSummary> {
    info!(root = %root.display(), scoped = options.changes.is_some(), "Exporting BIDS layout");
    project.preprocess();

    let mut exporter = Exporter {
        layout: Layout::new(root),
        options,
        summary: ExportSummary::default(),
    };
    exporter.run(project)?;

    info!(
        written = exporter.summary.written.len(),
        archived = exporter.summary.archived.len(),
        "Export complete"
    );
    Ok(exporter.summary)
}

/// Content of a task's events sidecar
pub fn events_sidecar(event_codes: &Fields) -> Fields {
    if event_codes.is_empty() {
        return Fields::new();
    }
    let mut fields = Fields::new();
    fields.insert(
        "event_code".into(),
        json!({
            "Description": EVENT_CODES_DESCRIPTION,
            "EventCodes": event_codes,
        }),
    );
    fields
}

struct Exporter<'a> {
    layout: Layout,
    options: &'a ExportOptions,
    summary: ExportSummary,
}

impl Exporter<'_> {
    fn run(&mut self, project: &Project) -> Result<()> {
        self.apply_renames()?;
        fs::create_dir_all(self.layout.root())?;
        self.write_report()?;

        self.write_sidecar(&self.layout.file(DATASET_DESCRIPTION), &project.dataset_description)?;
        if !project.readme.is_empty() {
            self.write_text(&self.layout.file(README), &project.readme)?;
        }
        if !project.changes.is_empty() {
            self.write_text(&self.layout.file(CHANGES), &project.changes)?;
        }

        let task_names: BTreeSet<String> = project.tasks.keys().cloned().collect();
        for (name, task) in &project.tasks {
            self.write_sidecar(
                &self.layout.task_sidecar(name),
                &task.fields.get_all(&Scope::Project),
            )?;
            self.write_sidecar(
                &self.layout.task_events(name),
                &events_sidecar(&task.event_codes),
            )?;
        }
        self.scrub(&self.layout.root().to_path_buf(), &task_names)?;

        let replacements = match serde_json::to_value(&project.field_replacements)? {
            Value::Object(map) if !project.field_replacements.is_empty() => map,
            _ => Fields::new(),
        };
        self.write_sidecar(&self.layout.file(FIELD_REPLACEMENTS), &replacements)?;

        self.write_bidsignore(project)?;
        self.carry_ignored_files(project)?;

        let participants = render_keyed_tsv(
            "participant_id",
            project
                .subjects
                .iter()
                .map(|(id, subject)| (format!("sub-{}", id), subject)),
        );
        self.write_text(&self.layout.file(PARTICIPANTS_TSV), &participants)?;
        self.write_sidecar(&self.layout.file(PARTICIPANTS_JSON), &project.field_definitions)?;

        for (id, subject) in &project.subjects {
            self.write_subject(project, id, subject, &task_names)?;
        }
        Ok(())
    }

    fn changes(&self) -> Option<&Changeset> {
        self.options.changes.as_ref()
    }

    fn write_text(&mut self, path: &Path, contents: &str) -> Result<()> {
        if tabular::write_text(path, contents, self.changes())? == WriteOutcome::Written {
            debug!(path = %path.display(), "Wrote file");
            self.summary.written.push(path.to_path_buf());
        }
        Ok(())
    }

    fn archive(&mut self, path: &Path) -> Result<()> {
        if let Some(destination) = send_to_archive(self.layout.root(), path)? {
            self.summary.archived.push(destination);
        }
        Ok(())
    }

    /// Write a JSON sidecar, archiving a differing or corrupt predecessor
    ///
    /// Empty content writes nothing, so a stale predecessor is only archived.
    fn write_sidecar(&mut self, path: &Path, fields: &Fields) -> Result<()> {
        if !should_write(path, self.changes()) {
            return Ok(());
        }
        match tabular::read_json(path) {
            Ok(Some(existing)) if existing == *fields => return Ok(()),
            Ok(Some(_)) => self.archive(path)?,
            Ok(None) => {}
            Err(Error::CorruptSidecar { reason, .. }) => {
                warn!(path = %path.display(), %reason, "Archiving unreadable sidecar");
                self.archive(path)?;
            }
            Err(e) => return Err(e),
        }
        if fields.is_empty() {
            return Ok(());
        }
        self.write_text(path, &render_json(fields)?)
    }

    /// Execute the rename plan; JSON sidecars are regenerated, so they are archived
    fn apply_renames(&mut self) -> Result<()> {
        let options = self.options;
        for (old, new) in &options.renamed {
            if !old.is_file() {
                continue;
            }
            if old.extension().and_then(|e| e.to_str()) == Some("json") {
                self.archive(old)?;
                continue;
            }
            if let Some(parent) = new.parent() {
                fs::create_dir_all(parent)?;
            }
            match fs::rename(old, new) {
                Ok(()) => {
                    info!(from = %old.display(), to = %new.display(), "Renamed file");
                    self.summary.renamed.push(new.clone());
                }
                Err(e) => warn!("Unable to rename {} to {}: {}", old.display(), new.display(), e),
            }
        }
        Ok(())
    }

    fn write_report(&mut self) -> Result<()> {
        let path = self.layout.file(REPORT);
        if self.options.changes.is_none() {
            let text = generation_header(Utc::now()) + &self.options.report;
            self.write_text(&path, &text)
        } else if !self.options.report.is_empty() {
            tabular::append_text(&path, &self.options.report)
        } else {
            Ok(())
        }
    }

    fn write_bidsignore(&mut self, project: &Project) -> Result<()> {
        let mut lines: Vec<String> = BIDSIGNORE_BASE.iter().map(|s| s.to_string()).collect();
        lines.extend(
            project
                .ignored_files
                .iter()
                .filter_map(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned()),
        );
        let mut text = lines.join("\n");
        text.push('\n');
        self.write_text(&self.layout.file(BIDSIGNORE), &text)
    }

    fn carry_ignored_files(&mut self, project: &Project) -> Result<()> {
        if self.options.stub {
            return Ok(());
        }
        for source in &project.ignored_files {
            let Some(name) = source.file_name() else {
                continue;
            };
            let destination = self.layout.root().join(name);
            if destination.exists() || !should_write(&destination, self.changes()) {
                continue;
            }
            if !source.exists() {
                warn!("Ignored file {} no longer exists", source.display());
                continue;
            }
            info!(from = %source.display(), "Copying ignored file");
            copy_tree(source, &destination)?;
            self.summary.written.push(destination);
        }
        Ok(())
    }

    /// Archive non-recording files naming a task the project no longer has
    fn scrub(&mut self, dir: &Path, tasks: &BTreeSet<String>) -> Result<()> {
        if !dir.is_dir() {
            return Ok(());
        }
        let mut stale = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.is_file() || is_raw_recording(&path) {
                continue;
            }
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if let Some(task) = task_token(&name) {
                if !tasks.contains(task) {
                    stale.push(path);
                }
            }
        }
        stale.sort();
        for path in stale {
            info!(path = %path.display(), "Archiving file of unknown task");
            self.archive(&path)?;
        }
        Ok(())
    }

    fn write_subject(
        &mut self,
        project: &Project,
        id: &str,
        subject: &Subject,
        tasks: &BTreeSet<String>,
    ) -> Result<()> {
        let dir = self.layout.subject_dir(id);
        fs::create_dir_all(&dir)?;

        if !subject.is_session_agnostic() {
            let sessions = render_keyed_tsv(
                "session_id",
                subject
                    .sessions
                    .iter()
                    .map(|(ses, session)| (format!("ses-{}", ses), session)),
            );
            self.write_text(&self.layout.sessions_tsv(id), &sessions)?;
        }
        self.write_sidecar(&self.layout.sessions_json(id), &subject.field_definitions)?;

        let scope = Scope::subject(id);
        for (name, task) in &project.tasks {
            self.write_sidecar(
                &self.layout.subject_task_sidecar(id, name),
                &task.fields.get_all(&scope),
            )?;
        }
        self.scrub(&dir, tasks)?;

        for (ses, session) in &subject.sessions {
            self.write_session(project, id, ses, session, tasks)?;
        }
        Ok(())
    }

    fn write_session(
        &mut self,
        project: &Project,
        sub: &str,
        ses: &str,
        session: &Session,
        tasks: &BTreeSet<String>,
    ) -> Result<()> {
        let dir = self.layout.session_dir(sub, ses);
        fs::create_dir_all(&dir)?;

        let scans = render_keyed_tsv(
            "filename",
            session.scans.iter().map(|(label, scan)| (label.clone(), scan)),
        );
        self.write_text(&self.layout.scans_tsv(sub, ses), &scans)?;
        self.write_sidecar(&self.layout.scans_json(sub, ses), &session.field_definitions)?;

        if ses != SESSION_AGNOSTIC {
            let scope = Scope::session(sub, ses);
            for (name, task) in &project.tasks {
                self.write_sidecar(
                    &self.layout.session_task_sidecar(sub, ses, name),
                    &task.fields.get_all(&scope),
                )?;
            }
            self.scrub(&dir, tasks)?;
        }

        self.write_sidecar(&self.layout.coordsystem(sub, ses), &session.coordsystem)?;
        if !session.electrodes.is_empty() {
            let electrodes = render_keyed_tsv(
                "name",
                session.electrodes.iter().map(|e| (e.name.clone(), e)),
            );
            self.write_text(&self.layout.electrodes(sub, ses), &electrodes)?;
        }

        let mut recording_dirs = BTreeSet::new();
        for (label, scan) in &session.scans {
            if !scan.channels.is_empty() {
                let channels = render_keyed_tsv(
                    "name",
                    scan.channels.iter().map(|c| (c.name.clone(), c)),
                );
                self.write_text(&self.layout.channels(sub, ses, label), &channels)?;
            }
            if !scan.events.is_empty() {
                self.write_text(&self.layout.events(sub, ses, label), &render_tsv(&scan.events))?;
            }

            let recording = self.layout.recording(sub, ses, label);
            self.copy_recording(&scan.path, &recording)?;
            if let Some(parent) = recording.parent() {
                recording_dirs.insert(parent.to_path_buf());
            }

            let fields = project
                .tasks
                .get(&scan.task)
                .map(|task| task.fields.get_all(&Scope::scan(sub, ses, label)))
                .unwrap_or_default();
            self.write_sidecar(&self.layout.scan_sidecar(sub, ses, label), &fields)?;
        }

        for dir in recording_dirs {
            self.scrub(&dir, tasks)?;
        }
        Ok(())
    }

    fn copy_recording(&mut self, source: &Path, destination: &Path) -> Result<()> {
        if self.options.stub
            || destination.exists()
            || !should_write(destination, self.changes())
        {
            return Ok(());
        }
        if !source.is_file() {
            warn!("Recording {} not found; not copied", source.display());
            return Ok(());
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        debug!(from = %source.display(), to = %destination.display(), "Copying recording");
        fs::copy(source, destination)?;
        self.summary.written.push(destination.to_path_buf());
        Ok(())
    }
}

/// Copy a file or a whole directory tree
fn copy_tree(source: &Path, destination: &Path) -> Result<()> {
    for entry in WalkDir::new(source) {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| Error::InvalidInput(e.to_string()))?;
        let target = if relative.as_os_str().is_empty() {
            destination.to_path_buf()
        } else {
            destination.join(relative)
        };
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_events_sidecar_wraps_codes() {
        let mut codes = Fields::new();
        codes.insert("1".into(), json!("Event/Label/Stimulus"));
        let sidecar = events_sidecar(&codes);
        assert_eq!(
            Value::Object(sidecar),
            json!({"event_code": {
                "Description": EVENT_CODES_DESCRIPTION,
                "EventCodes": {"1": "Event/Label/Stimulus"}
            }})
        );
        assert!(events_sidecar(&Fields::new()).is_empty());
    }

    #[test]
    fn test_copy_tree_copies_directories() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("docs");
        fs::create_dir_all(source.join("inner")).unwrap();
        fs::write(source.join("inner").join("a.txt"), "a").unwrap();

        let destination = dir.path().join("out").join("docs");
        copy_tree(&source, &destination).unwrap();

        assert_eq!(
            fs::read_to_string(destination.join("inner").join("a.txt")).unwrap(),
            "a"
        );
    }
}
