//! Importer: rebuild a Project from a BIDS layout on disk
//!
//! Reads exactly what the exporter writes. Required top-level files
//! (dataset_description.json, participants.tsv) and the project-wide task
//! sidecars are fatal when missing or corrupt; corrupt per-entity sidecars
//! are archived, reported, and treated as empty.

use crate::archive::send_to_archive;
use crate::export::BIDSIGNORE_BASE;
use crate::field_store::{Fields, Scope};
use crate::layout::{
    is_identifier, is_raw_recording, run_index, session_stem, task_token, Layout, BIDSIGNORE,
    CHANGES, DATASET_DESCRIPTION, FIELD_REPLACEMENTS, PARTICIPANTS_JSON, PARTICIPANTS_TSV,
    README,
};
use crate::project::{
    compare_ids, Channel, Electrode, Event, FieldReplacements, Project, Scan, Session, Subject,
    SESSION_AGNOSTIC,
};
use crate::report::Report;
use crate::tabular::{self, TsvTable};
use crate::{Error, Result};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Import the layout rooted at `root`
///
/// Recoverable problems are added to `report` as warnings.
pub fn import_project(root: &Path, report: &mut Report) -> Result<Project> {
    Importer {
        layout: Layout::new(root),
        report,
    }
    .run()
}

struct Importer<'a> {
    layout: Layout,
    report: &'a mut Report,
}

impl Importer<'_> {
    fn run(&mut self) -> Result<Project> {
        let root = self.layout.root().to_path_buf();
        if !root.is_dir() {
            return Err(Error::NotFound(format!("layout root {}", root.display())));
        }
        info!(root = %root.display(), "Importing BIDS layout");

        let description_path = self.layout.file(DATASET_DESCRIPTION);
        let dataset_description = tabular::read_json(&description_path)?
            .ok_or_else(|| Error::MissingRequiredFile(description_path.clone()))?;
        let name = dataset_description
            .get("Name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let mut project = Project::new(&name);
        project.dataset_description = dataset_description;
        project.field_definitions =
            tabular::read_json(&self.layout.file(PARTICIPANTS_JSON))?.unwrap_or_default();
        project.readme = tabular::read_text(&self.layout.file(README))?.unwrap_or_default();
        project.changes = tabular::read_text(&self.layout.file(CHANGES))?.unwrap_or_default();
        project.field_replacements = self.read_field_replacements();

        self.read_participants(&mut project)?;
        self.read_root_tasks(&mut project)?;

        let mut listed: Vec<String> = project.subjects.keys().cloned().collect();
        for (id, _) in entity_dirs(&root, "sub-")? {
            listed.retain(|l| *l != id);
            self.read_subject(&mut project, &id)?;
        }
        for id in listed {
            self.report.warn(format!(
                "Subject sub-{} is listed in participants.tsv but has no directory",
                id
            ));
            project.subjects.shift_remove(&id);
        }
        // Directory listings sort as text; ids were assigned in numeric order
        project.subjects.sort_by(|a, _, b, _| compare_ids(a, b));

        project.ignored_files = self.read_ignored_files()?;

        info!(
            subjects = project.subjects.len(),
            tasks = project.tasks.len(),
            "Import complete"
        );
        Ok(project)
    }

    /// Archive a corrupt optional file and note it in the report
    fn recover(&mut self, path: &Path, reason: &str) -> Result<()> {
        self.report.warn(format!(
            "Unreadable file {} was archived and treated as empty: {}",
            path.display(),
            reason
        ));
        send_to_archive(self.layout.root(), path)?;
        Ok(())
    }

    fn optional_json(&mut self, path: &Path) -> Result<Option<Fields>> {
        match tabular::read_json(path) {
            Ok(fields) => Ok(fields),
            Err(Error::CorruptSidecar { path, reason }) => {
                self.recover(&path, &reason)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn optional_tsv(&mut self, path: &Path) -> Result<Option<TsvTable>> {
        match tabular::read_tsv(path) {
            Ok(table) => Ok(table),
            Err(Error::CorruptSidecar { path, reason }) => {
                self.recover(&path, &reason)?;
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn read_field_replacements(&mut self) -> FieldReplacements {
        let path = self.layout.file(FIELD_REPLACEMENTS);
        let parsed = tabular::read_json(&path).and_then(|fields| match fields {
            Some(fields) => Ok(serde_json::from_value(Value::Object(fields))?),
            None => Ok(FieldReplacements::default()),
        });
        match parsed {
            Ok(replacements) => replacements,
            Err(e) => {
                self.report.warn(format!(
                    "{} could not be read and was ignored: {}",
                    FIELD_REPLACEMENTS, e
                ));
                FieldReplacements::default()
            }
        }
    }

    fn read_participants(&mut self, project: &mut Project) -> Result<()> {
        let path = self.layout.file(PARTICIPANTS_TSV);
        let table = tabular::read_tsv(&path)?.ok_or_else(|| Error::MissingRequiredFile(path))?;

        for (key, fields) in table.keyed() {
            match key.strip_prefix("sub-").filter(|id| is_identifier(id)) {
                Some(id) => {
                    project.subjects.insert(
                        id.to_string(),
                        Subject {
                            fields,
                            ..Subject::default()
                        },
                    );
                }
                None => self
                    .report
                    .warn(format!("Ignoring participants.tsv row with id {:?}", key)),
            }
        }
        Ok(())
    }

    /// Project-scope task sidecars and event code maps
    fn read_root_tasks(&mut self, project: &mut Project) -> Result<()> {
        for path in sorted_files(self.layout.root())? {
            let name = file_name(&path);
            if let Some(task) = between(&name, "task-", "_eeg.json") {
                let fields = tabular::read_json(&path)?.unwrap_or_default();
                project
                    .task_mut(task)
                    .fields
                    .extend_at(&Scope::Project, fields);
            } else if let Some(task) = between(&name, "task-", "_events.json") {
                let fields = tabular::read_json(&path)?.unwrap_or_default();
                let codes = fields
                    .get("event_code")
                    .and_then(|e| e.get("EventCodes"))
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                project.task_mut(task).event_codes = codes;
            }
        }
        Ok(())
    }

    fn read_subject(&mut self, project: &mut Project, id: &str) -> Result<()> {
        let dir = self.layout.subject_dir(id);
        debug!(subject = id, "Importing subject");
        let mut subject = project.subjects.shift_remove(id).unwrap_or_default();

        let session_ids: Vec<String> = {
            let ids: Vec<String> = entity_dirs(&dir, "ses-")?
                .into_iter()
                .map(|(id, _)| id)
                .collect();
            if ids.is_empty() {
                vec![SESSION_AGNOSTIC.to_string()]
            } else {
                ids
            }
        };

        subject.field_definitions = self
            .optional_json(&self.layout.sessions_json(id))?
            .unwrap_or_default();

        let stem = format!("sub-{}", id);
        for (task, path) in task_sidecars(&dir, &stem)? {
            let fields = self.optional_json(&path)?.unwrap_or_default();
            project
                .task_mut(&task)
                .fields
                .extend_at(&Scope::subject(id), fields);
        }

        for session_id in &session_ids {
            let session = self.read_session(project, id, session_id)?;
            subject.sessions.insert(session_id.clone(), session);
        }
        subject.sessions.sort_by(|a, _, b, _| compare_ids(a, b));

        if !subject.is_session_agnostic() {
            let path = self.layout.sessions_tsv(id);
            if let Some(table) = self.optional_tsv(&path)? {
                for (key, fields) in table.keyed() {
                    let session = key
                        .strip_prefix("ses-")
                        .and_then(|s| subject.sessions.get_mut(s));
                    match session {
                        Some(session) => session.fields = fields,
                        None => self.report.warn(format!(
                            "{} lists {} which has no directory",
                            path.display(),
                            key
                        )),
                    }
                }
            }
        }

        project.subjects.insert(id.to_string(), subject);
        Ok(())
    }

    fn read_session(&mut self, project: &mut Project, sub: &str, ses: &str) -> Result<Session> {
        let dir = self.layout.session_dir(sub, ses);
        let mut session = Session::default();

        if ses != SESSION_AGNOSTIC {
            for (task, path) in task_sidecars(&dir, &session_stem(sub, ses))? {
                let fields = self.optional_json(&path)?.unwrap_or_default();
                project
                    .task_mut(&task)
                    .fields
                    .extend_at(&Scope::session(sub, ses), fields);
            }
        }

        if let Some(table) = self.optional_tsv(&self.layout.scans_tsv(sub, ses))? {
            for (label, fields) in table.keyed() {
                if let Some(mut scan) = self.scan_for_label(&dir, &label) {
                    scan.fields = fields;
                    session.scans.insert(label, scan);
                }
            }
        }
        session.field_definitions = self
            .optional_json(&self.layout.scans_json(sub, ses))?
            .unwrap_or_default();

        for recording_dir in recording_dirs(&dir, ses)? {
            let dir_name = file_name(&recording_dir);
            for path in sorted_files(&recording_dir)? {
                if !is_raw_recording(&path) {
                    continue;
                }
                let label = format!("{}/{}", dir_name, file_name(&path));
                if session.scans.contains_key(&label) {
                    continue;
                }
                if let Some(scan) = self.scan_for_label(&dir, &label) {
                    session.scans.insert(label, scan);
                }
            }
        }

        if session.scans.is_empty() {
            return Err(Error::NotFound(format!(
                "session directory {} references no scans",
                dir.display()
            )));
        }

        session.coordsystem = self
            .optional_json(&self.layout.coordsystem(sub, ses))?
            .unwrap_or_default();
        session.electrodes = self.read_electrodes(&self.layout.electrodes(sub, ses))?;

        for (label, scan) in session.scans.iter_mut() {
            if let Some(table) = self.optional_tsv(&self.layout.channels(sub, ses, label))? {
                scan.channels = table
                    .keyed()
                    .into_iter()
                    .map(|(name, fields)| Channel { name, fields })
                    .collect();
            }
            if let Some(table) = self.optional_tsv(&self.layout.events(sub, ses, label))? {
                scan.events = table.records().iter().map(Event::from_record).collect();
            }
            let fields = self
                .optional_json(&self.layout.scan_sidecar(sub, ses, label))?
                .unwrap_or_default();
            project
                .task_mut(&scan.task)
                .fields
                .extend_at(&Scope::scan(sub, ses, label), fields);
        }

        debug!(subject = sub, session = ses, scans = session.scans.len(), "Imported session");
        Ok(session)
    }

    fn scan_for_label(&mut self, session_dir: &Path, label: &str) -> Option<Scan> {
        let name = label.rsplit('/').next().unwrap_or(label);
        match task_token(name) {
            Some(task) => Some(Scan::new(task, session_dir.join(label), run_index(name))),
            None => {
                self.report
                    .warn(format!("Scan {} has no task label and was skipped", label));
                None
            }
        }
    }

    fn read_electrodes(&mut self, path: &Path) -> Result<Vec<Electrode>> {
        let Some(table) = self.optional_tsv(path)? else {
            return Ok(Vec::new());
        };

        let parsed: std::result::Result<Vec<Electrode>, String> = table
            .keyed()
            .into_iter()
            .map(|(name, fields)| -> std::result::Result<Electrode, String> {
                let coordinate = |axis: &str| {
                    fields
                        .get(axis)
                        .and_then(Value::as_str)
                        .and_then(|v| v.parse::<f64>().ok())
                        .ok_or_else(|| format!("electrode {} has no numeric {}", name, axis))
                };
                Ok(Electrode {
                    x: coordinate("x")?,
                    y: coordinate("y")?,
                    z: coordinate("z")?,
                    name: name.clone(),
                })
            })
            .collect();

        match parsed {
            Ok(electrodes) => Ok(electrodes),
            Err(reason) => {
                self.recover(path, &reason)?;
                Ok(Vec::new())
            }
        }
    }

    /// Extra .bidsignore entries that still exist on disk
    fn read_ignored_files(&mut self) -> Result<Vec<PathBuf>> {
        let Some(text) = tabular::read_text(&self.layout.file(BIDSIGNORE))? else {
            return Ok(Vec::new());
        };
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !BIDSIGNORE_BASE.contains(line))
            .map(|line| self.layout.file(line))
            .filter(|path| path.exists())
            .collect())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Identifier between `prefix` and `suffix`
fn between<'a>(name: &'a str, prefix: &str, suffix: &str) -> Option<&'a str> {
    name.strip_prefix(prefix)?
        .strip_suffix(suffix)
        .filter(|middle| is_identifier(middle))
}

fn sorted_entries(dir: &Path, want_dirs: bool) -> Result<Vec<PathBuf>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() == want_dirs {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

fn sorted_files(dir: &Path) -> Result<Vec<PathBuf>> {
    sorted_entries(dir, false)
}

/// Child directories named `{prefix}{identifier}`, as (identifier, path)
fn entity_dirs(dir: &Path, prefix: &str) -> Result<Vec<(String, PathBuf)>> {
    Ok(sorted_entries(dir, true)?
        .into_iter()
        .filter_map(|path| {
            let name = file_name(&path);
            let id = name.strip_prefix(prefix).filter(|id| is_identifier(id))?;
            Some((id.to_string(), path))
        })
        .collect())
}

/// Directories holding recordings inside a session directory
fn recording_dirs(session_dir: &Path, session: &str) -> Result<Vec<PathBuf>> {
    Ok(sorted_entries(session_dir, true)?
        .into_iter()
        .filter(|path| session != SESSION_AGNOSTIC || !file_name(path).starts_with("ses-"))
        .collect())
}

/// `{stem}_task-{task}_eeg.json` files directly inside `dir`
fn task_sidecars(dir: &Path, stem: &str) -> Result<Vec<(String, PathBuf)>> {
    let prefix = format!("{}_task-", stem);
    Ok(sorted_files(dir)?
        .into_iter()
        .filter_map(|path| {
            let name = file_name(&path);
            let task = between(&name, &prefix, "_eeg.json")?.to_string();
            Some((task, path))
        })
        .collect())
}
