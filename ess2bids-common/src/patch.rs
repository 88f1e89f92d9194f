//! Field-replacement workflow
//!
//! Applies `field_replacements.json` to an imported project: task renames
//! first, then task field directives, then channel directives. Every path a
//! directive can affect is collected into a changeset so the following export
//! rewrites only those files. Problems are reported, never raised.

use crate::archive::ARCHIVE_DIR;
use crate::export::{export_project, ExportOptions, ExportSummary};
use crate::field_store::{Fields, Scope};
use crate::import::import_project;
use crate::layout::{is_identifier, replace_task_token, Layout, FIELD_REPLACEMENTS};
use crate::project::{Directive, Project, CHANNEL_TYPES, SESSION_AGNOSTIC};
use crate::report::{finalizer_section, Report};
use crate::tabular::{cell_text, Changeset};
use crate::{Error, Result};
use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

/// What applying the directives produced
#[derive(Debug, Clone, Default)]
pub struct PatchOutcome {
    pub changes: Changeset,
    /// Files to move, as (old, new)
    pub renamed: Vec<(PathBuf, PathBuf)>,
    pub report: Report,
}

/// Import the layout at `root`, apply its field replacements and write back
/// only what changed; a finalizer section is appended to REPORT.txt.
pub fn replace_fields(root: &Path, stub: bool) -> Result<(Report, ExportSummary)> {
    let mut report = Report::new();
    let mut project = import_project(root, &mut report)?;

    let outcome = apply_field_replacements(&mut project, root)?;
    report.extend(outcome.report);

    let options = ExportOptions {
        changes: Some(outcome.changes),
        renamed: outcome.renamed,
        stub,
        report: finalizer_section(Utc::now(), &report),
    };
    let summary = export_project(&mut project, root, &options)?;
    Ok((report, summary))
}

/// Apply `project.field_replacements` in memory
pub fn apply_field_replacements(project: &mut Project, root: &Path) -> Result<PatchOutcome> {
    let layout = Layout::new(root);
    let mut outcome = PatchOutcome::default();

    let renames: Vec<(String, Value)> = project
        .field_replacements
        .tasks
        .iter()
        .flat_map(|(task, directives)| {
            directives
                .iter()
                .filter_map(|d| d.rename.clone())
                .map(move |rename| (task.clone(), rename))
        })
        .collect();
    for (old, new) in renames {
        rename_task(project, &layout, &old, &new, &mut outcome)?;
    }

    let tasks = project.field_replacements.tasks.clone();
    for (task, directives) in &tasks {
        if !project.tasks.contains_key(task) {
            outcome.report.fail(format!(
                "Task label {} isn't in the project structure",
                task
            ));
            continue;
        }
        for directive in directives.iter().filter(|d| d.rename.is_none()) {
            apply_task_directive(project, &layout, task, directive, &mut outcome);
        }
    }

    let channels = project.field_replacements.channels.clone();
    for (channel, directives) in &channels {
        for directive in directives {
            apply_channel_directive(project, &layout, channel, directive, &mut outcome);
        }
    }

    info!(
        changes = outcome.changes.len(),
        renames = outcome.renamed.len(),
        failures = outcome.report.failures().len(),
        "Applied field replacements"
    );
    Ok(outcome)
}

fn rename_task(
    project: &mut Project,
    layout: &Layout,
    old: &str,
    new: &Value,
    outcome: &mut PatchOutcome,
) -> Result<()> {
    let Some(new) = new.as_str().filter(|n| is_identifier(n)) else {
        outcome.report.fail(format!(
            "New label {} for task {} needs to be alphanumeric",
            cell_text(new),
            old
        ));
        return Ok(());
    };
    if !project.tasks.contains_key(old) {
        outcome
            .report
            .fail(format!("Task label {} isn't in the project structure", old));
        return Ok(());
    }
    if project.tasks.contains_key(new) {
        outcome
            .report
            .fail(format!("Cannot rename task {} to {}: label already exists", old, new));
        return Ok(());
    }
    info!(from = old, to = new, "Renaming task");

    let Some(mut task) = project.tasks.remove(old) else {
        return Err(Error::NotFound(format!("task {}", old)));
    };
    if task.fields.get("TaskName", &Scope::Project).ok() == Some(&Value::String(old.to_string())) {
        task.fields
            .set("TaskName", Value::String(new.to_string()), Scope::Project);
    }

    for (sub_id, subject) in project.subjects.iter_mut() {
        for (ses_id, session) in subject.sessions.iter_mut() {
            if !session.scans.values().any(|scan| scan.task == old) {
                continue;
            }
            // Rebuilt in place so renamed scans keep their row position
            let scans = std::mem::take(&mut session.scans);
            for (label, mut scan) in scans {
                if scan.task != old {
                    session.scans.insert(label, scan);
                    continue;
                }
                let new_label = replace_task_token(&label, old, new).unwrap_or_else(|| label.clone());
                scan.task = new.to_string();
                if let Some(name) = scan.path.file_name().and_then(|n| n.to_str()) {
                    if let Some(renamed) = replace_task_token(name, old, new) {
                        scan.path = scan.path.with_file_name(renamed);
                    }
                }
                task.fields.rename_scan(sub_id, ses_id, &label, &new_label);
                session.scans.insert(new_label, scan);
            }
            outcome.changes.insert(layout.scans_tsv(sub_id, ses_id));
        }
    }
    project.tasks.insert(new.to_string(), task);

    let mut directives = project
        .field_replacements
        .tasks
        .remove(old)
        .unwrap_or_default();
    directives.retain(|d| d.rename.is_none());
    project
        .field_replacements
        .tasks
        .entry(new.to_string())
        .or_default()
        .extend(directives);
    outcome.changes.insert(layout.file(FIELD_REPLACEMENTS));

    if !layout.root().is_dir() {
        return Ok(());
    }
    for entry in WalkDir::new(layout.root())
        .into_iter()
        .filter_entry(|e| e.file_name() != ARCHIVE_DIR)
    {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        if let Some(renamed) = replace_task_token(name, old, new) {
            let from = entry.path().to_path_buf();
            let to = from.with_file_name(renamed);
            debug!(from = %from.display(), to = %to.display(), "Planned rename");
            outcome.changes.insert(from.clone());
            outcome.changes.insert(to.clone());
            outcome.renamed.push((from, to));
        }
    }
    Ok(())
}

/// Directive values minus unfilled (null) placeholders
fn filled_fields(directive: &Directive, target: &str, outcome: &mut PatchOutcome) -> Fields {
    let mut fields = Fields::new();
    for (name, value) in &directive.fields {
        if value.is_null() {
            outcome.report.warn(format!(
                "Field {} of {} has no value yet and was skipped",
                name, target
            ));
        } else {
            fields.insert(name.clone(), value.clone());
        }
    }
    fields
}

/// Sessions selected by a directive; `None` if the selector is malformed
fn selected_sessions(project: &Project, directive: &Directive) -> Option<Vec<(String, String)>> {
    let selector = match &directive.selector {
        None => Fields::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(_) => return None,
    };

    let mut selected = Vec::new();
    for (sub_id, subject) in &project.subjects {
        for (ses_id, session) in &subject.sessions {
            let all_match = selector.iter().all(|(name, wanted)| {
                let by_session = session.fields.get(name).map(|v| values_match(v, wanted));
                let by_subject = subject.fields.get(name).map(|v| values_match(v, wanted));
                let by_identity = match name.as_str() {
                    "participant_id" => Some(values_match(&Value::String(format!("sub-{}", sub_id)), wanted)),
                    "session_id" if ses_id != SESSION_AGNOSTIC => {
                        Some(values_match(&Value::String(format!("ses-{}", ses_id)), wanted))
                    }
                    _ => None,
                };
                [by_session, by_subject, by_identity]
                    .into_iter()
                    .flatten()
                    .any(|matched| matched)
            });
            if all_match {
                selected.push((sub_id.clone(), ses_id.clone()));
            }
        }
    }
    Some(selected)
}

/// Equal as JSON, or equal once rendered as a table cell
fn values_match(actual: &Value, wanted: &Value) -> bool {
    actual == wanted || cell_text(actual) == cell_text(wanted)
}

/// Every sidecar path that can hold fields of `task`
fn task_sidecar_paths(project: &Project, layout: &Layout, task: &str) -> Vec<PathBuf> {
    let mut paths = vec![layout.task_sidecar(task)];
    for (sub_id, subject) in &project.subjects {
        paths.push(layout.subject_task_sidecar(sub_id, task));
        for (ses_id, session) in &subject.sessions {
            if let Some(path) = layout.sidecar_for(task, &Scope::session(sub_id, ses_id)) {
                paths.push(path);
            }
            for (label, scan) in &session.scans {
                if scan.task == task {
                    paths.push(layout.scan_sidecar(sub_id, ses_id, label));
                }
            }
        }
    }
    paths
}

fn apply_task_directive(
    project: &mut Project,
    layout: &Layout,
    task_label: &str,
    directive: &Directive,
    outcome: &mut PatchOutcome,
) {
    let updates = filled_fields(directive, &format!("task {}", task_label), outcome);
    if updates.is_empty() {
        return;
    }

    let scopes = match &directive.selector {
        None => vec![Scope::Project],
        Some(_) => match selected_sessions(project, directive) {
            Some(sessions) => sessions
                .iter()
                .map(|(sub, ses)| Scope::session(sub, ses))
                .collect(),
            None => {
                outcome.report.fail(format!(
                    "Malformed field replacement entry in {}",
                    task_label
                ));
                return;
            }
        },
    };
    if scopes.is_empty() {
        outcome.report.warn(format!(
            "A field replacement for task {} matched no session",
            task_label
        ));
        return;
    }

    let Some(task) = project.tasks.get_mut(task_label) else {
        return;
    };
    for scope in &scopes {
        for (name, value) in &updates {
            task.fields.set_overriding(name, value.clone(), scope.clone());
        }
    }
    debug!(task = task_label, scopes = scopes.len(), "Applied task directive");

    outcome
        .changes
        .extend(task_sidecar_paths(project, layout, task_label));
}

fn apply_channel_directive(
    project: &mut Project,
    layout: &Layout,
    channel: &str,
    directive: &Directive,
    outcome: &mut PatchOutcome,
) {
    match directive.fields.get("type") {
        Some(Value::Null) => outcome
            .report
            .warn(format!("Channel type for {} is unspecified", channel)),
        Some(kind) if !kind.as_str().map(|k| CHANNEL_TYPES.contains(&k)).unwrap_or(false) => {
            outcome.report.fail(format!(
                "Channel type {} is invalid for channel label {}",
                cell_text(kind),
                channel
            ));
            return;
        }
        _ => {}
    }

    let updates: Fields = directive
        .fields
        .iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    if updates.is_empty() {
        return;
    }

    let Some(sessions) = selected_sessions(project, directive) else {
        outcome
            .report
            .fail(format!("Malformed field replacement entry in {}", channel));
        return;
    };

    let mut touched_tasks = BTreeSet::new();
    for (sub_id, ses_id) in &sessions {
        let Some(session) = project
            .subjects
            .get_mut(sub_id)
            .and_then(|s| s.sessions.get_mut(ses_id))
        else {
            continue;
        };
        for (label, scan) in session.scans.iter_mut() {
            let Some(target) = scan.channel_mut(channel) else {
                continue;
            };
            for (name, value) in &updates {
                target.fields.insert(name.clone(), value.clone());
            }
            outcome.changes.insert(layout.channels(sub_id, ses_id, label));
            touched_tasks.insert(scan.task.clone());
        }
    }

    if touched_tasks.is_empty() {
        outcome.report.warn(format!(
            "Channel {} was not found in any selected scan",
            channel
        ));
        return;
    }
    for task in &touched_tasks {
        outcome
            .changes
            .extend(task_sidecar_paths(project, layout, task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::project::{Channel, Scan, Session, Subject};
    use serde_json::json;

    fn fields(value: Value) -> Fields {
        match value {
            Value::Object(map) => map,
            _ => Fields::new(),
        }
    }

    /// Two subjects, one session each, one "rest" scan per session
    fn project() -> Project {
        let mut project = Project::new("demo");
        for (sub, group) in [("01", "control"), ("02", "patient")] {
            let label = format!("eeg/sub-{}_ses-01_task-rest_eeg.set", sub);
            let mut scan = Scan::new("rest", format!("/src/{}.set", sub), 0);
            scan.channels.push(Channel::new("Fz", "EEG", "µV", "256"));
            scan.channels.push(Channel::new("X1", "null", "µV", "256"));
            let mut session = Session {
                fields: fields(json!({"legacy_recordingParameterSet": "rps1"})),
                ..Session::default()
            };
            session.scans.insert(label, scan);
            let mut subject = Subject {
                fields: fields(json!({"group": group})),
                ..Subject::default()
            };
            subject.sessions.insert("01".to_string(), session);
            project.subjects.insert(sub.to_string(), subject);
        }
        project
            .task_mut("rest")
            .fields
            .set("TaskName", json!("rest"), Scope::Project);
        project
    }

    #[test]
    fn test_where_is_a_strict_conjunction() {
        let project = project();
        let both = Directive::selecting(fields(json!({
            "group": "control",
            "legacy_recordingParameterSet": "rps1"
        })));
        assert_eq!(
            selected_sessions(&project, &both).unwrap(),
            vec![("01".to_string(), "01".to_string())]
        );

        let conflicting = Directive::selecting(fields(json!({
            "group": "control",
            "participant_id": "sub-02"
        })));
        assert!(selected_sessions(&project, &conflicting).unwrap().is_empty());

        let everything = Directive::default();
        assert_eq!(selected_sessions(&project, &everything).unwrap().len(), 2);
    }

    #[test]
    fn test_session_directive_overrides_narrower_entries() {
        let mut project = project();
        let label = "eeg/sub-01_ses-01_task-rest_eeg.set";
        project.tasks.get_mut("rest").unwrap().fields.set(
            "PowerLineFrequency",
            json!(50),
            Scope::scan("01", "01", label),
        );
        project.field_replacements.tasks.insert(
            "rest".into(),
            vec![Directive::selecting(fields(json!({"participant_id": "sub-01"})))
                .with_field("PowerLineFrequency", json!(60))],
        );

        let outcome = apply_field_replacements(&mut project, Path::new("/bids")).unwrap();

        let store = &project.tasks["rest"].fields;
        assert_eq!(
            store.get("PowerLineFrequency", &Scope::session("01", "01")).unwrap(),
            &json!(60)
        );
        assert!(!store.contains("PowerLineFrequency", &Scope::scan("01", "01", label)));
        assert!(outcome
            .changes
            .contains(&PathBuf::from("/bids/sub-01/ses-01/sub-01_ses-01_task-rest_eeg.json")));
        assert!(outcome.report.failures().is_empty());
    }

    #[test]
    fn test_placeholder_values_are_skipped_with_warning() {
        let mut project = project();
        project.field_replacements.tasks.insert(
            "rest".into(),
            vec![Directive::default().with_field("PowerLineFrequency", Value::Null)],
        );

        let outcome = apply_field_replacements(&mut project, Path::new("/bids")).unwrap();

        assert!(!project.tasks["rest"].fields.contains_name("PowerLineFrequency"));
        assert_eq!(outcome.report.warnings().len(), 1);
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_unknown_task_and_malformed_where_fail() {
        let mut project = project();
        project.field_replacements.tasks.insert(
            "missing".into(),
            vec![Directive::default().with_field("A", json!(1))],
        );
        project.field_replacements.tasks.insert(
            "rest".into(),
            vec![Directive {
                selector: Some(json!("sub-01")),
                ..Directive::default()
            }
            .with_field("A", json!(1))],
        );

        let outcome = apply_field_replacements(&mut project, Path::new("/bids")).unwrap();

        let failures = outcome.report.failures();
        assert_eq!(failures.len(), 2);
        assert!(failures
            .iter()
            .any(|f| f == "Task label missing isn't in the project structure"));
        assert!(failures
            .iter()
            .any(|f| f == "Malformed field replacement entry in rest"));
    }

    #[test]
    fn test_channel_directive_sets_type_in_selected_sessions() {
        let mut project = project();
        project.field_replacements.channels.insert(
            "X1".into(),
            vec![Directive::selecting(fields(json!({"participant_id": "sub-02"})))
                .with_field("type", json!("EOG"))],
        );

        let outcome = apply_field_replacements(&mut project, Path::new("/bids")).unwrap();

        let scan = |sub: &str| {
            project.subjects[sub].sessions["01"].scans
                [&format!("eeg/sub-{}_ses-01_task-rest_eeg.set", sub)]
                .clone()
        };
        assert_eq!(scan("02").channels[1].channel_type(), Some("EOG"));
        assert_eq!(scan("01").channels[1].channel_type(), Some("null"));
        assert!(outcome.changes.contains(&PathBuf::from(
            "/bids/sub-02/ses-01/eeg/sub-02_ses-01_task-rest_channels.tsv"
        )));
    }

    #[test]
    fn test_invalid_channel_type_fails_directive() {
        let mut project = project();
        project.field_replacements.channels.insert(
            "X1".into(),
            vec![Directive::default().with_field("type", json!("BRAIN"))],
        );

        let outcome = apply_field_replacements(&mut project, Path::new("/bids")).unwrap();

        assert_eq!(
            outcome.report.failures(),
            &["Channel type BRAIN is invalid for channel label X1".to_string()]
        );
        assert!(outcome.changes.is_empty());
    }

    #[test]
    fn test_rename_rejects_bad_labels() {
        let mut project = project();
        project
            .field_replacements
            .tasks
            .insert("rest".into(), vec![Directive::renaming("not valid")]);

        let outcome = apply_field_replacements(&mut project, Path::new("/nonexistent")).unwrap();

        assert_eq!(outcome.report.failures().len(), 1);
        assert!(project.tasks.contains_key("rest"));
    }
}
