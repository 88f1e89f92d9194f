//! Integration tests for export, import and the finalize workflow
//!
//! Covers:
//! - Round trip: export then import reproduces the project
//! - Idempotent write: a second full export changes nothing
//! - Archive on change: a scoped export archives exactly the edited sidecar
//! - Changeset rule: a scoped export never writes paths outside the changeset
//! - Orphans of removed tasks and corrupt sidecars are archived
//! - Entity order survives ids of three digits
//! - Task rename through field_replacements.json

mod common;

use common::{archived, fields, sample_project, snapshot};
use ess2bids_common::export::{export_project, ExportOptions};
use ess2bids_common::field_store::Scope;
use ess2bids_common::import::import_project;
use ess2bids_common::layout::{scan_label, Layout, REPORT};
use ess2bids_common::project::{
    sequence_id, Project, Scan, Session, Subject, SESSION_AGNOSTIC,
};
use ess2bids_common::patch::replace_fields;
use ess2bids_common::report::Report;
use ess2bids_common::tabular::Changeset;
use serde_json::json;
use std::fs;
use tempfile::TempDir;

fn stub() -> ExportOptions {
    ExportOptions {
        stub: true,
        ..ExportOptions::default()
    }
}

#[test]
fn test_export_then_import_round_trips() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();

    let mut report = Report::new();
    let imported = import_project(dir.path(), &mut report).unwrap();

    assert!(report.is_empty(), "unexpected warnings: {:?}", report);
    assert_eq!(imported.name, project.name);
    assert_eq!(imported.dataset_description, project.dataset_description);
    assert_eq!(imported.field_definitions, project.field_definitions);

    assert_eq!(
        imported.tasks.keys().collect::<Vec<_>>(),
        project.tasks.keys().collect::<Vec<_>>()
    );
    for (name, task) in &project.tasks {
        assert!(
            task.fields.equivalent(&imported.tasks[name].fields),
            "field store of task {} differs",
            name
        );
    }

    assert_eq!(imported.subjects.len(), project.subjects.len());
    for (sub_id, subject) in &project.subjects {
        let other = &imported.subjects[sub_id];
        assert_eq!(other.fields, subject.fields);
        assert_eq!(other.field_definitions, subject.field_definitions);
        assert_eq!(
            other.sessions.keys().collect::<Vec<_>>(),
            subject.sessions.keys().collect::<Vec<_>>()
        );
        for (ses_id, session) in &subject.sessions {
            let other = &other.sessions[ses_id];
            assert_eq!(other.fields, session.fields);
            assert_eq!(other.electrodes, session.electrodes);
            assert_eq!(other.coordsystem, session.coordsystem);
            assert_eq!(
                other.scans.keys().collect::<Vec<_>>(),
                session.scans.keys().collect::<Vec<_>>()
            );
            for (label, scan) in &session.scans {
                let other = &other.scans[label];
                assert_eq!(other.task, scan.task);
                assert_eq!(other.run, scan.run);
                assert_eq!(other.fields, scan.fields);
                assert_eq!(other.events, scan.events);
                assert_eq!(other.channels, scan.channels);
            }
        }
    }
}

#[test]
fn test_consolidated_fields_land_in_the_right_sidecars() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();

    let root_sidecar: serde_json::Value = serde_json::from_str(
        &fs::read_to_string(dir.path().join("task-rest_eeg.json")).unwrap(),
    )
    .unwrap();
    assert_eq!(root_sidecar["TaskName"], json!("rest"));
    assert_eq!(root_sidecar["PowerLineFrequency"], json!(60));
    assert_eq!(root_sidecar["EEGChannelCount"], json!(2));
    assert_eq!(root_sidecar["SoftwareFilters"], json!("n/a"));

    let scan_sidecar = dir
        .path()
        .join("sub-01/ses-01/eeg/sub-01_ses-01_task-rest_run-2_eeg.json");
    let scan_fields: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(scan_sidecar).unwrap()).unwrap();
    assert_eq!(scan_fields, json!({"RecordingDuration": 200.0}));

    // No session concept for subject 02
    assert!(dir.path().join("sub-02/sub-02_scans.tsv").exists());
    assert!(!dir.path().join("sub-02/sub-02_sessions.tsv").exists());
    assert!(dir.path().join("sub-01/sub-01_sessions.tsv").exists());

    let bidsignore = fs::read_to_string(dir.path().join(".bidsignore")).unwrap();
    assert!(bidsignore.lines().any(|l| l == "archived"));
}

#[test]
fn test_second_full_export_is_byte_identical() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    let first: Vec<_> = snapshot(dir.path())
        .into_iter()
        .filter(|(path, _)| path != std::path::Path::new(REPORT))
        .collect();

    let summary = export_project(&mut project, dir.path(), &stub()).unwrap();
    let second: Vec<_> = snapshot(dir.path())
        .into_iter()
        .filter(|(path, _)| path != std::path::Path::new(REPORT))
        .collect();

    assert_eq!(first, second);
    assert!(summary.archived.is_empty());
    assert!(archived(dir.path()).is_empty());
}

#[test]
fn test_scoped_export_archives_only_the_changed_sidecar() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    let before = snapshot(dir.path());

    project.tasks.get_mut("rest").unwrap().fields.set(
        "TaskDescription",
        json!("Eyes closed"),
        Scope::Project,
    );
    let sidecar = Layout::new(dir.path()).task_sidecar("rest");
    let changes: Changeset = [sidecar.clone()].into_iter().collect();
    let options = ExportOptions {
        changes: Some(changes),
        stub: true,
        ..ExportOptions::default()
    };
    let summary = export_project(&mut project, dir.path(), &options).unwrap();

    let archived = archived(dir.path());
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("task-rest_eeg("));
    assert!(archived[0].ends_with(").json"));
    assert_eq!(summary.written, vec![sidecar.clone()]);

    let after = snapshot(dir.path());
    assert_eq!(after.len(), before.len());
    for ((path, old), (_, new)) in before.iter().zip(after.iter()) {
        if dir.path().join(path) == sidecar {
            assert_ne!(old, new);
        } else {
            assert_eq!(old, new, "{} changed", path.display());
        }
    }
}

#[test]
fn test_scoped_export_writes_nothing_outside_the_changeset() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    let options = ExportOptions {
        changes: Some(Changeset::new()),
        stub: true,
        ..ExportOptions::default()
    };

    let summary = export_project(&mut project, dir.path(), &options).unwrap();
    assert!(summary.written.is_empty(), "{:?}", summary.written);
    assert!(snapshot(dir.path()).is_empty());

    // Missing files are not recreated either
    export_project(&mut project, dir.path(), &stub()).unwrap();
    let sessions = dir.path().join("sub-01/sub-01_sessions.tsv");
    fs::remove_file(&sessions).unwrap();
    let summary = export_project(&mut project, dir.path(), &options).unwrap();
    assert!(summary.written.is_empty());
    assert!(!sessions.exists());
}

#[test]
fn test_export_archives_files_of_removed_task() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    assert!(dir.path().join("task-flanker_eeg.json").exists());

    project.tasks.remove("flanker");
    for subject in project.subjects.values_mut() {
        for session in subject.sessions.values_mut() {
            session.scans.retain(|_, scan| scan.task != "flanker");
        }
    }
    let summary = export_project(&mut project, dir.path(), &stub()).unwrap();

    for (path, _) in snapshot(dir.path()) {
        assert!(
            !path.to_string_lossy().contains("task-flanker"),
            "{} was left behind",
            path.display()
        );
    }
    let archived = archived(dir.path());
    assert!(archived.iter().any(|name| name.starts_with("task-flanker_eeg(")));
    assert!(archived
        .iter()
        .any(|name| name.starts_with("sub-02_task-flanker_run-1_events(")));
    assert_eq!(summary.archived.len(), archived.len());

    let scans = fs::read_to_string(dir.path().join("sub-02/sub-02_scans.tsv")).unwrap();
    assert!(!scans.contains("task-flanker"));
    assert!(scans.contains("task-rest_run-2"));
}

#[test]
fn test_corrupt_sidecar_is_archived_and_rewritten() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    let sidecar = dir.path().join("task-flanker_eeg.json");
    let good = fs::read_to_string(&sidecar).unwrap();
    fs::write(&sidecar, "{\"TaskName\": ").unwrap();

    let summary = export_project(&mut project, dir.path(), &stub()).unwrap();

    assert_eq!(fs::read_to_string(&sidecar).unwrap(), good);
    let archived = archived(dir.path());
    assert_eq!(archived.len(), 1);
    assert!(archived[0].starts_with("task-flanker_eeg("));
    assert_eq!(summary.archived.len(), 1);
}

/// `count` subjects without sessions, each with `runs` scans of task rest
fn numbered_project(count: usize, runs: u32) -> Project {
    let mut project = Project::new("Large Study");
    project.init_dataset_description("1.2.1", "CC0", vec![], vec![]);
    for index in 0..count {
        let id = sequence_id(index);
        let mut session = Session::default();
        for run in 1..=runs {
            let label = scan_label(&id, SESSION_AGNOSTIC, "rest", run);
            let mut scan = Scan::new("rest", format!("/source/{}", label), run);
            scan.fields = fields(json!({"ESS_inSessionRecordingNum": run.to_string()}));
            session.scans.insert(label, scan);
        }
        let mut subject = Subject {
            fields: fields(json!({"group": "control"})),
            ..Subject::default()
        };
        subject.sessions.insert(SESSION_AGNOSTIC.to_string(), session);
        project.subjects.insert(id, subject);
    }
    project
        .task_mut("rest")
        .fields
        .set("TaskName", json!("rest"), Scope::Project);
    project
}

#[test]
fn test_participants_keep_assignment_order_past_99_subjects() {
    let dir = TempDir::new().unwrap();
    let mut project = numbered_project(101, 1);
    export_project(&mut project, dir.path(), &stub()).unwrap();

    let expected: Vec<String> = (0..101).map(|i| format!("sub-{}", sequence_id(i))).collect();
    let participants = fs::read_to_string(dir.path().join("participants.tsv")).unwrap();
    let ids: Vec<String> = participants
        .lines()
        .skip(1)
        .map(|line| line.split('\t').next().unwrap().to_string())
        .collect();
    assert_eq!(ids, expected);

    let mut report = Report::new();
    let imported = import_project(dir.path(), &mut report).unwrap();
    let imported_ids: Vec<String> = imported
        .subjects
        .keys()
        .map(|id| format!("sub-{}", id))
        .collect();
    assert_eq!(imported_ids, expected);
}

#[test]
fn test_scans_keep_generation_order_past_nine_runs() {
    let dir = TempDir::new().unwrap();
    let mut project = numbered_project(1, 11);
    export_project(&mut project, dir.path(), &stub()).unwrap();

    let scans = fs::read_to_string(dir.path().join("sub-01/sub-01_scans.tsv")).unwrap();
    let labels: Vec<&str> = scans
        .lines()
        .skip(1)
        .map(|line| line.split('\t').next().unwrap())
        .collect();
    let expected: Vec<String> = (1..=11)
        .map(|run| scan_label("01", SESSION_AGNOSTIC, "rest", run))
        .collect();
    assert_eq!(labels, expected);

    let mut report = Report::new();
    let imported = import_project(dir.path(), &mut report).unwrap();
    let runs: Vec<u32> = imported.subjects["01"].sessions[SESSION_AGNOSTIC]
        .scans
        .values()
        .map(|scan| scan.run)
        .collect();
    assert_eq!(runs, (1..=11).collect::<Vec<_>>());
}

#[test]
fn test_task_rename_moves_every_file() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    fs::write(
        dir.path().join("field_replacements.json"),
        r#"{"tasks": {"rest": [{"rename": "calm"}]}}"#,
    )
    .unwrap();

    let (report, _) = replace_fields(dir.path(), true).unwrap();
    assert!(report.failures().is_empty(), "{:?}", report.failures());

    for (path, _) in snapshot(dir.path()) {
        assert!(
            !path.to_string_lossy().contains("task-rest"),
            "{} still names the old task",
            path.display()
        );
    }
    assert!(archived(dir.path())
        .iter()
        .any(|name| name.starts_with("task-rest_eeg(")));

    let mut report = Report::new();
    let imported = import_project(dir.path(), &mut report).unwrap();
    assert!(!imported.tasks.contains_key("rest"));
    assert_eq!(
        imported.tasks["calm"]
            .fields
            .get("TaskName", &Scope::Project)
            .unwrap(),
        &json!("calm")
    );
    let scans: Vec<_> = imported
        .subjects
        .values()
        .flat_map(|s| s.sessions.values())
        .flat_map(|s| s.scans.values())
        .collect();
    assert_eq!(scans.iter().filter(|s| s.task == "calm").count(), 6);
    assert!(scans.iter().all(|s| s.task != "rest"));

    // Scan-scope values follow the renamed labels
    assert_eq!(
        imported.tasks["calm"]
            .fields
            .get(
                "RecordingDuration",
                &Scope::scan("01", "01", "eeg/sub-01_ses-01_task-calm_run-2_eeg.set")
            )
            .unwrap(),
        &json!(200.0)
    );
}

#[test]
fn test_finalize_applies_session_directive() {
    let dir = TempDir::new().unwrap();
    let mut project = sample_project();
    export_project(&mut project, dir.path(), &stub()).unwrap();
    fs::write(
        dir.path().join("field_replacements.json"),
        serde_json::to_string_pretty(&json!({
            "tasks": {"flanker": [
                {"where": {"participant_id": "sub-01", "session_id": "ses-02"}, "PowerLineFrequency": 50}
            ]},
            "channels": {"VEOG": [{"type": "VEOG"}]}
        }))
        .unwrap(),
    )
    .unwrap();

    let (report, _) = replace_fields(dir.path(), true).unwrap();
    assert!(report.failures().is_empty(), "{:?}", report.failures());

    let session_sidecar = dir
        .path()
        .join("sub-01/ses-02/sub-01_ses-02_task-flanker_eeg.json");
    let value: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(session_sidecar).unwrap()).unwrap();
    assert_eq!(value["PowerLineFrequency"], json!(50));

    let channels = fs::read_to_string(
        dir.path()
            .join("sub-02/eeg/sub-02_task-flanker_run-1_channels.tsv"),
    )
    .unwrap();
    assert!(channels.contains("VEOG\tVEOG\t"));

    let report_text = fs::read_to_string(dir.path().join(REPORT)).unwrap();
    assert!(report_text.contains("--> Finalizer ran on"));

    // The directive stays valid for the next run and changes nothing more
    let before = snapshot(dir.path())
        .into_iter()
        .filter(|(p, _)| p != std::path::Path::new(REPORT))
        .collect::<Vec<_>>();
    replace_fields(dir.path(), true).unwrap();
    let after = snapshot(dir.path())
        .into_iter()
        .filter(|(p, _)| p != std::path::Path::new(REPORT))
        .collect::<Vec<_>>();
    assert_eq!(before, after);
}
