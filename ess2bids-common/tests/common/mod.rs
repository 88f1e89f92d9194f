//! Shared fixtures for integration tests

#![allow(dead_code)]

use ess2bids_common::field_store::{Fields, Scope};
use ess2bids_common::layout::scan_label;
use ess2bids_common::project::{
    Channel, Electrode, Event, Project, Scan, Session, Subject, SESSION_AGNOSTIC,
};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub fn fields(value: Value) -> Fields {
    match value {
        Value::Object(map) => map,
        _ => Fields::new(),
    }
}

fn scan(task: &str, label: &str, recording_num: &str) -> Scan {
    let mut scan = Scan::new(task, format!("/source/{}", label), 1);
    scan.fields = fields(json!({"ESS_inSessionRecordingNum": recording_num}));
    scan.channels = vec![
        Channel::new("Fz", "EEG", "µV", "256"),
        Channel::new("Cz", "EEG", "µV", "256"),
        Channel::new("VEOG", "EOG", "µV", "256"),
    ];
    scan.events = vec![
        Event {
            onset: "0.5".into(),
            duration: "n/a".into(),
            event_code: "1".into(),
            hed: Some("Event/Label/Target".into()),
        },
        Event {
            onset: "1.75".into(),
            duration: "n/a".into(),
            event_code: "2".into(),
            hed: None,
        },
    ];
    scan
}

/// Subject 01 with two sessions, subject 02 without sessions; tasks rest and flanker
pub fn sample_project() -> Project {
    let mut project = Project::new("Sample Study");
    project.init_dataset_description(
        "1.2.1",
        "CC0",
        vec!["A. Author".into()],
        vec!["Grant 1".into()],
    );
    project.readme = "A sample study\n".into();
    project.changes = "1.0.0 2020-01-01\n - Initial release\n".into();
    project.field_definitions = fields(json!({
        "group": {"Description": "Experimental group"}
    }));

    let layout_sessions = [("01", "01"), ("01", "02"), ("02", SESSION_AGNOSTIC)];
    for (sub, ses) in layout_sessions {
        let subject = project
            .subjects
            .entry(sub.to_string())
            .or_insert_with(|| Subject {
                fields: fields(json!({"group": if sub == "01" { "control" } else { "patient" }})),
                ..Subject::default()
            });

        let mut session = Session::default();
        if ses != SESSION_AGNOSTIC {
            session.fields = fields(json!({"acq_time": format!("2020-01-0{}T10:00:00", ses)}));
            subject.field_definitions = fields(json!({
                "acq_time": {"Description": "Acquisition time"}
            }));
        }
        for (run, task) in [(1, "rest"), (2, "rest"), (1, "flanker")] {
            let label = scan_label(sub, ses, task, run);
            session
                .scans
                .insert(label.clone(), scan(task, &label, &run.to_string()));
        }
        if sub == "01" && ses == "01" {
            session.electrodes = ["Fz", "Cz"]
                .iter()
                .enumerate()
                .map(|(i, name)| Electrode {
                    name: name.to_string(),
                    x: 0.5 * i as f64,
                    y: -1.25,
                    z: 3.0,
                })
                .collect();
            session.coordsystem = fields(json!({
                "EEGCoordinateSystem": "Other",
                "EEGCoordinateUnits": "mm"
            }));
        }
        subject.sessions.insert(ses.to_string(), session);
    }

    for task in ["rest", "flanker"] {
        let entry = project.task_mut(task);
        entry.fields.set("TaskName", json!(task), Scope::Project);
        entry.event_codes = fields(json!({"1": "Event/Label/Target", "2": "Event/Label/Cue"}));
    }

    // Differs per scan so it stays at scan scope
    let rest = project.task_mut("rest");
    for (sub, ses) in [("01", "01"), ("01", "02"), ("02", SESSION_AGNOSTIC)] {
        for run in [1, 2] {
            rest.fields.set(
                "RecordingDuration",
                json!(100.0 * run as f64),
                Scope::scan(sub, ses, &scan_label(sub, ses, "rest", run)),
            );
        }
        rest.fields
            .set("PowerLineFrequency", json!(60), Scope::session(sub, ses));
    }
    project
}

/// Every file under `root` outside archived/, relative path -> bytes
pub fn snapshot(root: &Path) -> Vec<(PathBuf, Vec<u8>)> {
    let mut files: Vec<(PathBuf, Vec<u8>)> = WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.file_name() != "archived")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().to_path_buf();
            (relative, fs::read(e.path()).unwrap())
        })
        .collect();
    files.sort();
    files
}

/// Files currently in archived/
pub fn archived(root: &Path) -> Vec<String> {
    let dir = root.join("archived");
    if !dir.is_dir() {
        return Vec::new();
    }
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
