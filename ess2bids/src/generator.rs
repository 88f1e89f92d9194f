//! Maps an extracted study description onto a [`Project`]
//!
//! Subjects and sessions are numbered in first-seen order. Values that cannot
//! be derived from the legacy description (power line frequency, types of
//! non-scalp channels) are left as placeholder directives in
//! `field_replacements.json` for the user to fill in before finalizing.

use crate::definitions::{self, define};
use crate::description::{DataRecording, SessionRecord, StudyDescription, SubjectRecord};
use crate::electrodes::{CachedExtractor, ElectrodeExtractor};
use chrono::NaiveDate;
use ess2bids_common::layout::scan_label;
use ess2bids_common::project::{
    sequence_id, Channel, Directive, Event, Project, Scan, Session, Subject, CHANNEL_TYPES,
};
use ess2bids_common::tabular::NOT_AVAILABLE;
use ess2bids_common::{Error, Fields, Result, Scope};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use tracing::{debug, info, warn};

/// Directory, relative to the study, holding one folder per session number
pub const SESSION_DIR: &str = "session";

/// Extra documentation carried verbatim into the layout
pub const ADDITIONAL_DOCUMENTATION: &str = "additional_documentation";

/// Field tying a session to its recording parameter set
pub const PARAMETER_SET_FIELD: &str = "legacy_recordingParameterSet";

const CHANNEL_UNITS: &str = "µV";

#[derive(Debug, Clone)]
pub struct GeneratorOptions {
    pub bids_version: String,
    /// Date of the initial release entry in CHANGES
    pub today: NaiveDate,
}

/// Alphanumeric task label: `_`, `-` and spaces start a new capitalized word
pub fn camel_case_label(label: &str) -> String {
    let mut out = String::with_capacity(label.len());
    let mut capitalize = false;
    for c in label.chars() {
        match c {
            '_' | '-' | ' ' => capitalize = true,
            c if capitalize => {
                out.extend(c.to_uppercase());
                capitalize = false;
            }
            c => out.push(c),
        }
    }
    out.retain(|c| c.is_ascii_alphanumeric());
    out
}

/// Tags of an event instance beyond those its code declares
fn extra_tags(tags: &str, declared: Option<&str>) -> Option<String> {
    let remaining = match declared {
        Some(declared) if !declared.is_empty() => tags.replace(declared, ""),
        _ => tags.to_string(),
    };
    let joined = remaining
        .split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>()
        .join(",");
    (!joined.is_empty()).then_some(joined)
}

/// Build the project for a study whose description lives in `study_dir`
pub fn generate_project<E: ElectrodeExtractor>(
    study: &StudyDescription,
    study_dir: &Path,
    extractor: &mut CachedExtractor<E>,
    options: &GeneratorOptions,
) -> Result<Project> {
    let name = study
        .header
        .title
        .clone()
        .or_else(|| {
            study_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
        })
        .unwrap_or_default();

    let mut project = Project::new(&name);
    project.init_dataset_description(
        &options.bids_version,
        study.header.license.as_deref().unwrap_or_default(),
        Vec::new(),
        study.header.funding_organization.iter().cloned().collect(),
    );
    project.readme = format!(
        "Description: {}\nLegacy UUID: {}\n",
        study.header.description.as_deref().unwrap_or(NOT_AVAILABLE),
        study.header.uuid.as_deref().unwrap_or(NOT_AVAILABLE)
    );
    project.changes = format!("1.0.0 - {}\n - Initial Release\n", options.today.format("%Y-%m-%d"));

    info!("Reading project {}...", study_dir.display());
    let mut generator = Generator {
        study,
        study_dir,
        extractor,
        project,
        subject_ids: HashMap::new(),
        session_ids: HashMap::new(),
    };
    generator.sessions()?;
    generator.tasks();
    generator.event_codes();

    let mut project = generator.project;
    let documentation = study_dir.join(ADDITIONAL_DOCUMENTATION);
    if documentation.exists() {
        project.ignored_files.push(documentation);
    }

    info!(
        subjects = project.subjects.len(),
        tasks = project.tasks.len(),
        "Finalizing product..."
    );
    Ok(project)
}

struct Generator<'a, E> {
    study: &'a StudyDescription,
    study_dir: &'a Path,
    extractor: &'a mut CachedExtractor<E>,
    project: Project,
    /// Lab id -> subject id
    subject_ids: HashMap<String, String>,
    /// (subject id, session number) -> session id
    session_ids: HashMap<(String, String), String>,
}

impl<'a, E: ElectrodeExtractor> Generator<'a, E> {
    fn sessions(&mut self) -> Result<()> {
        let study = self.study;
        for group in &study.sessions {
            for session in &group.sessions {
                let task = camel_case_label(session.task_label.as_deref().unwrap_or_default());
                if task.is_empty() {
                    warn!(
                        "Session {} has no usable task label; its recordings are skipped",
                        group.number
                    );
                    continue;
                }
                if !self.project.tasks.contains_key(&task) {
                    self.project
                        .task_mut(&task)
                        .fields
                        .set("TaskName", json!(task), Scope::Project);
                }

                for subject in &session.subjects {
                    let sub_id = self.subject(subject);
                    let ses_id = self.session(&sub_id, &group.number, session, subject)?;
                    for recording in &session.recordings {
                        self.recording(&sub_id, &ses_id, &group.number, &task, recording)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Subject id for `record`, creating the subject on first sight
    fn subject(&mut self, record: &SubjectRecord) -> String {
        if let Some(id) = self.subject_ids.get(&record.lab_id) {
            return id.clone();
        }

        let id = sequence_id(self.subject_ids.len());
        info!("Adding Subject {} to Structure...", id);
        let mut subject = Subject::default();
        let participant = [
            ("group", record.group.as_deref()),
            ("year_of_birth", record.year_of_birth.as_deref()),
            ("legacy_labID", Some(record.lab_id.as_str())),
        ];
        for (name, value) in participant {
            if let Some(value) = value {
                subject.fields.insert(name.to_string(), json!(value));
                define(&mut self.project.field_definitions, name, definitions::participant_field);
            }
        }

        self.project.subjects.insert(id.clone(), subject);
        self.subject_ids.insert(record.lab_id.clone(), id.clone());
        id
    }

    /// Session id for this subject and session number, creating it on first sight
    fn session(
        &mut self,
        sub_id: &str,
        number: &str,
        record: &SessionRecord,
        subject_record: &SubjectRecord,
    ) -> Result<String> {
        let key = (sub_id.to_string(), number.to_string());
        if let Some(id) = self.session_ids.get(&key) {
            return Ok(id.clone());
        }

        let subject = self
            .project
            .subjects
            .get_mut(sub_id)
            .ok_or_else(|| Error::NotFound(format!("subject {}", sub_id)))?;
        let id = sequence_id(subject.sessions.len());
        info!("Adding information from Session {}", id);

        let mut session = Session::default();
        let acq_time = record
            .recordings
            .iter()
            .filter_map(|r| r.start_date_time.as_deref())
            .min();
        let values = [
            ("acq_time", acq_time),
            ("ESS_subjectLabID", Some(subject_record.lab_id.as_str())),
            ("ESS_sessionNum", Some(number)),
            ("ESS_sessionID", record.lab_id.as_deref()),
            ("ESS_inSessionRecordingNum", subject_record.in_session_number.as_deref()),
            ("caffeine", subject_record.caffeine.as_deref()),
            ("alcohol", subject_record.alcohol.as_deref()),
            ("age", subject_record.age.as_deref()),
            ("height", subject_record.height.as_deref()),
            ("weight", subject_record.weight.as_deref()),
            ("gender", subject_record.gender.as_deref()),
            ("hand", subject_record.hand.as_deref()),
        ];
        for (name, value) in values {
            if let Some(value) = value {
                session.fields.insert(name.to_string(), json!(value));
                define(&mut subject.field_definitions, name, definitions::session_field);
            }
        }
        for name in ["ESS_dataRecordingUuid", "ESS_inSessionRecordingNum"] {
            define(&mut session.field_definitions, name, definitions::scan_field);
        }

        subject.sessions.insert(id.clone(), session);
        self.session_ids.insert(key, id.clone());
        Ok(id)
    }

    fn recording(
        &mut self,
        sub_id: &str,
        ses_id: &str,
        number: &str,
        task: &str,
        recording: &DataRecording,
    ) -> Result<()> {
        let source_dir = self.study_dir.join(SESSION_DIR).join(number);
        let run = self.session_mut(sub_id, ses_id)?
            .scans
            .values()
            .filter(|s| s.task == task)
            .count() as u32
            + 1;
        let label = scan_label(sub_id, ses_id, task, run);
        debug!(label = %label, source = %recording.filename, "Adding scan");

        let mut scan = Scan::new(task, source_dir.join(&recording.filename), run);
        if let Some(uuid) = &recording.uuid {
            scan.fields.insert("ESS_dataRecordingUuid".into(), json!(uuid));
        }
        scan.fields.insert(
            "ESS_inSessionRecordingNum".into(),
            json!(recording.in_session_number()),
        );
        scan.events = self.events(task, &source_dir, recording)?;

        if let Some(set_label) = recording.parameter_set.as_deref() {
            self.electrodes(sub_id, ses_id, set_label, &recording.filename, &source_dir)?;
            self.channels(sub_id, ses_id, task, &label, set_label, &mut scan);
        } else {
            warn!("Recording {} names no recording parameter set", recording.filename);
        }

        self.session_mut(sub_id, ses_id)?.scans.insert(label, scan);
        Ok(())
    }

    fn session_mut(&mut self, sub_id: &str, ses_id: &str) -> Result<&mut Session> {
        self.project
            .subjects
            .get_mut(sub_id)
            .and_then(|s| s.sessions.get_mut(ses_id))
            .ok_or_else(|| Error::NotFound(format!("session {} of subject {}", ses_id, sub_id)))
    }

    /// Events of one recording, read from its event instance file
    fn events(&self, task: &str, source_dir: &Path, recording: &DataRecording) -> Result<Vec<Event>> {
        let Some(file) = recording.event_instance_file.as_deref() else {
            warn!("Recording {} names no event instance file", recording.filename);
            return Ok(Vec::new());
        };
        let path = source_dir.join(file);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::MissingRequiredFile(path));
            }
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in String::from_utf8_lossy(&bytes).lines() {
            let cells: Vec<&str> = line.trim_end_matches('\r').split('\t').collect();
            if cells.len() < 2 || cells[0].trim().is_empty() {
                continue;
            }
            let code = cells[0].trim();
            let declared = self.declared_tag(task, code);
            events.push(Event {
                onset: cells[1].trim().to_string(),
                duration: NOT_AVAILABLE.to_string(),
                event_code: code.to_string(),
                hed: cells.get(2).and_then(|tags| extra_tags(tags, declared)),
            });
        }
        Ok(events)
    }

    /// HED tag declared for `code`, preferring the declaration for `task`
    fn declared_tag(&self, task: &str, code: &str) -> Option<&'a str> {
        let study = self.study;
        let matching = || study.event_codes.iter().filter(move |c| c.code == code);
        matching()
            .find(|c| c.task_label.as_deref().map(camel_case_label).as_deref() == Some(task))
            .or_else(|| matching().find(|c| c.task_label.is_none()))
            .and_then(|c| c.hed_tag.as_deref())
    }

    /// Electrode positions of a session, extracted once per parameter set
    fn electrodes(
        &mut self,
        sub_id: &str,
        ses_id: &str,
        set_label: &str,
        filename: &str,
        source_dir: &Path,
    ) -> Result<()> {
        if !self.session_mut(sub_id, ses_id)?.coordsystem.is_empty() {
            return Ok(());
        }

        let electrodes = self
            .extractor
            .layout(set_label, filename, source_dir)?
            .electrodes();

        let Some(subject) = self.project.subjects.get_mut(sub_id) else {
            return Ok(());
        };
        define(&mut subject.field_definitions, PARAMETER_SET_FIELD, definitions::session_field);
        if let Some(session) = subject.sessions.get_mut(ses_id) {
            session.electrodes = electrodes;
            session.coordsystem.insert("EEGCoordinateSystem".into(), json!("RAS"));
            session.coordsystem.insert("EEGCoordinateUnits".into(), json!("mm"));
            session
                .fields
                .insert(PARAMETER_SET_FIELD.into(), json!(set_label));
        }
        Ok(())
    }

    /// Channels of a scan from its recording parameter set
    fn channels(
        &mut self,
        sub_id: &str,
        ses_id: &str,
        task: &str,
        label: &str,
        set_label: &str,
        scan: &mut Scan,
    ) {
        let Some(parameter_set) = self.study.parameter_set(set_label) else {
            warn!("Recording parameter set {} is not declared", set_label);
            return;
        };

        let scope = Scope::scan(sub_id, ses_id, label);
        for modality in &parameter_set.modalities {
            let mut kind = modality.kind.to_uppercase();
            if kind == "EKG" {
                kind = "ECG".to_string();
            } else if !CHANNEL_TYPES.contains(&kind.as_str()) {
                kind = "MISC".to_string();
            }

            if kind == "EEG" {
                let fields = &mut self.project.task_mut(task).fields;
                if let Some(rate) = modality.sampling_rate.as_deref() {
                    let value = rate.parse::<f64>().map(|r| json!(r)).unwrap_or_else(|_| json!(rate));
                    fields.set("SamplingFrequency", value, scope.clone());
                }
                let descriptive = [
                    ("CapManufacturer", &modality.name),
                    ("EEGPlacementScheme", &modality.channel_location_type),
                    ("EEGReference", &modality.reference_label),
                ];
                for (name, value) in descriptive {
                    let value = value.as_deref().unwrap_or(NOT_AVAILABLE);
                    fields.set(name, json!(value), scope.clone());
                }
            }

            let rate = modality.sampling_rate.as_deref().unwrap_or(NOT_AVAILABLE);
            for name in &modality.channel_labels {
                let channel_type = if modality.non_scalp_channel_labels.contains(name) {
                    self.placeholder_channel_directive(name, set_label);
                    "null"
                } else {
                    kind.as_str()
                };
                let channel = Channel::new(name, channel_type, CHANNEL_UNITS, rate);
                match scan.channel_mut(name) {
                    Some(existing) => *existing = channel,
                    None => scan.channels.push(channel),
                }
            }
        }
    }

    /// `{"where": {"legacy_recordingParameterSet": <label>}, "type": null}` once per label
    fn placeholder_channel_directive(&mut self, channel: &str, set_label: &str) {
        let directives = self
            .project
            .field_replacements
            .channels
            .entry(channel.to_string())
            .or_default();
        let selector = Value::Object(parameter_set_selector(set_label));
        if directives.iter().any(|d| d.selector.as_ref() == Some(&selector)) {
            return;
        }
        directives.push(
            Directive::selecting(parameter_set_selector(set_label)).with_field("type", Value::Null),
        );
    }

    /// TaskDescription and PowerLineFrequency placeholders per declared task
    fn tasks(&mut self) {
        let study = self.study;
        for record in &study.tasks {
            let name = camel_case_label(&record.label);
            if name.is_empty() {
                warn!("Task label {} has no alphanumeric characters", record.label);
                continue;
            }
            let task = self.project.task_mut(&name);
            if !task.fields.contains("TaskName", &Scope::Project) {
                task.fields.set("TaskName", json!(name), Scope::Project);
            }
            if let Some(description) = &record.description {
                task.fields
                    .set("TaskDescription", json!(description), Scope::Project);
            }

            let directives = study
                .parameter_sets
                .iter()
                .map(|ps| {
                    Directive::selecting(parameter_set_selector(&ps.label))
                        .with_field("PowerLineFrequency", Value::Null)
                })
                .collect();
            self.project.field_replacements.tasks.insert(name, directives);
        }
    }

    /// Event codes with instances go to their task, or project-wide when unresolved
    fn event_codes(&mut self) {
        let study = self.study;
        for record in &study.event_codes {
            if record.instances == 0 {
                continue;
            }
            let tag = record.hed_tag.clone().map(Value::String).unwrap_or(Value::Null);
            let task = record
                .task_label
                .as_deref()
                .map(camel_case_label)
                .filter(|t| self.project.tasks.contains_key(t));
            match task {
                Some(task) => {
                    self.project
                        .task_mut(&task)
                        .event_codes
                        .insert(record.code.clone(), tag);
                }
                None => {
                    self.project.event_codes.insert(record.code.clone(), tag);
                }
            }
        }
    }
}

fn parameter_set_selector(set_label: &str) -> Fields {
    let mut selector = Fields::new();
    selector.insert(PARAMETER_SET_FIELD.into(), json!(set_label));
    selector
}
