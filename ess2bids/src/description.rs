//! Study description extractor
//!
//! Reads `study_description.xml` into a typed [`StudyDescription`]. The XML is
//! first loaded into a small element tree, then walked by an [`Extractor`]
//! that knows the legacy schema. Placeholder values ("NA", "NaN", "n/a" and
//! empty text) come out as `None`.

use ess2bids_common::{Error, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// File name of the legacy study description
pub const DESCRIPTION_FILE: &str = "study_description.xml";

/// Subdirectory some studies keep their description in
pub const LEVEL1_DIR: &str = "Level1";

const PLACEHOLDERS: &[&str] = &["NA", "NaN", "n/a"];

/// How strictly the legacy schema is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    /// Missing elements become absent values; entries without a key are skipped
    #[default]
    Lenient,
    /// Any missing required element is a decode error
    Strict,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Header {
    pub title: Option<String>,
    pub description: Option<String>,
    pub funding_organization: Option<String>,
    pub uuid: Option<String>,
    pub root_uri: Option<String>,
    /// "type text link", trimmed
    pub license: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubjectRecord {
    pub lab_id: String,
    pub in_session_number: Option<String>,
    pub group: Option<String>,
    pub gender: Option<String>,
    pub year_of_birth: Option<String>,
    pub age: Option<String>,
    pub hand: Option<String>,
    pub vision: Option<String>,
    pub hearing: Option<String>,
    pub height: Option<String>,
    pub weight: Option<String>,
    pub channel_locations: Option<String>,
    pub caffeine: Option<String>,
    pub alcohol: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataRecording {
    pub filename: String,
    pub uuid: Option<String>,
    pub start_date_time: Option<String>,
    pub parameter_set: Option<String>,
    pub event_instance_file: Option<String>,
    pub original_path: Option<String>,
}

impl DataRecording {
    /// In-session recording number encoded after the last `_` of the filename
    pub fn in_session_number(&self) -> &str {
        let stem = self
            .filename
            .rsplit_once('.')
            .map(|(stem, _)| stem)
            .unwrap_or(&self.filename);
        stem.rsplit_once('_').map(|(_, num)| num).unwrap_or(stem)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionRecord {
    pub task_label: Option<String>,
    pub lab_id: Option<String>,
    /// Keyed by lab id; a repeated lab id replaces the earlier entry
    pub subjects: Vec<SubjectRecord>,
    pub recordings: Vec<DataRecording>,
}

/// All session records sharing one session number
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionGroup {
    pub number: String,
    pub sessions: Vec<SessionRecord>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskRecord {
    pub label: String,
    pub description: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Modality {
    pub kind: String,
    pub sampling_rate: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub start_channel: Option<String>,
    pub end_channel: Option<String>,
    pub subject_in_session_number: Option<String>,
    pub reference_location: Option<String>,
    pub reference_label: Option<String>,
    pub channel_location_type: Option<String>,
    pub channel_labels: Vec<String>,
    pub non_scalp_channel_labels: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterSet {
    pub label: String,
    pub modalities: Vec<Modality>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventCodeRecord {
    pub code: String,
    pub task_label: Option<String>,
    pub instances: u64,
    pub hed_tag: Option<String>,
    pub label: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StudyDescription {
    pub header: Header,
    /// Grouped by session number, in document order
    pub sessions: Vec<SessionGroup>,
    pub tasks: Vec<TaskRecord>,
    pub parameter_sets: Vec<ParameterSet>,
    pub event_codes: Vec<EventCodeRecord>,
}

impl StudyDescription {
    pub fn parameter_set(&self, label: &str) -> Option<&ParameterSet> {
        self.parameter_sets.iter().find(|ps| ps.label == label)
    }
}

/// Directory holding the study description: `input` itself or `input/Level1`
pub fn locate_study(input: &Path) -> Result<PathBuf> {
    if input.join(DESCRIPTION_FILE).is_file() {
        return Ok(input.to_path_buf());
    }
    let level1 = input.join(LEVEL1_DIR);
    if level1.join(DESCRIPTION_FILE).is_file() {
        debug!(path = %level1.display(), "Using Level1 study directory");
        return Ok(level1);
    }
    Err(Error::MissingRequiredFile(input.join(DESCRIPTION_FILE)))
}

/// Read and extract a study description file
pub fn read_description(path: &Path, mode: Mode) -> Result<StudyDescription> {
    let bytes = std::fs::read(path)?;
    parse_description(path, &bytes, mode)
}

/// Extract a study description from raw XML bytes; `path` is used in errors
pub fn parse_description(path: &Path, xml: &[u8], mode: Mode) -> Result<StudyDescription> {
    let root = parse_tree(path, xml)?;
    Extractor { path, mode }.study(&root)
}

/// Minimal element tree; attributes are not part of the legacy schema
#[derive(Debug, Default)]
struct Element {
    name: String,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn named(name: String) -> Self {
        Self {
            name,
            ..Self::default()
        }
    }

    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    fn value(&self) -> Option<String> {
        let text = self.text.trim();
        if text.is_empty() || PLACEHOLDERS.contains(&text) {
            None
        } else {
            Some(text.to_string())
        }
    }
}

fn decode_error(path: &Path, reason: impl ToString) -> Error {
    Error::SourceDecode {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    }
}

fn parse_tree(path: &Path, xml: &[u8]) -> Result<Element> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    // Bottom entry collects the document's top-level elements
    let mut stack = vec![Element::default()];

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| decode_error(path, format!("{} at byte {}", e, reader.buffer_position())))?;
        match event {
            Event::Start(ref e) => {
                let name = reader
                    .decoder()
                    .decode(e.local_name().as_ref())
                    .map_err(|e| decode_error(path, e))?
                    .into_owned();
                stack.push(Element::named(name));
            }
            Event::Empty(ref e) => {
                let name = reader
                    .decoder()
                    .decode(e.local_name().as_ref())
                    .map_err(|e| decode_error(path, e))?
                    .into_owned();
                if let Some(parent) = stack.last_mut() {
                    parent.children.push(Element::named(name));
                }
            }
            Event::End(_) => {
                let element = stack
                    .pop()
                    .ok_or_else(|| decode_error(path, "unbalanced end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => return Err(decode_error(path, "unbalanced end tag")),
                }
            }
            Event::Text(e) => {
                let text = e.unescape().map_err(|e| decode_error(path, e))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&text);
                }
            }
            Event::CData(e) => {
                let bytes = e.into_inner();
                let text = std::str::from_utf8(&bytes).map_err(|e| decode_error(path, e))?;
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(text);
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    if stack.len() != 1 {
        return Err(decode_error(path, "unexpected end of document"));
    }
    stack
        .pop()
        .and_then(|document| document.children.into_iter().next())
        .ok_or_else(|| decode_error(path, "no root element"))
}

/// Walks the element tree according to the legacy schema
struct Extractor<'p> {
    path: &'p Path,
    mode: Mode,
}

impl<'p> Extractor<'p> {
    /// Child element that the legacy converter could not do without
    fn required<'e>(&self, parent: &'e Element, name: &str) -> Result<Option<&'e Element>> {
        match parent.child(name) {
            Some(child) => Ok(Some(child)),
            None if self.mode == Mode::Strict => Err(decode_error(
                self.path,
                format!("<{}> is missing <{}>", parent.name, name),
            )),
            None => Ok(None),
        }
    }

    /// Key text of an entry; in lenient mode a missing key skips the entry
    fn key(&self, parent: &Element, name: &str) -> Result<Option<String>> {
        let key = self.required(parent, name)?.and_then(Element::value);
        if key.is_none() {
            if self.mode == Mode::Strict {
                return Err(decode_error(
                    self.path,
                    format!("<{}> has an empty <{}>", parent.name, name),
                ));
            }
            warn!("Skipping <{}> without <{}>", parent.name, name);
        }
        Ok(key)
    }

    /// Children of a required container element
    fn list<'e>(&self, parent: &'e Element, container: &str, item: &'e str) -> Result<Vec<&'e Element>> {
        Ok(match self.required(parent, container)? {
            Some(c) => c.children_named(item).collect(),
            None => Vec::new(),
        })
    }

    fn study(&self, root: &Element) -> Result<StudyDescription> {
        let header = self.header(root)?;

        let mut sessions: Vec<SessionGroup> = Vec::new();
        for session in self.list(root, "sessions", "session")? {
            let Some(number) = self.key(session, "number")? else {
                continue;
            };
            let record = self.session(session)?;
            match sessions.iter_mut().find(|g| g.number == number) {
                Some(group) => group.sessions.push(record),
                None => sessions.push(SessionGroup {
                    number,
                    sessions: vec![record],
                }),
            }
        }

        let mut tasks = Vec::new();
        for task in self.list(root, "tasks", "task")? {
            if let Some(label) = self.key(task, "taskLabel")? {
                tasks.push(TaskRecord {
                    label,
                    description: text(task, "description"),
                    tag: text(task, "tag"),
                });
            }
        }

        let mut parameter_sets = Vec::new();
        for rps in self.list(root, "recordingParameterSets", "recordingParameterSet")? {
            if let Some(label) = self.key(rps, "recordingParameterSetLabel")? {
                parameter_sets.push(ParameterSet {
                    label,
                    modalities: self.modalities(rps)?,
                });
            }
        }

        let mut event_codes = Vec::new();
        for code in self.list(root, "eventCodes", "eventCode")? {
            if let Some(record) = self.event_code(code)? {
                event_codes.push(record);
            }
        }

        debug!(
            sessions = sessions.len(),
            tasks = tasks.len(),
            parameter_sets = parameter_sets.len(),
            event_codes = event_codes.len(),
            "Extracted study description"
        );

        Ok(StudyDescription {
            header,
            sessions,
            tasks,
            parameter_sets,
            event_codes,
        })
    }

    fn header(&self, root: &Element) -> Result<Header> {
        let funding_organization = match self.required(root, "project")? {
            Some(project) => self
                .required(project, "funding")?
                .and_then(|f| text(f, "organization")),
            None => None,
        };

        let license = match self.required(root, "summary")? {
            Some(summary) => self.required(summary, "license")?.and_then(|license| {
                let joined = ["type", "text", "link"]
                    .iter()
                    .map(|name| text(license, name).unwrap_or_default())
                    .collect::<Vec<_>>()
                    .join(" ");
                let trimmed = joined.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            }),
            None => None,
        };

        Ok(Header {
            title: text(root, "title"),
            description: text(root, "description"),
            funding_organization,
            uuid: text(root, "uuid"),
            root_uri: text(root, "rootURI"),
            license,
        })
    }

    fn session(&self, session: &Element) -> Result<SessionRecord> {
        let mut subjects: Vec<SubjectRecord> = Vec::new();
        for subject in session.children_named("subject") {
            let Some(record) = self.subject(subject)? else {
                continue;
            };
            match subjects.iter_mut().find(|s| s.lab_id == record.lab_id) {
                Some(existing) => *existing = record,
                None => subjects.push(record),
            }
        }

        let mut recordings = Vec::new();
        for recording in self.list(session, "dataRecordings", "dataRecording")? {
            let Some(filename) = self.key(recording, "filename")? else {
                continue;
            };
            recordings.push(DataRecording {
                filename,
                uuid: text(recording, "dataRecordingUuid"),
                start_date_time: text(recording, "startDateTime"),
                parameter_set: self
                    .required(recording, "recordingParameterSetLabel")?
                    .and_then(Element::value),
                event_instance_file: self
                    .required(recording, "eventInstanceFile")?
                    .and_then(Element::value),
                original_path: text(recording, "originalFileNameAndPath"),
            });
        }

        Ok(SessionRecord {
            task_label: self.required(session, "taskLabel")?.and_then(Element::value),
            lab_id: text(session, "labId"),
            subjects,
            recordings,
        })
    }

    fn subject(&self, subject: &Element) -> Result<Option<SubjectRecord>> {
        let Some(lab_id) = self.key(subject, "labId")? else {
            return Ok(None);
        };
        let medication = self.required(subject, "medication")?;
        Ok(Some(SubjectRecord {
            lab_id,
            in_session_number: text(subject, "inSessionNumber"),
            group: text(subject, "group"),
            gender: text(subject, "gender"),
            year_of_birth: text(subject, "YOB"),
            age: text(subject, "age"),
            hand: text(subject, "hand"),
            vision: text(subject, "vision"),
            hearing: text(subject, "hearing"),
            height: text(subject, "height"),
            weight: text(subject, "weight"),
            channel_locations: text(subject, "channelLocations"),
            caffeine: medication.and_then(|m| text(m, "caffeine")),
            alcohol: medication.and_then(|m| text(m, "alcohol")),
        }))
    }

    fn modalities(&self, rps: &Element) -> Result<Vec<Modality>> {
        let mut modalities: Vec<Modality> = Vec::new();
        for modality in self.list(rps, "channelType", "modality")? {
            let Some(kind) = self.key(modality, "type")? else {
                continue;
            };
            let record = Modality {
                kind,
                sampling_rate: text(modality, "samplingRate"),
                name: text(modality, "name"),
                description: text(modality, "description"),
                start_channel: text(modality, "startChannel"),
                end_channel: text(modality, "endChannel"),
                subject_in_session_number: text(modality, "subjectInSessionNumber"),
                reference_location: text(modality, "referenceLocation"),
                reference_label: text(modality, "referenceLabel"),
                channel_location_type: text(modality, "channelLocationType"),
                channel_labels: labels(self.required(modality, "channelLabel")?),
                non_scalp_channel_labels: labels(self.required(modality, "nonScalpChannelLabel")?),
            };
            // Same type twice: the later declaration wins
            match modalities.iter_mut().find(|m| m.kind == record.kind) {
                Some(existing) => *existing = record,
                None => modalities.push(record),
            }
        }
        Ok(modalities)
    }

    fn event_code(&self, code: &Element) -> Result<Option<EventCodeRecord>> {
        let Some(value) = self.key(code, "code")? else {
            return Ok(None);
        };
        let condition = self.required(code, "condition")?;
        Ok(Some(EventCodeRecord {
            code: value,
            task_label: text(code, "taskLabel"),
            instances: text(code, "numberOfInstances")
                .and_then(|n| n.parse().ok())
                .unwrap_or(0),
            hed_tag: condition.and_then(|c| text(c, "tag")),
            label: condition.and_then(|c| text(c, "label")),
            description: condition.and_then(|c| text(c, "description")),
        }))
    }
}

fn text(parent: &Element, name: &str) -> Option<String> {
    parent.child(name).and_then(Element::value)
}

/// Comma-separated label list; placeholders and blanks dropped
fn labels(element: Option<&Element>) -> Vec<String> {
    element
        .and_then(Element::value)
        .map(|list| {
            list.split(',')
                .map(str::trim)
                .filter(|l| !l.is_empty() && !PLACEHOLDERS.contains(l))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
