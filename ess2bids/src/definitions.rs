//! Field definitions for legacy study attributes carried into the layout

use ess2bids_common::Fields;
use serde_json::{json, Value};

/// Conversion disclaimer placed at the top of the report
pub const DISCLAIMER: &str = " === DISCLAIMERS ===

By default, conversions cannot automatically specify the PowerLineFrequency field,
nor the types of the channels listed as nonScalpChannelLabel in the legacy study.
Replace the placeholders in 'field_replacements.json' before validating, as both are
required for the study to be BIDS compliant. Descriptions for those channels are
also recommended.

It's highly recommended to fill in 'License', 'Authors', 'Acknowledgments',
'HowToAcknowledge', 'ReferencesAndLinks' and 'DatasetDOI' in dataset_description.json.
";

/// Definition of a participant-level field (participants.json)
pub fn participant_field(name: &str) -> Option<Value> {
    let definition = match name {
        "group" => json!({
            "Description": "type of subject group the subject belongs to (e.g. autistic, normal, control...)"
        }),
        "year_of_birth" => json!({"Description": "subject's year of birth only"}),
        "legacy_labID" => json!({"Description": "labID used to reference the subject in ESS"}),
        _ => return None,
    };
    Some(definition)
}

/// Definition of a session-level field (sub-<id>_sessions.json)
pub fn session_field(name: &str) -> Option<Value> {
    let definition = match name {
        "age" => json!({"Description": "subject's age (in years) at the time of recording."}),
        "height" => json!({"Units": "cm"}),
        "weight" => json!({"Units": "kg"}),
        "gender" => json!({
            "Description": "subject's gender (M, F, or Other)",
            "Levels": {"M": "Male", "F": "Female", "Other": "not specified"}
        }),
        "hand" => json!({
            "Description": "subject's dominantly used hand",
            "Levels": {"R": "right", "L": "left", "A": "ambidextrous"}
        }),
        "alcohol" => json!({
            "Description": "whether the subject has consumed alcohol within 12 hours before the recording",
            "Levels": {
                "Yes": "Has consumed alcohol within last 12 hours",
                "No": "Has not consumed alcohol within last 12 hours"
            }
        }),
        "caffeine" => json!({
            "Description": "hours since last caffeine intake, if less than 12 hours",
            "Units": "hours"
        }),
        "ESS_sessionNum" => json!({
            "Description": "Number of the ESS session in which this recording is found"
        }),
        "ESS_sessionID" => json!({
            "Description": "labID used to reference the session in original lab notes"
        }),
        "ESS_subjectLabID" => json!({
            "Description": "labID used to reference the subject in this study as provided in original lab notes"
        }),
        "ESS_inSessionRecordingNum" => json!({
            "Description": "Number distinguishing the subjects of one ESS session, used to associate files with subjects when lab ids are absent"
        }),
        "legacy_recordingParameterSet" => json!({
            "Description": "ID used to reference the recordingParameterSet in ESS"
        }),
        _ => return None,
    };
    Some(definition)
}

/// Definition of a scan-level field (sub-<id>[_ses-<id>]_scans.json)
pub fn scan_field(name: &str) -> Option<Value> {
    let definition = match name {
        "ESS_dataRecordingUuid" => json!({
            "Description": "Unique universal ID used to reference the specific recording in ESS"
        }),
        "ESS_inSessionRecordingNum" => json!({
            "Description": "Number of the recording associated with a particular subject in an ESS session"
        }),
        _ => return None,
    };
    Some(definition)
}

/// Record the definition of `name` into `definitions` if one is known
pub fn define(definitions: &mut Fields, name: &str, lookup: fn(&str) -> Option<Value>) {
    if definitions.contains_key(name) {
        return;
    }
    if let Some(definition) = lookup(name) {
        definitions.insert(name.to_string(), definition);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_define_is_idempotent() {
        let mut definitions = Fields::new();
        define(&mut definitions, "height", session_field);
        define(&mut definitions, "height", session_field);
        define(&mut definitions, "unknown", session_field);
        assert_eq!(definitions.len(), 1);
        assert_eq!(definitions["height"]["Units"], json!("cm"));
    }

    #[test]
    fn test_levels_for_categorical_fields() {
        assert!(session_field("gender").unwrap()["Levels"].get("Other").is_some());
        assert!(participant_field("age").is_none());
        assert!(scan_field("ESS_dataRecordingUuid").is_some());
    }
}
