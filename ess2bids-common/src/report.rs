//! REPORT.txt content

use chrono::{DateTime, Utc};

/// Failures and warnings collected during one run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Report {
    failures: Vec<String>,
    warnings: Vec<String>,
}

impl Report {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{}", message);
        self.failures.push(message);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.warnings.push(message);
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty() && self.warnings.is_empty()
    }

    pub fn extend(&mut self, other: Report) {
        self.failures.extend(other.failures);
        self.warnings.extend(other.warnings);
    }
}

fn stamp(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Header opening a freshly generated REPORT.txt
pub fn generation_header(now: DateTime<Utc>) -> String {
    format!(" --> BIDS study generated with ess2bids on {}\n\n", stamp(now))
}

/// Section appended to REPORT.txt by each finalizer run
pub fn finalizer_section(now: DateTime<Utc>, report: &Report) -> String {
    let mut out = format!("\n --> Finalizer ran on {}\n", stamp(now));
    if !report.failures.is_empty() {
        out.push_str("\n ==== REPLACEMENT FAILURES ==== \n(check values for tab characters)\n\n");
        for failure in &report.failures {
            out.push_str(failure);
            out.push('\n');
        }
    }
    if !report.warnings.is_empty() {
        out.push_str("\n ==== REPLACEMENT WARNINGS ==== \n\n");
        for warning in &report.warnings {
            out.push_str(warning);
            out.push('\n');
        }
    }
    out
}

/// Body of a conversion report: the disclaimer followed by the warnings
pub fn conversion_section(disclaimer: &str, warnings: &[String]) -> String {
    let mut out = disclaimer.trim_end().to_string();
    out.push_str("\n\n === WARNINGS === \n\n");
    for warning in warnings {
        out.push_str(warning);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_finalizer_section_lists_failures_then_warnings() {
        let now = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        let mut report = Report::new();
        report.warn("w1");
        report.fail("f1");

        let text = finalizer_section(now, &report);
        assert!(text.starts_with("\n --> Finalizer ran on 2020-01-02 03:04:05 UTC"));
        let f = text.find("REPLACEMENT FAILURES").unwrap();
        let w = text.find("REPLACEMENT WARNINGS").unwrap();
        assert!(f < w);
        assert!(text.contains("f1\n"));
        assert!(text.contains("w1\n"));
    }

    #[test]
    fn test_empty_finalizer_section_is_just_the_stamp() {
        let now = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();
        assert_eq!(
            finalizer_section(now, &Report::new()),
            "\n --> Finalizer ran on 2020-01-02 03:04:05 UTC\n"
        );
    }
}
