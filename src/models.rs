//! Core data models used throughout the pipeline.
//!
//! These types are the typed values passed between stages: validated
//! solicitation summaries coming out of the fetcher, document and prediction
//! records going into the store, and the bundle that groups them into one
//! unit of work per solicitation.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::error::PayloadError;

/// Inclusive posted-date window for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateWindow {
    /// The calendar day before `today`.
    pub fn previous_day(today: NaiveDate) -> Self {
        let day = today - Duration::days(1);
        Self { from: day, to: day }
    }
}

impl fmt::Display for DateWindow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.from, self.to)
    }
}

/// Procurement notice type, normalised from the upstream `type` string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum NoticeType {
    Presolicitation,
    Combined,
    Modification,
    AmendedCombined,
    Training,
    Solicitation,
    Other,
}

impl NoticeType {
    pub const ALL: [NoticeType; 7] = [
        NoticeType::Modification,
        NoticeType::Combined,
        NoticeType::Presolicitation,
        NoticeType::AmendedCombined,
        NoticeType::Training,
        NoticeType::Solicitation,
        NoticeType::Other,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            NoticeType::Presolicitation => "PRESOL",
            NoticeType::Combined => "COMBINE",
            NoticeType::Modification => "MOD",
            NoticeType::AmendedCombined => "AMDCSS",
            NoticeType::Training => "TRAIN",
            NoticeType::Solicitation => "SOLICIT",
            NoticeType::Other => "OTHER",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            NoticeType::Presolicitation => "Presolicitation",
            NoticeType::Combined => "Combined Synopsis/Solicitation",
            NoticeType::Modification => "Modification/Amendment/Cancel",
            NoticeType::AmendedCombined => "Amended Combined Synopsis/Solicitation",
            NoticeType::Training => "Training data",
            NoticeType::Solicitation => "Solicitation",
            NoticeType::Other => "Other",
        }
    }

    /// Map the upstream free-text notice type to a code.
    pub fn from_upstream(raw: &str) -> Self {
        let lower = raw.trim().to_ascii_lowercase();
        if lower.starts_with("presolicitation") {
            NoticeType::Presolicitation
        } else if lower.starts_with("combined synopsis") {
            NoticeType::Combined
        } else if lower.starts_with("amended combined") {
            NoticeType::AmendedCombined
        } else if lower.starts_with("modification") || lower.starts_with("amendment") {
            NoticeType::Modification
        } else if lower == "solicitation" {
            NoticeType::Solicitation
        } else {
            NoticeType::Other
        }
    }
}

/// A validated solicitation record from the opportunity source.
#[derive(Debug, Clone, PartialEq)]
pub struct SolicitationSummary {
    pub notice_id: String,
    pub title: String,
    pub solicitation_number: Option<String>,
    pub notice_type: NoticeType,
    pub posted_date: NaiveDate,
    pub updated_date: Option<NaiveDate>,
    pub naics_code: Option<String>,
    /// Dotted org path code, e.g. `097.DLA.SP4701`.
    pub org_code: Option<String>,
    /// Dotted org path name, e.g. `DEPT OF DEFENSE.DEFENSE LOGISTICS AGENCY`.
    pub org_path_name: Option<String>,
    pub ui_link: Option<String>,
    pub raw: Value,
}

impl SolicitationSummary {
    /// Validate one raw upstream record. Unknown fields are ignored.
    pub fn from_payload(raw: &Value) -> Result<Self, PayloadError> {
        let obj = raw.as_object().ok_or(PayloadError::NotAnObject)?;

        let notice_id = required_str(obj, "noticeId")?;
        let title = required_str(obj, "title")?;
        let posted_raw = required_str(obj, "postedDate")?;
        let posted_date = parse_upstream_date(&posted_raw).ok_or(PayloadError::InvalidField {
            field: "postedDate",
            value: posted_raw.clone(),
        })?;

        let updated_date = match optional_str(obj, "updatedDate") {
            Some(s) => Some(parse_upstream_date(&s).ok_or(PayloadError::InvalidField {
                field: "updatedDate",
                value: s.clone(),
            })?),
            None => None,
        };

        let notice_type = optional_str(obj, "type")
            .map(|t| NoticeType::from_upstream(&t))
            .unwrap_or(NoticeType::Other);

        Ok(Self {
            notice_id,
            title,
            solicitation_number: optional_str(obj, "solicitationNumber"),
            notice_type,
            posted_date,
            updated_date,
            naics_code: optional_str(obj, "naicsCode"),
            org_code: optional_str(obj, "fullParentPathCode"),
            org_path_name: optional_str(obj, "fullParentPathName"),
            ui_link: optional_str(obj, "uiLink"),
            raw: raw.clone(),
        })
    }
}

fn required_str(
    obj: &serde_json::Map<String, Value>,
    field: &'static str,
) -> Result<String, PayloadError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(PayloadError::MissingField(field)),
        Some(Value::String(s)) if s.trim().is_empty() => Err(PayloadError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.trim().to_string()),
        Some(other) => Err(PayloadError::InvalidField {
            field,
            value: other.to_string(),
        }),
    }
}

fn optional_str(obj: &serde_json::Map<String, Value>, field: &str) -> Option<String> {
    match obj.get(field) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

/// Upstream dates come as `2024-03-01`, `2024-03-01 10:22:01.123-04` or RFC 3339.
fn parse_upstream_date(s: &str) -> Option<NaiveDate> {
    let head = s.get(..10)?;
    NaiveDate::parse_from_str(head, "%Y-%m-%d").ok()
}

/// Canonical agency/office names for a solicitation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HierarchyResolution {
    pub agency: String,
    pub office: String,
    /// Set when the names are a fallback rather than an upstream answer.
    pub degraded: bool,
}

/// Outcome of extracting text from one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExtractionStatus {
    Success,
    UnsupportedFormat,
    CorruptOrUnreadable,
    Timeout,
}

impl ExtractionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtractionStatus::Success => "success",
            ExtractionStatus::UnsupportedFormat => "unsupported-format",
            ExtractionStatus::CorruptOrUnreadable => "corrupt-or-unreadable",
            ExtractionStatus::Timeout => "extraction-timeout",
        }
    }
}

impl fmt::Display for ExtractionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExtractionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ExtractionStatus::Success),
            "unsupported-format" => Ok(ExtractionStatus::UnsupportedFormat),
            "corrupt-or-unreadable" => Ok(ExtractionStatus::CorruptOrUnreadable),
            "extraction-timeout" => Ok(ExtractionStatus::Timeout),
            other => Err(format!("unknown extraction status: {}", other)),
        }
    }
}

/// Compliance label produced by the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ComplianceLabel {
    Compliant,
    NonCompliant,
    Indeterminate,
}

impl ComplianceLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplianceLabel::Compliant => "compliant",
            ComplianceLabel::NonCompliant => "non-compliant",
            ComplianceLabel::Indeterminate => "indeterminate",
        }
    }
}

impl fmt::Display for ComplianceLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classifier answer for one document.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Classification {
    pub label: ComplianceLabel,
    pub confidence: f64,
    /// Raw model score; `None` when the model was not consulted.
    pub decision_score: Option<f64>,
}

impl Classification {
    pub fn indeterminate() -> Self {
        Self {
            label: ComplianceLabel::Indeterminate,
            confidence: 0.0,
            decision_score: None,
        }
    }
}

/// Identity and hyper-parameters of the loaded model.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelInfo {
    pub version: String,
    pub estimator: String,
    pub params: Value,
}

/// A document ready to be written.
#[derive(Debug, Clone)]
pub struct DocumentRecord {
    /// Hex SHA-256 of the file bytes.
    pub fingerprint: String,
    pub filename: String,
    pub size_bytes: i64,
    pub content_type: Option<String>,
    pub text: Option<String>,
    pub status: ExtractionStatus,
    pub status_detail: Option<String>,
}

/// A prediction ready to be written, keyed to its document by fingerprint.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub fingerprint: String,
    pub model_version: String,
    pub classification: Classification,
    pub predicted_at: DateTime<Utc>,
}

/// Everything committed for one solicitation in one transaction.
#[derive(Debug, Clone)]
pub struct SolicitationBundle {
    pub summary: SolicitationSummary,
    pub hierarchy: HierarchyResolution,
    pub documents: Vec<DocumentRecord>,
    pub predictions: Vec<PredictionRecord>,
    /// Archive retrieval exhausted its retries; keep the notice queued.
    pub needs_retry: bool,
    pub model_version: String,
}

/// A document already in the store, as seen by a rerun.
#[derive(Debug, Clone, PartialEq)]
pub struct KnownDocument {
    pub status: ExtractionStatus,
    pub text: Option<String>,
    pub predicted_versions: Vec<String>,
}

/// Row counts written by one bundle commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub documents_inserted: u64,
    pub predictions_inserted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record() -> Value {
        json!({
            "noticeId": "abc123",
            "title": "Enterprise IT Support",
            "solicitationNumber": "W91-24-R-0001",
            "postedDate": "2024-03-01",
            "type": "Combined Synopsis/Solicitation",
            "naicsCode": "541512",
            "fullParentPathCode": "097.DLA.SP4701",
            "fullParentPathName": "DEPT OF DEFENSE.DEFENSE LOGISTICS AGENCY",
            "someNewField": {"ignored": true}
        })
    }

    #[test]
    fn parses_a_complete_record() {
        let s = SolicitationSummary::from_payload(&record()).unwrap();
        assert_eq!(s.notice_id, "abc123");
        assert_eq!(s.notice_type, NoticeType::Combined);
        assert_eq!(s.posted_date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
        assert_eq!(s.naics_code.as_deref(), Some("541512"));
        assert_eq!(s.org_code.as_deref(), Some("097.DLA.SP4701"));
    }

    #[test]
    fn missing_notice_id_is_typed_error() {
        let mut raw = record();
        raw.as_object_mut().unwrap().remove("noticeId");
        assert_eq!(
            SolicitationSummary::from_payload(&raw).unwrap_err(),
            PayloadError::MissingField("noticeId")
        );
    }

    #[test]
    fn bad_date_is_typed_error() {
        let mut raw = record();
        raw["postedDate"] = json!("yesterday");
        assert!(matches!(
            SolicitationSummary::from_payload(&raw).unwrap_err(),
            PayloadError::InvalidField {
                field: "postedDate",
                ..
            }
        ));
    }

    #[test]
    fn timestamped_dates_are_accepted() {
        let mut raw = record();
        raw["postedDate"] = json!("2024-03-01 10:22:01.123-04");
        let s = SolicitationSummary::from_payload(&raw).unwrap();
        assert_eq!(s.posted_date, NaiveDate::from_ymd_opt(2024, 3, 1).unwrap());
    }

    #[test]
    fn missing_naics_is_not_a_parse_error() {
        let mut raw = record();
        raw.as_object_mut().unwrap().remove("naicsCode");
        let s = SolicitationSummary::from_payload(&raw).unwrap();
        assert!(s.naics_code.is_none());
    }

    #[test]
    fn non_object_is_rejected() {
        assert_eq!(
            SolicitationSummary::from_payload(&json!([1, 2])).unwrap_err(),
            PayloadError::NotAnObject
        );
    }

    #[test]
    fn previous_day_window() {
        let today = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let w = DateWindow::previous_day(today);
        assert_eq!(w.from, NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(w.from, w.to);
    }

    #[test]
    fn notice_type_mapping() {
        assert_eq!(NoticeType::from_upstream("Presolicitation"), NoticeType::Presolicitation);
        assert_eq!(NoticeType::from_upstream("Solicitation"), NoticeType::Solicitation);
        assert_eq!(
            NoticeType::from_upstream("Modification/Amendment/Cancel"),
            NoticeType::Modification
        );
        assert_eq!(NoticeType::from_upstream("Sources Sought"), NoticeType::Other);
    }

    #[test]
    fn status_round_trips_through_text() {
        for s in [
            ExtractionStatus::Success,
            ExtractionStatus::UnsupportedFormat,
            ExtractionStatus::CorruptOrUnreadable,
            ExtractionStatus::Timeout,
        ] {
            assert_eq!(s.as_str().parse::<ExtractionStatus>().unwrap(), s);
        }
    }
}
