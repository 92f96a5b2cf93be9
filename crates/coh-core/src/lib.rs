//! Core domain model for COH: opportunities, attachments and fetch outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "coh-core";

/// Public landing page for an opportunity, kept in every record as a manual fallback.
pub const SAM_GOV_VIEW_BASE: &str = "https://sam.gov/opp";

/// Outcome of one unit of outbound work (a page, a detail call, a download).
///
/// Failures travel as values so callers decide whether to retry, skip the unit,
/// or (for search only) stop the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome<T> {
    Success(T),
    RetryableFailure(String),
    FatalFailure(String),
}

impl<T> FetchOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn success(self) -> Option<T> {
        match self {
            Self::Success(value) => Some(value),
            _ => None,
        }
    }

    pub fn failure_reason(&self) -> Option<&str> {
        match self {
            Self::Success(_) => None,
            Self::RetryableFailure(reason) | Self::FatalFailure(reason) => Some(reason),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FetchOutcome<U> {
        match self {
            Self::Success(value) => FetchOutcome::Success(f(value)),
            Self::RetryableFailure(reason) => FetchOutcome::RetryableFailure(reason),
            Self::FatalFailure(reason) => FetchOutcome::FatalFailure(reason),
        }
    }

    /// Retry budget is spent: a retryable failure becomes fatal for this unit.
    pub fn exhausted(self, attempts: usize) -> Self {
        match self {
            Self::RetryableFailure(reason) => {
                Self::FatalFailure(format!("gave up after {attempts} attempts: {reason}"))
            }
            other => other,
        }
    }
}

/// Per-field tag inside assembled records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "camelCase")]
pub enum FieldOutcome<T> {
    Fetched(T),
    NotRequested,
    Failed {
        reason: String,
    },
}

impl<T> Default for FieldOutcome<T> {
    fn default() -> Self {
        Self::NotRequested
    }
}

impl<T> FieldOutcome<T> {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed {
            reason: reason.into(),
        }
    }

    pub fn fetched(&self) -> Option<&T> {
        match self {
            Self::Fetched(value) => Some(value),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> FieldOutcome<U> {
        match self {
            Self::Fetched(value) => FieldOutcome::Fetched(f(value)),
            Self::NotRequested => FieldOutcome::NotRequested,
            Self::Failed { reason } => FieldOutcome::Failed { reason },
        }
    }
}

/// Pipeline stage a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureStage {
    Search,
    Detail,
    Listing,
    Download,
    Store,
}

impl std::fmt::Display for FailureStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Search => "search",
            Self::Detail => "detail",
            Self::Listing => "listing",
            Self::Download => "download",
            Self::Store => "store",
        };
        f.write_str(label)
    }
}

/// Search filter set; also the shape of the optional YAML filter file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchFilters {
    pub keywords: Option<String>,
    pub naics_codes: Vec<String>,
    pub set_aside_types: Vec<String>,
    pub states: Vec<String>,
    pub opportunity_types: Vec<String>,
    pub posted_within_days: Option<u32>,
    pub page_size: u32,
    /// Upper bound on summaries emitted by pagination; `None` walks until exhaustion.
    pub result_cap: Option<usize>,
}

impl Default for SearchFilters {
    fn default() -> Self {
        Self {
            keywords: None,
            naics_codes: Vec::new(),
            set_aside_types: Vec::new(),
            states: Vec::new(),
            opportunity_types: Vec::new(),
            posted_within_days: Some(30),
            page_size: 25,
            result_cap: None,
        }
    }
}

/// Normalized view of one search hit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct OpportunitySummary {
    pub opportunity_id: String,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    pub notice_type: Option<String>,
    pub notice_type_code: Option<String>,
    pub posted_date: Option<String>,
    pub modified_date: Option<String>,
    pub response_deadline: Option<String>,
    pub response_time_zone: Option<String>,
    pub is_active: Option<bool>,
    pub is_canceled: Option<bool>,
    /// Organization names, top-level agency first.
    pub organization_hierarchy: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOfPerformance {
    pub city: Option<String>,
    pub state: Option<String>,
    pub state_code: Option<String>,
    pub country: Option<String>,
    pub country_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub fax: Option<String>,
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub contact_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Award {
    pub amount: Option<AwardAmount>,
    pub awardee: Option<String>,
    pub awardee_uei: Option<String>,
}

/// Award amounts arrive as numbers or strings depending on the notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AwardAmount {
    Number(f64),
    Text(String),
}

/// Fields that only the detail endpoint provides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DetailRecord {
    pub naics_code: Option<String>,
    pub psc_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub set_aside_description: Option<String>,
    pub place_of_performance: Option<PlaceOfPerformance>,
    pub contacts: Vec<Contact>,
    pub award: Option<Award>,
}

/// One entry of the attachment-listing sub-resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentDescriptor {
    pub resource_id: String,
    pub filename: String,
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub access_level: String,
    pub posted_date: Option<String>,
}

impl AttachmentDescriptor {
    pub fn is_public(&self) -> bool {
        self.access_level.eq_ignore_ascii_case("public")
    }
}

/// Detail fetch result: the record itself is mandatory, the listing may have failed.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct OpportunityDetail {
    pub record: DetailRecord,
    pub attachments: FieldOutcome<Vec<AttachmentDescriptor>>,
}

/// Result of acquiring one attachment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(
    tag = "status",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum DownloadStatus {
    Downloaded {
        downloaded_size: u64,
        sha256: String,
        size_mismatch: bool,
    },
    Failed {
        reason: String,
        stage: FailureStage,
    },
    Skipped {
        reason: String,
    },
    #[default]
    NotRequested,
}

impl DownloadStatus {
    pub fn downloaded_size(&self) -> Option<u64> {
        match self {
            Self::Downloaded {
                downloaded_size, ..
            } => Some(*downloaded_size),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attachment {
    pub resource_id: String,
    pub filename: String,
    #[serde(rename = "type")]
    pub content_type: Option<String>,
    pub size: Option<u64>,
    pub access_level: String,
    pub posted_date: Option<String>,
    pub download_url: String,
    pub storage_key: String,
    #[serde(flatten)]
    pub download: DownloadStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttachmentText {
    pub resource_id: String,
    pub filename: String,
    pub text: String,
}

/// Normalized output record, one per exported opportunity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Opportunity {
    pub opportunity_id: String,
    pub solicitation_number: Option<String>,
    pub title: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub notice_type: Option<String>,
    #[serde(rename = "typeCode")]
    pub notice_type_code: Option<String>,
    pub posted_date: Option<String>,
    pub modified_date: Option<String>,
    pub response_deadline: Option<String>,
    pub response_time_zone: Option<String>,
    pub is_active: Option<bool>,
    pub is_canceled: Option<bool>,
    pub agency_name: Option<String>,
    pub sub_agency_name: Option<String>,
    pub office_name: Option<String>,
    pub naics_code: Option<String>,
    pub psc_code: Option<String>,
    pub set_aside_type: Option<String>,
    pub set_aside_description: Option<String>,
    pub place_of_performance: Option<PlaceOfPerformance>,
    pub contacts: Vec<Contact>,
    pub award: Option<Award>,
    pub sam_gov_link: String,
    pub attachments: FieldOutcome<Vec<Attachment>>,
    pub attachment_texts: Vec<AttachmentText>,
    pub scraped_at: DateTime<Utc>,
}

impl Opportunity {
    /// Attachments in listing order; empty when the listing was skipped or failed.
    pub fn attachment_list(&self) -> &[Attachment] {
        self.attachments.fetched().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Keeps alphanumerics (any script) and `._- `; anything else is dropped.
///
/// When the cleaned name differs from the input, the first 8 hex digits of the
/// SHA-256 of the raw filename are appended to the stem, so names that clean
/// to the same text still get distinct keys.
pub fn sanitize_filename(filename: &str) -> String {
    let kept = filename
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '_' | '-' | ' '))
        .collect::<String>();
    let trimmed = kept.trim();
    let base = if trimmed.is_empty() || trimmed.chars().all(|c| c == '.') {
        "unnamed"
    } else {
        trimmed
    };
    if base == filename {
        return base.to_string();
    }

    let digest = hex::encode(Sha256::digest(filename.as_bytes()));
    let suffix = &digest[..8];
    match base.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => {
            format!("{stem}-{suffix}.{ext}")
        }
        _ => format!("{base}-{suffix}"),
    }
}

pub fn storage_key(opportunity_id: &str, filename: &str) -> String {
    format!("{}/{}", opportunity_id.trim(), sanitize_filename(filename))
}

pub fn sam_gov_link(opportunity_id: &str) -> String {
    format!("{SAM_GOV_VIEW_BASE}/{opportunity_id}/view")
}
