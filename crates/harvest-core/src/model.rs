//! Persisted entity shapes plus the normalized handoff contract from
//! source adapters into the resolution pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job boards the harvester knows how to ingest from.
///
/// Postings live in a single collection discriminated by this enum; there is
/// no per-source physical partitioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Indeed,
    Stepstone,
    Monster,
    Xing,
    Jooble,
}

impl Source {
    pub const ALL: [Source; 5] = [
        Source::Indeed,
        Source::Stepstone,
        Source::Monster,
        Source::Xing,
        Source::Jooble,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Indeed => "indeed",
            Source::Stepstone => "stepstone",
            Source::Monster => "monster",
            Source::Xing => "xing",
            Source::Jooble => "jooble",
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "indeed" => Ok(Source::Indeed),
            "stepstone" => Ok(Source::Stepstone),
            "monster" => Ok(Source::Monster),
            "xing" => Ok(Source::Xing),
            "jooble" => Ok(Source::Jooble),
            other => Err(format!("unknown source `{other}`")),
        }
    }
}

/// A hiring company. Deliberately not unique at the storage layer; duplicate
/// rows are reconciled offline by the duplicate cleanup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: Uuid,
    pub name: String,
    pub website: Option<String>,
    pub founded_year: Option<i32>,
    pub industries: Vec<String>,
    pub employee_range: Option<String>,
    pub social_links: Vec<String>,
    pub last_seen_with_offer: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// A branch/office of a company, optionally pinned to a location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyBranch {
    pub id: Uuid,
    pub company_id: Uuid,
    pub location_id: Option<Uuid>,
    pub phone_numbers: Vec<String>,
    pub created_at: DateTime<Utc>,
}

/// A geographic location; referenced by branches and directly by postings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: Uuid,
    pub name: Option<String>,
    pub country: Option<String>,
    pub region: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub created_at: DateTime<Utc>,
}

/// A contact email address.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactAddress {
    pub id: Uuid,
    pub address: String,
    pub created_at: DateTime<Utc>,
}

/// Link row binding a contact address to at most one company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContactLink {
    pub company_id: Uuid,
    pub address_id: Uuid,
    pub usable_for_applications: bool,
}

/// A harvested job posting.
///
/// `identity_hash` is stored for online lookup but is *not* enforced unique;
/// uniqueness is a reconciliation-time property. `first_seen_run_id` is
/// immutable after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: Uuid,
    pub source: Source,
    pub title: String,
    pub description: Option<String>,
    pub url: String,
    pub host: Option<String>,
    pub salary_min: Option<i64>,
    pub salary_max: Option<i64>,
    pub posted_at: Option<DateTime<Utc>>,
    pub languages: Vec<String>,
    pub remote: bool,
    pub company_id: Option<Uuid>,
    pub branch_id: Option<Uuid>,
    pub location_id: Option<Uuid>,
    pub contact_address_id: Option<Uuid>,
    pub identity_hash: String,
    pub first_seen_run_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of an extraction run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    InProgress,
    Imported,
    Failed,
    PartiallyImported,
    Merged,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::InProgress => "IN_PROGRESS",
            RunStatus::Imported => "IMPORTED",
            RunStatus::Failed => "FAILED",
            RunStatus::PartiallyImported => "PARTIALLY_IMPORTED",
            RunStatus::Merged => "MERGED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::InProgress)
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(RunStatus::InProgress),
            "IMPORTED" => Ok(RunStatus::Imported),
            "FAILED" => Ok(RunStatus::Failed),
            "PARTIALLY_IMPORTED" => Ok(RunStatus::PartiallyImported),
            "MERGED" => Ok(RunStatus::Merged),
            other => Err(format!("unknown run status `{other}`")),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One invocation of the extraction process.
///
/// Counters are additive across updates; `percentage_done` is recomputed by
/// the progress estimator, never incrementally adjusted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRun {
    pub id: Uuid,
    pub keywords: Vec<String>,
    pub sources: Vec<Source>,
    pub requested_configurations: Vec<String>,
    pub country: Option<String>,
    pub location: Option<String>,
    pub distance_km: Option<u32>,
    pub page_offset: u32,
    pub page_count: u32,
    pub result_cap: Option<u32>,
    pub found_count: i64,
    pub new_count: i64,
    pub bound_count: i64,
    pub status: RunStatus,
    pub percentage_done: Option<u8>,
    pub error_message: Option<String>,
    pub error_trace: Option<String>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl ExtractionRun {
    /// True once an error snapshot has been stored; used to keep the failure
    /// protocol idempotent.
    pub fn has_error_snapshot(&self) -> bool {
        self.error_message.is_some() || self.error_trace.is_some()
    }
}

/// Bookkeeping row: one keyword under one configuration within a run.
/// Consumed only by the progress estimator and reporting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeywordConfigState {
    pub run_id: Uuid,
    pub keyword: String,
    pub configuration: String,
    pub handled: bool,
    pub found: i64,
}

/// Normalized posting record handed over by a source adapter.
///
/// This is the resolver's only required input contract; adapters are free to
/// produce it however their source demands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostingDraft {
    pub source: Source,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub url: String,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub company_name: Option<String>,
    #[serde(default)]
    pub company_website: Option<String>,
    #[serde(default)]
    pub branch_phone_numbers: Vec<String>,
    #[serde(default)]
    pub location_name: Option<String>,
    #[serde(default)]
    pub location_country: Option<String>,
    #[serde(default)]
    pub location_region: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub contact_address: Option<String>,
    #[serde(default)]
    pub salary_min: Option<i64>,
    #[serde(default)]
    pub salary_max: Option<i64>,
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub remote: bool,
}

impl PostingDraft {
    /// Company name with surrounding whitespace stripped, if one is present
    /// and non-empty. Postings without a resolvable company are rejected.
    pub fn resolvable_company_name(&self) -> Option<&str> {
        self.company_name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
    }
}
