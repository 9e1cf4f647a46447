//! Core domain model and identity fingerprinting for the harvester.

pub mod fingerprint;
pub mod model;

pub use model::{
    Company, CompanyBranch, ContactAddress, ContactLink, ExtractionRun, JobPosting,
    KeywordConfigState, Location, PostingDraft, RunStatus, Source,
};
