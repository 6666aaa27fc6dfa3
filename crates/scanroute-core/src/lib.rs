#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Domain model and collaborator interfaces for the scan routing pipeline.
//!
//! Everything here is storage- and transport-agnostic: the state store, the
//! pipeline components and the concrete adapters all exchange these types.

pub mod error;
pub mod model;
pub mod service;

pub use error::{PipelineError, PipelineResult};
pub use model::{
    Candidate, ConfidenceTier, FolderSnapshot, RemoteMetadata, ResolutionTarget, RollKind,
    RollLayout, RollLink, ScanJob, SearchQuery, TermKind, folder_name,
};
pub use scanroute_events::ScanStage;
pub use service::{CandidateChoice, OperatorPrompt, OrderDirectory, RemoteStorage};
