//! Collaborator traits implemented by adapters (order systems, storage, operator UI).

use std::path::Path;

use async_trait::async_trait;

use crate::error::{PipelineError, PipelineResult};
use crate::model::{Candidate, RemoteMetadata, RollLink, ScanJob, SearchQuery};

/// Order system used to find, annotate and tag orders.
#[async_trait]
pub trait OrderDirectory: Send + Sync {
    /// Search for orders matching the query, ranked by the directory.
    async fn search(&self, query: &SearchQuery) -> PipelineResult<Vec<Candidate>>;

    /// Attach roll links to the order record.
    async fn annotate(&self, order_id: &str, links: &[RollLink]) -> PipelineResult<()>;

    /// Tag the order so downstream automation picks it up.
    async fn tag_for_automation(&self, order_id: &str) -> PipelineResult<()>;

    /// Record a newly created customer root; default implementation reports lack of support.
    async fn record_customer_root(&self, customer_id: &str, url: &str) -> PipelineResult<()> {
        let _ = (customer_id, url);
        Err(PipelineError::unavailable(
            "record_customer_root",
            "not supported by this directory",
        ))
    }
}

/// Remote object store holding the customer folders.
#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// Upload a local file to the destination path (folder + file name).
    async fn put_file(&self, destination: &str, local_file: &Path) -> PipelineResult<()>;

    /// Metadata for an existing object, `None` when absent.
    async fn exists(&self, destination: &str) -> PipelineResult<Option<RemoteMetadata>>;

    /// Create (or fetch) a shareable link for a folder.
    async fn create_shared_link(&self, folder: &str) -> PipelineResult<String>;
}

/// Operator answer when presented with candidates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateChoice {
    /// Index into the presented candidates.
    Selected(usize),
    /// Defer the scan to the staging queue.
    Deferred,
    /// Ask for another search term.
    SearchAgain,
}

/// Interactive operator conversation.
#[async_trait]
pub trait OperatorPrompt: Send + Sync {
    /// Ask for a search term; `None` leaves the job waiting for a later sweep.
    async fn prompt_search_term(&self, job: &ScanJob) -> PipelineResult<Option<String>>;

    /// Present ranked candidates and return the operator's choice.
    async fn present_candidates(
        &self,
        job: &ScanJob,
        candidates: &[Candidate],
    ) -> PipelineResult<CandidateChoice>;

    /// Surface a status line to the operator.
    async fn report_status(&self, message: &str);
}
