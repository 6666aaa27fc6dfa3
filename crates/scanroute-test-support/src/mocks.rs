//! In-memory fakes of the pipeline collaborators with failure injection.

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use scanroute_core::{
    Candidate, CandidateChoice, OperatorPrompt, OrderDirectory, PipelineError, PipelineResult,
    RemoteMetadata, RemoteStorage, RollLink, ScanJob, SearchQuery, TermKind,
};
use sha2::{Digest, Sha256};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, Clone)]
struct StoredObject {
    size: u64,
    hash: String,
}

#[derive(Default)]
struct StorageState {
    objects: BTreeMap<String, StoredObject>,
    put_paths: Vec<String>,
    exists_calls: u32,
    put_failures: u32,
    link_failures: bool,
    links: Vec<String>,
    put_delay: Option<Duration>,
}

/// Remote storage kept in memory.
#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<StorageState>,
    report_hashes: bool,
}

impl FakeStorage {
    /// Storage that reports content hashes from `exists`.
    #[must_use]
    pub fn with_hashes() -> Self {
        Self {
            report_hashes: true,
            ..Self::default()
        }
    }

    /// Fail the next `count` puts with a transient error (`u32::MAX` fails forever).
    pub fn fail_puts(&self, count: u32) {
        lock(&self.state).put_failures = count;
    }

    /// Make `create_shared_link` fail with `RemoteUnavailable`.
    pub fn fail_links(&self, fail: bool) {
        lock(&self.state).link_failures = fail;
    }

    /// Sleep inside every put, keeping uploads in flight.
    pub fn set_put_delay(&self, delay: Duration) {
        lock(&self.state).put_delay = Some(delay);
    }

    /// Pretend an object exists with the given size, without a hash.
    pub fn seed_object(&self, destination: &str, size: u64) {
        lock(&self.state).objects.insert(
            destination.to_string(),
            StoredObject {
                size,
                hash: String::new(),
            },
        );
    }

    /// Replace the stored hash so the next comparison mismatches.
    pub fn corrupt_hash(&self, destination: &str) {
        if let Some(object) = lock(&self.state).objects.get_mut(destination) {
            object.hash = "0".repeat(64);
        }
    }

    /// Number of `put_file` calls, failed ones included.
    #[must_use]
    pub fn put_calls(&self) -> usize {
        lock(&self.state).put_paths.len()
    }

    /// Destinations passed to `put_file`, in call order.
    #[must_use]
    pub fn put_paths(&self) -> Vec<String> {
        lock(&self.state).put_paths.clone()
    }

    /// Number of `exists` calls.
    #[must_use]
    pub fn exists_calls(&self) -> u32 {
        lock(&self.state).exists_calls
    }

    /// Stored objects below `prefix`.
    #[must_use]
    pub fn files_under(&self, prefix: &str) -> Vec<String> {
        let prefix = format!("{}/", prefix.trim_end_matches('/'));
        lock(&self.state)
            .objects
            .keys()
            .filter(|key| key.starts_with(&prefix))
            .cloned()
            .collect()
    }

    /// Folders a shared link was requested for.
    #[must_use]
    pub fn linked_folders(&self) -> Vec<String> {
        lock(&self.state).links.clone()
    }
}

#[async_trait]
impl RemoteStorage for FakeStorage {
    async fn put_file(&self, destination: &str, local_file: &Path) -> PipelineResult<()> {
        let delay = {
            let mut state = lock(&self.state);
            state.put_paths.push(destination.to_string());
            if state.put_failures > 0 {
                if state.put_failures != u32::MAX {
                    state.put_failures -= 1;
                }
                return Err(PipelineError::transient("put_file", "injected failure"));
            }
            state.put_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let bytes = std::fs::read(local_file).map_err(|source| PipelineError::FilesystemRace {
            operation: "fake.put_file",
            path: local_file.to_path_buf(),
            source,
        })?;
        let object = StoredObject {
            size: bytes.len() as u64,
            hash: format!("{:x}", Sha256::digest(&bytes)),
        };
        lock(&self.state)
            .objects
            .insert(destination.to_string(), object);
        Ok(())
    }

    async fn exists(&self, destination: &str) -> PipelineResult<Option<RemoteMetadata>> {
        let mut state = lock(&self.state);
        state.exists_calls += 1;
        Ok(state.objects.get(destination).map(|object| RemoteMetadata {
            size: object.size,
            content_hash: self.report_hashes.then(|| object.hash.clone()),
        }))
    }

    async fn create_shared_link(&self, folder: &str) -> PipelineResult<String> {
        let mut state = lock(&self.state);
        if state.link_failures {
            return Err(PipelineError::unavailable("create_shared_link", "injected failure"));
        }
        state.links.push(folder.to_string());
        Ok(format!("https://share.test/{}", folder.trim_start_matches('/')))
    }
}

#[derive(Default)]
struct DirectoryState {
    orders: Vec<Candidate>,
    search_calls: u32,
    search_failures: u32,
    annotate_failures: u32,
    annotations: Vec<(String, Vec<RollLink>)>,
    tags: Vec<String>,
    customer_roots: Vec<(String, String)>,
}

/// Order directory backed by an in-memory order list.
#[derive(Default)]
pub struct FakeDirectory {
    state: Mutex<DirectoryState>,
}

impl FakeDirectory {
    /// Register an order returned by matching searches.
    pub fn add_order(&self, candidate: Candidate) {
        lock(&self.state).orders.push(candidate);
    }

    /// Fail the next `count` searches with `RemoteUnavailable`.
    pub fn fail_searches(&self, count: u32) {
        lock(&self.state).search_failures = count;
    }

    /// Fail the next `count` annotations with a transient error.
    pub fn fail_annotations(&self, count: u32) {
        lock(&self.state).annotate_failures = count;
    }

    /// Number of searches performed.
    #[must_use]
    pub fn search_calls(&self) -> u32 {
        lock(&self.state).search_calls
    }

    /// Annotations received, in order.
    #[must_use]
    pub fn annotations(&self) -> Vec<(String, Vec<RollLink>)> {
        lock(&self.state).annotations.clone()
    }

    /// Orders tagged for automation.
    #[must_use]
    pub fn tags(&self) -> Vec<String> {
        lock(&self.state).tags.clone()
    }

    /// Customer roots recorded as `(customer_id, url)`.
    #[must_use]
    pub fn customer_roots(&self) -> Vec<(String, String)> {
        lock(&self.state).customer_roots.clone()
    }
}

fn candidate_matches(candidate: &Candidate, query: &SearchQuery) -> bool {
    match query.kind {
        TermKind::Email => candidate.customer_email.eq_ignore_ascii_case(&query.term),
        TermKind::OrderNumber => candidate.order_number.trim_start_matches('#') == query.term,
        TermKind::FreeText => candidate.label.to_lowercase().contains(&query.term),
    }
}

#[async_trait]
impl OrderDirectory for FakeDirectory {
    async fn search(&self, query: &SearchQuery) -> PipelineResult<Vec<Candidate>> {
        let mut state = lock(&self.state);
        state.search_calls += 1;
        if state.search_failures > 0 {
            state.search_failures -= 1;
            return Err(PipelineError::unavailable("search", "injected failure"));
        }
        Ok(state
            .orders
            .iter()
            .filter(|candidate| candidate_matches(candidate, query))
            .cloned()
            .collect())
    }

    async fn annotate(&self, order_id: &str, links: &[RollLink]) -> PipelineResult<()> {
        let mut state = lock(&self.state);
        if state.annotate_failures > 0 {
            state.annotate_failures -= 1;
            return Err(PipelineError::transient("annotate", "injected failure"));
        }
        state
            .annotations
            .push((order_id.to_string(), links.to_vec()));
        Ok(())
    }

    async fn tag_for_automation(&self, order_id: &str) -> PipelineResult<()> {
        lock(&self.state).tags.push(order_id.to_string());
        Ok(())
    }

    async fn record_customer_root(&self, customer_id: &str, url: &str) -> PipelineResult<()> {
        lock(&self.state)
            .customer_roots
            .push((customer_id.to_string(), url.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct PromptState {
    terms: VecDeque<Option<String>>,
    choices: VecDeque<CandidateChoice>,
    prompted: Vec<PathBuf>,
    presented: Vec<usize>,
    statuses: Vec<String>,
}

/// Operator conversation driven by a script.
///
/// When the script runs out, no search term is given (the job keeps waiting)
/// and candidate lists are answered with `SearchAgain`.
#[derive(Default)]
pub struct ScriptedPrompt {
    state: Mutex<PromptState>,
}

impl ScriptedPrompt {
    /// Queue a search term.
    pub fn push_term(&self, term: &str) {
        lock(&self.state).terms.push_back(Some(term.to_string()));
    }

    /// Queue an empty answer (operator skipped the prompt).
    pub fn push_skip(&self) {
        lock(&self.state).terms.push_back(None);
    }

    /// Queue an answer to a candidate list.
    pub fn push_choice(&self, choice: CandidateChoice) {
        lock(&self.state).choices.push_back(choice);
    }

    /// Scan folders the operator was asked about, in order.
    #[must_use]
    pub fn prompted(&self) -> Vec<PathBuf> {
        lock(&self.state).prompted.clone()
    }

    /// Sizes of the candidate lists presented.
    #[must_use]
    pub fn presented(&self) -> Vec<usize> {
        lock(&self.state).presented.clone()
    }

    /// Status lines reported to the operator.
    #[must_use]
    pub fn statuses(&self) -> Vec<String> {
        lock(&self.state).statuses.clone()
    }
}

#[async_trait]
impl OperatorPrompt for ScriptedPrompt {
    async fn prompt_search_term(&self, job: &ScanJob) -> PipelineResult<Option<String>> {
        let mut state = lock(&self.state);
        state.prompted.push(job.source_path.clone());
        Ok(state.terms.pop_front().flatten())
    }

    async fn present_candidates(
        &self,
        _job: &ScanJob,
        candidates: &[Candidate],
    ) -> PipelineResult<CandidateChoice> {
        let mut state = lock(&self.state);
        state.presented.push(candidates.len());
        Ok(state
            .choices
            .pop_front()
            .unwrap_or(CandidateChoice::SearchAgain))
    }

    async fn report_status(&self, message: &str) {
        lock(&self.state).statuses.push(message.to_string());
    }
}
