//! Search-term handling in front of the order directory.

use std::sync::Arc;

use scanroute_core::{Candidate, OrderDirectory, PipelineResult, SearchQuery, TermKind};
use tracing::debug;

/// Result of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchOutcome {
    /// The operator typed the defer keyword.
    Deferred,
    /// Ranked candidates, possibly empty.
    Candidates(Vec<Candidate>),
}

/// Classifies operator terms and delegates lookup to an [`OrderDirectory`].
#[derive(Clone)]
pub struct Matcher {
    directory: Arc<dyn OrderDirectory>,
    defer_keyword: String,
}

impl Matcher {
    /// Build a matcher with the reserved defer keyword.
    #[must_use]
    pub fn new(directory: Arc<dyn OrderDirectory>, defer_keyword: &str) -> Self {
        Self {
            directory,
            defer_keyword: defer_keyword.trim().to_lowercase(),
        }
    }

    /// Search for orders matching `term`.
    ///
    /// # Errors
    ///
    /// Propagates directory failures (for example `RemoteUnavailable`).
    pub async fn search(&self, term: &str) -> PipelineResult<MatchOutcome> {
        let folded = term.trim().to_lowercase();
        if folded == self.defer_keyword {
            return Ok(MatchOutcome::Deferred);
        }
        if folded.is_empty() {
            return Ok(MatchOutcome::Candidates(Vec::new()));
        }
        let query = classify(&folded);
        let candidates = self.directory.search(&query).await?;
        debug!(
            term = %query.term,
            kind = ?query.kind,
            matches = candidates.len(),
            "order search completed"
        );
        Ok(MatchOutcome::Candidates(candidates))
    }
}

/// Classify a trimmed, case-folded term.
#[must_use]
pub fn classify(term: &str) -> SearchQuery {
    let digits = term.strip_prefix('#').unwrap_or(term);
    if term.contains('@') {
        SearchQuery {
            term: term.to_string(),
            kind: TermKind::Email,
        }
    } else if !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()) {
        SearchQuery {
            term: digits.to_string(),
            kind: TermKind::OrderNumber,
        }
    } else {
        SearchQuery {
            term: term.to_string(),
            kind: TermKind::FreeText,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanroute_core::{ConfidenceTier, PipelineError};
    use scanroute_test_support::FakeDirectory;

    fn directory() -> Arc<FakeDirectory> {
        let directory = FakeDirectory::default();
        directory.add_order(Candidate {
            order_id: "order-100".into(),
            order_number: "100".into(),
            label: "Jeff Example (#100)".into(),
            customer_email: "jeff@example.com".into(),
            customer_id: Some("cust-1".into()),
            customer_root: None,
            confidence: ConfidenceTier::Exact,
        });
        Arc::new(directory)
    }

    #[test]
    fn classifies_terms() {
        assert_eq!(classify("jeff@example.com").kind, TermKind::Email);
        let order = classify("#100");
        assert_eq!(order.kind, TermKind::OrderNumber);
        assert_eq!(order.term, "100");
        assert_eq!(classify("1002").kind, TermKind::OrderNumber);
        assert_eq!(classify("jeff").kind, TermKind::FreeText);
        assert_eq!(classify("#").kind, TermKind::FreeText);
    }

    #[tokio::test]
    async fn defer_keyword_short_circuits_lookup() -> PipelineResult<()> {
        let directory = directory();
        let matcher = Matcher::new(directory.clone(), "stage");
        assert_eq!(matcher.search("  STAGE ").await?, MatchOutcome::Deferred);
        assert_eq!(directory.search_calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn terms_are_trimmed_and_case_folded() -> PipelineResult<()> {
        let directory = directory();
        let matcher = Matcher::new(directory.clone(), "stage");
        let MatchOutcome::Candidates(found) = matcher.search(" Jeff@Example.com ").await? else {
            return Err(PipelineError::unavailable("test", "expected candidates"));
        };
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].order_number, "100");
        Ok(())
    }

    #[tokio::test]
    async fn zero_matches_is_an_empty_list() -> PipelineResult<()> {
        let matcher = Matcher::new(directory(), "stage");
        assert_eq!(
            matcher.search("nobody@example.com").await?,
            MatchOutcome::Candidates(Vec::new())
        );
        Ok(())
    }

    #[tokio::test]
    async fn directory_failures_propagate() {
        let directory = directory();
        directory.fail_searches(1);
        let matcher = Matcher::new(directory, "stage");
        let result = matcher.search("100").await;
        assert!(matches!(result, Err(PipelineError::RemoteUnavailable { .. })));
    }
}
