//! Order directory backed by a JSON catalog file with a JSON-lines journal.
//!
//! The catalog is re-read on every search so it can be edited or re-exported
//! while the watcher runs. Annotations, tags and customer root links are
//! appended to the journal.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scanroute_core::{
    Candidate, ConfidenceTier, OrderDirectory, PipelineError, PipelineResult, RollLink,
    SearchQuery, TermKind,
};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Most candidates returned by one search.
const MAX_RESULTS: usize = 10;
/// Tag that triggers downstream automation.
pub const AUTOMATION_TAG: &str = "s";

/// One order in the catalog file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CatalogOrder {
    /// Order identifier.
    pub order_id: String,
    /// Human facing order number.
    pub order_number: String,
    /// Customer email address.
    pub customer_email: String,
    /// Customer display name.
    #[serde(default)]
    pub customer_name: String,
    /// Customer identifier.
    #[serde(default)]
    pub customer_id: Option<String>,
    /// Saved customer root folder.
    #[serde(default)]
    pub customer_root: Option<String>,
    /// Order creation time; newer orders rank first within a tier.
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Line appended to the journal.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Order note with the roll links.
    Annotation {
        /// Order identifier.
        order_id: String,
        /// Audit note.
        note: String,
        /// Shared links for each uploaded roll.
        links: Vec<RollLink>,
        /// Write time.
        at: DateTime<Utc>,
    },
    /// Order tagged for automation.
    Tag {
        /// Order identifier.
        order_id: String,
        /// Tag value.
        tag: String,
        /// Write time.
        at: DateTime<Utc>,
    },
    /// Customer root link saved on the customer profile.
    CustomerRoot {
        /// Customer identifier.
        customer_id: String,
        /// Shared link of the customer root.
        url: String,
        /// Write time.
        at: DateTime<Utc>,
    },
}

/// [`OrderDirectory`] over a local catalog export.
pub struct CatalogOrderDirectory {
    catalog: PathBuf,
    journal: PathBuf,
    lab_name: String,
    journal_lock: Mutex<()>,
}

impl CatalogOrderDirectory {
    /// Directory reading `catalog` and journaling next to it (`<catalog>.journal.jsonl`).
    #[must_use]
    pub fn new(catalog: impl Into<PathBuf>, lab_name: impl Into<String>) -> Self {
        let catalog = catalog.into();
        let mut journal = catalog.clone().into_os_string();
        journal.push(".journal.jsonl");
        Self {
            catalog,
            journal: PathBuf::from(journal),
            lab_name: lab_name.into(),
            journal_lock: Mutex::new(()),
        }
    }

    /// Journal file path.
    #[must_use]
    pub fn journal_path(&self) -> &Path {
        &self.journal
    }

    /// Orders from the catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RemoteUnavailable`] when the catalog cannot be
    /// read or parsed.
    pub async fn orders(&self) -> PipelineResult<Vec<CatalogOrder>> {
        let raw = tokio::fs::read(&self.catalog).await.map_err(|err| {
            PipelineError::unavailable(
                "catalog.read",
                format!("{}: {err}", self.catalog.display()),
            )
        })?;
        serde_json::from_slice(&raw).map_err(|err| {
            PipelineError::unavailable(
                "catalog.parse",
                format!("{}: {err}", self.catalog.display()),
            )
        })
    }

    /// Entries written to the journal so far.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::RemoteUnavailable`] when the journal is unreadable.
    pub async fn journal(&self) -> PipelineResult<Vec<JournalEntry>> {
        let raw = match tokio::fs::read_to_string(&self.journal).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(PipelineError::unavailable(
                    "journal.read",
                    format!("{}: {err}", self.journal.display()),
                ));
            }
        };
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line)
                    .map_err(|err| PipelineError::unavailable("journal.parse", err.to_string()))
            })
            .collect()
    }

    async fn append(&self, entry: &JournalEntry) -> PipelineResult<()> {
        let mut line = serde_json::to_string(entry)
            .map_err(|err| PipelineError::unavailable("journal.serialize", err.to_string()))?;
        line.push('\n');
        let _guard = self.journal_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal)
            .await
            .map_err(|err| journal_write_error(&self.journal, &err))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|err| journal_write_error(&self.journal, &err))?;
        file.flush()
            .await
            .map_err(|err| journal_write_error(&self.journal, &err))?;
        Ok(())
    }
}

fn journal_write_error(path: &Path, err: &std::io::Error) -> PipelineError {
    PipelineError::transient("journal.append", format!("{}: {err}", path.display()))
}

fn rank(order: &CatalogOrder, query: &SearchQuery) -> Option<ConfidenceTier> {
    let email = order.customer_email.to_lowercase();
    let name = order.customer_name.to_lowercase();
    match query.kind {
        TermKind::Email => (email == query.term).then_some(ConfidenceTier::Exact),
        TermKind::OrderNumber => {
            (order.order_number.trim_start_matches('#') == query.term).then_some(ConfidenceTier::Exact)
        }
        TermKind::FreeText if name == query.term => Some(ConfidenceTier::Strong),
        TermKind::FreeText => {
            (name.contains(&query.term) || email.contains(&query.term)).then_some(ConfidenceTier::Weak)
        }
    }
}

fn to_candidate(order: CatalogOrder, confidence: ConfidenceTier) -> Candidate {
    let label = if order.customer_name.is_empty() {
        format!("#{} {}", order.order_number, order.customer_email)
    } else {
        format!(
            "#{} {} <{}>",
            order.order_number, order.customer_name, order.customer_email
        )
    };
    Candidate {
        order_id: order.order_id,
        order_number: order.order_number,
        label,
        customer_email: order.customer_email,
        customer_id: order.customer_id,
        customer_root: order.customer_root,
        confidence,
    }
}

#[async_trait]
impl OrderDirectory for CatalogOrderDirectory {
    async fn search(&self, query: &SearchQuery) -> PipelineResult<Vec<Candidate>> {
        let mut ranked: Vec<(ConfidenceTier, CatalogOrder)> = self
            .orders()
            .await?
            .into_iter()
            .filter_map(|order| rank(&order, query).map(|tier| (tier, order)))
            .collect();
        ranked.sort_by(|(tier_a, a), (tier_b, b)| {
            tier_a
                .cmp(tier_b)
                .then_with(|| b.created_at.cmp(&a.created_at))
        });
        ranked.truncate(MAX_RESULTS);
        debug!(term = %query.term, matches = ranked.len(), "catalog searched");
        Ok(ranked
            .into_iter()
            .map(|(tier, order)| to_candidate(order, tier))
            .collect())
    }

    async fn annotate(&self, order_id: &str, links: &[RollLink]) -> PipelineResult<()> {
        let at = Utc::now();
        let note = format!(
            "Scans uploaded ({}) via {}.",
            at.format("%Y-%m-%d %H:%M"),
            self.lab_name
        );
        self.append(&JournalEntry::Annotation {
            order_id: order_id.to_string(),
            note,
            links: links.to_vec(),
            at,
        })
        .await?;
        info!(order_id, rolls = links.len(), "order annotated in journal");
        Ok(())
    }

    async fn tag_for_automation(&self, order_id: &str) -> PipelineResult<()> {
        self.append(&JournalEntry::Tag {
            order_id: order_id.to_string(),
            tag: AUTOMATION_TAG.to_string(),
            at: Utc::now(),
        })
        .await
    }

    async fn record_customer_root(&self, customer_id: &str, url: &str) -> PipelineResult<()> {
        self.append(&JournalEntry::CustomerRoot {
            customer_id: customer_id.to_string(),
            url: url.to_string(),
            at: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scanroute_pipeline::classify;
    use std::error::Error;
    use tempfile::TempDir;

    fn write_catalog(dir: &Path) -> Result<PathBuf, Box<dyn Error>> {
        let path = dir.join("orders.json");
        let orders = serde_json::json!([
            {
                "order_id": "gid://order/1",
                "order_number": "100",
                "customer_email": "jeff@example.com",
                "customer_name": "Jeff Example",
                "customer_id": "cust-1",
                "created_at": "2026-01-02T10:00:00Z"
            },
            {
                "order_id": "gid://order/2",
                "order_number": "101",
                "customer_email": "jeff@example.com",
                "customer_name": "Jeff Example",
                "customer_id": "cust-1",
                "created_at": "2026-02-02T10:00:00Z"
            },
            {
                "order_id": "gid://order/3",
                "order_number": "102",
                "customer_email": "ann@example.com",
                "customer_name": "Ann Jefferson"
            }
        ]);
        std::fs::write(&path, serde_json::to_vec(&orders)?)?;
        Ok(path)
    }

    #[tokio::test]
    async fn email_search_ranks_newest_order_first() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let directory = CatalogOrderDirectory::new(write_catalog(temp.path())?, "Noritsu");
        let found = directory.search(&classify("jeff@example.com")).await?;
        let numbers: Vec<_> = found.iter().map(|c| c.order_number.as_str()).collect();
        assert_eq!(numbers, vec!["101", "100"]);
        assert!(found.iter().all(|c| c.confidence == ConfidenceTier::Exact));
        Ok(())
    }

    #[tokio::test]
    async fn free_text_matches_are_weak_and_order_numbers_exact() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let directory = CatalogOrderDirectory::new(write_catalog(temp.path())?, "Noritsu");
        let loose = directory.search(&classify("jeff")).await?;
        assert_eq!(loose.len(), 3);
        assert!(loose.iter().all(|c| c.confidence == ConfidenceTier::Weak));

        let exact = directory.search(&classify("#102")).await?;
        assert_eq!(exact.len(), 1);
        assert_eq!(exact[0].label, "#102 Ann Jefferson <ann@example.com>");
        Ok(())
    }

    #[tokio::test]
    async fn annotation_note_names_the_lab() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let directory = CatalogOrderDirectory::new(write_catalog(temp.path())?, "Noritsu");
        let links = vec![RollLink {
            roll_id: "roll42".into(),
            destination: "/Store/orders/jeff@example.com/100/roll42/photos".into(),
            url: "file:///mirror/roll42".into(),
        }];
        directory.annotate("gid://order/1", &links).await?;
        directory.tag_for_automation("gid://order/1").await?;

        let journal = directory.journal().await?;
        assert_eq!(journal.len(), 2);
        let JournalEntry::Annotation { note, links: saved, .. } = &journal[0] else {
            return Err("expected annotation entry".into());
        };
        assert!(note.starts_with("Scans uploaded ("));
        assert!(note.ends_with(") via Noritsu."));
        assert_eq!(saved, &links);
        assert!(matches!(&journal[1], JournalEntry::Tag { tag, .. } if tag == AUTOMATION_TAG));
        Ok(())
    }

    #[tokio::test]
    async fn customer_roots_are_journaled() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let directory = CatalogOrderDirectory::new(write_catalog(temp.path())?, "Noritsu");
        directory
            .record_customer_root("cust-1", "file:///mirror/Store/orders/jeff@example.com")
            .await?;
        let journal = directory.journal().await?;
        assert!(matches!(
            journal.as_slice(),
            [JournalEntry::CustomerRoot { customer_id, .. }] if customer_id == "cust-1"
        ));
        assert!(directory.journal_path().ends_with("orders.json.journal.jsonl"));
        Ok(())
    }

    #[tokio::test]
    async fn missing_catalog_is_unavailable() -> Result<(), Box<dyn Error>> {
        let temp = TempDir::new()?;
        let directory = CatalogOrderDirectory::new(temp.path().join("absent.json"), "Noritsu");
        let err = directory
            .search(&classify("100"))
            .await
            .err()
            .ok_or("expected failure")?;
        assert!(matches!(err, PipelineError::RemoteUnavailable { .. }));
        Ok(())
    }
}
