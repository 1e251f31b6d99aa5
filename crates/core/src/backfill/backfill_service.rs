use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, error, info, warn};
use serde::de::{self, MapAccess, Visitor};
use serde::Deserializer as _;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::backfill_model::{BackfillRequest, BackfillSummary};
use crate::chain::MarketDeal;
use crate::deals::{DealRepositoryTrait, NewDeal};
use crate::errors::{Error, Result};

const ENTRY_CHANNEL_CAPACITY: usize = 1024;
const RECEIVER_GONE: &str = "snapshot consumer stopped";

/// One top-level `deal id -> market deal` pair.
struct SnapshotEntry {
    key: String,
    deal: std::result::Result<MarketDeal, String>,
}

/// Visits the snapshot object one entry at a time so the full map is never
/// held in memory.
struct EntryVisitor {
    tx: mpsc::Sender<SnapshotEntry>,
}

impl<'de> Visitor<'de> for EntryVisitor {
    type Value = ();

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an object mapping deal ids to market deals")
    }

    fn visit_map<A>(self, mut map: A) -> std::result::Result<(), A::Error>
    where
        A: MapAccess<'de>,
    {
        while let Some(key) = map.next_key::<String>()? {
            let value = map.next_value::<serde_json::Value>()?;
            let deal = serde_json::from_value::<MarketDeal>(value).map_err(|e| e.to_string());
            if self.tx.blocking_send(SnapshotEntry { key, deal }).is_err() {
                return Err(de::Error::custom(RECEIVER_GONE));
            }
        }
        Ok(())
    }
}

fn stream_entries<R: Read>(reader: R, tx: mpsc::Sender<SnapshotEntry>) -> Result<()> {
    let mut de = serde_json::Deserializer::from_reader(reader);
    (&mut de).deserialize_map(EntryVisitor { tx })?;
    de.end()?;
    Ok(())
}

/// Opens the snapshot, decompressing `.zst` files on the fly.
pub fn open_snapshot(path: &Path) -> Result<Box<dyn Read + Send>> {
    let file = File::open(path)?;
    let compressed = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("zst"));
    if compressed {
        Ok(Box::new(zstd::stream::read::Decoder::new(file)?))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

enum Step {
    Cancelled,
    Entry(Option<SnapshotEntry>),
}

/// Imports deals from a market snapshot into the registry.
pub struct BackfillService {
    repository: Arc<dyn DealRepositoryTrait>,
    snapshot_path: PathBuf,
    configured_providers: Vec<String>,
}

impl BackfillService {
    pub fn new(
        repository: Arc<dyn DealRepositoryTrait>,
        snapshot_path: impl Into<PathBuf>,
        configured_providers: Vec<String>,
    ) -> Self {
        Self {
            repository,
            snapshot_path: snapshot_path.into(),
            configured_providers,
        }
    }

    fn effective_providers(&self, request: &BackfillRequest) -> Result<HashSet<String>> {
        let providers: HashSet<String> = if request.providers.is_empty() {
            self.configured_providers.iter().cloned().collect()
        } else {
            request.providers.iter().cloned().collect()
        };
        if providers.is_empty() {
            return Err(Error::invalid_input(
                "backfill needs at least one provider (none requested or configured)",
            ));
        }
        Ok(providers)
    }

    /// Imports from the configured snapshot file.
    pub async fn import(
        &self,
        request: BackfillRequest,
        cancel: CancellationToken,
    ) -> Result<BackfillSummary> {
        let providers = self.effective_providers(&request)?;
        let reader = open_snapshot(&self.snapshot_path)?;
        info!(
            "[Backfill] Importing {} for {} provider(s) from epoch {}",
            self.snapshot_path.display(),
            providers.len(),
            request.start_epoch
        );
        self.import_reader(reader, &providers, request.start_epoch, cancel)
            .await
    }

    /// Streams `reader` and inserts every matching deal. Cancellation stops
    /// the run between entries.
    pub async fn import_reader<R>(
        &self,
        reader: R,
        providers: &HashSet<String>,
        start_epoch: i64,
        cancel: CancellationToken,
    ) -> Result<BackfillSummary>
    where
        R: Read + Send + 'static,
    {
        let (tx, mut rx) = mpsc::channel(ENTRY_CHANNEL_CAPACITY);
        let producer = tokio::task::spawn_blocking(move || stream_entries(reader, tx));
        let mut summary = BackfillSummary::default();

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Cancelled,
                entry = rx.recv() => Step::Entry(entry),
            };
            match step {
                Step::Cancelled => {
                    warn!("[Backfill] Cancelled after {} entries", summary.scanned);
                    return Err(Error::Cancelled);
                }
                Step::Entry(None) => break,
                Step::Entry(Some(entry)) => {
                    self.import_entry(entry, providers, start_epoch, &mut summary)
                        .await
                }
            }
        }

        producer
            .await
            .map_err(|e| Error::invalid_input(format!("snapshot reader failed: {e}")))??;

        info!(
            "[Backfill] Done: scanned={} inserted={} duplicates={} failed={}",
            summary.scanned, summary.inserted, summary.duplicates, summary.failed
        );
        Ok(summary)
    }

    async fn import_entry(
        &self,
        entry: SnapshotEntry,
        providers: &HashSet<String>,
        start_epoch: i64,
        summary: &mut BackfillSummary,
    ) {
        summary.scanned += 1;

        let Ok(deal_id) = entry.key.parse::<i64>() else {
            debug!("[Backfill] Skipping non-numeric key '{}'", entry.key);
            summary.skipped_key += 1;
            return;
        };
        let deal = match entry.deal {
            Ok(deal) => deal,
            Err(e) => {
                warn!("[Backfill] Skipping malformed deal {}: {}", deal_id, e);
                summary.skipped_malformed += 1;
                return;
            }
        };
        let proposal = deal.proposal;
        if !providers.contains(&proposal.provider) {
            summary.skipped_provider += 1;
            return;
        }
        if proposal.start_epoch < start_epoch {
            summary.skipped_epoch += 1;
            return;
        }
        let payload_cid = match proposal.label.to_payload_string() {
            Ok(label) => label,
            Err(e) => {
                warn!("[Backfill] Skipping deal {}: {}", deal_id, e);
                summary.skipped_label += 1;
                return;
            }
        };

        let new_deal = NewDeal {
            deal_id,
            payload_cid,
            client: proposal.client,
            provider: proposal.provider,
            start_epoch: proposal.start_epoch,
            end_epoch: proposal.end_epoch,
        };
        match self.repository.insert_if_absent(new_deal).await {
            Ok(true) => summary.inserted += 1,
            Ok(false) => summary.duplicates += 1,
            Err(e) => {
                error!("[Backfill] Failed to insert deal {}: {}", deal_id, e);
                summary.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MemoryDealRepository;
    use serde_json::json;

    fn snapshot() -> serde_json::Value {
        json!({
            "1": {
                "Proposal": {
                    "Client": "f01000", "Provider": "f02000", "Label": "bafy-one",
                    "StartEpoch": 500, "EndEpoch": 900, "PieceSize": 2048, "VerifiedDeal": true
                },
                "State": {"SectorStartEpoch": 10, "LastUpdatedEpoch": -1, "SlashEpoch": -1}
            },
            "2": {
                "Proposal": {
                    "Client": "f01000", "Provider": "f03000", "Label": "bafy-two",
                    "StartEpoch": 500, "EndEpoch": 900
                },
                "State": {}
            },
            "3": {
                "Proposal": {
                    "Client": "f01000", "Provider": "f02000", "Label": "bafy-three",
                    "StartEpoch": 10, "EndEpoch": 900
                }
            },
            "4": {
                "Proposal": {
                    "Client": "f01000", "Provider": "f02000", "Label": [255, 254],
                    "StartEpoch": 600, "EndEpoch": 900
                }
            },
            "x": {"Proposal": {"Client": "f0", "Provider": "f02000", "Label": "", "StartEpoch": 0, "EndEpoch": 0}},
            "5": {"Unexpected": true}
        })
    }

    fn write_snapshot(dir: &Path, compressed: bool) -> PathBuf {
        let raw = serde_json::to_vec(&snapshot()).unwrap();
        if compressed {
            let path = dir.join("deals.json.zst");
            std::fs::write(&path, zstd::stream::encode_all(raw.as_slice(), 3).unwrap()).unwrap();
            path
        } else {
            let path = dir.join("deals.json");
            std::fs::write(&path, raw).unwrap();
            path
        }
    }

    #[tokio::test]
    async fn imports_only_matching_deals_from_compressed_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), true);
        let repo = Arc::new(MemoryDealRepository::default());
        let service = BackfillService::new(repo.clone(), path, vec!["f02000".to_string()]);

        let summary = service
            .import(
                BackfillRequest {
                    providers: vec![],
                    start_epoch: 100,
                },
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(summary.scanned, 6);
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.skipped_key, 1);
        assert_eq!(summary.skipped_malformed, 1);
        assert_eq!(summary.skipped_provider, 1);
        assert_eq!(summary.skipped_epoch, 1);
        assert_eq!(summary.skipped_label, 1);

        let deal = repo.deal(1).unwrap();
        assert_eq!(deal.payload_cid, "bafy-one");
        assert_eq!(deal.start_epoch, 500);
        assert_eq!(deal.last_update, None);
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn rerun_counts_duplicates_and_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_snapshot(dir.path(), false);
        let repo = Arc::new(MemoryDealRepository::default());
        let service = BackfillService::new(repo.clone(), path, vec![]);
        let request = BackfillRequest {
            providers: vec!["f02000".into(), "f03000".into()],
            start_epoch: 0,
        };

        let first = service
            .import(request.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(first.inserted, 3);

        let second = service
            .import(request, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.duplicates, 3);
        assert_eq!(repo.len(), 3);
    }

    #[tokio::test]
    async fn empty_provider_set_is_rejected_up_front() {
        let service = BackfillService::new(
            Arc::new(MemoryDealRepository::default()),
            "/does/not/exist.zst",
            vec![],
        );
        let err = service
            .import(BackfillRequest::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
    }

    #[tokio::test]
    async fn missing_snapshot_is_an_error() {
        let service = BackfillService::new(
            Arc::new(MemoryDealRepository::default()),
            "/does/not/exist.zst",
            vec!["f02000".into()],
        );
        let err = service
            .import(BackfillRequest::default(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[tokio::test]
    async fn cancelled_run_stops_without_finishing() {
        let repo = Arc::new(MemoryDealRepository::default());
        let service = BackfillService::new(repo.clone(), "unused", vec![]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let raw = serde_json::to_vec(&snapshot()).unwrap();
        let providers: HashSet<String> = ["f02000".to_string()].into_iter().collect();

        let err = service
            .import_reader(std::io::Cursor::new(raw), &providers, 0, cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(repo.len(), 0);
    }

    #[tokio::test]
    async fn truncated_snapshot_fails() {
        let service = BackfillService::new(Arc::new(MemoryDealRepository::default()), "unused", vec![]);
        let providers: HashSet<String> = ["f02000".to_string()].into_iter().collect();
        let err = service
            .import_reader(
                std::io::Cursor::new(br#"{"1": {"Proposal": "#.to_vec()),
                &providers,
                0,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Json(_)));
    }
}
