use std::path::Path;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::car_model::{CarInfo, ContainerFetchSummary};
use super::car_reader::CarReader;
use super::car_traits::ObjectStore;
use crate::cid::{verify, Cid};
use crate::errors::{Error, Result};
use crate::retrieval::BlockSink;

const STREAM_BUFFER_SIZE: usize = 64 * 1024;

enum EntryReport {
    Forwarded,
    /// Verified but the sink refused it.
    Verified,
    Failed,
}

/// Pulls payload roots out of archived containers and forwards them
/// downstream.
#[derive(Clone)]
pub struct ContainerFetchService {
    store: Arc<dyn ObjectStore>,
    sink: Arc<dyn BlockSink>,
}

impl ContainerFetchService {
    pub fn new(store: Arc<dyn ObjectStore>, sink: Arc<dyn BlockSink>) -> Self {
        Self { store, sink }
    }

    /// Streams the container at `key` until the block with `target` appears.
    pub async fn find_block(&self, key: &str, target: &Cid) -> Result<Vec<u8>> {
        let stream = self.store.download_stream(key).await?;
        let mut reader = CarReader::new(BufReader::with_capacity(STREAM_BUFFER_SIZE, stream)).await?;
        debug!("[Car] {} roots: {:?}", key, reader.header().roots);
        Ok(reader.find_block(target).await?)
    }

    /// Locates, verifies and forwards the payload root of one container.
    pub async fn fetch_entry(&self, info: &CarInfo) -> Result<Cid> {
        let root: Cid = info.data_cid.parse()?;
        let block = self.find_block(&info.file_name, &root).await?;
        verify(&root, &block)?;
        self.sink.submit(&root, &block).await?;
        Ok(root)
    }

    async fn process_entry(&self, info: CarInfo, cancel: CancellationToken) -> EntryReport {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = self.fetch_entry(&info) => res,
        };
        match result {
            Ok(root) => {
                info!("[Car] Forwarded {} from {}", root, info.file_name);
                EntryReport::Forwarded
            }
            Err(Error::Sink(e)) => {
                warn!("[Car] Sink rejected {}: {}", info.data_cid, e);
                EntryReport::Verified
            }
            Err(e) => {
                error!("[Car] {} ({}): {}", info.file_name, info.data_cid, e);
                EntryReport::Failed
            }
        }
    }

    /// Reads a JSON-lines manifest and processes every entry with at most
    /// `parallel` containers in flight. Per-entry failures are logged and
    /// counted; only an unreadable manifest is an error.
    pub async fn process_manifest(
        &self,
        manifest: &Path,
        parallel: usize,
        cancel: CancellationToken,
    ) -> Result<ContainerFetchSummary> {
        let file = tokio::fs::File::open(manifest).await?;
        let mut lines = BufReader::new(file).lines();
        let semaphore = Arc::new(Semaphore::new(parallel.max(1)));
        let mut tasks = JoinSet::new();
        let mut summary = ContainerFetchSummary::default();

        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            summary.entries += 1;
            let info: CarInfo = match serde_json::from_str(line) {
                Ok(info) => info,
                Err(e) => {
                    warn!("[Car] Skipping malformed manifest line: {}", e);
                    summary.malformed += 1;
                    continue;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => permit
                    .map_err(|e| Error::invalid_input(format!("worker pool closed: {e}")))?,
            };
            let service = self.clone();
            let cancel = cancel.clone();
            tasks.spawn(async move {
                let _permit = permit;
                service.process_entry(info, cancel).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(EntryReport::Forwarded) => {
                    summary.verified += 1;
                    summary.forwarded += 1;
                }
                Ok(EntryReport::Verified) => summary.verified += 1,
                Ok(EntryReport::Failed) => summary.failed += 1,
                Err(e) => {
                    error!("[Car] Container task aborted: {}", e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "[Car] Manifest {} done: entries={} forwarded={} failed={} malformed={}",
            manifest.display(),
            summary.entries,
            summary.forwarded,
            summary.failed,
            summary.malformed
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::car::car_reader::test_support::{carv1, raw_cid};
    use crate::testing::{MemoryObjectStore, RecordingSink};

    fn manifest_line(data_cid: &Cid, file_name: &str) -> String {
        serde_json::json!({
            "dataCid": data_cid.to_string(),
            "pieceCid": "baga6ea4seaq",
            "pieceSize": 2048,
            "carSize": 1900,
            "fileName": file_name,
        })
        .to_string()
    }

    #[tokio::test]
    async fn forwards_roots_found_in_containers() {
        let root = raw_cid(b"payload root");
        let filler = raw_cid(b"filler");
        let store = Arc::new(MemoryObjectStore::default());
        store.put(
            "a.car",
            carv1(
                &[root.clone()],
                &[(filler.clone(), b"filler".to_vec()), (root.clone(), b"payload root".to_vec())],
            ),
        );
        // root missing from this container
        store.put("b.car", carv1(&[filler.clone()], &[(filler.clone(), b"filler".to_vec())]));

        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.jsonl");
        let lines = [
            manifest_line(&root, "a.car"),
            "{not json".to_string(),
            String::new(),
            manifest_line(&root, "b.car"),
            manifest_line(&root, "missing.car"),
        ];
        std::fs::write(&manifest, lines.join("\n")).unwrap();

        let sink = Arc::new(RecordingSink::default());
        let service = ContainerFetchService::new(store, sink.clone());
        let summary = service
            .process_manifest(&manifest, 2, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.entries, 4);
        assert_eq!(summary.malformed, 1);
        assert_eq!(summary.forwarded, 1);
        assert_eq!(summary.failed, 2);
        let submitted = sink.submitted();
        assert_eq!(submitted.len(), 1);
        assert_eq!(submitted[0].0, root);
        assert_eq!(submitted[0].1, b"payload root".to_vec());
    }

    #[tokio::test]
    async fn corrupted_block_is_not_forwarded() {
        let root = raw_cid(b"payload root");
        let store = Arc::new(MemoryObjectStore::default());
        store.put(
            "a.car",
            carv1(&[root.clone()], &[(root.clone(), b"tampered".to_vec())]),
        );
        let sink = Arc::new(RecordingSink::default());
        let service = ContainerFetchService::new(store, sink.clone());

        let err = service
            .fetch_entry(&CarInfo {
                data_cid: root.to_string(),
                piece_cid: String::new(),
                piece_size: 0,
                car_size: 0,
                file_name: "a.car".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("mismatch"));
        assert!(sink.submitted().is_empty());
    }

    #[tokio::test]
    async fn sink_failure_still_counts_as_verified() {
        let root = raw_cid(b"payload root");
        let store = Arc::new(MemoryObjectStore::default());
        store.put("a.car", carv1(&[root.clone()], &[(root.clone(), b"payload root".to_vec())]));
        let sink = Arc::new(RecordingSink::failing());
        let dir = tempfile::tempdir().unwrap();
        let manifest = dir.path().join("manifest.jsonl");
        std::fs::write(&manifest, manifest_line(&root, "a.car")).unwrap();

        let summary = ContainerFetchService::new(store, sink)
            .process_manifest(&manifest, 1, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.verified, 1);
        assert_eq!(summary.forwarded, 0);
    }

    #[tokio::test]
    async fn unreadable_manifest_is_an_error() {
        let service = ContainerFetchService::new(
            Arc::new(MemoryObjectStore::default()),
            Arc::new(RecordingSink::default()),
        );
        let err = service
            .process_manifest(Path::new("/no/such/manifest"), 1, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
