//! Checkpoint Coordinator (spec §4.G): assigns checkpoint ids, collects each
//! operator's snapshot once its barrier has passed, and durably commits a
//! round only once every operator has acked.
//!
//! Durable storage goes through `object_store`'s `LocalFileSystem`, which
//! already implements an atomic `rename` on top of the platform filesystem —
//! exactly the primitive spec §6.2 asks the commit step to use, so the
//! on-disk layout here is a thin, literal translation of that section rather
//! than a new protocol.

use std::path::Path as FsPath;
use std::sync::Arc;

use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{local::LocalFileSystem, ObjectStore};
use tokio::sync::mpsc;

use flux_core::message::CheckpointId;
use flux_core::operator::Operator;
use flux_core::{ErrorKind, PipelineError, Result};

use crate::schedule::SnapshotReport;

/// How many past committed checkpoint ids [`CheckpointCoordinator::commit`]
/// keeps in the history file, oldest discarded first. Spec §4.G: "the
/// pipeline may be started from the last-known-good earlier checkpoint if
/// present" — a single superseded id is the common case, but a handful of
/// retries is cheap to keep and avoids falling straight to "from scratch" on
/// two consecutive corrupt blobs.
const HISTORY_LIMIT: usize = 5;

/// Durable checkpoint store plus id bookkeeping for one pipeline instance
/// (identified by `pipeline_id`, spec §4.G/§6.2).
pub struct CheckpointCoordinator {
    store: Arc<dyn ObjectStore>,
    pipeline_id: String,
    operator_count: usize,
    next_id: u64,
}

impl CheckpointCoordinator {
    pub fn new(store: Arc<dyn ObjectStore>, pipeline_id: impl Into<String>, operator_count: usize) -> Self {
        Self {
            store,
            pipeline_id: pipeline_id.into(),
            operator_count,
            next_id: 1,
        }
    }

    /// Opens (creating if absent) a local-disk-backed coordinator rooted at
    /// `state_dir`, matching the `<state_dir>/P/...` layout of spec §6.2.
    pub fn open_local(
        state_dir: impl AsRef<FsPath>,
        pipeline_id: impl Into<String>,
        operator_count: usize,
    ) -> Result<Self> {
        let fs = LocalFileSystem::new_with_prefix(state_dir).map_err(|e| {
            PipelineError::with_source(
                ErrorKind::Io,
                "failed to open checkpoint state directory",
                e.into(),
            )
        })?;
        Ok(Self::new(Arc::new(fs), pipeline_id, operator_count))
    }

    /// Assigns the next monotonically increasing `checkpoint_id` (spec §4.G
    /// item 1).
    pub fn next_checkpoint_id(&mut self) -> CheckpointId {
        let id = CheckpointId(self.next_id);
        self.next_id += 1;
        id
    }

    fn blob_path(&self, checkpoint_id: CheckpointId, operator_index: usize) -> ObjectPath {
        ObjectPath::from(format!(
            "{}/{}/{}",
            self.pipeline_id, checkpoint_id.0, operator_index
        ))
    }

    fn committed_marker_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/CHECKPOINT", self.pipeline_id))
    }

    fn committed_tmp_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/CHECKPOINT.tmp", self.pipeline_id))
    }

    /// Internal bookkeeping file, not part of spec §6.2's on-disk layout
    /// (which only promises the single current `CHECKPOINT` marker):
    /// newline-separated committed checkpoint ids, newest first, bounded to
    /// [`HISTORY_LIMIT`] entries. Lets restart fall back to an earlier
    /// checkpoint without needing to probe the blob directory for
    /// candidates.
    fn history_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/CHECKPOINT.history", self.pipeline_id))
    }

    fn history_tmp_path(&self) -> ObjectPath {
        ObjectPath::from(format!("{}/CHECKPOINT.history.tmp", self.pipeline_id))
    }

    async fn read_history(&self) -> Result<Vec<CheckpointId>> {
        match self.store.get(&self.history_path()).await {
            Ok(result) => {
                let bytes = result.bytes().await.map_err(|e| {
                    PipelineError::with_source(ErrorKind::Io, "failed to read checkpoint history", e.into())
                })?;
                let text = String::from_utf8_lossy(&bytes);
                Ok(text
                    .lines()
                    .filter(|line| !line.is_empty())
                    .filter_map(|line| line.parse::<u64>().ok())
                    .map(CheckpointId)
                    .collect())
            }
            Err(object_store::Error::NotFound { .. }) => Ok(Vec::new()),
            Err(e) => Err(PipelineError::with_source(ErrorKind::Io, "failed to read checkpoint history", e.into())),
        }
    }

    async fn write_history(&self, ids: &[CheckpointId]) -> Result<()> {
        let text = ids.iter().map(|id| id.0.to_string()).collect::<Vec<_>>().join("\n");
        let tmp = self.history_tmp_path();
        self.store.put(&tmp, Bytes::from(text)).await.map_err(|e| {
            PipelineError::with_source(ErrorKind::Io, "failed to write checkpoint history", e.into())
        })?;
        self.store.rename(&tmp, &self.history_path()).await.map_err(|e| {
            PipelineError::with_source(ErrorKind::Io, "failed to commit checkpoint history", e.into())
        })?;
        Ok(())
    }

    async fn persist_snapshot(&self, report: &SnapshotReport) -> Result<()> {
        let path = self.blob_path(report.checkpoint_id, report.operator_index);
        self.store
            .put(&path, Bytes::from(report.state.clone()))
            .await
            .map_err(|e| {
                PipelineError::with_source(
                    ErrorKind::Io,
                    format!("failed to persist checkpoint blob at {path}"),
                    e.into(),
                )
            })?;
        Ok(())
    }

    /// Drains `snapshots` until every operator has acked `checkpoint_id`,
    /// persisting each blob as it arrives, then commits the round (spec
    /// §4.G items 3-4). Returns `Ok(false)` without committing if the
    /// snapshot channel closes early (the pipeline shut down mid-round);
    /// that round is simply never observed as committed on restart.
    pub async fn run_round(
        &self,
        checkpoint_id: CheckpointId,
        snapshots: &mut mpsc::UnboundedReceiver<SnapshotReport>,
    ) -> Result<bool> {
        let mut acked = vec![false; self.operator_count];
        while !acked.iter().all(|a| *a) {
            let Some(report) = snapshots.recv().await else {
                return Ok(false);
            };
            if report.checkpoint_id != checkpoint_id {
                continue;
            }
            self.persist_snapshot(&report).await?;
            acked[report.operator_index] = true;
        }
        self.commit(checkpoint_id).await?;
        Ok(true)
    }

    async fn commit(&self, checkpoint_id: CheckpointId) -> Result<()> {
        let mut history = self.read_history().await.unwrap_or_default();
        history.retain(|id| *id != checkpoint_id);
        history.insert(0, checkpoint_id);
        history.truncate(HISTORY_LIMIT);
        self.write_history(&history).await?;

        let tmp = self.committed_tmp_path();
        self.store
            .put(&tmp, Bytes::copy_from_slice(&checkpoint_id.0.to_be_bytes()))
            .await
            .map_err(|e| {
                PipelineError::with_source(ErrorKind::Io, "failed to write checkpoint marker", e.into())
            })?;
        self.store
            .rename(&tmp, &self.committed_marker_path())
            .await
            .map_err(|e| {
                PipelineError::with_source(
                    ErrorKind::Io,
                    "failed to commit checkpoint marker",
                    e.into(),
                )
            })?;
        Ok(())
    }

    /// All committed checkpoint ids still on record, newest first (spec
    /// §4.G restart fallback: "the pipeline may be started from the
    /// last-known-good earlier checkpoint if present, otherwise from
    /// scratch"). Empty if nothing has ever committed.
    pub async fn committed_history(&self) -> Result<Vec<CheckpointId>> {
        self.read_history().await
    }

    /// Reads the last committed `checkpoint_id`, if any (spec §4.G item 5).
    pub async fn last_committed(&self) -> Result<Option<CheckpointId>> {
        let path = self.committed_marker_path();
        match self.store.get(&path).await {
            Ok(result) => {
                let bytes = result.bytes().await.map_err(|e| {
                    PipelineError::with_source(ErrorKind::Io, "failed to read checkpoint marker", e.into())
                })?;
                if bytes.len() != 8 {
                    return Err(PipelineError::state_corruption(format!(
                        "checkpoint marker at {path} is {} bytes, expected 8",
                        bytes.len()
                    )));
                }
                let mut buf = [0u8; 8];
                buf.copy_from_slice(&bytes);
                Ok(Some(CheckpointId(u64::from_be_bytes(buf))))
            }
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(PipelineError::with_source(
                ErrorKind::Io,
                "failed to read checkpoint marker",
                e.into(),
            )),
        }
    }

    /// Restores every operator from the newest committed checkpoint that
    /// decodes cleanly, falling back to progressively older ones (spec
    /// §4.G: "a blob that fails to decode aborts restore with a
    /// `state_corruption` error; the pipeline may be started from the
    /// last-known-good earlier checkpoint if present, otherwise from
    /// scratch"). Returns the checkpoint id actually restored from, or
    /// `None` if every committed id failed (or none exist) and the caller
    /// should start the pipeline from scratch.
    pub async fn restore_with_fallback(&self, operators: &mut [Box<dyn Operator>]) -> Result<Option<CheckpointId>> {
        for checkpoint_id in self.committed_history().await? {
            match self.try_restore(checkpoint_id, operators).await {
                Ok(()) => return Ok(Some(checkpoint_id)),
                Err(e) => {
                    tracing::warn!(
                        %checkpoint_id,
                        error = %e,
                        "checkpoint restore failed, falling back to an earlier checkpoint"
                    );
                }
            }
        }
        Ok(None)
    }

    async fn try_restore(&self, checkpoint_id: CheckpointId, operators: &mut [Box<dyn Operator>]) -> Result<()> {
        for (index, operator) in operators.iter_mut().enumerate() {
            let blob = self.load_snapshot(checkpoint_id, index).await?;
            operator.restore_state(&blob)?;
        }
        Ok(())
    }

    /// Fetches operator `operator_index`'s state blob for `checkpoint_id`
    /// (spec §4.G item 5). A missing blob is itself a form of
    /// `state_corruption`: a committed checkpoint promises every operator's
    /// blob exists.
    pub async fn load_snapshot(&self, checkpoint_id: CheckpointId, operator_index: usize) -> Result<Vec<u8>> {
        let path = self.blob_path(checkpoint_id, operator_index);
        let result = self.store.get(&path).await.map_err(|e| {
            PipelineError::with_source(
                ErrorKind::StateCorruption,
                format!("missing checkpoint blob at {path}"),
                e.into(),
            )
        })?;
        let bytes = result
            .bytes()
            .await
            .map_err(|e| PipelineError::with_source(ErrorKind::Io, "failed to read checkpoint blob", e.into()))?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures::stream::StreamExt;

    fn report(checkpoint_id: u64, operator_index: usize, state: &[u8]) -> SnapshotReport {
        SnapshotReport {
            operator_index,
            checkpoint_id: CheckpointId(checkpoint_id),
            state: state.to_vec(),
        }
    }

    #[tokio::test]
    async fn round_trip_persist_and_load() {
        let dir = std::env::temp_dir().join(format!("flux-checkpoint-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let coordinator = CheckpointCoordinator::open_local(&dir, "P", 2).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(report(1, 0, b"alpha")).unwrap();
        tx.send(report(1, 1, b"beta")).unwrap();
        drop(tx);

        let committed = coordinator
            .run_round(CheckpointId(1), &mut rx)
            .await
            .unwrap();
        assert!(committed);

        assert_eq!(coordinator.last_committed().await.unwrap(), Some(CheckpointId(1)));
        assert_eq!(
            coordinator.load_snapshot(CheckpointId(1), 0).await.unwrap(),
            b"alpha"
        );
        assert_eq!(
            coordinator.load_snapshot(CheckpointId(1), 1).await.unwrap(),
            b"beta"
        );

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn uncommitted_pipeline_has_no_marker() {
        let dir = std::env::temp_dir().join(format!("flux-checkpoint-test-empty-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let coordinator = CheckpointCoordinator::open_local(&dir, "Q", 1).unwrap();
        assert_eq!(coordinator.last_committed().await.unwrap(), None);
        std::fs::remove_dir_all(&dir).ok();
    }

    /// Rejects any blob equal to `b"bad"` as `state_corruption`, otherwise
    /// records the restored bytes, so a test can tell which checkpoint a
    /// restore actually pulled state from.
    struct FlakyRestoreOperator {
        restored_as: Mutex<Option<Vec<u8>>>,
    }

    impl FlakyRestoreOperator {
        fn new() -> Self {
            Self { restored_as: Mutex::new(None) }
        }
    }

    #[async_trait::async_trait]
    impl Operator for FlakyRestoreOperator {
        fn name(&self) -> &str {
            "flaky_restore"
        }
        fn input_kind(&self) -> flux_core::operator::ElementKind {
            flux_core::operator::ElementKind::Void
        }
        fn output_kind(&self) -> flux_core::operator::ElementKind {
            flux_core::operator::ElementKind::Void
        }
        async fn instantiate(
            &self,
            _input: flux_core::operator::MessageStream,
            _control: flux_core::control::ControlPlane,
        ) -> Result<flux_core::operator::MessageStream> {
            Ok(futures::stream::empty().boxed())
        }
        fn restore_state(&mut self, state: &[u8]) -> Result<()> {
            if state == b"bad" {
                return Err(PipelineError::state_corruption("blob decoded as garbage"));
            }
            *self.restored_as.get_mut().unwrap() = Some(state.to_vec());
            Ok(())
        }
    }

    #[tokio::test]
    async fn restore_with_fallback_skips_a_corrupt_checkpoint_for_an_earlier_good_one() {
        let dir = std::env::temp_dir().join(format!("flux-checkpoint-test-fallback-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let coordinator = CheckpointCoordinator::open_local(&dir, "R", 1).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(report(1, 0, b"good-1")).unwrap();
        drop(tx);
        assert!(coordinator.run_round(CheckpointId(1), &mut rx).await.unwrap());

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(report(2, 0, b"bad")).unwrap();
        drop(tx);
        assert!(coordinator.run_round(CheckpointId(2), &mut rx).await.unwrap());

        assert_eq!(coordinator.last_committed().await.unwrap(), Some(CheckpointId(2)));

        let mut operators: Vec<Box<dyn Operator>> = vec![Box::new(FlakyRestoreOperator::new())];
        let restored_from = coordinator.restore_with_fallback(&mut operators).await.unwrap();
        assert_eq!(restored_from, Some(CheckpointId(1)));

        std::fs::remove_dir_all(&dir).ok();
    }

    #[tokio::test]
    async fn restore_with_fallback_returns_none_when_nothing_decodes() {
        let dir = std::env::temp_dir().join(format!("flux-checkpoint-test-all-corrupt-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let coordinator = CheckpointCoordinator::open_local(&dir, "S", 1).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        tx.send(report(1, 0, b"bad")).unwrap();
        drop(tx);
        assert!(coordinator.run_round(CheckpointId(1), &mut rx).await.unwrap());

        let mut operators: Vec<Box<dyn Operator>> = vec![Box::new(FlakyRestoreOperator::new())];
        let restored_from = coordinator.restore_with_fallback(&mut operators).await.unwrap();
        assert_eq!(restored_from, None);

        std::fs::remove_dir_all(&dir).ok();
    }
}
