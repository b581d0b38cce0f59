//! Processor manager — one full pipeline run.
//!
//! 1. Refuse to start twice (the guard is released when the run ends).
//! 2. Create every model table and the checkpoint table.
//! 3. Resolve the super stream's next version `S`.
//! 4. Sync every coprocessor to `S`.
//! 5. Open the shared stream at `S` and fan batches out to admitted coprocessors.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::checkpoint::CheckpointManager;
use crate::coprocessor::Coprocessor;
use crate::error::IndexerError;
use crate::store::{Storage, TableSchema};
use crate::stream::StreamProvider;
use crate::super_processor::{super_processor_name, StreamExit, SuperProcessor};
use crate::supervisor::{ErrorReporter, Pipeline};
use crate::sync::SyncCoordinator;

pub struct ProcessorManager {
    chain_id: u64,
    /// Super stream genesis.
    starting_version: u64,
    store: Arc<dyn Storage>,
    provider: Arc<dyn StreamProvider>,
    coprocessors: Vec<Arc<dyn Coprocessor>>,
    running: AtomicBool,
}

/// Clears the running flag on drop, whichever way the run ends.
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ProcessorManager {
    pub fn new(
        chain_id: u64,
        starting_version: u64,
        store: Arc<dyn Storage>,
        provider: Arc<dyn StreamProvider>,
    ) -> Self {
        Self {
            chain_id,
            starting_version,
            store,
            provider,
            coprocessors: Vec::new(),
            running: AtomicBool::new(false),
        }
    }

    /// Add a coprocessor; coprocessors run in the order they were added.
    pub fn with_coprocessor(mut self, coprocessor: Arc<dyn Coprocessor>) -> Self {
        self.coprocessors.push(coprocessor);
        self
    }

    pub fn super_processor_name(&self) -> String {
        super_processor_name(self.chain_id)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn acquire(&self) -> Result<RunGuard<'_>, IndexerError> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| IndexerError::AlreadyRunning)?;
        Ok(RunGuard(&self.running))
    }

    fn tables(&self) -> Vec<TableSchema> {
        self.coprocessors.iter().flat_map(|c| c.tables()).collect()
    }

    /// Run the pipeline until the stream closes or an error occurs.
    pub async fn run(&self, reporter: ErrorReporter) -> Result<StreamExit, IndexerError> {
        let _guard = self.acquire()?;

        self.store.migrate(&self.tables()).await?;

        let super_next = CheckpointManager::new(self.store.clone(), self.super_processor_name())
            .resolve(self.starting_version)
            .await?;
        tracing::info!(
            chain_id = self.chain_id,
            super_next,
            genesis = self.starting_version,
            coprocessors = self.coprocessors.len(),
            "Processor manager starting"
        );

        let report = SyncCoordinator::new(
            self.chain_id,
            super_next,
            self.starting_version,
            self.store.clone(),
            self.provider.clone(),
        )
        .sync(&self.coprocessors, &reporter)
        .await?;

        let super_processor = SuperProcessor::new(self.chain_id, super_next, report.admitted);
        let mut stream = self.provider.open(super_next).await?;
        super_processor
            .run(super_next, stream.as_mut(), self.store.as_ref())
            .await
    }
}

#[async_trait]
impl Pipeline for ProcessorManager {
    async fn run(&self, reporter: ErrorReporter) -> Result<StreamExit, IndexerError> {
        ProcessorManager::run(self, reporter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::coprocessor::tests::{ledger_tx, pings_table_named, Pinger};
    use crate::memory::InMemoryStorage;
    use crate::retry::RetryConfig;
    use crate::stream::MemoryLedger;
    use crate::supervisor::Supervisor;

    fn manager(store: &InMemoryStorage, ledger: MemoryLedger, coprocessors: Vec<Arc<dyn Coprocessor>>) -> ProcessorManager {
        let mut manager = ProcessorManager::new(0, 1, Arc::new(store.clone()), Arc::new(ledger));
        for c in coprocessors {
            manager = manager.with_coprocessor(c);
        }
        manager
    }

    fn versions(rows: &[crate::store::Row]) -> Vec<i64> {
        let mut v: Vec<i64> = rows.iter().filter_map(|r| r.int("version")).collect();
        v.sort_unstable();
        v
    }

    #[tokio::test]
    async fn fresh_run_indexes_the_whole_ledger() {
        let store = InMemoryStorage::new();
        let ledger = MemoryLedger::new((1..=120).map(ledger_tx).collect(), 25);
        let pinger: Arc<dyn Coprocessor> = Arc::new(Pinger::new("pinger", 1));
        let m = manager(&store, ledger, vec![pinger]);

        let (reporter, _errors) = ErrorReporter::channel();
        let exit = m.run(reporter).await.unwrap();

        assert_eq!(exit, StreamExit::Ended { next_version: 121 });
        assert!(!m.is_running());
        assert_eq!(store.next_version("0_super_processor").await.unwrap(), Some(121));
        assert_eq!(store.next_version("pinger").await.unwrap(), Some(121));
        assert_eq!(store.rows("pings").await.len(), 108);
    }

    #[tokio::test]
    async fn restart_with_a_lagging_coprocessor_catches_up_then_joins() {
        let store = InMemoryStorage::new();
        let first: Arc<dyn Coprocessor> =
            Arc::new(Pinger::on_table("first", 1, pings_table_named("first_pings")));
        manager(&store, MemoryLedger::new((1..=60).map(ledger_tx).collect(), 16), vec![first.clone()])
            .run(ErrorReporter::channel().0)
            .await
            .unwrap();
        assert_eq!(store.next_version("0_super_processor").await.unwrap(), Some(61));
        assert_eq!(store.rows("first_pings").await.len(), 54);

        // a second coprocessor appears while the ledger has grown
        let second: Arc<dyn Coprocessor> =
            Arc::new(Pinger::on_table("second", 1, pings_table_named("second_pings")));
        let ledger = MemoryLedger::new((1..=100).map(ledger_tx).collect(), 16);
        let m = manager(&store, ledger, vec![first, second]);
        m.run(ErrorReporter::channel().0).await.unwrap();

        assert_eq!(store.next_version("0_super_processor").await.unwrap(), Some(101));
        assert_eq!(store.next_version("first").await.unwrap(), Some(101));
        assert_eq!(store.next_version("second").await.unwrap(), Some(101));

        // every user version exactly once per coprocessor, no gaps
        let expected: Vec<i64> = (1..=100).filter(|v| v % 10 != 0).collect();
        assert_eq!(versions(&store.rows("first_pings").await), expected);
        assert_eq!(versions(&store.rows("second_pings").await), expected);
    }

    #[tokio::test]
    async fn second_concurrent_run_is_refused() {
        let store = InMemoryStorage::new();
        let m = manager(&store, MemoryLedger::new(vec![], 8), vec![]);
        let _guard = m.acquire().unwrap();
        let err = m.run(ErrorReporter::channel().0).await.unwrap_err();
        assert!(matches!(err, IndexerError::AlreadyRunning));
    }

    #[tokio::test]
    async fn supervised_run_succeeds_when_stream_ends() {
        let store = InMemoryStorage::new();
        let pinger: Arc<dyn Coprocessor> = Arc::new(Pinger::new("pinger", 1));
        let m = manager(&store, MemoryLedger::new((1..=30).map(ledger_tx).collect(), 8), vec![pinger]);

        let mut supervisor = Supervisor::new(RetryConfig::immediate(6));
        let exit = supervisor.run(&m).await.unwrap();
        assert_eq!(exit, StreamExit::Ended { next_version: 31 });
        assert_eq!(supervisor.attempts(), 1);
    }
}
