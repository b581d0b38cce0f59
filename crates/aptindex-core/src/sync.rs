//! Sync coordinator — aligns every coprocessor with the super stream.
//!
//! Before the shared stream opens, each coprocessor's checkpoint `C` is
//! compared with the super stream's checkpoint `S`:
//!
//! | Condition                                   | Decision                   |
//! |---------------------------------------------|----------------------------|
//! | `C == S`                                    | admit                      |
//! | genesis before the super stream's genesis   | reject                     |
//! | never checkpointed and genesis `> S`        | admit, wait for genesis    |
//! | `C > S`                                     | reject                     |
//! | `C < S`                                     | catch up to `S`, then admit |
//!
//! Rules are checked top to bottom. Rejected coprocessors are excluded for the
//! rest of the process lifetime; the others move on to the shared stream.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::checkpoint::CheckpointManager;
use crate::coprocessor::Coprocessor;
use crate::error::IndexerError;
use crate::processor::ProcessContext;
use crate::store::Storage;
use crate::stream::StreamProvider;
use crate::supervisor::ErrorReporter;
use crate::worker::run_catch_up;

/// Why a coprocessor may not join the super stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rejection {
    GenesisBeforeSuper { genesis: u64, super_genesis: u64 },
    AheadOfSuper { next_version: u64, super_next: u64 },
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::GenesisBeforeSuper {
                genesis,
                super_genesis,
            } => write!(
                f,
                "genesis {genesis} is earlier than the super stream genesis {super_genesis}"
            ),
            Self::AheadOfSuper {
                next_version,
                super_next,
            } => write!(
                f,
                "INVARIANT: next version {next_version} is ahead of the super stream at {super_next}"
            ),
        }
    }
}

/// Outcome of the admission rules for one coprocessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPlan {
    AlreadySynced,
    AwaitingGenesis,
    CatchUp { from: u64 },
    Reject(Rejection),
}

/// Apply the admission rules.
///
/// `stored` is the coprocessor's persisted checkpoint, `None` if it never
/// committed a batch.
pub fn plan(stored: Option<u64>, genesis: u64, super_next: u64, super_genesis: u64) -> SyncPlan {
    let next_version = stored.unwrap_or(genesis);
    if next_version == super_next {
        return SyncPlan::AlreadySynced;
    }
    if genesis < super_genesis {
        return SyncPlan::Reject(Rejection::GenesisBeforeSuper {
            genesis,
            super_genesis,
        });
    }
    if stored.is_none() && genesis > super_next {
        return SyncPlan::AwaitingGenesis;
    }
    if next_version > super_next {
        return SyncPlan::Reject(Rejection::AheadOfSuper {
            next_version,
            super_next,
        });
    }
    SyncPlan::CatchUp { from: next_version }
}

/// How an admitted coprocessor got in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Admission {
    AlreadySynced,
    AwaitingGenesis,
    CaughtUp { from: u64, to: u64 },
}

/// Result of one sync pass.
#[derive(Default)]
pub struct SyncReport {
    /// Coprocessors allowed on the super stream, in their original order.
    pub admitted: Vec<Arc<dyn Coprocessor>>,
    pub admissions: Vec<(String, Admission)>,
    pub rejections: Vec<(String, Rejection)>,
}

impl SyncReport {
    pub fn admission(&self, name: &str) -> Option<Admission> {
        self.admissions
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| *a)
    }

    pub fn rejection(&self, name: &str) -> Option<Rejection> {
        self.rejections
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, r)| *r)
    }
}

pub struct SyncCoordinator {
    chain_id: u64,
    super_next: u64,
    super_genesis: u64,
    store: Arc<dyn Storage>,
    provider: Arc<dyn StreamProvider>,
}

impl SyncCoordinator {
    pub fn new(
        chain_id: u64,
        super_next: u64,
        super_genesis: u64,
        store: Arc<dyn Storage>,
        provider: Arc<dyn StreamProvider>,
    ) -> Self {
        Self {
            chain_id,
            super_next,
            super_genesis,
            store,
            provider,
        }
    }

    /// Reconcile every coprocessor with the super stream.
    ///
    /// Catch-up runs execute one at a time as spawned tasks; a failing run
    /// reports its error on `reporter` and aborts the whole pass.
    pub async fn sync(
        &self,
        coprocessors: &[Arc<dyn Coprocessor>],
        reporter: &ErrorReporter,
    ) -> Result<SyncReport, IndexerError> {
        let mut report = SyncReport::default();

        for coprocessor in coprocessors {
            let name = coprocessor.name();
            if coprocessor.tables().is_empty() {
                return Err(IndexerError::Config(format!(
                    "coprocessor '{name}' declares no models"
                )));
            }

            let stored = CheckpointManager::new(self.store.clone(), name.clone())
                .load()
                .await?;
            let genesis = coprocessor.genesis_version();

            let admission = match plan(stored, genesis, self.super_next, self.super_genesis) {
                SyncPlan::AlreadySynced => {
                    tracing::info!(consumer = %name, at = self.super_next, "Already synced with super stream");
                    Admission::AlreadySynced
                }
                SyncPlan::AwaitingGenesis => {
                    tracing::info!(
                        consumer = %name,
                        genesis,
                        super_next = self.super_next,
                        "Super stream has not reached genesis yet"
                    );
                    Admission::AwaitingGenesis
                }
                SyncPlan::Reject(rejection) => {
                    tracing::error!(consumer = %name, reason = %rejection, "Coprocessor rejected");
                    report.rejections.push((name, rejection));
                    continue;
                }
                SyncPlan::CatchUp { from } => {
                    self.catch_up(coprocessor.clone(), from, reporter).await?;
                    Admission::CaughtUp {
                        from,
                        to: self.super_next,
                    }
                }
            };

            report.admissions.push((name, admission));
            report.admitted.push(coprocessor.clone());
        }

        tracing::info!(
            admitted = report.admitted.len(),
            rejected = report.rejections.len(),
            "Coprocessors synced; proceeding with single super stream"
        );
        Ok(report)
    }

    async fn catch_up(
        &self,
        coprocessor: Arc<dyn Coprocessor>,
        from: u64,
        reporter: &ErrorReporter,
    ) -> Result<(), IndexerError> {
        let ctx = ProcessContext::catch_up(self.chain_id, self.super_next, coprocessor.genesis_version());
        let store = self.store.clone();
        let provider = self.provider.clone();
        let reporter = reporter.clone();

        let handle = tokio::spawn(async move {
            match run_catch_up(coprocessor.as_ref(), from, ctx, store.as_ref(), provider.as_ref()).await {
                Ok(_) => Ok(()),
                Err(err) => {
                    let reason = format!("catch-up of '{}' failed: {err}", coprocessor.name());
                    reporter.report(err);
                    Err(IndexerError::Aborted { reason })
                }
            }
        });

        handle.await.map_err(|e| IndexerError::Aborted {
            reason: format!("catch-up task did not finish: {e}"),
        })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::CheckpointStore;
    use crate::coprocessor::tests::{ledger_tx, Pinger};
    use crate::handler::HandlerRegistry;
    use crate::memory::InMemoryStorage;
    use crate::store::TableSchema;
    use crate::stream::MemoryLedger;

    #[test]
    fn admission_matrix() {
        // S = 500, super genesis = 100
        assert_eq!(plan(Some(500), 200, 500, 100), SyncPlan::AlreadySynced);
        assert_eq!(plan(Some(300), 200, 500, 100), SyncPlan::CatchUp { from: 300 });
        assert_eq!(plan(None, 600, 500, 100), SyncPlan::AwaitingGenesis);
        assert_eq!(plan(None, 200, 500, 100), SyncPlan::CatchUp { from: 200 });
        assert_eq!(
            plan(None, 50, 500, 100),
            SyncPlan::Reject(Rejection::GenesisBeforeSuper {
                genesis: 50,
                super_genesis: 100
            })
        );
        assert_eq!(
            plan(Some(700), 200, 500, 100),
            SyncPlan::Reject(Rejection::AheadOfSuper {
                next_version: 700,
                super_next: 500
            })
        );
    }

    #[test]
    fn aligned_checkpoint_wins_over_early_genesis() {
        assert_eq!(plan(Some(500), 50, 500, 100), SyncPlan::AlreadySynced);
    }

    #[test]
    fn genesis_equal_to_super_next_needs_no_run() {
        assert_eq!(plan(None, 500, 500, 100), SyncPlan::AlreadySynced);
    }

    async fn seed(store: &InMemoryStorage, name: &str, next_version: u64) {
        let mut txn = store.begin().await.unwrap();
        txn.set_next_version(name, next_version).await.unwrap();
        txn.commit().await.unwrap();
    }

    #[tokio::test]
    async fn sync_pass_over_the_matrix() {
        let store = InMemoryStorage::new();
        let aligned: Arc<dyn Coprocessor> = Arc::new(Pinger::new("aligned", 200));
        let behind: Arc<dyn Coprocessor> = Arc::new(Pinger::new("behind", 200));
        let future: Arc<dyn Coprocessor> = Arc::new(Pinger::new("future", 600));
        let too_old: Arc<dyn Coprocessor> = Arc::new(Pinger::new("too_old", 50));
        let ahead: Arc<dyn Coprocessor> = Arc::new(Pinger::new("ahead", 200));
        store.migrate(&aligned.tables()).await.unwrap();
        seed(&store, "aligned", 500).await;
        seed(&store, "behind", 300).await;
        seed(&store, "ahead", 700).await;

        let ledger = MemoryLedger::new((0..1_000).map(ledger_tx).collect(), 64);
        let coordinator = SyncCoordinator::new(0, 500, 100, Arc::new(store.clone()), Arc::new(ledger));
        let (reporter, mut errors) = ErrorReporter::channel();

        let all = vec![aligned, behind, future, too_old, ahead];
        let report = coordinator.sync(&all, &reporter).await.unwrap();

        assert_eq!(report.admission("aligned"), Some(Admission::AlreadySynced));
        assert_eq!(
            report.admission("behind"),
            Some(Admission::CaughtUp { from: 300, to: 500 })
        );
        assert_eq!(report.admission("future"), Some(Admission::AwaitingGenesis));
        assert!(matches!(
            report.rejection("too_old"),
            Some(Rejection::GenesisBeforeSuper { .. })
        ));
        assert!(matches!(
            report.rejection("ahead"),
            Some(Rejection::AheadOfSuper { .. })
        ));
        let admitted: Vec<String> = report.admitted.iter().map(|c| c.name()).collect();
        assert_eq!(admitted, vec!["aligned", "behind", "future"]);

        // exactly one catch-up run, ending at the ceiling
        assert_eq!(store.next_version("behind").await.unwrap(), Some(500));
        assert!(store.next_version("future").await.unwrap().is_none());
        // 300..=499 minus the twenty block-metadata versions
        assert_eq!(store.rows("pings").await.len(), 180);
        assert!(errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn failed_catch_up_is_reported_and_aborts() {
        let store = InMemoryStorage::new();
        let behind: Arc<dyn Coprocessor> = Arc::new(Pinger::new("behind", 0));
        store.migrate(&behind.tables()).await.unwrap();
        seed(&store, "behind", 10).await;

        // ledger ends before the ceiling
        let ledger = MemoryLedger::new((0..50).map(ledger_tx).collect(), 16);
        let coordinator = SyncCoordinator::new(0, 500, 0, Arc::new(store.clone()), Arc::new(ledger));
        let (reporter, mut errors) = ErrorReporter::channel();

        let Err(err) = coordinator.sync(&[behind], &reporter).await else {
            panic!("catch-up past the ledger end must abort");
        };
        assert!(matches!(err, IndexerError::Aborted { .. }));
        assert!(matches!(errors.try_recv(), Ok(IndexerError::Stream(_))));
    }

    struct Modelless(HandlerRegistry);

    impl Coprocessor for Modelless {
        fn name(&self) -> String {
            "modelless".into()
        }
        fn genesis_version(&self) -> u64 {
            0
        }
        fn tables(&self) -> Vec<TableSchema> {
            vec![]
        }
        fn registry(&self) -> &HandlerRegistry {
            &self.0
        }
    }

    #[tokio::test]
    async fn coprocessor_without_models_is_fatal() {
        let store = InMemoryStorage::new();
        let ledger = MemoryLedger::new(vec![], 16);
        let coordinator = SyncCoordinator::new(0, 0, 0, Arc::new(store), Arc::new(ledger));
        let (reporter, _errors) = ErrorReporter::channel();

        let modelless: Arc<dyn Coprocessor> = Arc::new(Modelless(HandlerRegistry::new()));
        let Err(err) = coordinator.sync(&[modelless], &reporter).await else {
            panic!("coprocessor without models must be rejected");
        };
        assert!(matches!(err, IndexerError::Config(_)));
        assert!(err.is_fatal());
    }
}
