//! Supervisor — restarts the whole pipeline on transient failure.
//!
//! ```text
//! STARTING → RUNNING → (SUCCEEDED | FAILED) → [RETRYING → STARTING]* → TERMINATED
//! ```
//!
//! While RUNNING, the pipeline future races an error listener fed by
//! [`ErrorReporter`]s handed to background tasks; whichever settles first
//! decides the attempt. Fatal errors terminate at once, transient ones are
//! retried with backoff until the attempt ceiling is reached.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::IndexerError;
use crate::retry::{RetryConfig, RetryPolicy};
use crate::super_processor::StreamExit;

/// Lifecycle of a supervised pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SupervisorState {
    Starting,
    Running,
    Succeeded,
    Failed,
    Retrying,
    Terminated,
}

impl std::fmt::Display for SupervisorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Retrying => write!(f, "retrying"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Sending half of an attempt's error channel.
///
/// Background tasks spawned by the pipeline report failures here so the
/// supervisor sees them even if the pipeline future is still pending.
#[derive(Debug, Clone)]
pub struct ErrorReporter {
    tx: mpsc::UnboundedSender<IndexerError>,
}

impl ErrorReporter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<IndexerError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn report(&self, err: IndexerError) {
        // receiver gone means the attempt is already over
        if self.tx.send(err).is_err() {
            tracing::debug!("error reported after attempt ended");
        }
    }
}

/// One full run of the indexing pipeline.
#[async_trait]
pub trait Pipeline: Send + Sync {
    async fn run(&self, reporter: ErrorReporter) -> Result<StreamExit, IndexerError>;
}

pub struct Supervisor {
    policy: RetryPolicy,
    state: SupervisorState,
    attempts: u32,
}

impl Supervisor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            policy: RetryPolicy::new(config),
            state: SupervisorState::Starting,
            attempts: 0,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    /// Attempts started so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn transition(&mut self, next: SupervisorState) {
        tracing::debug!(from = %self.state, to = %next, attempt = self.attempts, "supervisor transition");
        self.state = next;
    }

    /// Run `pipeline` until it succeeds, fails fatally or exhausts its attempts.
    pub async fn run<P: Pipeline + ?Sized>(
        &mut self,
        pipeline: &P,
    ) -> Result<StreamExit, IndexerError> {
        self.attempts = 0;
        loop {
            self.transition(SupervisorState::Starting);
            self.attempts += 1;
            let (reporter, mut errors) = ErrorReporter::channel();

            self.transition(SupervisorState::Running);
            let outcome = tokio::select! {
                biased;
                Some(err) = errors.recv() => Err(err),
                res = pipeline.run(reporter) => res,
            };

            let err = match outcome {
                Ok(exit) => {
                    self.transition(SupervisorState::Succeeded);
                    tracing::info!(attempt = self.attempts, ?exit, "Pipeline finished");
                    self.transition(SupervisorState::Terminated);
                    return Ok(exit);
                }
                Err(err) => err,
            };

            self.transition(SupervisorState::Failed);
            if err.is_fatal() {
                tracing::error!(attempt = self.attempts, error = %err, "Fatal pipeline error");
                self.transition(SupervisorState::Terminated);
                return Err(err);
            }

            let Some(delay) = self.policy.next_delay(self.attempts) else {
                tracing::error!(attempts = self.attempts, error = %err, "Retry ceiling reached");
                self.transition(SupervisorState::Terminated);
                return Err(IndexerError::RetriesExhausted {
                    attempts: self.attempts,
                    last: err.to_string(),
                });
            };

            tracing::warn!(
                attempt = self.attempts,
                max_attempts = self.policy.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Pipeline failed, retrying"
            );
            self.transition(SupervisorState::Retrying);
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a transient error for the first `failures` runs.
    struct Flaky {
        failures: u32,
        runs: AtomicU32,
    }

    impl Flaky {
        fn new(failures: u32) -> Self {
            Self {
                failures,
                runs: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Pipeline for Flaky {
        async fn run(&self, _reporter: ErrorReporter) -> Result<StreamExit, IndexerError> {
            let run = self.runs.fetch_add(1, Ordering::SeqCst) + 1;
            if run <= self.failures {
                return Err(IndexerError::Storage(format!("connection reset #{run}")));
            }
            Ok(StreamExit::Ended { next_version: 42 })
        }
    }

    #[tokio::test]
    async fn six_failures_exhaust_retries() {
        let pipeline = Flaky::new(6);
        let mut supervisor = Supervisor::new(RetryConfig::immediate(6));
        let err = supervisor.run(&pipeline).await.unwrap_err();

        assert!(matches!(err, IndexerError::RetriesExhausted { attempts: 6, .. }));
        assert!(err.is_fatal());
        assert_eq!(pipeline.runs.load(Ordering::SeqCst), 6);
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }

    #[tokio::test]
    async fn five_failures_then_success() {
        let pipeline = Flaky::new(5);
        let mut supervisor = Supervisor::new(RetryConfig::immediate(6));
        let exit = supervisor.run(&pipeline).await.unwrap();

        assert_eq!(exit, StreamExit::Ended { next_version: 42 });
        assert_eq!(supervisor.attempts(), 6);
        assert_eq!(supervisor.state(), SupervisorState::Terminated);
    }

    struct Fatal(AtomicU32);

    #[async_trait]
    impl Pipeline for Fatal {
        async fn run(&self, _reporter: ErrorReporter) -> Result<StreamExit, IndexerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Err(IndexerError::Config("unsupported chain id 7".into()))
        }
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let pipeline = Fatal(AtomicU32::new(0));
        let mut supervisor = Supervisor::new(RetryConfig::immediate(6));
        let err = supervisor.run(&pipeline).await.unwrap_err();

        assert!(matches!(err, IndexerError::Config(_)));
        assert_eq!(pipeline.0.load(Ordering::SeqCst), 1);
    }

    /// Reports a fatal error from "background work" and never finishes.
    struct ReportsThenHangs;

    #[async_trait]
    impl Pipeline for ReportsThenHangs {
        async fn run(&self, reporter: ErrorReporter) -> Result<StreamExit, IndexerError> {
            let background = reporter.clone();
            tokio::spawn(async move {
                background.report(IndexerError::Invariant("checkpoint ahead of super".into()));
            });
            std::future::pending::<()>().await;
            Ok(StreamExit::Ended { next_version: 0 })
        }
    }

    #[tokio::test]
    async fn reported_error_wins_the_race() {
        let mut supervisor = Supervisor::new(RetryConfig::immediate(6));
        let err = supervisor.run(&ReportsThenHangs).await.unwrap_err();
        assert!(matches!(err, IndexerError::Invariant(_)));
        assert_eq!(supervisor.attempts(), 1);
    }
}
