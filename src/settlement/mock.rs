//! Scripted adapter for tests and dry runs.

use super::{PollOutcome, SettlementAdapter, SettlementError, SubmitOutcome};
use crate::domain::{Rail, Withdrawal};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Adapter that replays queued outcomes.
///
/// When a queue runs dry, `submit` answers `AcceptedAsync` without a
/// reference and `poll` answers `Pending`.
#[derive(Debug)]
pub struct MockAdapter {
    rail: Rail,
    submits: Mutex<VecDeque<Result<SubmitOutcome, SettlementError>>>,
    polls: Mutex<VecDeque<Result<PollOutcome, SettlementError>>>,
    submit_delay: Option<Duration>,
    submit_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl MockAdapter {
    pub fn new(rail: Rail) -> Self {
        Self {
            rail,
            submits: Mutex::new(VecDeque::new()),
            polls: Mutex::new(VecDeque::new()),
            submit_delay: None,
            submit_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_submit(self, outcome: SubmitOutcome) -> Self {
        self.push_submit(Ok(outcome));
        self
    }

    pub fn with_submit_error(self, error: SettlementError) -> Self {
        self.push_submit(Err(error));
        self
    }

    pub fn with_poll(self, outcome: PollOutcome) -> Self {
        self.push_poll(Ok(outcome));
        self
    }

    pub fn with_poll_error(self, error: SettlementError) -> Self {
        self.push_poll(Err(error));
        self
    }

    /// Sleep this long inside every `submit`.
    pub fn with_submit_delay(mut self, delay: Duration) -> Self {
        self.submit_delay = Some(delay);
        self
    }

    pub fn push_submit(&self, outcome: Result<SubmitOutcome, SettlementError>) {
        lock(&self.submits).push_back(outcome);
    }

    pub fn push_poll(&self, outcome: Result<PollOutcome, SettlementError>) {
        lock(&self.polls).push_back(outcome);
    }

    pub fn submit_calls(&self) -> usize {
        self.submit_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[async_trait]
impl SettlementAdapter for MockAdapter {
    fn rail(&self) -> Rail {
        self.rail
    }

    async fn submit(&self, _withdrawal: &Withdrawal) -> Result<SubmitOutcome, SettlementError> {
        self.submit_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.submit_delay {
            tokio::time::sleep(delay).await;
        }
        let next = lock(&self.submits).pop_front();
        next.unwrap_or(Ok(SubmitOutcome::AcceptedAsync { external_ref: None }))
    }

    async fn poll(&self, _withdrawal: &Withdrawal) -> Result<PollOutcome, SettlementError> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        let next = lock(&self.polls).pop_front();
        next.unwrap_or(Ok(PollOutcome::Pending))
    }
}
