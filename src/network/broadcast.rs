//! Broadcast bookkeeping
//!
//! One `BroadcastItem` exists per announced hash. Every caller that
//! broadcasts the same hash attaches a job to the same item, so they share
//! one timeout and one ack/reject outcome.

use crate::core::{Block, Transaction};
use crate::crypto::Hash256;
use crate::network::pool::PoolError;
use crate::wire::types::InvItem;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Delay between a peer requesting the item and callers being told
pub const ACK_DELAY: Duration = Duration::from_secs(1);

/// Terminal outcome of a broadcast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BroadcastOutcome {
    /// A peer requested the data
    Acked,
    /// A peer rejected it
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastData {
    Block(Block),
    Tx(Transaction),
}

impl BroadcastData {
    pub fn hash(&self) -> Hash256 {
        match self {
            BroadcastData::Block(block) => block.hash(),
            BroadcastData::Tx(tx) => tx.txid(),
        }
    }

    pub fn inv(&self) -> InvItem {
        match self {
            BroadcastData::Block(block) => InvItem::block(block.hash()),
            BroadcastData::Tx(tx) => InvItem::tx(tx.txid()),
        }
    }

    pub fn is_block(&self) -> bool {
        matches!(self, BroadcastData::Block(_))
    }
}

impl From<Block> for BroadcastData {
    fn from(block: Block) -> Self {
        BroadcastData::Block(block)
    }
}

impl From<Transaction> for BroadcastData {
    fn from(tx: Transaction) -> Self {
        BroadcastData::Tx(tx)
    }
}

type Job = oneshot::Sender<Result<BroadcastOutcome, PoolError>>;

/// Pending result of `Pool::broadcast`
#[derive(Debug)]
pub struct BroadcastHandle {
    rx: oneshot::Receiver<Result<BroadcastOutcome, PoolError>>,
}

impl BroadcastHandle {
    pub async fn wait(self) -> Result<BroadcastOutcome, PoolError> {
        self.rx.await.unwrap_or(Err(PoolError::Closed))
    }
}

#[derive(Debug)]
pub struct BroadcastItem {
    pub data: BroadcastData,
    jobs: Vec<Job>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every refresh; a timer only fires for its own generation
    generation: u64,
}

impl BroadcastItem {
    pub fn new(data: BroadcastData) -> Self {
        Self {
            data,
            jobs: Vec::new(),
            timer: None,
            generation: 0,
        }
    }

    pub fn hash(&self) -> Hash256 {
        self.data.hash()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn add_job(&mut self) -> BroadcastHandle {
        let (tx, rx) = oneshot::channel();
        self.jobs.push(tx);
        BroadcastHandle { rx }
    }

    /// Replace the timeout task, returning the new generation
    pub fn refresh(&mut self, spawn: impl FnOnce(u64) -> JoinHandle<()>) -> u64 {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
        self.generation += 1;
        self.timer = Some(spawn(self.generation));
        self.generation
    }

    /// Hand the current jobs to the caller (used for the delayed ack)
    pub fn take_jobs(&mut self) -> Vec<Job> {
        std::mem::take(&mut self.jobs)
    }

    pub fn resolve(&mut self, outcome: BroadcastOutcome) {
        resolve_jobs(self.take_jobs(), outcome);
    }

    pub fn reject(&mut self, err: impl Fn() -> PoolError) {
        for job in self.take_jobs() {
            let _ = job.send(Err(err()));
        }
    }
}

impl Drop for BroadcastItem {
    fn drop(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

pub fn resolve_jobs(jobs: Vec<Job>, outcome: BroadcastOutcome) {
    for job in jobs {
        let _ = job.send(Ok(outcome));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::transaction::tests::spend;

    #[tokio::test]
    async fn test_jobs_share_outcome() {
        let tx = spend(Hash256::new([1; 32]), 0, false);
        let mut item = BroadcastItem::new(tx.clone().into());
        assert_eq!(item.hash(), tx.txid());

        let a = item.add_job();
        let b = item.add_job();
        assert_eq!(item.job_count(), 2);

        item.resolve(BroadcastOutcome::Rejected);
        assert_eq!(a.wait().await.unwrap(), BroadcastOutcome::Rejected);
        assert_eq!(b.wait().await.unwrap(), BroadcastOutcome::Rejected);
        assert_eq!(item.job_count(), 0);
    }

    #[tokio::test]
    async fn test_refresh_replaces_timer() {
        let tx = spend(Hash256::new([2; 32]), 0, false);
        let mut item = BroadcastItem::new(tx.into());

        let first = item.refresh(|_| tokio::spawn(std::future::pending()));
        let second = item.refresh(|_| tokio::spawn(std::future::pending()));
        assert_eq!((first, second), (1, 2));

        let job = item.add_job();
        item.reject(|| PoolError::Timeout);
        assert!(matches!(job.wait().await, Err(PoolError::Timeout)));
    }

    #[tokio::test]
    async fn test_dropped_item_closes_jobs() {
        let tx = spend(Hash256::new([3; 32]), 0, false);
        let mut item = BroadcastItem::new(tx.into());
        let job = item.add_job();
        drop(item);
        assert!(matches!(job.wait().await, Err(PoolError::Closed)));
    }
}
