//! Worker pool abstraction (REDESIGN FLAG #3).
//!
//! The original builds a shell command line per shard and hands the whole
//! batch to GNU `parallel`. Here, every execution backend implements one
//! trait; [`LocalWorkerPool`] runs shards as in-process async tasks,
//! [`crate::campaign::cluster::ClusterWorkerPool`] runs the same unit of
//! work over SSH. Neither ever constructs a shell pipeline.

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::Result;

/// One shard's unit of work: run it to completion (or a recoverable
/// failure) and report how many experiments it ended up with on disk.
#[async_trait]
pub trait ShardUnit: Send + 'static {
    async fn run(self: Box<Self>) -> Result<ShardOutcome>;
}

#[derive(Debug, Clone)]
pub struct ShardOutcome {
    pub shard_id: u32,
    pub records_written: u64,
}

#[async_trait]
pub trait WorkerPool: Send + Sync {
    async fn run_all(&self, units: Vec<Box<dyn ShardUnit>>) -> Vec<Result<ShardOutcome>>;
}

/// Runs shards as in-process async tasks, oversubscribed to 200% of
/// available CPU cores (spec.md §4.4 "Local"): debugger-protocol round
/// trips spend most of their time waiting on the child, so running more
/// shards than cores keeps cores busy.
pub struct LocalWorkerPool {
    concurrency: usize,
}

impl LocalWorkerPool {
    pub fn new() -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            concurrency: (cores * 2).max(1),
        }
    }

    pub fn with_concurrency(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
        }
    }
}

impl Default for LocalWorkerPool {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WorkerPool for LocalWorkerPool {
    async fn run_all(&self, units: Vec<Box<dyn ShardUnit>>) -> Vec<Result<ShardOutcome>> {
        let semaphore = std::sync::Arc::new(Semaphore::new(self.concurrency));
        let mut set = JoinSet::new();

        for (index, unit) in units.into_iter().enumerate() {
            let permit = semaphore.clone();
            set.spawn(async move {
                let _permit = permit
                    .acquire_owned()
                    .await
                    .expect("semaphore is never closed");
                (index, unit.run().await)
            });
        }

        let mut results: Vec<Option<Result<ShardOutcome>>> = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if results.len() <= index {
                        results.resize_with(index + 1, || None);
                    }
                    results[index] = Some(result);
                }
                Err(e) => {
                    tracing::error!("shard task panicked: {e}");
                }
            }
        }
        results.into_iter().flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeShard {
        shard_id: u32,
        records: u64,
    }

    #[async_trait]
    impl ShardUnit for FakeShard {
        async fn run(self: Box<Self>) -> Result<ShardOutcome> {
            Ok(ShardOutcome {
                shard_id: self.shard_id,
                records_written: self.records,
            })
        }
    }

    #[tokio::test]
    async fn runs_every_unit_and_reports_its_outcome() {
        let pool = LocalWorkerPool::with_concurrency(2);
        let units: Vec<Box<dyn ShardUnit>> = vec![
            Box::new(FakeShard { shard_id: 0, records: 10 }),
            Box::new(FakeShard { shard_id: 1, records: 20 }),
            Box::new(FakeShard { shard_id: 2, records: 30 }),
        ];
        let results = pool.run_all(units).await;
        assert_eq!(results.len(), 3);
        let total: u64 = results
            .iter()
            .map(|r| r.as_ref().unwrap().records_written)
            .sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn concurrency_defaults_to_double_core_count() {
        let pool = LocalWorkerPool::new();
        assert!(pool.concurrency >= 2);
    }
}
