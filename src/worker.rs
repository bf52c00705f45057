//! Worker pool (spec.md §5 "Scheduling"): a fixed set of single-threaded
//! runtimes, each owning its own DNS resolver. A connection is pinned to
//! one worker at accept time and every task for that interception (parent
//! and all of its mirror children) is spawned on that worker's runtime —
//! there is no cross-worker migration, mirroring the original's
//! one-event-base-per-worker model.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::{Resolver, TokioResolver};
use tokio::runtime::{Builder, Handle};
use tokio::task::JoinHandle;

struct Worker {
    handle: Handle,
    resolver: TokioResolver,
    load: AtomicUsize,
}

/// A single worker, joined against its dedicated runtime thread.
pub struct WorkerHandle {
    worker: Arc<Worker>,
    index: usize,
}

impl WorkerHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn resolver(&self) -> &TokioResolver {
        &self.worker.resolver
    }

    /// Spawn `fut` on this worker's runtime; the returned guard decrements
    /// the load counter when the task completes, regardless of outcome.
    pub fn spawn<F>(&self, fut: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.worker.load.fetch_add(1, Ordering::Relaxed);
        let worker = self.worker.clone();
        self.worker.handle.spawn(async move {
            fut.await;
            worker.load.fetch_sub(1, Ordering::Relaxed);
        })
    }

    fn load(&self) -> usize {
        self.worker.load.load(Ordering::Relaxed)
    }
}

/// A fixed-size pool of workers, each with its own runtime and resolver.
pub struct WorkerPool {
    workers: Vec<WorkerHandle>,
}

impl WorkerPool {
    /// Spawn `count` workers, each on its own OS thread running a
    /// single-threaded tokio runtime.
    pub fn new(count: usize) -> anyhow::Result<Self> {
        anyhow::ensure!(count > 0, "worker pool must have at least one worker");

        let workers = (0..count)
            .map(|index| -> anyhow::Result<WorkerHandle> {
                let runtime = Builder::new_current_thread()
                    .enable_all()
                    .thread_name(format!("mitmrelay-worker-{index}"))
                    .build()?;

                // `enter()` gives the builder access to a Tokio runtime
                // handle for the connection provider it builds internally,
                // even though construction itself is synchronous in this
                // hickory-resolver version.
                let _guard = runtime.enter();
                let resolver: TokioResolver =
                    Resolver::builder_with_config(ResolverConfig::default(), TokioConnectionProvider::default())
                        .with_options(ResolverOpts::default())
                        .build();
                drop(_guard);

                let handle = runtime.handle().clone();

                // The runtime must be driven by some thread for `handle.spawn`
                // to ever run a task; this thread blocks forever on it rather
                // than returning it to the pool, since each worker owns its
                // runtime for the life of the process.
                std::thread::Builder::new()
                    .name(format!("mitmrelay-worker-{index}-drive"))
                    .spawn(move || {
                        runtime.block_on(std::future::pending::<()>());
                    })?;

                Ok(WorkerHandle {
                    worker: Arc::new(Worker {
                        handle,
                        resolver,
                        load: AtomicUsize::new(0),
                    }),
                    index,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(Self { workers })
    }

    /// Pick the least-loaded worker at the moment of a new accept (spec.md
    /// §5 "least-loaded-on-create").
    pub fn least_loaded(&self) -> &WorkerHandle {
        self.workers
            .iter()
            .min_by_key(|w| w.load())
            .expect("worker pool is never empty")
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn test_least_loaded_picks_idle_worker() {
        let pool = WorkerPool::new(2).unwrap();
        let counter = Arc::new(AtomicU32::new(0));

        let busy = pool.least_loaded();
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        let c = counter.clone();
        busy.spawn(async move {
            c.fetch_add(1, Ordering::SeqCst);
            let _ = rx.recv();
        });
        std::thread::sleep(std::time::Duration::from_millis(50));

        let idle = pool.least_loaded();
        assert_ne!(idle.index(), busy.index());
        drop(tx);
    }
}
