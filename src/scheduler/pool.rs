//! Worker pool for blocking remote calls
//!
//! Jobs run on tokio's blocking pool. A small async task awaits each job and
//! forwards the result as a [`Continuation`] over a crossbeam channel, which
//! the scheduling thread drains on its next tick. A job that panics is
//! reported as a failed job of the same kind, so the working-task count
//! always comes back down.

use crate::engine::RemoteEngine;
use crate::error::{CookError, Result};
use crate::node::NodeKey;
use crate::pipeline::{Continuation, Dispatch, Job};
use crossbeam_channel::Sender;
use std::sync::Arc;
use tokio::runtime::{Builder, Runtime};

pub struct WorkerPool {
    runtime: Runtime,
    engine: Arc<dyn RemoteEngine>,
    results: Sender<Continuation>,
}

impl WorkerPool {
    pub fn new(engine: Arc<dyn RemoteEngine>, threads: usize, results: Sender<Continuation>) -> Result<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(threads.max(1))
            .thread_name("cookbridge-worker")
            .enable_time()
            .build()?;
        tracing::debug!("Worker pool started with {} threads", threads.max(1));
        Ok(Self {
            runtime,
            engine,
            results,
        })
    }
}

impl Dispatch for WorkerPool {
    fn dispatch(&self, node: Option<NodeKey>, epoch: u64, job: Job) {
        let kind = job.kind();
        let engine = Arc::clone(&self.engine);
        let results = self.results.clone();
        tracing::trace!("Dispatching {:?} for {:?}", kind, node);

        let handle = self.runtime.spawn_blocking(move || job.run(engine.as_ref()));
        self.runtime.spawn(async move {
            let output = match handle.await {
                Ok(output) => output,
                Err(e) => {
                    tracing::error!("{:?} job for {:?} did not finish: {}", kind, node, e);
                    kind.failed(CookError::Worker(e.to_string()))
                }
            };
            if results.send(Continuation { node, epoch, output }).is_err() {
                tracing::debug!("Scheduler gone, dropping {:?} result", kind);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::HostSender;
    use crate::config::EngineSettings;
    use crate::engine::MockEngine;
    use crate::pipeline::JobOutput;
    use crate::session::{ConnectOptions, StartMode};
    use crossbeam_channel::bounded;
    use std::time::Duration;

    #[test]
    fn test_dispatch_delivers_continuation() {
        let engine: Arc<dyn RemoteEngine> = Arc::new(MockEngine::new());
        let (tx, rx) = bounded(4);
        let pool = WorkerPool::new(engine, 1, tx).unwrap();

        let (host_tx, _host_rx) = bounded(16);
        let job = Job::StartSession {
            mode: StartMode::Launch,
            options: ConnectOptions::from_settings(&EngineSettings::default()),
            host: HostSender::new(host_tx),
        };
        pool.dispatch(None, 7, job);

        let cont = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(cont.epoch, 7);
        assert!(cont.node.is_none());
        assert!(matches!(cont.output, JobOutput::Session { result: Ok(_), .. }));
    }
}
