#![forbid(unsafe_code)]

// Fixed pool of mediasoup workers, one WebRtcServer per worker

use super::config::MediaConfig;
use super::types::{SessionError, SessionResult};
use anyhow::{Context, Result};
use mediasoup::prelude::*;
use mediasoup::worker::WorkerId;
use mediasoup::worker_manager::WorkerManager;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use tokio::sync::watch;
use tracing::{debug, error, info};

struct PoolWorker {
    worker: Worker,
    webrtc_server: WebRtcServer,
}

/// Worker selected for a new room's router
#[derive(Debug)]
pub struct WorkerLease {
    pub worker: Worker,
    pub worker_id: WorkerId,
    pub webrtc_server: WebRtcServer,
}

/// Pool of media workers created at startup.
///
/// Worker death is unrecoverable: the pool flags itself dead, stops handing
/// out workers, and signals the fatal watch channel so the process can stop
/// admitting sessions and exit. An external supervisor restarts us.
pub struct WorkerPool {
    workers: Vec<PoolWorker>,
    router_counts: StdRwLock<HashMap<WorkerId, usize>>,
    next: AtomicUsize,
    dead: Arc<AtomicBool>,
    fatal: Arc<watch::Sender<bool>>,
    // Owns the channel to the worker subprocesses; must outlive the workers
    _manager: WorkerManager,
}

impl WorkerPool {
    pub async fn new(config: &MediaConfig) -> Result<Self> {
        let manager = WorkerManager::new();
        let dead = Arc::new(AtomicBool::new(false));
        let (fatal_tx, _fatal_rx) = watch::channel(false);
        let fatal = Arc::new(fatal_tx);

        let num_workers = config.worker.num_workers.max(1);
        info!("Starting {} media workers", num_workers);

        let mut workers = Vec::with_capacity(num_workers);
        let mut router_counts = HashMap::new();

        for i in 0..num_workers {
            let worker = manager
                .create_worker(config.worker.to_worker_settings())
                .await
                .context("failed to create media worker")?;
            let worker_id = worker.id();

            worker
                .on_dead({
                    let dead = dead.clone();
                    let fatal = fatal.clone();
                    move |reason| {
                        error!("Media worker {} died: {:?}", worker_id, reason);
                        dead.store(true, Ordering::SeqCst);
                        let _ = fatal.send(true);
                    }
                })
                .detach();

            let port = config.transport.server_port_base + i as u16;
            let webrtc_server = worker
                .create_webrtc_server(WebRtcServerOptions::new(WebRtcServerListenInfos::new(
                    config.transport.listen_info(port),
                )))
                .await
                .with_context(|| format!("failed to create WebRTC server on port {port}"))?;

            info!("Media worker {} ready, WebRTC server on UDP {}", worker_id, port);
            router_counts.insert(worker_id, 0);
            workers.push(PoolWorker {
                worker,
                webrtc_server,
            });
        }

        Ok(Self {
            workers,
            router_counts: StdRwLock::new(router_counts),
            next: AtomicUsize::new(0),
            dead,
            fatal,
            _manager: manager,
        })
    }

    /// Picks a worker for a new router, round-robin across the pool.
    pub fn acquire(&self) -> SessionResult<WorkerLease> {
        if self.dead.load(Ordering::SeqCst) {
            // The fatal watch channel is what tears the process down; a
            // request racing the shutdown just sees backpressure.
            return Err(SessionError::ServerBusy);
        }
        if self.workers.is_empty() {
            return Err(SessionError::ServerBusy);
        }

        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        let pool_worker = &self.workers[idx];
        let worker_id = pool_worker.worker.id();

        {
            let mut counts = self
                .router_counts
                .write()
                .unwrap_or_else(|e| e.into_inner());
            *counts.entry(worker_id).or_insert(0) += 1;
        }

        Ok(WorkerLease {
            worker: pool_worker.worker.clone(),
            worker_id,
            webrtc_server: pool_worker.webrtc_server.clone(),
        })
    }

    /// Records that a router hosted on the given worker was closed.
    pub fn note_router_closed(&self, worker_id: WorkerId) {
        let mut counts = self
            .router_counts
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(count) = counts.get_mut(&worker_id) {
            *count = count.saturating_sub(1);
            debug!("Worker {} now hosts {} routers", worker_id, count);
        }
    }

    /// Routers currently hosted on the given worker.
    pub fn router_count(&self, worker_id: WorkerId) -> usize {
        let counts = self.router_counts.read().unwrap_or_else(|e| e.into_inner());
        counts.get(&worker_id).copied().unwrap_or(0)
    }

    /// Routers currently hosted across the whole pool.
    pub fn total_router_count(&self) -> usize {
        let counts = self.router_counts.read().unwrap_or_else(|e| e.into_inner());
        counts.values().sum()
    }

    /// Receiver that flips to true when any worker dies.
    pub fn subscribe_fatal(&self) -> watch::Receiver<bool> {
        self.fatal.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }
}
