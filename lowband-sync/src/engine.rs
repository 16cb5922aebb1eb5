//! Background sync engine
//!
//! Owns one upload worker and one download worker. Each is an actor loop
//! reacting to connectivity changes, a periodic tick, and messages sent
//! through [`SyncEngineHandle`].

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::download::DownloadPipeline;
use crate::errors::{Result, SyncError};
use crate::upload::UploadPipeline;

const DOWNLOAD_CHANNEL_CAPACITY: usize = 64;
const COALESCED_RETRY_DELAY: Duration = Duration::from_secs(1);
const MIN_UPLOAD_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub upload_interval: Duration,
    pub upload_batch_size: usize,
    pub download_page_size: usize,
    /// Tables pulled when the engine starts
    pub tables: Vec<String>,
    pub download_on_startup: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            upload_interval: Duration::from_secs(60),
            upload_batch_size: 50,
            download_page_size: 100,
            tables: Vec::new(),
            download_on_startup: true,
        }
    }
}

#[derive(Debug)]
enum UploadMessage {
    /// Explicit request, e.g. after the user saved something
    Drain,
}

#[derive(Debug)]
enum DownloadMessage {
    /// Server push: rows of this table changed remotely
    RemoteChanged(String),
}

pub struct SyncEngine;

impl SyncEngine {
    /// Start both workers. `connectivity` carries the current online state.
    /// Upload intervals below 100ms are raised to 100ms.
    pub fn spawn(
        upload: Arc<UploadPipeline>,
        download: Arc<DownloadPipeline>,
        connectivity: watch::Receiver<bool>,
        config: EngineConfig,
    ) -> SyncEngineHandle {
        // Capacity 1: a queued request already covers any later one
        let (upload_tx, upload_rx) = mpsc::channel(1);
        let (download_tx, download_rx) = mpsc::channel(DOWNLOAD_CHANNEL_CAPACITY);
        let shutdown = CancellationToken::new();

        if config.upload_interval < MIN_UPLOAD_INTERVAL {
            warn!(
                requested = ?config.upload_interval,
                "Upload interval too short, using {:?}",
                MIN_UPLOAD_INTERVAL
            );
        }

        let upload_worker = UploadWorker {
            pipeline: upload,
            connectivity: connectivity.clone(),
            receiver: upload_rx,
            interval: config.upload_interval.max(MIN_UPLOAD_INTERVAL),
            batch_size: config.upload_batch_size,
            shutdown: shutdown.clone(),
        };
        let initial = if config.download_on_startup {
            config.tables.clone()
        } else {
            Vec::new()
        };
        let download_worker = DownloadWorker {
            pipeline: download,
            connectivity,
            receiver: download_rx,
            page_size: config.download_page_size,
            pending: initial,
            shutdown: shutdown.clone(),
        };

        info!("Starting sync engine");
        let workers = vec![
            tokio::spawn(upload_worker.run()),
            tokio::spawn(download_worker.run()),
        ];

        SyncEngineHandle {
            upload_tx,
            download_tx,
            shutdown,
            workers,
        }
    }
}

pub struct SyncEngineHandle {
    upload_tx: mpsc::Sender<UploadMessage>,
    download_tx: mpsc::Sender<DownloadMessage>,
    shutdown: CancellationToken,
    workers: Vec<JoinHandle<()>>,
}

impl SyncEngineHandle {
    /// Ask for a drain. Requests made while one is already pending coalesce.
    pub fn request_upload(&self) {
        match self.upload_tx.try_send(UploadMessage::Drain) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Upload worker is not running");
            }
        }
    }

    /// Server-push hook: re-download `table`
    pub async fn notify_remote_change(&self, table: impl Into<String>) -> Result<()> {
        self.download_tx
            .send(DownloadMessage::RemoteChanged(table.into()))
            .await
            .map_err(|_| SyncError::Cancelled("download worker stopped".into()))
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && self.workers.iter().any(|w| !w.is_finished())
    }

    /// Stop both workers and wait for them to exit
    pub async fn shutdown(self) {
        info!("Stopping sync engine");
        self.shutdown.cancel();
        for result in join_all(self.workers).await {
            if let Err(e) = result {
                error!("Sync worker panicked: {}", e);
            }
        }
    }
}

struct UploadWorker {
    pipeline: Arc<UploadPipeline>,
    connectivity: watch::Receiver<bool>,
    receiver: mpsc::Receiver<UploadMessage>,
    interval: Duration,
    batch_size: usize,
    shutdown: CancellationToken,
}

impl UploadWorker {
    async fn run(mut self) {
        let mut online = *self.connectivity.borrow_and_update();
        let mut watching = true;
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let drain = tokio::select! {
                _ = self.shutdown.cancelled() => break,

                changed = self.connectivity.changed(), if watching => match changed {
                    Ok(()) => {
                        let now = *self.connectivity.borrow_and_update();
                        let regained = now && !online;
                        online = now;
                        if regained {
                            info!("Connectivity regained, draining queue");
                        }
                        regained
                    }
                    Err(_) => {
                        debug!("Connectivity source dropped");
                        watching = false;
                        false
                    }
                },

                _ = ticker.tick() => online,

                msg = self.receiver.recv() => match msg {
                    Some(UploadMessage::Drain) => {
                        if !online {
                            debug!("Offline, drain deferred until connectivity returns");
                        }
                        online
                    }
                    None => break,
                },
            };

            if drain {
                tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => break,
                    result = self.pipeline.drain(self.batch_size) => {
                        if let Err(e) = result {
                            error!("Drain failed: {}", e);
                        }
                    }
                }
            }
        }
        debug!("Upload worker stopped");
    }
}

struct DownloadWorker {
    pipeline: Arc<DownloadPipeline>,
    connectivity: watch::Receiver<bool>,
    receiver: mpsc::Receiver<DownloadMessage>,
    page_size: usize,
    /// Tables waiting to be pulled, in request order
    pending: Vec<String>,
    shutdown: CancellationToken,
}

impl DownloadWorker {
    async fn run(mut self) {
        let mut online = *self.connectivity.borrow_and_update();
        let mut watching = true;

        loop {
            if online && !self.pending.is_empty() {
                let tables = std::mem::take(&mut self.pending);
                let report = self
                    .pipeline
                    .sync_tables_with_cancel(&tables, self.page_size, &self.shutdown)
                    .await;
                if self.shutdown.is_cancelled() {
                    break;
                }
                if report.coalesced {
                    // Someone else is pulling; try again shortly
                    self.enqueue(tables);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = sleep(COALESCED_RETRY_DELAY) => continue,
                    }
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => break,

                changed = self.connectivity.changed(), if watching => match changed {
                    Ok(()) => online = *self.connectivity.borrow_and_update(),
                    Err(_) => watching = false,
                },

                msg = self.receiver.recv() => match msg {
                    Some(DownloadMessage::RemoteChanged(table)) => {
                        debug!(table = %table, "Remote change notified");
                        self.enqueue(vec![table]);
                    }
                    None => break,
                },
            }
        }
        debug!("Download worker stopped");
    }

    fn enqueue(&mut self, tables: Vec<String>) {
        for table in tables {
            if !self.pending.contains(&table) {
                self.pending.push(table);
            }
        }
    }
}
