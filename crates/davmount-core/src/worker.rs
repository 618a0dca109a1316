//! Background maintenance: heal the caches once a day.
//!
//! The first pass runs immediately at startup so orphans left by a crash
//! are cleaned before the filesystem sees real traffic. The sleep is a
//! channel wait, so shutdown interrupts it promptly.

use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::errors::DavResult;
use crate::store::file_cache::FileCache;
use crate::store::stat_cache::StatCache;
use std::sync::Arc;

pub struct MaintenanceWorker {
    shutdown: Sender<()>,
    thread: JoinHandle<()>,
}

pub fn spawn(
    file_cache: Arc<FileCache>,
    stat_cache: Arc<StatCache>,
    interval: Duration,
) -> DavResult<MaintenanceWorker> {
    let (shutdown, wakeup) = mpsc::channel::<()>();
    let thread = std::thread::Builder::new()
        .name("davmount-maintenance".into())
        .spawn(move || {
            let mut first = true;
            loop {
                if let Err(err) = file_cache.cleanup(first) {
                    tracing::warn!("file cache cleanup failed: {err}");
                }
                if let Err(err) = stat_cache.prune() {
                    tracing::warn!("stat cache prune failed: {err}");
                }
                first = false;

                match wakeup.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    _ => {
                        tracing::debug!("maintenance worker exiting");
                        return;
                    }
                }
            }
        })?;
    Ok(MaintenanceWorker { shutdown, thread })
}

impl MaintenanceWorker {
    /// Interrupts the sleep and joins the thread.
    pub fn shutdown(self) {
        let _ = self.shutdown.send(());
        let _ = self.thread.join();
    }
}
