//! Optional background thread that reclaims wrappers as they are queued.
//!
//! Without it, queued wrappers are only released by opportunistic drains
//! (registration, allocation retries, explicit collects). Workloads that
//! cache proxies and rarely register new ones would otherwise hold native
//! memory indefinitely.

use crate::queue::ReclamationQueue;
use crossbeam_channel::{select, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tether_core::{BridgeError, Result};
use tracing::{debug, info, warn};

const THREAD_NAME: &str = "tether-collector";

struct Worker {
    stop: Sender<()>,
    join: JoinHandle<()>,
}

pub struct BackgroundCollector {
    queue: Arc<ReclamationQueue>,
    worker: Mutex<Option<Worker>>,
    running: Arc<AtomicBool>,
}

impl BackgroundCollector {
    pub fn new(queue: Arc<ReclamationQueue>) -> Self {
        Self {
            queue,
            worker: Mutex::new(None),
            running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Spawn the worker. Starting a running collector is an error.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.running.load(Ordering::SeqCst) {
            return Err(BridgeError::CollectorRunning);
        }
        // A worker that exited on its own still needs joining.
        if let Some(stale) = worker.take() {
            let _ = stale.join.join();
        }

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        let queue = Arc::clone(&self.queue);
        let receiver = queue.receiver();
        let running = Arc::clone(&self.running);

        self.running.store(true, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(THREAD_NAME.into())
            .spawn(move || {
                let mut reclaimed = 0u64;
                loop {
                    select! {
                        recv(receiver) -> msg => match msg {
                            Ok(wrapper) => {
                                if queue.reclaim(&wrapper) {
                                    reclaimed += 1;
                                }
                            }
                            Err(_) => break,
                        },
                        recv(stop_rx) -> _ => break,
                    }
                }
                if running.swap(false, Ordering::SeqCst) {
                    debug!("Collector exiting after {} reclamations", reclaimed);
                }
            });

        match spawned {
            Ok(join) => {
                *worker = Some(Worker {
                    stop: stop_tx,
                    join,
                });
                info!("Background collector started");
                Ok(())
            }
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                Err(e.into())
            }
        }
    }

    /// Signal the worker and wait for it. Returns false if none was running.
    pub fn stop(&self) -> bool {
        let Some(worker) = self.worker.lock().take() else {
            return false;
        };
        // Dropping the sender also wakes the worker.
        let _ = worker.stop.try_send(());
        drop(worker.stop);
        if worker.join.join().is_err() {
            warn!("Background collector panicked");
            self.running.store(false, Ordering::SeqCst);
        }
        info!("Background collector stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Drop for BackgroundCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

impl std::fmt::Debug for BackgroundCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundCollector")
            .field("running", &self.is_running())
            .finish()
    }
}
