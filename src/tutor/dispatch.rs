//! Dispatcher: reads the channel's message stream and fans messages out to
//! one worker task per session key.
//!
//! A worker handles its messages one at a time, so a channel's session is
//! never read and written by two messages at once. Different channels run
//! concurrently.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channels::{IncomingMessage, MessageStream};

use super::engine::TutorEngine;

/// A worker with no messages for this long exits.
const WORKER_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// How long in-flight work may continue after shutdown starts.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

struct Worker {
    tx: mpsc::UnboundedSender<IncomingMessage>,
    handle: JoinHandle<()>,
}

/// Routes inbound messages to per-key workers.
pub struct Dispatcher {
    engine: Arc<TutorEngine>,
    workers: HashMap<String, Worker>,
    idle_timeout: Duration,
}

impl Dispatcher {
    pub fn new(engine: Arc<TutorEngine>) -> Self {
        Self {
            engine,
            workers: HashMap::new(),
            idle_timeout: WORKER_IDLE_TIMEOUT,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Consume `stream` until it ends or Ctrl+C, then let workers finish.
    pub async fn run(mut self, mut stream: MessageStream) {
        info!(
            watch = %self.engine.config().watch_channel_id,
            output = %self.engine.config().output_channel_id,
            "Tutor ready and listening"
        );

        loop {
            let message = tokio::select! {
                biased;
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received, shutting down...");
                    break;
                }
                msg = stream.next() => match msg {
                    Some(m) => m,
                    None => {
                        info!("Channel stream ended, shutting down...");
                        break;
                    }
                },
            };
            self.dispatch(message);
        }

        self.shutdown().await;
    }

    /// Queue `msg` on its key's worker, starting one if needed.
    pub fn dispatch(&mut self, msg: IncomingMessage) {
        self.prune_finished();
        let key = self.engine.session_key(&msg);

        let msg = match self.workers.get(&key) {
            Some(worker) => match worker.tx.send(msg) {
                Ok(()) => return,
                // Worker went idle and closed its queue.
                Err(mpsc::error::SendError(msg)) => msg,
            },
            None => msg,
        };

        let previous = self.workers.remove(&key).map(|w| w.handle);
        let worker = self.spawn_worker(key.clone(), previous);
        // The queue was just created, so this cannot fail.
        let _ = worker.tx.send(msg);
        self.workers.insert(key, worker);
    }

    /// Number of live worker entries.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Drop entries for workers that idled out and finished draining.
    fn prune_finished(&mut self) {
        let before = self.workers.len();
        self.workers.retain(|_, worker| !worker.handle.is_finished());
        let pruned = before - self.workers.len();
        if pruned > 0 {
            debug!(pruned, remaining = self.workers.len(), "Pruned idle workers");
        }
    }

    fn spawn_worker(&self, key: String, previous: Option<JoinHandle<()>>) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<IncomingMessage>();
        let engine = Arc::clone(&self.engine);
        let idle_timeout = self.idle_timeout;

        let handle = tokio::spawn(async move {
            // The previous worker for this key may still be draining.
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            debug!(key = %key, "Worker started");

            loop {
                match tokio::time::timeout(idle_timeout, rx.recv()).await {
                    Ok(Some(msg)) => {
                        engine.handle_message(&msg).await;
                    }
                    Ok(None) => break,
                    Err(_) => {
                        rx.close();
                        while let Some(msg) = rx.recv().await {
                            engine.handle_message(&msg).await;
                        }
                        break;
                    }
                }
            }
            debug!(key = %key, "Worker stopped");
        });

        Worker { tx, handle }
    }

    /// Close every queue and wait briefly for in-flight messages.
    pub async fn shutdown(self) {
        let handles: Vec<JoinHandle<()>> = self
            .workers
            .into_values()
            .map(|worker| worker.handle)
            .collect();
        if handles.is_empty() {
            return;
        }

        info!(workers = handles.len(), "Waiting for in-flight messages");
        let abort_handles: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures::future::join_all(handles))
            .await
            .is_err()
        {
            warn!("Shutdown grace period elapsed, abandoning in-flight messages");
            for handle in abort_handles {
                handle.abort();
            }
        }
    }
}
