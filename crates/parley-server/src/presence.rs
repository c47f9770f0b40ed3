//! Best-effort presence and typing persistence.
//!
//! The hub never awaits these writes. Commands go through an unbounded queue
//! to a single writer task, which applies them in submission order so a
//! user's offline write can never overtake their online write.

use std::sync::Arc;

use parley_core::{ChatStore, UserId};
use parley_telemetry::{names, MetricsRecorder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum PresenceCommand {
    Online {
        user: UserId,
        online: bool,
    },
    Typing {
        user: UserId,
        receiver: UserId,
        is_typing: bool,
    },
    Flush(oneshot::Sender<()>),
}

#[derive(Clone)]
pub struct PresenceWriter {
    tx: mpsc::UnboundedSender<PresenceCommand>,
}

impl PresenceWriter {
    /// Start the writer task. It exits once every `PresenceWriter` clone is dropped.
    pub fn spawn(
        store: Arc<dyn ChatStore>,
        metrics: Option<Arc<MetricsRecorder>>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run(rx, store, metrics));
        (Self { tx }, task)
    }

    pub fn set_online(&self, user: &UserId, online: bool) {
        self.submit(PresenceCommand::Online {
            user: user.clone(),
            online,
        });
    }

    pub fn set_typing(&self, user: &UserId, receiver: &UserId, is_typing: bool) {
        self.submit(PresenceCommand::Typing {
            user: user.clone(),
            receiver: receiver.clone(),
            is_typing,
        });
    }

    /// Resolves once every write submitted before this call has been attempted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        self.submit(PresenceCommand::Flush(done));
        let _ = wait.await;
    }

    fn submit(&self, command: PresenceCommand) {
        if self.tx.send(command).is_err() {
            debug!("presence writer stopped, dropping write");
        }
    }
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<PresenceCommand>,
    store: Arc<dyn ChatStore>,
    metrics: Option<Arc<MetricsRecorder>>,
) {
    while let Some(command) = rx.recv().await {
        let (user, result) = match command {
            PresenceCommand::Online { user, online } => {
                let result = store.set_online(&user, online).await;
                (user, result)
            }
            PresenceCommand::Typing {
                user,
                receiver,
                is_typing,
            } => {
                let result = store.set_typing(&user, &receiver, is_typing).await;
                (user, result)
            }
            PresenceCommand::Flush(done) => {
                let _ = done.send(());
                continue;
            }
        };

        if let Err(e) = result {
            warn!(user_id = %user, error = %e, "presence write failed");
            if let Some(m) = &metrics {
                m.counter_inc(names::PRESENCE_FAILURES, &[], 1);
            }
        }
    }
    debug!("presence writer stopped");
}
