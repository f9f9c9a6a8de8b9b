//! Cleanup scheduler implementations.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ratelimit::Clock;

/// Capacity of the broadcast channel carrying due notices.
const CHANNEL_CAPACITY: usize = 1024;

/// Reasons a cleanup notice could not be scheduled.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("cleanup scheduling failed: no async runtime available")]
    NoRuntime,
    #[error("cleanup scheduling failed: {pending} notices already pending")]
    QueueFull { pending: usize },
}

/// Notification that the lockout on an (email, ip) pair is due to expire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CleanupNotice {
    pub id: Uuid,
    pub email: String,
    pub ip: String,
    /// When the lockout was set (Unix seconds)
    pub set_at: i64,
    /// When the lockout ends (Unix seconds)
    pub due_at: i64,
}

impl CleanupNotice {
    pub fn new(
        email: impl Into<String>,
        ip: impl Into<String>,
        set_at: i64,
        due_at: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            email: email.into(),
            ip: ip.into(),
            set_at,
            due_at,
        }
    }
}

/// Hands cleanup notices to something that will deliver them at `due_at`.
#[async_trait]
pub trait CleanupScheduler: Send + Sync {
    async fn schedule(&self, notice: CleanupNotice) -> Result<(), SchedulerError>;
}

/// In-process scheduler that holds each notice on a timer task and broadcasts
/// it to subscribers once it falls due.
pub struct DeferredCleanupScheduler {
    clock: Arc<dyn Clock>,
    sender: broadcast::Sender<CleanupNotice>,
    pending: Arc<AtomicUsize>,
    max_pending: usize,
}

impl DeferredCleanupScheduler {
    pub fn new(clock: Arc<dyn Clock>, max_pending: usize) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            clock,
            sender,
            pending: Arc::new(AtomicUsize::new(0)),
            max_pending,
        }
    }

    /// Receive notices as they fall due.
    pub fn subscribe(&self) -> broadcast::Receiver<CleanupNotice> {
        self.sender.subscribe()
    }

    /// Stream of due notices; lagging subscribers observe an error item.
    pub fn notices(&self) -> BroadcastStream<CleanupNotice> {
        BroadcastStream::new(self.subscribe())
    }

    /// Number of notices waiting for their due time.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Log every notice as it falls due and hand it to `on_due`.
    ///
    /// The subscription is taken before this returns, so no notice falling
    /// due afterwards is missed. The task ends once the scheduler is dropped.
    pub fn spawn_consumer<F>(&self, mut on_due: F) -> JoinHandle<()>
    where
        F: FnMut(CleanupNotice) + Send + 'static,
    {
        let mut notices = self.notices();
        tokio::spawn(async move {
            while let Some(item) = notices.next().await {
                match item {
                    Ok(notice) => {
                        info!(
                            id = %notice.id,
                            email = %notice.email,
                            ip = %notice.ip,
                            set_at = notice.set_at,
                            due_at = notice.due_at,
                            "Lockout expired"
                        );
                        on_due(notice);
                    }
                    Err(e) => warn!(error = %e, "Cleanup notice consumer fell behind"),
                }
            }
        })
    }
}

#[async_trait]
impl CleanupScheduler for DeferredCleanupScheduler {
    async fn schedule(&self, notice: CleanupNotice) -> Result<(), SchedulerError> {
        let runtime =
            tokio::runtime::Handle::try_current().map_err(|_| SchedulerError::NoRuntime)?;

        let pending = self.pending.fetch_add(1, Ordering::SeqCst);
        if pending >= self.max_pending {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            return Err(SchedulerError::QueueFull { pending });
        }

        let delay = u64::try_from(notice.due_at.saturating_sub(self.clock.now())).unwrap_or(0);
        let sender = self.sender.clone();
        let counter = Arc::clone(&self.pending);

        debug!(
            id = %notice.id,
            due_at = notice.due_at,
            delay_secs = delay,
            "Scheduled lockout cleanup notice"
        );

        runtime.spawn(async move {
            tokio::time::sleep(Duration::from_secs(delay)).await;
            counter.fetch_sub(1, Ordering::SeqCst);
            // No subscribers is not an error; the notice is purely advisory.
            if sender.send(notice.clone()).is_err() {
                trace!(id = %notice.id, "Cleanup notice fell due with no subscribers");
            }
        });

        Ok(())
    }
}
