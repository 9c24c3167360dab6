use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc::{channel, error::TrySendError, Sender};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::applications::models::ResponseStatus;

/// key: notifications -> post-commit side effects, never awaited by billing
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Notification {
    ResponseCreated {
        response_id: Uuid,
        casting_id: Uuid,
        employer_id: Uuid,
        applicant_id: Uuid,
        charged: bool,
    },
    ResponseStatusChanged {
        response_id: Uuid,
        applicant_id: Uuid,
        status: ResponseStatus,
    },
    CastingClosed {
        casting_id: Uuid,
        employer_id: Uuid,
        accepted_count: i32,
    },
}

impl Notification {
    pub fn event_name(&self) -> &'static str {
        match self {
            Notification::ResponseCreated { .. } => "response_created",
            Notification::ResponseStatusChanged { .. } => "response_status_changed",
            Notification::CastingClosed { .. } => "casting_closed",
        }
    }
}

/// Fire-and-forget. Implementations must return immediately.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// Delivery backend (push, email, sockets) drained by the worker.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Sink that only records the event in the service log.
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!(
            event = notification.event_name(),
            payload = %serde_json::to_string(notification)?,
            "notification emitted"
        );
        Ok(())
    }
}

/// key: notification-handle -> enqueue interface
#[derive(Clone)]
pub struct NotificationHandle {
    sender: Sender<Notification>,
}

impl NotificationDispatcher for NotificationHandle {
    fn dispatch(&self, notification: Notification) {
        match self.sender.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(dropped)) => warn!(
                event = dropped.event_name(),
                "notification queue full; dropping event"
            ),
            Err(TrySendError::Closed(dropped)) => warn!(
                event = dropped.event_name(),
                "notification worker stopped; dropping event"
            ),
        }
    }
}

/// Spawns the delivery worker. Failed deliveries are logged and not retried here.
pub fn start_notification_worker(
    sink: Arc<dyn NotificationSink>,
    capacity: usize,
) -> NotificationHandle {
    let (tx, mut rx) = channel::<Notification>(capacity.max(1));
    tokio::spawn(async move {
        while let Some(notification) = rx.recv().await {
            if let Err(err) = sink.deliver(&notification).await {
                error!(
                    ?err,
                    event = notification.event_name(),
                    "failed to deliver notification"
                );
            }
        }
    });
    NotificationHandle { sender: tx }
}
