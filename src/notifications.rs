use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use ulid::Ulid;

use crate::clock::Clock;
use crate::compactor::Compact;
use crate::limits::{FIRST_PAGE, MAX_NOTIFICATION_CONTENT_LEN, NOTIFY_CHANNEL_CAPACITY, PAGE_SIZE};
use crate::model::{Notification, NotificationEvent};
use crate::wal::{Wal, WalError, WalWriter};

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("notification content is empty")]
    EmptyContent,
    #[error("notification content exceeds {} bytes", MAX_NOTIFICATION_CONTENT_LEN)]
    ContentTooLong,
    #[error("notification not found: {0}")]
    NotFound(Ulid),
    #[error("storage error: {0}")]
    Storage(#[from] WalError),
}

/// What the booking flow needs from the notification side.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, recipient_id: Ulid, content: String) -> Result<Notification, NotificationError>;
}

/// Persists provider notifications and fans them out to live subscribers.
pub struct NotificationDispatcher {
    records: DashMap<Ulid, Notification>,
    /// Recipient → notification ids, oldest first.
    by_recipient: DashMap<Ulid, Vec<Ulid>>,
    channels: DashMap<Ulid, broadcast::Sender<Notification>>,
    wal: WalWriter<NotificationEvent>,
    clock: Arc<dyn Clock>,
    /// Appends hold this shared; compaction holds it exclusively.
    compaction_gate: RwLock<()>,
}

impl NotificationDispatcher {
    pub fn open(wal_path: &Path, clock: Arc<dyn Clock>) -> io::Result<Self> {
        let events: Vec<NotificationEvent> = Wal::replay(wal_path)?;
        let dispatcher = Self {
            records: DashMap::new(),
            by_recipient: DashMap::new(),
            channels: DashMap::new(),
            wal: WalWriter::spawn(Wal::open(wal_path)?),
            clock,
            compaction_gate: RwLock::new(()),
        };
        for event in events {
            dispatcher.apply(event);
        }
        Ok(dispatcher)
    }

    fn apply(&self, event: NotificationEvent) {
        match event {
            NotificationEvent::Created { notification } => {
                self.by_recipient
                    .entry(notification.recipient_id)
                    .or_default()
                    .push(notification.id);
                self.records.insert(notification.id, notification);
            }
            NotificationEvent::MarkedRead { id } => {
                if let Some(mut n) = self.records.get_mut(&id) {
                    n.read = true;
                }
            }
        }
    }

    /// Subscribe to new notifications for a recipient. Creates the channel if needed.
    pub fn subscribe(&self, recipient_id: Ulid) -> broadcast::Receiver<Notification> {
        self.channels
            .entry(recipient_id)
            .or_insert_with(|| broadcast::channel(NOTIFY_CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Newest first, `PAGE_SIZE` per 1-based page.
    pub fn list_for_recipient(&self, recipient_id: &Ulid, page: usize) -> Vec<Notification> {
        let Some(ids) = self.by_recipient.get(recipient_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let mut items: Vec<Notification> = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|e| e.value().clone()))
            .collect();
        items.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let skip = (page.max(FIRST_PAGE) - 1).saturating_mul(PAGE_SIZE);
        items.into_iter().skip(skip).take(PAGE_SIZE).collect()
    }

    pub fn get(&self, id: &Ulid) -> Option<Notification> {
        self.records.get(id).map(|e| e.value().clone())
    }

    /// Set `read = true` and return the updated record. Idempotent.
    pub async fn mark_read(&self, id: Ulid) -> Result<Notification, NotificationError> {
        let current = self.get(&id).ok_or(NotificationError::NotFound(id))?;
        if current.read {
            return Ok(current);
        }
        let _gate = self.compaction_gate.read().await;
        self.wal.append(NotificationEvent::MarkedRead { id }).await?;
        self.apply(NotificationEvent::MarkedRead { id });
        self.get(&id).ok_or(NotificationError::NotFound(id))
    }
}

#[async_trait]
impl Notifier for NotificationDispatcher {
    async fn notify(&self, recipient_id: Ulid, content: String) -> Result<Notification, NotificationError> {
        if content.trim().is_empty() {
            return Err(NotificationError::EmptyContent);
        }
        if content.len() > MAX_NOTIFICATION_CONTENT_LEN {
            return Err(NotificationError::ContentTooLong);
        }

        let notification = Notification {
            id: Ulid::new(),
            recipient_id,
            content,
            read: false,
            created_at: self.clock.now_ms(),
        };
        let _gate = self.compaction_gate.read().await;
        self.wal
            .append(NotificationEvent::Created { notification: notification.clone() })
            .await?;
        self.apply(NotificationEvent::Created { notification: notification.clone() });

        // No-op if nobody is listening.
        if let Some(sender) = self.channels.get(&recipient_id) {
            let _ = sender.send(notification.clone());
        }
        tracing::debug!("notification {} stored for {recipient_id}", notification.id);
        Ok(notification)
    }
}

#[async_trait]
impl Compact for NotificationDispatcher {
    fn name(&self) -> &'static str {
        "notifications"
    }

    async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    async fn compact(&self) -> Result<(), WalError> {
        let _exclusive = self.compaction_gate.write().await;
        let mut all: Vec<Notification> = self.records.iter().map(|e| e.value().clone()).collect();
        all.sort_by_key(|n| n.id);
        let events = all
            .into_iter()
            .map(|notification| NotificationEvent::Created { notification })
            .collect();
        self.wal.compact(events).await
    }
}
