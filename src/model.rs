use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::CANCELLATION_WINDOW_MS;

/// Unix milliseconds — the only time type.
pub type Ms = i64;

pub const HOUR_MS: Ms = 3_600_000;

/// A booked slot between a requester and a provider.
///
/// `canceled_at == None` means the appointment is active. Once set it never changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Appointment {
    pub id: Ulid,
    pub requester_id: Ulid,
    pub provider_id: Ulid,
    /// Scheduled start, always floored to the hour.
    pub date: Ms,
    pub canceled_at: Option<Ms>,
    pub created_at: Ms,
}

impl Appointment {
    pub fn is_active(&self) -> bool {
        self.canceled_at.is_none()
    }

    pub fn past(&self, now: Ms) -> bool {
        self.date < now
    }

    /// More than the cancellation window away and not yet canceled.
    pub fn cancelable(&self, now: Ms) -> bool {
        self.canceled_at.is_none() && self.date - CANCELLATION_WINDOW_MS > now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Requester,
    Provider,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Avatar {
    pub id: Ulid,
    pub path: String,
    pub url: String,
}

/// Display data for a user, owned by the external user directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Ulid,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub provider: bool,
    #[serde(default)]
    pub avatar: Option<Avatar>,
}

impl UserProfile {
    pub fn role(&self) -> Role {
        if self.provider {
            Role::Provider
        } else {
            Role::Requester
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: Ulid,
    /// The provider the notification is addressed to.
    pub recipient_id: Ulid,
    pub content: String,
    pub read: bool,
    pub created_at: Ms,
}

/// Name/email pair carried inside job payloads so the worker needs no lookups.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Appointment copy handed to the job queue. The queue owns this copy, not the record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppointmentSnapshot {
    pub id: Ulid,
    pub date: Ms,
    pub canceled_at: Option<Ms>,
    pub provider: Contact,
    pub user: Contact,
}

/// Payload of the cancellation mail job: `{ "appointment": { ... } }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancellationPayload {
    pub appointment: AppointmentSnapshot,
}

/// Appointment log records. Replaying them in order rebuilds the book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    AppointmentBooked { appointment: Appointment },
    AppointmentCanceled { id: Ulid, canceled_at: Ms },
}

/// Notification log records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationEvent {
    Created { notification: Notification },
    MarkedRead { id: Ulid },
}
