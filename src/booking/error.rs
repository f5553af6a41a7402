use thiserror::Error;
use ulid::Ulid;

use crate::notifications::NotificationError;
use crate::wal::WalError;

/// Which side of the booking has the wrong role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleViolation {
    RequesterIsProvider,
    TargetNotProvider,
}

impl std::fmt::Display for RoleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RoleViolation::RequesterIsProvider => f.write_str("Only User can create appointments"),
            RoleViolation::TargetNotProvider => {
                f.write_str("You can only create appointments with provider")
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum BookingError {
    #[error("validation fails!")]
    Validation,
    #[error("{0}")]
    InvalidRole(RoleViolation),
    #[error("Past dates are not permitted!")]
    PastDate,
    #[error("Choose an appointment time between {open_hour:02}:00 and {close_hour:02}:00")]
    OutsideBusinessHours { open_hour: u32, close_hour: u32 },
    #[error("Appointment date is not available!")]
    SlotTaken,
    #[error("appointment not found: {0}")]
    NotFound(Ulid),
    #[error("You don't have permission to cancel this appointment!")]
    Forbidden,
    #[error("You can only cancel appointments 2 hours in advance.")]
    CancellationWindowExpired,
    #[error("This appointment has already been canceled")]
    AlreadyCanceled,
    #[error("booking withdrawn, provider could not be notified: {0}")]
    NotificationFailed(#[source] NotificationError),
    #[error("storage error: {0}")]
    Storage(#[from] WalError),
}

impl BookingError {
    /// Short stable label for metrics.
    pub fn reason(&self) -> &'static str {
        match self {
            BookingError::Validation => "validation",
            BookingError::InvalidRole(_) => "invalid_role",
            BookingError::PastDate => "past_date",
            BookingError::OutsideBusinessHours { .. } => "outside_business_hours",
            BookingError::SlotTaken => "slot_taken",
            BookingError::NotFound(_) => "not_found",
            BookingError::Forbidden => "forbidden",
            BookingError::CancellationWindowExpired => "cancellation_window_expired",
            BookingError::AlreadyCanceled => "already_canceled",
            BookingError::NotificationFailed(_) => "notification_failed",
            BookingError::Storage(_) => "storage",
        }
    }
}
