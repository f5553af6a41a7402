use crate::clock::LocalCalendar;
use crate::model::*;

use super::error::{BookingError, RoleViolation};

/// Bookable start hours, both ends inclusive, on the floored local hour.
///
/// The rejection message is rendered from the same two numbers, so what is
/// enforced and what the caller is told cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessHours {
    pub open_hour: u32,
    pub close_hour: u32,
}

impl Default for BusinessHours {
    fn default() -> Self {
        Self { open_hour: 8, close_hour: 20 }
    }
}

impl BusinessHours {
    /// `None` unless `open_hour <= close_hour <= 23`.
    pub fn new(open_hour: u32, close_hour: u32) -> Option<Self> {
        (open_hour <= close_hour && close_hour <= 23).then_some(Self { open_hour, close_hour })
    }

    pub fn contains(&self, hour: u32) -> bool {
        (self.open_hour..=self.close_hour).contains(&hour)
    }
}

/// Everything the validator needs besides the slot lookup.
#[derive(Debug, Clone, Copy)]
pub struct BookingPolicy {
    pub hours: BusinessHours,
    pub calendar: LocalCalendar,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            hours: BusinessHours::default(),
            calendar: LocalCalendar::utc(),
        }
    }
}

/// Decide whether `requested` can be booked with `provider` by `requester`.
///
/// Checks run in order: roles, past date, business hours, slot conflict. The
/// conflict lookup is only consulted once the floored slot is otherwise valid.
/// Returns the floored timestamp to persist.
pub fn is_bookable(
    policy: &BookingPolicy,
    requester: Option<Role>,
    provider: Option<Role>,
    requested: Ms,
    now: Ms,
    slot_taken: impl FnOnce(Ms) -> bool,
) -> Result<Ms, BookingError> {
    if requester != Some(Role::Requester) {
        return Err(BookingError::InvalidRole(RoleViolation::RequesterIsProvider));
    }
    if provider != Some(Role::Provider) {
        return Err(BookingError::InvalidRole(RoleViolation::TargetNotProvider));
    }

    let slot = policy.calendar.floor_to_hour(requested);
    if slot <= now {
        return Err(BookingError::PastDate);
    }

    if !policy.hours.contains(policy.calendar.hour_of_day(slot)) {
        return Err(BookingError::OutsideBusinessHours {
            open_hour: policy.hours.open_hour,
            close_hour: policy.hours.close_hour,
        });
    }

    if slot_taken(slot) {
        return Err(BookingError::SlotTaken);
    }

    Ok(slot)
}
