use ulid::Ulid;

use crate::limits::{FIRST_PAGE, PAGE_SIZE};
use crate::model::*;

use super::AppointmentBook;

impl AppointmentBook {
    pub fn get(&self, id: &Ulid) -> Option<Appointment> {
        self.appointments.get(id).map(|e| e.value().clone())
    }

    /// Active appointments of `requester_id`, latest date first, `PAGE_SIZE` per page.
    /// Pages are 1-based; page 0 reads as page 1.
    pub fn list_for_requester(&self, requester_id: &Ulid, page: usize) -> Vec<Appointment> {
        let Some(ids) = self.by_requester.get(requester_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        let mut active: Vec<Appointment> = ids
            .iter()
            .filter_map(|id| self.get(id))
            .filter(Appointment::is_active)
            .collect();
        active.sort_by(|a, b| b.date.cmp(&a.date).then(b.id.cmp(&a.id)));

        let skip = (page.max(FIRST_PAGE) - 1).saturating_mul(PAGE_SIZE);
        active.into_iter().skip(skip).take(PAGE_SIZE).collect()
    }

    /// Appointment id holding `(provider_id, date)`, if any.
    pub async fn active_at(&self, provider_id: &Ulid, date: Ms) -> Option<Ulid> {
        let slots = self.providers.get(provider_id).map(|e| e.value().clone())?;
        let guard = slots.read().await;
        guard.active.get(&date).copied()
    }

    pub fn len(&self) -> usize {
        self.appointments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.appointments.is_empty()
    }
}
