use tracing::{error, info, warn};
use ulid::Ulid;

use crate::limits::CANCELLATION_WINDOW_MS;
use crate::mail::CANCELLATION_MAIL_QUEUE;
use crate::model::*;
use crate::observability;

use super::availability::is_bookable;
use super::{AppointmentBook, BookingError, RoleViolation};

impl AppointmentBook {
    /// Book `provider_id` for `requester_id` at the hour containing `requested`.
    ///
    /// Validation and the insert run under the provider's write lock, so two
    /// concurrent requests for the same slot cannot both succeed. The provider
    /// is notified before the lock is released; if that fails the booking is
    /// withdrawn and the slot freed.
    pub async fn create(
        &self,
        requester_id: Ulid,
        provider_id: Ulid,
        requested: Ms,
    ) -> Result<Appointment, BookingError> {
        let result = self.try_create(requester_id, provider_id, requested).await;
        if let Err(e) = &result {
            metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.reason())
                .increment(1);
        }
        result
    }

    async fn try_create(
        &self,
        requester_id: Ulid,
        provider_id: Ulid,
        requested: Ms,
    ) -> Result<Appointment, BookingError> {
        let requester = self.directory.find(&requester_id).await;
        let provider = self.directory.find(&provider_id).await;
        let provider_role = provider.as_ref().map(UserProfile::role);

        let _gate = self.compaction_gate.read().await;
        // Only real providers get a slot map.
        let slots = (provider_role == Some(Role::Provider)).then(|| self.provider_slots(provider_id));
        let mut guard = match &slots {
            Some(s) => Some(s.write().await),
            None => None,
        };

        let now = self.clock.now_ms();
        let date = is_bookable(
            &self.policy,
            requester.as_ref().map(UserProfile::role),
            provider_role,
            requested,
            now,
            |slot| guard.as_ref().is_some_and(|g| g.is_taken(slot)),
        )?;
        let guard = guard
            .as_mut()
            .ok_or(BookingError::InvalidRole(RoleViolation::TargetNotProvider))?;

        let appointment = Appointment {
            id: Ulid::new(),
            requester_id,
            provider_id,
            date,
            canceled_at: None,
            created_at: now,
        };

        guard.reserve(date, appointment.id)?;
        if let Err(e) = self
            .wal
            .append(Event::AppointmentBooked { appointment: appointment.clone() })
            .await
        {
            guard.release(date, appointment.id);
            return Err(e.into());
        }
        self.by_requester
            .entry(requester_id)
            .or_default()
            .push(appointment.id);
        self.appointments.insert(appointment.id, appointment.clone());

        info!(
            "appointment {} booked: provider {provider_id} at {}",
            appointment.id,
            self.policy.calendar.to_rfc3339(date)
        );
        metrics::counter!(observability::APPOINTMENTS_BOOKED_TOTAL).increment(1);

        let requester_name = requester.map(|r| r.name).unwrap_or_default();
        let content = format!(
            "Novo agendamento de {requester_name} para {}",
            self.policy.calendar.format_slot(date)
        );
        if let Err(e) = self.notifier.notify(provider_id, content).await {
            error!("notifying provider {provider_id} failed, withdrawing {}: {e}", appointment.id);
            self.withdraw(&appointment, guard).await?;
            return Err(BookingError::NotificationFailed(e));
        }

        Ok(appointment)
    }

    /// Compensate a booking whose notification could not be stored: mark it
    /// canceled and free the slot. The caller still holds the provider lock.
    ///
    /// If the cancellation cannot be logged either, memory keeps matching the
    /// log: the appointment stays booked and its id is logged for manual
    /// reconciliation.
    async fn withdraw(
        &self,
        appointment: &Appointment,
        slots: &mut super::ProviderSlots,
    ) -> Result<(), BookingError> {
        let canceled_at = self.clock.now_ms();
        if let Err(e) = self
            .wal
            .append(Event::AppointmentCanceled { id: appointment.id, canceled_at })
            .await
        {
            error!(
                "appointment {} stranded: booked for provider {} at {} without a notification, withdraw failed: {e}",
                appointment.id,
                appointment.provider_id,
                self.policy.calendar.to_rfc3339(appointment.date)
            );
            return Err(e.into());
        }
        if let Some(mut a) = self.appointments.get_mut(&appointment.id) {
            a.canceled_at = Some(canceled_at);
        }
        slots.release(appointment.date, appointment.id);
        Ok(())
    }

    /// Cancel `appointment_id` on behalf of `caller_id`.
    ///
    /// Checks in order: exists, caller owns it, still outside the two-hour
    /// window, not already canceled. On success the cancellation is durable and
    /// a `CancellationMail` job carrying a snapshot has been handed to the queue.
    pub async fn cancel(&self, appointment_id: Ulid, caller_id: Ulid) -> Result<Appointment, BookingError> {
        let result = self.try_cancel(appointment_id, caller_id).await;
        if let Err(e) = &result {
            metrics::counter!(observability::BOOKING_REJECTIONS_TOTAL, "reason" => e.reason())
                .increment(1);
        }
        result
    }

    async fn try_cancel(&self, appointment_id: Ulid, caller_id: Ulid) -> Result<Appointment, BookingError> {
        let provider_id = self
            .appointments
            .get(&appointment_id)
            .map(|a| a.provider_id)
            .ok_or(BookingError::NotFound(appointment_id))?;

        let _gate = self.compaction_gate.read().await;
        let slots = self.provider_slots(provider_id);
        let mut guard = slots.write().await;

        let mut appointment = self
            .appointments
            .get(&appointment_id)
            .map(|a| a.value().clone())
            .ok_or(BookingError::NotFound(appointment_id))?;

        if appointment.requester_id != caller_id {
            return Err(BookingError::Forbidden);
        }
        let now = self.clock.now_ms();
        if now > appointment.date - CANCELLATION_WINDOW_MS {
            return Err(BookingError::CancellationWindowExpired);
        }
        if appointment.canceled_at.is_some() {
            return Err(BookingError::AlreadyCanceled);
        }

        self.wal
            .append(Event::AppointmentCanceled { id: appointment_id, canceled_at: now })
            .await?;
        appointment.canceled_at = Some(now);
        self.appointments.insert(appointment_id, appointment.clone());
        guard.release(appointment.date, appointment_id);
        drop(guard);

        info!("appointment {appointment_id} canceled by {caller_id}");
        metrics::counter!(observability::APPOINTMENTS_CANCELED_TOTAL).increment(1);

        let payload = CancellationPayload {
            appointment: self.snapshot(&appointment).await,
        };
        // The cancellation is already committed; a mail that cannot be queued is
        // reported but does not undo it.
        if let Err(e) = self.queue.add(CANCELLATION_MAIL_QUEUE, &payload).await {
            warn!("cancellation mail for {appointment_id} not queued: {e}");
        }

        Ok(appointment)
    }

    /// Copy of the appointment with the display data the mail needs.
    async fn snapshot(&self, appointment: &Appointment) -> AppointmentSnapshot {
        let provider = self.directory.find(&appointment.provider_id).await;
        let requester = self.directory.find(&appointment.requester_id).await;
        AppointmentSnapshot {
            id: appointment.id,
            date: appointment.date,
            canceled_at: appointment.canceled_at,
            provider: Contact {
                name: provider.as_ref().map(|p| p.name.clone()).unwrap_or_default(),
                email: provider.map(|p| p.email),
            },
            user: Contact {
                name: requester.map(|r| r.name).unwrap_or_default(),
                email: None,
            },
        }
    }
}
