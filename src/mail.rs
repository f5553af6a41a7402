use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::clock::LocalCalendar;
use crate::model::CancellationPayload;
use crate::queue::{JobError, JobHandler};

/// Queue key of the cancellation mail job.
pub const CANCELLATION_MAIL_QUEUE: &str = "CancellationMail";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    /// `Name <address>`.
    pub to: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum MailError {
    #[error("mail transport unavailable: {0}")]
    Transport(String),
    #[error("recipient has no address")]
    NoRecipient,
}

/// Outbound mail transport.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(&self, mail: Mail) -> Result<(), MailError>;
}

/// Writes mails to the log instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send(&self, mail: Mail) -> Result<(), MailError> {
        info!(to = %mail.to, subject = %mail.subject, "mail: {}", mail.body);
        Ok(())
    }
}

/// Tells a provider that one of their appointments was canceled.
///
/// Works only from the snapshot in the payload, so a redelivered job sends the
/// same mail again and touches nothing else.
pub struct CancellationMail {
    mailer: Arc<dyn Mailer>,
    calendar: LocalCalendar,
}

impl CancellationMail {
    pub fn new(mailer: Arc<dyn Mailer>, calendar: LocalCalendar) -> Self {
        Self { mailer, calendar }
    }

    pub fn render(&self, payload: &CancellationPayload) -> Result<Mail, MailError> {
        let appointment = &payload.appointment;
        let address = appointment
            .provider
            .email
            .as_deref()
            .ok_or(MailError::NoRecipient)?;
        Ok(Mail {
            to: format!("{} <{address}>", appointment.provider.name),
            subject: "Agendamento cancelado".to_string(),
            body: format!(
                "Olá {}, o agendamento de {} para {} foi cancelado.",
                appointment.provider.name,
                appointment.user.name,
                self.calendar.format_slot(appointment.date)
            ),
        })
    }
}

#[async_trait]
impl JobHandler for CancellationMail {
    fn key(&self) -> &'static str {
        CANCELLATION_MAIL_QUEUE
    }

    async fn handle(&self, payload: Value) -> Result<(), JobError> {
        let payload: CancellationPayload = serde_json::from_value(payload)?;
        let mail = self
            .render(&payload)
            .map_err(|e| JobError::Delivery(e.to_string()))?;
        self.mailer
            .send(mail)
            .await
            .map_err(|e| JobError::Delivery(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AppointmentSnapshot, Contact, HOUR_MS};
    use std::sync::Mutex;
    use ulid::Ulid;

    // 2026-03-05T00:00:00Z
    const DAY: i64 = 1_772_668_800_000;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<Mail>>);

    #[async_trait]
    impl Mailer for Outbox {
        async fn send(&self, mail: Mail) -> Result<(), MailError> {
            self.0.lock().unwrap().push(mail);
            Ok(())
        }
    }

    struct Down;

    #[async_trait]
    impl Mailer for Down {
        async fn send(&self, _mail: Mail) -> Result<(), MailError> {
            Err(MailError::Transport("connection refused".into()))
        }
    }

    fn payload(provider_email: Option<&str>) -> CancellationPayload {
        CancellationPayload {
            appointment: AppointmentSnapshot {
                id: Ulid::new(),
                date: DAY + 14 * HOUR_MS,
                canceled_at: Some(DAY),
                provider: Contact {
                    name: "Bia".into(),
                    email: provider_email.map(str::to_string),
                },
                user: Contact { name: "Caio".into(), email: None },
            },
        }
    }

    #[tokio::test]
    async fn sends_to_provider() {
        let outbox = Arc::new(Outbox::default());
        let job = CancellationMail::new(outbox.clone(), LocalCalendar::utc());

        job.handle(serde_json::to_value(payload(Some("bia@example.com"))).unwrap())
            .await
            .unwrap();

        let sent = outbox.0.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "Bia <bia@example.com>");
        assert!(sent[0].body.contains("Caio"));
        assert!(sent[0].body.contains("dia 05 de março, às 14:00h"));
    }

    #[tokio::test]
    async fn transport_failure_is_retryable() {
        let job = CancellationMail::new(Arc::new(Down), LocalCalendar::utc());
        let r = job
            .handle(serde_json::to_value(payload(Some("bia@example.com"))).unwrap())
            .await;
        assert!(matches!(r, Err(JobError::Delivery(_))));
    }

    #[tokio::test]
    async fn malformed_payload_is_payload_error() {
        let job = CancellationMail::new(Arc::new(LogMailer), LocalCalendar::utc());
        let r = job.handle(serde_json::json!({"appointment": 3})).await;
        assert!(matches!(r, Err(JobError::Payload(_))));
    }

    #[test]
    fn missing_address_cannot_render() {
        let job = CancellationMail::new(Arc::new(LogMailer), LocalCalendar::utc());
        assert!(matches!(job.render(&payload(None)), Err(MailError::NoRecipient)));
    }
}
