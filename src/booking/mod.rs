mod availability;
mod error;
mod mutations;
mod queries;

pub use availability::{is_bookable, BookingPolicy, BusinessHours};
pub use error::{BookingError, RoleViolation};

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use ulid::Ulid;

use crate::clock::Clock;
use crate::compactor::Compact;
use crate::directory::UserDirectory;
use crate::model::*;
use crate::notifications::Notifier;
use crate::queue::JobQueue;
use crate::wal::{Wal, WalError, WalWriter};

/// Active slots of one provider: floored start → appointment id.
///
/// This map is the uniqueness constraint for `(provider, date)` among active
/// appointments. It is only mutated under the provider's write lock.
#[derive(Debug, Default)]
pub struct ProviderSlots {
    active: BTreeMap<Ms, Ulid>,
}

impl ProviderSlots {
    pub fn is_taken(&self, date: Ms) -> bool {
        self.active.contains_key(&date)
    }

    /// Claim `date` for `id`; fails if any active appointment already holds it.
    fn reserve(&mut self, date: Ms, id: Ulid) -> Result<(), BookingError> {
        match self.active.entry(date) {
            std::collections::btree_map::Entry::Vacant(v) => {
                v.insert(id);
                Ok(())
            }
            std::collections::btree_map::Entry::Occupied(_) => Err(BookingError::SlotTaken),
        }
    }

    /// Free `date` if (and only if) it is held by `id`.
    fn release(&mut self, date: Ms, id: Ulid) {
        if self.active.get(&date) == Some(&id) {
            self.active.remove(&date);
        }
    }
}

pub type SharedProviderSlots = Arc<RwLock<ProviderSlots>>;

/// Collaborators the lifecycle manager orchestrates.
pub struct BookDeps {
    pub directory: Arc<dyn UserDirectory>,
    pub notifier: Arc<dyn Notifier>,
    pub queue: JobQueue,
    pub clock: Arc<dyn Clock>,
    pub policy: BookingPolicy,
}

/// Appointment lifecycle manager and its store.
///
/// State lives in memory and is rebuilt from the appointment WAL on startup.
/// Bookings and cancellations for the same provider serialize on that
/// provider's lock; different providers proceed in parallel.
pub struct AppointmentBook {
    pub(super) appointments: DashMap<Ulid, Appointment>,
    pub(super) providers: DashMap<Ulid, SharedProviderSlots>,
    /// Requester → appointment ids, in booking order.
    pub(super) by_requester: DashMap<Ulid, Vec<Ulid>>,
    pub(super) wal: WalWriter<Event>,
    pub(super) directory: Arc<dyn UserDirectory>,
    pub(super) notifier: Arc<dyn Notifier>,
    pub(super) queue: JobQueue,
    pub(super) clock: Arc<dyn Clock>,
    pub(super) policy: BookingPolicy,
    /// Mutations hold this shared; compaction holds it exclusively so no append
    /// lands between the snapshot and the rewrite.
    pub(super) compaction_gate: RwLock<()>,
}

impl AppointmentBook {
    pub fn open(wal_path: &Path, deps: BookDeps) -> io::Result<Self> {
        let events: Vec<Event> = Wal::replay(wal_path)?;
        let wal = WalWriter::spawn(Wal::open(wal_path)?);

        let appointments = DashMap::new();
        let by_requester: DashMap<Ulid, Vec<Ulid>> = DashMap::new();
        let mut slots: HashMap<Ulid, ProviderSlots> = HashMap::new();

        // Replay into plain maps first; locks are only introduced once state is complete.
        for event in events {
            match event {
                Event::AppointmentBooked { appointment } => {
                    if appointment.is_active() {
                        let provider = slots.entry(appointment.provider_id).or_default();
                        if provider.reserve(appointment.date, appointment.id).is_err() {
                            tracing::warn!(
                                "replay: appointment {} shares an active slot, keeping the first",
                                appointment.id
                            );
                        }
                    }
                    by_requester
                        .entry(appointment.requester_id)
                        .or_default()
                        .push(appointment.id);
                    appointments.insert(appointment.id, appointment);
                }
                Event::AppointmentCanceled { id, canceled_at } => {
                    if let Some(mut a) = appointments.get_mut(&id)
                        && a.canceled_at.is_none()
                    {
                        a.canceled_at = Some(canceled_at);
                        if let Some(provider) = slots.get_mut(&a.provider_id) {
                            provider.release(a.date, id);
                        }
                    }
                }
            }
        }

        let providers = DashMap::new();
        for (provider_id, s) in slots {
            providers.insert(provider_id, Arc::new(RwLock::new(s)));
        }

        tracing::info!(
            "appointment book loaded: {} appointments, {} providers",
            appointments.len(),
            providers.len()
        );

        Ok(Self {
            appointments,
            providers,
            by_requester,
            wal,
            directory: deps.directory,
            notifier: deps.notifier,
            queue: deps.queue,
            clock: deps.clock,
            policy: deps.policy,
            compaction_gate: RwLock::new(()),
        })
    }

    pub fn policy(&self) -> &BookingPolicy {
        &self.policy
    }

    /// Lock handle for a provider's slots, created on first use.
    pub(super) fn provider_slots(&self, provider_id: Ulid) -> SharedProviderSlots {
        self.providers
            .entry(provider_id)
            .or_insert_with(|| Arc::new(RwLock::new(ProviderSlots::default())))
            .value()
            .clone()
    }
}

#[async_trait]
impl Compact for AppointmentBook {
    fn name(&self) -> &'static str {
        "appointments"
    }

    async fn appends_since_compact(&self) -> u64 {
        self.wal.appends_since_compact().await
    }

    /// Rewrite the log as one `AppointmentBooked` per appointment, canceled ones included.
    async fn compact(&self) -> Result<(), WalError> {
        let _exclusive = self.compaction_gate.write().await;
        let mut snapshot: Vec<Appointment> =
            self.appointments.iter().map(|e| e.value().clone()).collect();
        snapshot.sort_by_key(|a| a.id);
        let events = snapshot
            .into_iter()
            .map(|appointment| Event::AppointmentBooked { appointment })
            .collect();
        self.wal.compact(events).await
    }
}
