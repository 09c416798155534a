//! The directory actor: the single writer of the record collection.
//!
//! Every mutation (scan merges, probe results, user actions) is a command
//! drained by one task, so readers only ever see whole records. Observers
//! subscribe to [`DirectoryEvent`]s and ask for the snapshot hash, which is
//! recomputed only when something it covers changed since the last request.

pub mod collection;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, mpsc, oneshot};
use shared::record::{PropertySet, Property, RefreshPolicy, RefreshReason, UpdateTicket};
use shared::types::{Booking, ErrorReason, ProbeReport, ServerId, ServerRecord, SourceKind, UpdateMode};
use crate::error::DirectoryError;
use crate::store::hash;
pub use collection::{Directory, MergeSummary, ScanBatch};

/// Change notifications published after each applied command.
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryEvent {
    Added(Vec<ServerId>),
    Removed(Vec<ServerId>),
    Changed { id: ServerId, properties: PropertySet },
    ScanFailed { source: SourceKind, message: String },
}

/// User-driven edits to a single record.
#[derive(Debug, Clone)]
pub enum Mutation {
    SetBooking(Option<Booking>),
    SetFavourite(bool),
    SetJoined(bool),
    SelectCar { car: Option<String>, skin: Option<String> },
}

/// Commands sent to the directory task
pub enum DirectoryCommand {
    Merge(ScanBatch, oneshot::Sender<MergeSummary>),
    BeginUpdate(ServerId, UpdateMode, oneshot::Sender<Option<UpdateTicket>>),
    Apply(UpdateTicket, Result<ProbeReport, ErrorReason>, oneshot::Sender<PropertySet>),
    Abandon(Vec<UpdateTicket>, oneshot::Sender<()>),
    Modify(ServerId, Mutation, oneshot::Sender<Result<ServerRecord, DirectoryError>>),
    DueForRefresh {
        ids: Vec<ServerId>,
        now: DateTime<Utc>,
        policy: RefreshPolicy,
        reply: oneshot::Sender<Vec<(ServerId, RefreshReason)>>,
    },
    Get(ServerId, oneshot::Sender<Option<ServerRecord>>),
    Snapshot(oneshot::Sender<Vec<ServerRecord>>),
    Hash(oneshot::Sender<String>),
}

/// Snapshot hash, recomputed lazily after hashed properties change.
struct CachedHash {
    value: String,
    dirty: bool,
}

impl CachedHash {
    fn get(&mut self, directory: &Directory) -> String {
        if self.dirty {
            self.value = hash::compute_hash(directory.records());
            self.dirty = false;
        }
        self.value.clone()
    }
}

/// Handle to the directory task
#[derive(Clone)]
pub struct DirectoryHandle {
    tx: mpsc::Sender<DirectoryCommand>,
    events: broadcast::Sender<DirectoryEvent>,
}

impl DirectoryHandle {
    /// Spawn the directory task on the current runtime
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::channel::<DirectoryCommand>(1024);
        let (events, _) = broadcast::channel(1024);

        let publisher = events.clone();
        tokio::spawn(async move {
            let mut directory = Directory::new();
            let mut hash = CachedHash { value: hash::compute_hash(&[]), dirty: false };
            while let Some(cmd) = rx.recv().await {
                handle_command(&mut directory, cmd, &publisher, &mut hash);
            }
            tracing::debug!("Directory task stopped");
        });

        Self { tx, events }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DirectoryEvent> {
        self.events.subscribe()
    }

    pub async fn hash(&self) -> Result<String, DirectoryError> {
        self.request(DirectoryCommand::Hash).await
    }

    pub fn publish(&self, event: DirectoryEvent) {
        let _ = self.events.send(event);
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> DirectoryCommand,
    ) -> Result<T, DirectoryError> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(make(reply)).await.map_err(|_| DirectoryError::Closed)?;
        rx.await.map_err(|_| DirectoryError::Closed)
    }

    /// Apply one scan result as a single batch
    pub async fn merge(&self, batch: ScanBatch) -> Result<MergeSummary, DirectoryError> {
        self.request(|reply| DirectoryCommand::Merge(batch, reply)).await
    }

    /// Move a record into `Loading`. `None` if the record no longer exists.
    pub async fn begin_update(&self, id: ServerId, mode: UpdateMode) -> Result<Option<UpdateTicket>, DirectoryError> {
        self.request(|reply| DirectoryCommand::BeginUpdate(id, mode, reply)).await
    }

    pub async fn apply(
        &self,
        ticket: UpdateTicket,
        outcome: Result<ProbeReport, ErrorReason>,
    ) -> Result<PropertySet, DirectoryError> {
        self.request(|reply| DirectoryCommand::Apply(ticket, outcome, reply)).await
    }

    pub async fn abandon(&self, tickets: Vec<UpdateTicket>) -> Result<(), DirectoryError> {
        if tickets.is_empty() {
            return Ok(());
        }
        self.request(|reply| DirectoryCommand::Abandon(tickets, reply)).await
    }

    pub async fn modify(&self, id: ServerId, mutation: Mutation) -> Result<ServerRecord, DirectoryError> {
        self.request(|reply| DirectoryCommand::Modify(id, mutation, reply)).await?
    }

    /// Which of `ids` need a refresh now. Session-end refreshes are recorded
    /// so the cooldown applies to the next call.
    pub async fn due_for_refresh(
        &self,
        ids: Vec<ServerId>,
        now: DateTime<Utc>,
        policy: RefreshPolicy,
    ) -> Result<Vec<(ServerId, RefreshReason)>, DirectoryError> {
        self.request(|reply| DirectoryCommand::DueForRefresh { ids, now, policy, reply }).await
    }

    pub async fn get(&self, id: ServerId) -> Result<Option<ServerRecord>, DirectoryError> {
        self.request(|reply| DirectoryCommand::Get(id, reply)).await
    }

    pub async fn snapshot(&self) -> Result<Vec<ServerRecord>, DirectoryError> {
        self.request(DirectoryCommand::Snapshot).await
    }
}

fn handle_command(
    directory: &mut Directory,
    cmd: DirectoryCommand,
    events: &broadcast::Sender<DirectoryEvent>,
    hash: &mut CachedHash,
) {
    let publish_changed = |id: &ServerId, properties: PropertySet| {
        if !properties.is_empty() {
            let _ = events.send(DirectoryEvent::Changed { id: id.clone(), properties });
        }
    };
    // Ping alone does not change the published hash
    let affects_hash = |properties: PropertySet| {
        properties.intersects(PropertySet::ALL.without(Property::Ping))
    };

    match cmd {
        DirectoryCommand::Merge(batch, reply) => {
            let summary = directory.merge(batch);
            if !summary.removed.is_empty() {
                let _ = events.send(DirectoryEvent::Removed(summary.removed.clone()));
            }
            if !summary.added.is_empty() {
                let _ = events.send(DirectoryEvent::Added(summary.added.clone()));
            }
            for (id, properties) in &summary.changed {
                publish_changed(id, *properties);
            }
            if !summary.added.is_empty() || !summary.removed.is_empty() || !summary.changed.is_empty() {
                hash.dirty = true;
            }
            tracing::debug!(
                "Merged scan: {} added, {} removed, {} total",
                summary.added.len(),
                summary.removed.len(),
                summary.total
            );
            let _ = reply.send(summary);
        }
        DirectoryCommand::BeginUpdate(id, mode, reply) => {
            let ticket = directory.get_mut(&id).map(|record| {
                let (ticket, changed) = record.begin_update(mode);
                publish_changed(&id, changed);
                hash.dirty |= affects_hash(changed);
                ticket
            });
            let _ = reply.send(ticket);
        }
        DirectoryCommand::Apply(ticket, outcome, reply) => {
            let changed = match directory.get_mut(&ticket.id) {
                Some(record) => {
                    if !record.accepts(&ticket, outcome.is_ok()) {
                        tracing::debug!("Discarding stale result #{} for {}", ticket.seq, ticket.id);
                    }
                    record.apply(&ticket, outcome, Utc::now())
                }
                None => PropertySet::EMPTY,
            };
            publish_changed(&ticket.id, changed);
            if affects_hash(changed) {
                hash.dirty = true;
            }
            let _ = reply.send(changed);
        }
        DirectoryCommand::Abandon(tickets, reply) => {
            for ticket in tickets {
                if let Some(record) = directory.get_mut(&ticket.id) {
                    let changed = record.abandon(&ticket);
                    publish_changed(&ticket.id, changed);
                    hash.dirty |= affects_hash(changed);
                }
            }
            let _ = reply.send(());
        }
        DirectoryCommand::Modify(id, mutation, reply) => {
            let result = match directory.get_mut(&id) {
                Some(record) => {
                    let changed = apply_mutation(record, mutation);
                    publish_changed(&id, changed);
                    Ok((record.clone(), changed))
                }
                None => Err(DirectoryError::NotFound(id)),
            };
            let result = result.map(|(record, changed)| {
                if affects_hash(changed) {
                    hash.dirty = true;
                }
                record
            });
            let _ = reply.send(result);
        }
        DirectoryCommand::DueForRefresh { ids, now, policy, reply } => {
            let mut due = Vec::new();
            for id in ids {
                if let Some(record) = directory.get_mut(&id) {
                    if let Some(reason) = record.refresh_due(now, &policy) {
                        if reason == RefreshReason::SessionEnded {
                            record.mark_end_refresh(now);
                        }
                        due.push((id, reason));
                    }
                }
            }
            let _ = reply.send(due);
        }
        DirectoryCommand::Get(id, reply) => {
            let _ = reply.send(directory.get(&id).cloned());
        }
        DirectoryCommand::Snapshot(reply) => {
            let _ = reply.send(directory.records().to_vec());
        }
        DirectoryCommand::Hash(reply) => {
            let _ = reply.send(hash.get(directory));
        }
    }
}

fn apply_mutation(record: &mut ServerRecord, mutation: Mutation) -> PropertySet {
    match mutation {
        Mutation::SetBooking(booking) if record.booking != booking => {
            record.booking = booking;
            Property::Booking.into()
        }
        Mutation::SetFavourite(favourite) if record.favourite != favourite => {
            record.favourite = favourite;
            Property::Favourite.into()
        }
        Mutation::SetJoined(joined) if record.joined != joined => {
            record.joined = joined;
            Property::Joined.into()
        }
        Mutation::SelectCar { car, skin } if record.selected_car != car || record.selected_skin != skin => {
            record.selected_car = car;
            record.selected_skin = skin;
            Property::Selection.into()
        }
        _ => PropertySet::EMPTY,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use shared::types::{CarEntry, Status};
    use crate::discovery::DiscoveredServer;

    fn report(current: u32) -> ProbeReport {
        ProbeReport {
            name: "Test".to_string(),
            capacity: 10,
            current_drivers: current,
            cars: vec![CarEntry { id: "ks_abarth500".to_string(), total: 10, used: None }],
            drivers: None,
            session: None,
            track_id: None,
            has_password: false,
            ping_ms: 30,
        }
    }

    async fn seeded(addrs: &[&str]) -> DirectoryHandle {
        let handle = DirectoryHandle::spawn();
        handle
            .merge(ScanBatch {
                servers: addrs
                    .iter()
                    .map(|a| DiscoveredServer::new(a.parse().unwrap(), None, SourceKind::Master))
                    .collect(),
                answered: BTreeSet::from([SourceKind::Master]),
            })
            .await
            .unwrap();
        handle
    }

    #[tokio::test]
    async fn test_apply_publishes_changed_properties() {
        let handle = seeded(&["10.0.0.1:9600"]).await;
        let mut events = handle.subscribe();
        let id = ServerId::from("10.0.0.1:9600");

        let ticket = handle.begin_update(id.clone(), UpdateMode::Normal).await.unwrap().unwrap();
        let hash_before = handle.hash().await.unwrap();
        handle.apply(ticket, Ok(report(4))).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first, DirectoryEvent::Changed { id: id.clone(), properties: Property::Status.into() });
        match events.recv().await.unwrap() {
            DirectoryEvent::Changed { properties, .. } => {
                assert!(properties.contains(Property::CurrentDrivers));
                assert!(properties.contains(Property::Ping));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_ne!(handle.hash().await.unwrap(), hash_before);

        let record = handle.get(id).await.unwrap().unwrap();
        assert_eq!(record.status, Status::Ready);
        assert_eq!(record.live.current_drivers, 4);
    }

    #[tokio::test]
    async fn test_hash_tracks_listed_fields_not_ping() {
        let handle = seeded(&["10.0.0.1:9600"]).await;
        let id = ServerId::from("10.0.0.1:9600");
        let ticket = handle.begin_update(id.clone(), UpdateMode::Normal).await.unwrap().unwrap();
        handle.apply(ticket, Ok(report(2))).await.unwrap();
        let settled = handle.hash().await.unwrap();
        assert_eq!(handle.hash().await.unwrap(), settled);

        let ticket = handle.begin_update(id.clone(), UpdateMode::Normal).await.unwrap().unwrap();
        let mut faster = report(2);
        faster.ping_ms = 5;
        let changed = handle.apply(ticket, Ok(faster)).await.unwrap();
        assert!(changed.contains(Property::Ping));
        assert_eq!(handle.hash().await.unwrap(), settled);

        let ticket = handle.begin_update(id, UpdateMode::Normal).await.unwrap().unwrap();
        handle.apply(ticket, Ok(report(3))).await.unwrap();
        assert_ne!(handle.hash().await.unwrap(), settled);
    }

    #[tokio::test]
    async fn test_failed_record_is_due_again_after_staleness_window() {
        let handle = seeded(&["10.0.0.1:9600"]).await;
        let id = ServerId::from("10.0.0.1:9600");
        let ticket = handle.begin_update(id.clone(), UpdateMode::Normal).await.unwrap().unwrap();
        handle.apply(ticket, Err(ErrorReason::Timeout)).await.unwrap();

        let now = Utc::now();
        let policy = RefreshPolicy::default();
        let due = handle.due_for_refresh(vec![id.clone()], now, policy).await.unwrap();
        assert!(due.is_empty());
        let later = now + chrono::Duration::seconds(10);
        let due = handle.due_for_refresh(vec![id.clone()], later, policy).await.unwrap();
        assert_eq!(due, vec![(id, RefreshReason::Periodic)]);
    }

    #[tokio::test]
    async fn test_begin_update_for_unknown_record() {
        let handle = seeded(&[]).await;
        let ticket = handle.begin_update(ServerId::from("1.2.3.4:1"), UpdateMode::Full).await.unwrap();
        assert!(ticket.is_none());
    }

    #[tokio::test]
    async fn test_modify_unknown_record_is_not_found() {
        let handle = seeded(&[]).await;
        let err = handle
            .modify(ServerId::from("1.2.3.4:1"), Mutation::SetFavourite(true))
            .await
            .unwrap_err();
        assert!(matches!(err, DirectoryError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_due_for_refresh_lists_unloaded_records() {
        let handle = seeded(&["10.0.0.1:9600", "10.0.0.2:9600"]).await;
        let ids = vec![ServerId::from("10.0.0.1:9600"), ServerId::from("10.0.0.9:9600")];
        let due = handle.due_for_refresh(ids, Utc::now(), RefreshPolicy::default()).await.unwrap();
        assert_eq!(due, vec![(ServerId::from("10.0.0.1:9600"), RefreshReason::Initial)]);
    }
}
