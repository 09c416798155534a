//! Discovery and refresh orchestration on top of the directory actor.
//!
//! At most one scan and one sweep run at a time; starting either cancels
//! the one in flight. Records watched by detail views and auto-join
//! sessions are refreshed on every tick once they are due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use shared::record::RefreshPolicy;
use shared::types::{Booking, ServerId, ServerRecord, UpdateMode};
use crate::autojoin;
use crate::config::DirectoryConfig;
use crate::content::ContentCatalog;
use crate::directory::{DirectoryEvent, DirectoryHandle, MergeSummary, Mutation, ScanBatch};
use crate::discovery::DiscoverySource;
use crate::engine::{RefreshEngine, SweepSummary};
use crate::error::{DirectoryError, ProbeError};
use crate::filter::{CombinedFilter, FilterContext};
use crate::launcher::{LaunchOutcome, Launcher, StartDescriptor};
use crate::probe::Booker;
use crate::store_manager::StoreHandle;

/// Aggregate progress published to observers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DirectoryStatus {
    /// A scan is running.
    pub background_loading: bool,
    /// A sweep is running.
    pub pinging: bool,
    /// Probe results applied since start. Never decreases.
    pub pinged: u64,
    pub sweep_total: usize,
    pub sweep_done: usize,
    pub total: usize,
    pub last_scan_error: Option<String>,
}

pub struct Collaborators {
    pub booker: Arc<dyn Booker>,
    pub launcher: Arc<dyn Launcher>,
    pub catalog: Arc<dyn ContentCatalog>,
    pub store: StoreHandle,
}

pub struct ManagerOptions {
    pub driver_name: String,
    pub policy: RefreshPolicy,
}

pub struct DirectoryManager {
    directory: DirectoryHandle,
    engine: RefreshEngine,
    sources: Vec<Box<dyn DiscoverySource>>,
    booker: Arc<dyn Booker>,
    launcher: Arc<dyn Launcher>,
    catalog: Arc<dyn ContentCatalog>,
    store: StoreHandle,
    options: ManagerOptions,
    status: watch::Sender<DirectoryStatus>,
    scan_token: Mutex<Option<CancellationToken>>,
    scan_running: Mutex<()>,
    sweep_token: Mutex<Option<CancellationToken>>,
    sweep_running: Mutex<()>,
    /// Reference counts of records that get refreshed on the tick.
    watched: Mutex<HashMap<ServerId, usize>>,
    autojoins: Mutex<HashMap<ServerId, (u64, CancellationToken)>>,
    autojoin_seq: AtomicU64,
    shutdown: CancellationToken,
}

/// Cancel whatever token sits in `slot` and install a fresh child of `parent`.
async fn replace_token(slot: &Mutex<Option<CancellationToken>>, parent: &CancellationToken) -> CancellationToken {
    let token = parent.child_token();
    if let Some(previous) = slot.lock().await.replace(token.clone()) {
        previous.cancel();
    }
    token
}

fn booking_error(e: ProbeError) -> DirectoryError {
    match e {
        ProbeError::Protocol(message) => DirectoryError::BookingRejected(message),
        other => DirectoryError::Probe(other),
    }
}

/// Log a background operation's result. Cancellation is expected.
fn log_outcome<T>(what: &str, result: Result<T, DirectoryError>) {
    match result {
        Ok(_) => {}
        Err(DirectoryError::Cancelled) => tracing::debug!("{} cancelled", what),
        Err(e) => tracing::warn!("{} failed: {}", what, e),
    }
}

impl DirectoryManager {
    pub fn new(
        directory: DirectoryHandle,
        engine: RefreshEngine,
        sources: Vec<Box<dyn DiscoverySource>>,
        collaborators: Collaborators,
        options: ManagerOptions,
        shutdown: CancellationToken,
    ) -> Self {
        let (status, _) = watch::channel(DirectoryStatus::default());
        Self {
            directory,
            engine,
            sources,
            booker: collaborators.booker,
            launcher: collaborators.launcher,
            catalog: collaborators.catalog,
            store: collaborators.store,
            options,
            status,
            scan_token: Mutex::new(None),
            scan_running: Mutex::new(()),
            sweep_token: Mutex::new(None),
            sweep_running: Mutex::new(()),
            watched: Mutex::new(HashMap::new()),
            autojoins: Mutex::new(HashMap::new()),
            autojoin_seq: AtomicU64::new(0),
            shutdown,
        }
    }

    pub fn directory(&self) -> &DirectoryHandle {
        &self.directory
    }

    pub fn status(&self) -> watch::Receiver<DirectoryStatus> {
        self.status.subscribe()
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    pub fn policy(&self) -> RefreshPolicy {
        self.options.policy
    }

    pub fn filter_context(&self) -> FilterContext<'_> {
        FilterContext {
            catalog: Some(self.catalog.as_ref()),
        }
    }

    async fn require(&self, id: &ServerId) -> Result<ServerRecord, DirectoryError> {
        self.directory
            .get(id.clone())
            .await?
            .ok_or_else(|| DirectoryError::NotFound(id.clone()))
    }

    /// Query every source and merge the answers as one batch.
    ///
    /// Sources that fail are reported through `ScanFailed` events and their
    /// records are kept. Fails with `SourceUnavailable` only when no source
    /// answered.
    pub async fn scan(&self) -> Result<MergeSummary, DirectoryError> {
        let cancel = replace_token(&self.scan_token, &self.shutdown).await;
        let _running = self.scan_running.lock().await;
        if cancel.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }

        self.status.send_modify(|s| s.background_loading = true);
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(DirectoryError::Cancelled),
            result = self.collect_and_merge() => result,
        };

        self.status.send_modify(|s| {
            s.background_loading = false;
            match &result {
                Ok(summary) => {
                    s.total = summary.total;
                    s.last_scan_error = None;
                }
                Err(DirectoryError::Cancelled) => {}
                Err(e) => s.last_scan_error = Some(e.to_string()),
            }
        });
        result
    }

    async fn collect_and_merge(&self) -> Result<MergeSummary, DirectoryError> {
        let fetches = self
            .sources
            .iter()
            .map(|source| async move { (source.kind(), source.fetch().await) });
        let results = join_all(fetches).await;

        let mut batch = ScanBatch::default();
        let mut failures = Vec::new();
        for (kind, result) in results {
            match result {
                Ok(servers) => {
                    tracing::debug!("{} source returned {} servers", kind, servers.len());
                    batch.answered.insert(kind);
                    batch.servers.extend(servers);
                }
                Err(e) => {
                    tracing::warn!("{}", e);
                    self.directory.publish(DirectoryEvent::ScanFailed {
                        source: kind,
                        message: e.message.clone(),
                    });
                    failures.push(e.to_string());
                }
            }
        }

        if batch.answered.is_empty() && !failures.is_empty() {
            return Err(DirectoryError::SourceUnavailable(failures.join("; ")));
        }

        let summary = self.directory.merge(batch).await?;
        tracing::info!(
            "Scan complete: {} servers ({} new, {} gone)",
            summary.total,
            summary.added.len(),
            summary.removed.len()
        );
        Ok(summary)
    }

    /// Probe every record that currently passes `filter`.
    pub async fn ping_everything(
        &self,
        filter: &CombinedFilter,
        cancel: &CancellationToken,
    ) -> Result<SweepSummary, DirectoryError> {
        let token = replace_token(&self.sweep_token, cancel).await;
        let _running = self.sweep_running.lock().await;
        if token.is_cancelled() {
            return Err(DirectoryError::Cancelled);
        }

        let records = self.directory.snapshot().await?;
        let ctx = self.filter_context();
        let targets: Vec<ServerId> = records
            .iter()
            .filter(|r| filter.test(r, &ctx))
            .map(|r| r.id.clone())
            .collect();
        tracing::debug!("Sweeping {} of {} servers", targets.len(), records.len());

        let summary = self
            .engine
            .sweep(&self.directory, targets, UpdateMode::Normal, &token, Some(&self.status))
            .await?;
        tracing::debug!(
            "Sweep done: {} probed, {} failed, {} skipped",
            summary.completed,
            summary.failed,
            summary.skipped
        );
        Ok(summary)
    }

    /// Probe a single record now.
    pub async fn update(&self, id: &ServerId, mode: UpdateMode) -> Result<ServerRecord, DirectoryError> {
        let summary = self
            .engine
            .sweep(&self.directory, vec![id.clone()], mode, &self.shutdown.child_token(), None)
            .await?;
        if summary.skipped > 0 {
            return Err(DirectoryError::NotFound(id.clone()));
        }
        self.require(id).await
    }

    pub async fn watch(&self, id: &ServerId) {
        *self.watched.lock().await.entry(id.clone()).or_insert(0) += 1;
    }

    pub async fn unwatch(&self, id: &ServerId) {
        let mut watched = self.watched.lock().await;
        if let Some(count) = watched.get_mut(id) {
            *count -= 1;
            if *count == 0 {
                watched.remove(id);
            }
        }
    }

    /// Full refresh of every watched record that is due.
    pub async fn refresh_watched(&self) -> Result<(), DirectoryError> {
        let ids: Vec<ServerId> = self.watched.lock().await.keys().cloned().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let due = self
            .directory
            .due_for_refresh(ids, Utc::now(), self.options.policy)
            .await?;
        if due.is_empty() {
            return Ok(());
        }
        for (id, reason) in &due {
            tracing::debug!("Refreshing {} ({:?})", id, reason);
        }
        let targets = due.into_iter().map(|(id, _)| id).collect();
        self.engine
            .sweep(&self.directory, targets, UpdateMode::Full, &self.shutdown.child_token(), None)
            .await?;
        Ok(())
    }

    pub async fn set_favourite(&self, id: &ServerId, favourite: bool) -> Result<ServerRecord, DirectoryError> {
        let record = self.directory.modify(id.clone(), Mutation::SetFavourite(favourite)).await?;
        let persisted = async {
            self.store.save_server(record.address, Some(record.display_name.clone())).await?;
            self.store.set_favourite(record.address, favourite).await
        };
        if let Err(e) = persisted.await {
            tracing::error!("Failed to persist favourite for {}: {}", id, e);
        }
        Ok(record)
    }

    pub async fn select_car(
        &self,
        id: &ServerId,
        car: Option<String>,
        skin: Option<String>,
    ) -> Result<ServerRecord, DirectoryError> {
        self.directory.modify(id.clone(), Mutation::SelectCar { car, skin }).await
    }

    /// Reserve a slot. The record stays watched until the booking is used
    /// or cancelled.
    pub async fn book(&self, id: &ServerId, car: String, skin: Option<String>) -> Result<ServerRecord, DirectoryError> {
        let record = self.require(id).await?;
        let time_left = self
            .booker
            .book(record.address, &car, skin.as_deref(), &self.options.driver_name)
            .await
            .map_err(booking_error)?;
        let expires_at = Utc::now() + chrono::Duration::from_std(time_left).unwrap_or_else(|_| chrono::Duration::zero());

        self.directory
            .modify(id.clone(), Mutation::SelectCar { car: Some(car.clone()), skin: skin.clone() })
            .await?;
        let was_booked = record.is_booked();
        let record = self
            .directory
            .modify(id.clone(), Mutation::SetBooking(Some(Booking { car_id: car, skin_id: skin, expires_at })))
            .await?;
        if !was_booked {
            self.watch(id).await;
        }
        tracing::info!("Booked {} on {} for {:?}", record.selected_car.as_deref().unwrap_or("?"), id, time_left);
        Ok(record)
    }

    pub async fn cancel_booking(&self, id: &ServerId) -> Result<ServerRecord, DirectoryError> {
        let record = self.require(id).await?;
        if !record.is_booked() {
            return Ok(record);
        }
        if let Err(e) = self.booker.unbook(record.address, &self.options.driver_name).await {
            tracing::warn!("Failed to cancel booking on {}: {}", id, e);
        }
        self.release_booking(id).await
    }

    async fn release_booking(&self, id: &ServerId) -> Result<ServerRecord, DirectoryError> {
        let record = self.directory.modify(id.clone(), Mutation::SetBooking(None)).await?;
        self.unwatch(id).await;
        Ok(record)
    }

    /// Hand a start descriptor to the launcher and wait for the game to exit.
    ///
    /// Without an explicit `car` the booked car is used, then the selected
    /// car, then the first car with a free slot.
    pub async fn join(
        &self,
        id: &ServerId,
        car: Option<String>,
        password: Option<String>,
    ) -> Result<LaunchOutcome, DirectoryError> {
        let record = self.require(id).await?;
        let (car_id, skin_id) = car
            .map(|car| {
                let skin = record.selected_skin.clone().filter(|_| record.selected_car.as_ref() == Some(&car));
                (car, skin)
            })
            .or_else(|| car_for_join(&record))
            .ok_or_else(|| DirectoryError::NoCarAvailable(id.clone()))?;

        let descriptor = StartDescriptor {
            car_id,
            skin_id,
            track_id: record.live.track_id.clone(),
            server: record.address,
            password,
            driver_name: self.options.driver_name.clone(),
        };

        self.directory.modify(id.clone(), Mutation::SetJoined(true)).await?;
        let remembered = async {
            self.store.save_server(record.address, Some(record.display_name.clone())).await?;
            self.store.mark_joined(record.address, Utc::now()).await
        };
        if let Err(e) = remembered.await {
            tracing::error!("Failed to remember {} as recent: {}", id, e);
        }

        tracing::info!("Joining {} with {}", id, descriptor.car_id);
        let outcome = self.launcher.start(descriptor).await;
        tracing::info!("Session on {} ended: {:?}", id, outcome);

        self.directory.modify(id.clone(), Mutation::SetJoined(false)).await?;
        if record.is_booked() {
            self.release_booking(id).await?;
        }
        Ok(outcome)
    }

    /// Start an auto-join session, replacing any armed one for the record.
    pub async fn arm_autojoin(
        self: &Arc<Self>,
        id: &ServerId,
        any_car: bool,
        password: Option<String>,
    ) -> Result<(), DirectoryError> {
        self.require(id).await?;
        let seq = self.autojoin_seq.fetch_add(1, Ordering::Relaxed);
        let token = self.shutdown.child_token();
        if let Some((_, previous)) = self.autojoins.lock().await.insert(id.clone(), (seq, token.clone())) {
            previous.cancel();
        }

        let manager = self.clone();
        let id = id.clone();
        tokio::spawn(async move {
            autojoin::run_session(&manager, &id, any_car, password, &token).await;
            let mut sessions = manager.autojoins.lock().await;
            if sessions.get(&id).is_some_and(|(current, _)| *current == seq) {
                sessions.remove(&id);
            }
        });
        Ok(())
    }

    /// Returns false when nothing was armed.
    pub async fn disarm_autojoin(&self, id: &ServerId) -> bool {
        match self.autojoins.lock().await.remove(id) {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn autojoin_armed(&self, id: &ServerId) -> bool {
        self.autojoins.lock().await.contains_key(id)
    }

    /// Periodic scans, sweeps and watched-record refreshes until shutdown.
    pub async fn run(self: Arc<Self>, config: DirectoryConfig) {
        let sweep_period = Duration::from_secs(config.sweep_interval_secs.max(1));
        let mut scan_interval = interval(Duration::from_secs(config.scan_interval_secs.max(1)));
        let mut sweep_interval = interval_at(Instant::now() + sweep_period, sweep_period);
        let mut tick = interval(Duration::from_secs(config.refresh_tick_secs.max(1)));
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = scan_interval.tick() => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        match manager.scan().await {
                            Ok(_) => {
                                let cancel = manager.shutdown.clone();
                                log_outcome("Sweep", manager.ping_everything(&CombinedFilter::default(), &cancel).await);
                            }
                            Err(e) => log_outcome("Scan", Err::<(), _>(e)),
                        }
                    });
                }
                _ = sweep_interval.tick() => {
                    let manager = self.clone();
                    tokio::spawn(async move {
                        let cancel = manager.shutdown.clone();
                        log_outcome("Sweep", manager.ping_everything(&CombinedFilter::default(), &cancel).await);
                    });
                }
                _ = tick.tick() => {
                    log_outcome("Watched refresh", self.refresh_watched().await);
                }
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Directory manager shutting down");
                    break;
                }
            }
        }
    }
}

/// Booked car, then selected car, then the first car with a free slot.
fn car_for_join(record: &ServerRecord) -> Option<(String, Option<String>)> {
    if let Some(booking) = &record.booking {
        return Some((booking.car_id.clone(), booking.skin_id.clone()));
    }
    if let Some(car) = &record.selected_car {
        return Some((car.clone(), record.selected_skin.clone()));
    }
    record
        .live
        .cars
        .iter()
        .find(|car| car.free_slots() > 0)
        .map(|car| (car.id.clone(), None))
}
