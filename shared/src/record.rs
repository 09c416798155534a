//! Per-record update state machine.
//!
//! `Unloaded -> Loading -> {Ready | Error}`, and back to `Loading` from either
//! terminal-looking state on the next refresh. Probe results carry the
//! sequence number handed out by [`ServerRecord::begin_update`]; the record
//! decides whether a late result still counts.

use std::net::SocketAddr;
use chrono::{DateTime, Duration, Utc};
use crate::types::{
    CarEntry, ErrorReason, LiveState, ProbeReport, ServerId, ServerRecord, Status, UpdateMode,
};

/// A record property observers can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Property {
    Status = 1 << 0,
    DisplayName = 1 << 1,
    CurrentDrivers = 1 << 2,
    ConnectedDrivers = 1 << 3,
    Capacity = 1 << 4,
    Cars = 1 << 5,
    Ping = 1 << 6,
    Session = 1 << 7,
    Track = 1 << 8,
    Password = 1 << 9,
    Booking = 1 << 10,
    Favourite = 1 << 11,
    Joined = 1 << 12,
    Selection = 1 << 13,
}

/// Small bit set of [`Property`] values.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PropertySet(u32);

impl PropertySet {
    pub const EMPTY: PropertySet = PropertySet(0);
    pub const ALL: PropertySet = PropertySet((1 << 14) - 1);

    pub const fn of(props: &[Property]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < props.len() {
            bits |= props[i] as u32;
            i += 1;
        }
        Self(bits)
    }

    pub fn insert(&mut self, prop: Property) {
        self.0 |= prop as u32;
    }

    pub fn contains(self, prop: Property) -> bool {
        self.0 & prop as u32 != 0
    }

    pub fn intersects(self, other: PropertySet) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: PropertySet) -> PropertySet {
        PropertySet(self.0 | other.0)
    }

    pub fn without(self, prop: Property) -> PropertySet {
        PropertySet(self.0 & !(prop as u32))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl From<Property> for PropertySet {
    fn from(prop: Property) -> Self {
        PropertySet(prop as u32)
    }
}

/// Handed out when a probe starts; returned with its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateTicket {
    pub id: ServerId,
    pub address: SocketAddr,
    pub seq: u64,
    pub mode: UpdateMode,
}

/// When a `Ready` or failed record is due for another probe.
#[derive(Debug, Clone, Copy)]
pub struct RefreshPolicy {
    pub stale_after: Duration,
    pub session_end_cooldown: Duration,
}

impl Default for RefreshPolicy {
    fn default() -> Self {
        Self {
            stale_after: Duration::seconds(5),
            session_end_cooldown: Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// Never probed.
    Initial,
    /// The running session's scheduled end has passed.
    SessionEnded,
    /// Last update is older than the staleness window.
    Periodic,
}

impl ServerRecord {
    /// Move the record into `Loading` and allocate the next sequence number.
    pub fn begin_update(&mut self, mode: UpdateMode) -> (UpdateTicket, PropertySet) {
        let mut changed = PropertySet::EMPTY;
        if self.status != Status::Loading {
            self.updates.status_before_loading = Some(self.status);
            self.status = Status::Loading;
            changed.insert(Property::Status);
        }
        self.updates.in_flight += 1;
        self.updates.next_seq += 1;

        let ticket = UpdateTicket {
            id: self.id.clone(),
            address: self.address,
            seq: self.updates.next_seq,
            mode,
        };
        (ticket, changed)
    }

    /// Whether a result for `ticket` may still replace the record's state.
    ///
    /// Newer results win. A successful full result additionally wins over
    /// an overlapping normal one even when it completes later; a failed one
    /// never overrides fresher data.
    pub fn accepts(&self, ticket: &UpdateTicket, succeeded: bool) -> bool {
        let u = &self.updates;
        if ticket.seq > u.applied_seq {
            return true;
        }
        succeeded
            && ticket.mode == UpdateMode::Full
            && u.applied_mode == Some(UpdateMode::Normal)
            && ticket.seq > u.applied_full_seq
    }

    /// Apply a finished probe. Returns the properties that changed.
    pub fn apply(
        &mut self,
        ticket: &UpdateTicket,
        outcome: Result<ProbeReport, ErrorReason>,
        now: DateTime<Utc>,
    ) -> PropertySet {
        self.updates.in_flight = self.updates.in_flight.saturating_sub(1);

        let outcome = outcome.and_then(|report| {
            if report.current_drivers > report.capacity || report.capacity == 0 {
                Err(ErrorReason::Protocol)
            } else {
                Ok(report)
            }
        });

        if ticket.seq > self.updates.next_seq || !self.accepts(ticket, outcome.is_ok()) {
            return self.settle_loading();
        }

        let old_status = self.status;
        let old_error = self.error;
        let old_name = self.display_name.clone();

        let mut changed = match outcome {
            Ok(report) => {
                self.display_name = report.name.clone();
                let live = self.merge_report(report, ticket.mode);
                self.status = Status::Ready;
                self.error = None;
                let changed = live_changes(&self.live, &live);
                self.live = live;
                changed
            }
            Err(reason) => {
                self.status = Status::Error;
                self.error = Some(reason);
                PropertySet::EMPTY
            }
        };

        self.updates.applied_seq = self.updates.applied_seq.max(ticket.seq);
        if ticket.mode == UpdateMode::Full {
            self.updates.applied_full_seq = self.updates.applied_full_seq.max(ticket.seq);
        }
        self.updates.applied_mode = Some(ticket.mode);
        self.updates.last_update = Some(now);
        if self.updates.in_flight == 0 {
            self.updates.status_before_loading = None;
        }

        if self.status != old_status || self.error != old_error {
            changed.insert(Property::Status);
        }
        if self.display_name != old_name {
            changed.insert(Property::DisplayName);
        }
        changed
    }

    /// Drop an in-flight probe whose result will never arrive.
    pub fn abandon(&mut self, ticket: &UpdateTicket) -> PropertySet {
        if ticket.seq > self.updates.next_seq {
            return PropertySet::EMPTY;
        }
        self.updates.in_flight = self.updates.in_flight.saturating_sub(1);
        self.settle_loading()
    }

    /// Decide whether the record should be probed again.
    pub fn refresh_due(&self, now: DateTime<Utc>, policy: &RefreshPolicy) -> Option<RefreshReason> {
        match self.status {
            Status::Unloaded => return Some(RefreshReason::Initial),
            Status::Loading => return None,
            Status::Error => return self.stale(now, policy),
            Status::Ready => {}
        }

        let session_ended = self
            .live
            .session
            .as_ref()
            .and_then(|s| s.ends_at)
            .is_some_and(|ends_at| ends_at <= now);
        if session_ended {
            let cooled_down = self
                .updates
                .last_end_refresh
                .map_or(true, |last| now - last >= policy.session_end_cooldown);
            if cooled_down {
                return Some(RefreshReason::SessionEnded);
            }
        }

        self.stale(now, policy)
    }

    fn stale(&self, now: DateTime<Utc>, policy: &RefreshPolicy) -> Option<RefreshReason> {
        match self.updates.last_update {
            Some(last) if now - last <= policy.stale_after => None,
            _ => Some(RefreshReason::Periodic),
        }
    }

    pub fn mark_end_refresh(&mut self, now: DateTime<Utc>) {
        self.updates.last_end_refresh = Some(now);
    }

    fn settle_loading(&mut self) -> PropertySet {
        if self.updates.in_flight == 0 && self.status == Status::Loading {
            self.status = self
                .updates
                .status_before_loading
                .take()
                .unwrap_or(Status::Unloaded);
            return Property::Status.into();
        }
        PropertySet::EMPTY
    }

    /// Build the replacement live state. A normal probe keeps the roster
    /// gathered by an earlier full query.
    fn merge_report(&self, report: ProbeReport, mode: UpdateMode) -> LiveState {
        let (drivers, connected_drivers, cars) = match (mode, report.drivers) {
            (UpdateMode::Full, Some(drivers)) => {
                let connected = drivers.len() as u32;
                (drivers, Some(connected), report.cars)
            }
            _ => {
                let cars = report
                    .cars
                    .into_iter()
                    .map(|car| {
                        let used = car.used.or_else(|| self.known_usage(&car.id));
                        CarEntry { used, ..car }
                    })
                    .collect();
                (self.live.drivers.clone(), self.live.connected_drivers, cars)
            }
        };

        LiveState {
            current_drivers: report.current_drivers,
            connected_drivers,
            capacity: report.capacity,
            cars,
            drivers,
            ping_ms: Some(report.ping_ms),
            session: report.session,
            track_id: report.track_id,
            has_password: report.has_password,
        }
    }

    fn known_usage(&self, car_id: &str) -> Option<u32> {
        self.live
            .cars
            .iter()
            .find(|c| c.id == car_id)
            .and_then(|c| c.used)
    }
}

/// Fields that differ between two live states.
pub fn live_changes(old: &LiveState, new: &LiveState) -> PropertySet {
    let mut changed = PropertySet::EMPTY;
    if old.current_drivers != new.current_drivers {
        changed.insert(Property::CurrentDrivers);
    }
    if old.connected_drivers != new.connected_drivers || old.drivers != new.drivers {
        changed.insert(Property::ConnectedDrivers);
    }
    if old.capacity != new.capacity {
        changed.insert(Property::Capacity);
    }
    if old.cars != new.cars {
        changed.insert(Property::Cars);
    }
    if old.ping_ms != new.ping_ms {
        changed.insert(Property::Ping);
    }
    if old.session != new.session {
        changed.insert(Property::Session);
    }
    if old.track_id != new.track_id {
        changed.insert(Property::Track);
    }
    if old.has_password != new.has_password {
        changed.insert(Property::Password);
    }
    changed
}
