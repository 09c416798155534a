use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Stable record identity, derived from the server's query address ("ip:port").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(String);

impl ServerId {
    pub fn from_addr(addr: SocketAddr) -> Self {
        Self(addr.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Liveness of a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Unloaded,
    Loading,
    Ready,
    Error,
}

/// Why the last probe failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorReason {
    Timeout,
    Unreachable,
    Protocol,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionType {
    Booking,
    Practice,
    Qualification,
    Race,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionInfo {
    pub kind: SessionType,
    /// Scheduled end of the running session, if the server reports one.
    pub ends_at: Option<DateTime<Utc>>,
}

/// One car model offered by a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarEntry {
    pub id: String,
    /// Slots configured for this car.
    pub total: u32,
    /// Slots taken. Only known after a full query.
    pub used: Option<u32>,
}

impl CarEntry {
    /// Free slots for this car. Without roster data every slot counts as free.
    pub fn free_slots(&self) -> u32 {
        self.total.saturating_sub(self.used.unwrap_or(0))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverEntry {
    pub name: String,
    pub car_id: String,
}

/// Everything a probe reports about a server. Replaced as a whole, never
/// field by field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveState {
    pub current_drivers: u32,
    /// Drivers counted from the full roster. `None` until a full query.
    pub connected_drivers: Option<u32>,
    pub capacity: u32,
    pub cars: Vec<CarEntry>,
    pub drivers: Vec<DriverEntry>,
    /// Round-trip time in milliseconds. `None` until a probe succeeds.
    pub ping_ms: Option<u32>,
    pub session: Option<SessionInfo>,
    pub track_id: Option<String>,
    pub has_password: bool,
}

/// A reserved slot on a server ahead of session start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub car_id: String,
    pub skin_id: Option<String>,
    pub expires_at: DateTime<Utc>,
}

/// Where a server was discovered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Master,
    Saved,
    Lan,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SourceKind::Master => "master",
            SourceKind::Saved => "saved",
            SourceKind::Lan => "lan",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateMode {
    /// Ping plus basic counters.
    Normal,
    /// Normal plus the driver and car roster.
    Full,
}

/// Field set produced by one successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReport {
    pub name: String,
    pub capacity: u32,
    pub current_drivers: u32,
    pub cars: Vec<CarEntry>,
    /// Present only for full queries.
    pub drivers: Option<Vec<DriverEntry>>,
    pub session: Option<SessionInfo>,
    pub track_id: Option<String>,
    pub has_password: bool,
    pub ping_ms: u32,
}

/// Bookkeeping for in-flight and applied probes on one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateState {
    pub next_seq: u64,
    pub applied_seq: u64,
    pub applied_full_seq: u64,
    pub applied_mode: Option<UpdateMode>,
    pub in_flight: u32,
    pub status_before_loading: Option<Status>,
    pub last_update: Option<DateTime<Utc>>,
    pub last_end_refresh: Option<DateTime<Utc>>,
}

/// A discovered server and its mutable live state.
/// This is the canonical data model shared by the directory, the views and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub id: ServerId,
    pub address: SocketAddr,
    pub display_name: String,
    pub status: Status,
    pub error: Option<ErrorReason>,
    pub live: LiveState,
    pub booking: Option<Booking>,
    pub selected_car: Option<String>,
    pub selected_skin: Option<String>,
    pub favourite: bool,
    /// Set while a join is being handed to the launcher.
    pub joined: bool,
    pub origins: BTreeSet<SourceKind>,
    #[serde(skip)]
    pub updates: UpdateState,
}

impl ServerRecord {
    pub fn new(address: SocketAddr, display_name: Option<String>, source: SourceKind) -> Self {
        Self {
            id: ServerId::from_addr(address),
            address,
            display_name: display_name.unwrap_or_else(|| address.to_string()),
            status: Status::Unloaded,
            error: None,
            live: LiveState::default(),
            booking: None,
            selected_car: None,
            selected_skin: None,
            favourite: false,
            joined: false,
            origins: BTreeSet::from([source]),
            updates: UpdateState::default(),
        }
    }

    pub fn is_full(&self) -> bool {
        self.live.capacity > 0 && self.live.current_drivers >= self.live.capacity
    }

    pub fn has_errors(&self) -> bool {
        self.status == Status::Error
    }

    pub fn is_booked(&self) -> bool {
        self.booking.is_some()
    }

    /// Remaining booking time, zero once it has run out.
    pub fn booking_time_left(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.booking
            .as_ref()
            .map(|b| (b.expires_at - now).max(chrono::Duration::zero()))
    }
}
