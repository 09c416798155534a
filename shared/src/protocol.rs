use serde::{Serialize, Deserialize};
use crate::types::{CarEntry, DriverEntry, SessionInfo};

/// mDNS service type game servers advertise on the local network
pub const LAN_SERVICE_TYPE: &str = "_acserver._udp.local.";

/// TXT record key carrying the server's display name
pub const TXT_NAME: &str = "name";

/// Largest datagram a probe response may occupy
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Request datagram sent to a server's query port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProbeRequest {
    /// Basic counters only.
    Ping,
    /// Counters plus driver roster and per-car slot usage.
    Query,
    Book {
        car: String,
        skin: Option<String>,
        driver: String,
    },
    Unbook {
        driver: String,
    },
}

/// Reply to `Ping` and `Query`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeResponse {
    pub name: String,
    pub capacity: u32,
    pub clients: u32,
    #[serde(default)]
    pub cars: Vec<CarEntry>,
    #[serde(default)]
    pub drivers: Option<Vec<DriverEntry>>,
    #[serde(default)]
    pub session: Option<SessionInfo>,
    #[serde(default)]
    pub track: Option<String>,
    #[serde(default)]
    pub password: bool,
}

/// Reply to `Book` and `Unbook`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BookingResponse {
    pub ok: bool,
    /// Seconds until the reserved slot has to be taken.
    #[serde(default)]
    pub time_left_secs: u64,
    #[serde(default)]
    pub message: Option<String>,
}
