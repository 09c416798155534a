//! Record filters: the user-typed expression, the quick-filter toggles and
//! their conjunction.

pub mod parser;
pub mod quick;

use shared::record::{Property, PropertySet};
use shared::types::{ServerRecord, SessionType, Status};
use crate::content::{missing_content, ContentCatalog};
pub use parser::{parse, ParseError};
pub use quick::QuickFilters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Contains,
    Lt,
    Le,
    Gt,
    Ge,
}

impl Op {
    pub fn symbol(self) -> &'static str {
        match self {
            Op::Eq => "=",
            Op::Contains => ":",
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
        }
    }

    fn holds(self, actual: u32, expected: u32) -> bool {
        match self {
            Op::Eq | Op::Contains => actual == expected,
            Op::Lt => actual < expected,
            Op::Le => actual <= expected,
            Op::Gt => actual > expected,
            Op::Ge => actual >= expected,
        }
    }
}

/// Record property a clause refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Name,
    Drivers,
    Connected,
    Capacity,
    CarsCount,
    Free,
    Ping,
    Full,
    Password,
    Favourite,
    Errors,
    Booked,
    Missing,
    Track,
    Car,
    Session,
    Status,
}

enum KeyKind {
    Number,
    Flag,
    Text,
}

impl Key {
    pub fn from_word(word: &str) -> Option<Key> {
        let key = match word.trim().to_lowercase().as_str() {
            "name" => Key::Name,
            "drivers" | "players" | "clients" => Key::Drivers,
            "connected" => Key::Connected,
            "capacity" | "slots" => Key::Capacity,
            "cars" => Key::CarsCount,
            "free" => Key::Free,
            "ping" => Key::Ping,
            "full" => Key::Full,
            "password" => Key::Password,
            "favourite" | "favorite" | "fav" => Key::Favourite,
            "errors" | "error" => Key::Errors,
            "booked" => Key::Booked,
            "missing" => Key::Missing,
            "track" => Key::Track,
            "car" => Key::Car,
            "session" => Key::Session,
            "status" => Key::Status,
            _ => return None,
        };
        Some(key)
    }

    pub fn name(self) -> &'static str {
        match self {
            Key::Name => "name",
            Key::Drivers => "drivers",
            Key::Connected => "connected",
            Key::Capacity => "capacity",
            Key::CarsCount => "cars",
            Key::Free => "free",
            Key::Ping => "ping",
            Key::Full => "full",
            Key::Password => "password",
            Key::Favourite => "favourite",
            Key::Errors => "errors",
            Key::Booked => "booked",
            Key::Missing => "missing",
            Key::Track => "track",
            Key::Car => "car",
            Key::Session => "session",
            Key::Status => "status",
        }
    }

    fn kind(self) -> KeyKind {
        match self {
            Key::Drivers | Key::Connected | Key::Capacity | Key::CarsCount | Key::Free | Key::Ping => KeyKind::Number,
            Key::Full | Key::Password | Key::Favourite | Key::Errors | Key::Booked | Key::Missing => KeyKind::Flag,
            Key::Name | Key::Track | Key::Car | Key::Session | Key::Status => KeyKind::Text,
        }
    }

    pub fn is_flag(self) -> bool {
        matches!(self.kind(), KeyKind::Flag)
    }

    /// Record properties whose change can flip a clause on this key.
    pub fn properties(self) -> PropertySet {
        match self {
            Key::Name => Property::DisplayName.into(),
            Key::Drivers => Property::CurrentDrivers.into(),
            Key::Connected => Property::ConnectedDrivers.into(),
            Key::Capacity => Property::Capacity.into(),
            Key::CarsCount | Key::Car => Property::Cars.into(),
            Key::Free | Key::Full => PropertySet::of(&[Property::CurrentDrivers, Property::Capacity]),
            Key::Ping => Property::Ping.into(),
            Key::Password => Property::Password.into(),
            Key::Favourite => Property::Favourite.into(),
            Key::Errors | Key::Status => Property::Status.into(),
            Key::Booked => Property::Booking.into(),
            Key::Missing => PropertySet::of(&[Property::Cars, Property::Track]),
            Key::Track => Property::Track.into(),
            Key::Session => Property::Session.into(),
        }
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
    /// Bare word: case-insensitive substring of the display name.
    Name(String),
    Number { key: Key, op: Op, value: u32 },
    Text { key: Key, exact: bool, value: String },
    Flag { key: Key, expected: bool },
}

/// What a filter may consult besides the record itself.
#[derive(Clone, Copy, Default)]
pub struct FilterContext<'a> {
    pub catalog: Option<&'a dyn ContentCatalog>,
}

impl Filter {
    /// Build a `key op value` clause, checking the value fits the key.
    pub fn compare(key: Key, op: Op, value: &str) -> Result<Filter, ParseError> {
        let invalid = || ParseError::InvalidValue {
            key: key.name().to_string(),
            value: value.to_string(),
        };
        match key.kind() {
            KeyKind::Number => {
                let value = value.trim().parse::<u32>().map_err(|_| invalid())?;
                Ok(Filter::Number { key, op, value })
            }
            KeyKind::Flag => {
                if !matches!(op, Op::Eq | Op::Contains) {
                    return Err(invalid());
                }
                let expected = match value.trim().to_lowercase().as_str() {
                    "true" | "yes" | "1" | "+" => true,
                    "false" | "no" | "0" | "-" => false,
                    _ => return Err(invalid()),
                };
                Ok(Filter::Flag { key, expected })
            }
            KeyKind::Text => {
                if !matches!(op, Op::Eq | Op::Contains) {
                    return Err(invalid());
                }
                Ok(Filter::Text {
                    key,
                    exact: op == Op::Eq,
                    value: value.trim().to_lowercase(),
                })
            }
        }
    }

    pub fn test(&self, record: &ServerRecord, ctx: &FilterContext<'_>) -> bool {
        match self {
            Filter::And(parts) => parts.iter().all(|f| f.test(record, ctx)),
            Filter::Or(parts) => parts.iter().any(|f| f.test(record, ctx)),
            Filter::Not(inner) => !inner.test(record, ctx),
            Filter::Name(needle) => record.display_name.to_lowercase().contains(needle.as_str()),
            Filter::Number { key, op, value } => {
                number_of(*key, record).is_some_and(|actual| op.holds(actual, *value))
            }
            Filter::Text { key, exact, value } => {
                let matches = |candidate: &str| {
                    let candidate = candidate.to_lowercase();
                    if *exact {
                        candidate == *value
                    } else {
                        candidate.contains(value.as_str())
                    }
                };
                match key {
                    Key::Name => matches(&record.display_name),
                    Key::Track => record.live.track_id.as_deref().is_some_and(matches),
                    Key::Car => record.live.cars.iter().any(|car| matches(&car.id)),
                    Key::Session => record
                        .live
                        .session
                        .as_ref()
                        .is_some_and(|s| matches(session_name(s.kind))),
                    Key::Status => matches(status_name(record.status)),
                    _ => false,
                }
            }
            Filter::Flag { key, expected } => flag_of(*key, record, ctx) == *expected,
        }
    }

    /// Properties whose change can change this filter's verdict.
    pub fn affected_by(&self) -> PropertySet {
        match self {
            Filter::And(parts) | Filter::Or(parts) => parts
                .iter()
                .fold(PropertySet::EMPTY, |acc, f| acc.union(f.affected_by())),
            Filter::Not(inner) => inner.affected_by(),
            Filter::Name(_) => Property::DisplayName.into(),
            Filter::Number { key, .. } | Filter::Text { key, .. } | Filter::Flag { key, .. } => key.properties(),
        }
    }
}

fn number_of(key: Key, record: &ServerRecord) -> Option<u32> {
    let live = &record.live;
    match key {
        Key::Drivers => Some(live.current_drivers),
        Key::Connected => live.connected_drivers,
        Key::Capacity => Some(live.capacity),
        Key::CarsCount => Some(live.cars.len() as u32),
        Key::Free => Some(live.capacity.saturating_sub(live.current_drivers)),
        Key::Ping => live.ping_ms,
        _ => None,
    }
}

fn flag_of(key: Key, record: &ServerRecord, ctx: &FilterContext<'_>) -> bool {
    match key {
        Key::Full => record.is_full(),
        Key::Password => record.live.has_password,
        Key::Favourite => record.favourite,
        Key::Errors => record.has_errors(),
        Key::Booked => record.is_booked(),
        Key::Missing => ctx.catalog.is_some_and(|catalog| missing_content(record, catalog)),
        _ => false,
    }
}

fn session_name(kind: SessionType) -> &'static str {
    match kind {
        SessionType::Booking => "booking",
        SessionType::Practice => "practice",
        SessionType::Qualification => "qualification",
        SessionType::Race => "race",
    }
}

fn status_name(status: Status) -> &'static str {
    match status {
        Status::Unloaded => "unloaded",
        Status::Loading => "loading",
        Status::Ready => "ready",
        Status::Error => "error",
    }
}

/// `first ∧ second`, where a missing side always passes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CombinedFilter {
    /// User-typed expression.
    pub first: Option<Filter>,
    /// Derived from the quick-filter toggles.
    pub second: Option<Filter>,
}

impl CombinedFilter {
    pub fn new(first: Option<Filter>, second: Option<Filter>) -> Self {
        Self { first, second }
    }

    pub fn test(&self, record: &ServerRecord, ctx: &FilterContext<'_>) -> bool {
        self.first.as_ref().map_or(true, |f| f.test(record, ctx))
            && self.second.as_ref().map_or(true, |f| f.test(record, ctx))
    }

    pub fn affected_by(&self) -> PropertySet {
        let first = self.first.as_ref().map_or(PropertySet::EMPTY, Filter::affected_by);
        let second = self.second.as_ref().map_or(PropertySet::EMPTY, Filter::affected_by);
        first.union(second)
    }

    /// Whether a change to `changed` could alter any verdict.
    pub fn is_affected_by(&self, changed: PropertySet) -> bool {
        self.affected_by().intersects(changed)
    }
}
