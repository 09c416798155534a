use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use shared::record::{Property, PropertySet};
use shared::types::ServerRecord;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    #[default]
    Name,
    Drivers,
    ConnectedDrivers,
    Capacity,
    CarsNumber,
    Ping,
}

impl SortMode {
    pub const ALL: [SortMode; 6] = [
        SortMode::Name,
        SortMode::Drivers,
        SortMode::ConnectedDrivers,
        SortMode::Capacity,
        SortMode::CarsNumber,
        SortMode::Ping,
    ];

    pub fn name(self) -> &'static str {
        match self {
            SortMode::Name => "name",
            SortMode::Drivers => "drivers",
            SortMode::ConnectedDrivers => "connected_drivers",
            SortMode::Capacity => "capacity",
            SortMode::CarsNumber => "cars_number",
            SortMode::Ping => "ping",
        }
    }

    /// Total order over records. Counts sort descending, ping ascending with
    /// unknown ping last; ties fall back to the display name ignoring case,
    /// then to the id.
    pub fn compare(self, a: &ServerRecord, b: &ServerRecord) -> Ordering {
        let primary = match self {
            SortMode::Name => Ordering::Equal,
            SortMode::Drivers => b.live.current_drivers.cmp(&a.live.current_drivers),
            SortMode::ConnectedDrivers => b.live.connected_drivers.cmp(&a.live.connected_drivers),
            SortMode::Capacity => b.live.capacity.cmp(&a.live.capacity),
            SortMode::CarsNumber => b.live.cars.len().cmp(&a.live.cars.len()),
            SortMode::Ping => match (a.live.ping_ms, b.live.ping_ms) {
                (Some(x), Some(y)) => x.cmp(&y),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            },
        };
        primary
            .then_with(|| {
                a.display_name
                    .to_lowercase()
                    .cmp(&b.display_name.to_lowercase())
            })
            .then_with(|| a.id.cmp(&b.id))
    }

    /// Properties that can move a record under this order.
    pub fn affected_by(self) -> PropertySet {
        let primary = match self {
            SortMode::Name => PropertySet::EMPTY,
            SortMode::Drivers => Property::CurrentDrivers.into(),
            SortMode::ConnectedDrivers => Property::ConnectedDrivers.into(),
            SortMode::Capacity => Property::Capacity.into(),
            SortMode::CarsNumber => Property::Cars.into(),
            SortMode::Ping => Property::Ping.into(),
        };
        primary.union(Property::DisplayName.into())
    }
}

impl fmt::Display for SortMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown sort mode '{0}'")]
pub struct UnknownSortMode(pub String);

impl FromStr for SortMode {
    type Err = UnknownSortMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SortMode::ALL
            .into_iter()
            .find(|mode| mode.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownSortMode(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::{CarEntry, SourceKind};

    fn record(port: u16, name: &str, drivers: u32, ping: Option<u32>) -> ServerRecord {
        let mut r = ServerRecord::new(format!("10.0.0.1:{}", port).parse().unwrap(), Some(name.to_string()), SourceKind::Master);
        r.live.current_drivers = drivers;
        r.live.capacity = 20;
        r.live.ping_ms = ping;
        r
    }

    fn samples() -> Vec<ServerRecord> {
        let mut cars = record(4, "zeta", 2, None);
        cars.live.cars = vec![CarEntry { id: "a".into(), total: 1, used: None }];
        vec![
            record(1, "Beta", 2, Some(40)),
            record(2, "alpha", 2, Some(40)),
            record(3, "ALPHA", 5, None),
            cars,
            record(5, "gamma", 0, Some(10)),
        ]
    }

    #[test]
    fn test_comparators_are_total_orders() {
        let records = samples();
        for mode in SortMode::ALL {
            for a in &records {
                for b in &records {
                    let ab = mode.compare(a, b);
                    assert_eq!(ab, mode.compare(b, a).reverse(), "{} antisymmetry", mode);
                    assert_eq!(ab == Ordering::Equal, a.id == b.id, "{} only equal to itself", mode);
                    for c in &records {
                        if ab != Ordering::Greater && mode.compare(b, c) != Ordering::Greater {
                            assert_ne!(mode.compare(a, c), Ordering::Greater, "{} transitivity", mode);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_tied_primary_key_breaks_on_name() {
        let records = samples();
        let mut sorted = records.clone();
        sorted.sort_by(|a, b| SortMode::Drivers.compare(a, b));
        let names: Vec<_> = sorted.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, ["ALPHA", "alpha", "Beta", "zeta", "gamma"]);
    }

    #[test]
    fn test_unknown_ping_sorts_last() {
        let mut sorted = samples();
        sorted.sort_by(|a, b| SortMode::Ping.compare(a, b));
        let names: Vec<_> = sorted.iter().map(|r| r.display_name.as_str()).collect();
        assert_eq!(names, ["gamma", "alpha", "Beta", "ALPHA", "zeta"]);
    }

    #[test]
    fn test_parse_and_display() {
        for mode in SortMode::ALL {
            assert_eq!(mode.to_string().parse::<SortMode>(), Ok(mode));
        }
        assert_eq!(" PING ".parse::<SortMode>(), Ok(SortMode::Ping));
        assert!("fastest".parse::<SortMode>().is_err());
    }
}
