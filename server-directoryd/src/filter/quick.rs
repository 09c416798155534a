//! Quick-filter toggles.
//!
//! Each enabled toggle writes its fragment in parentheses and fragments are
//! joined with `&`. Reading is tolerant: fragments that do not parse or do
//! not match a known toggle are logged and skipped, so strings written by
//! newer or older builds still load.

use std::collections::BTreeMap;
use crate::filter::parser::{parse, split_top_level};
use crate::filter::Filter;

/// Toggle name and the filter fragment it stands for, in display order.
pub const TOGGLES: [(&str, &str); 7] = [
    ("non_empty", "drivers>0"),
    ("not_full", "full-"),
    ("no_password", "password-"),
    ("favourites", "favourite+"),
    ("no_errors", "errors-"),
    ("installed", "missing-"),
    ("booked", "booked+"),
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QuickFilters {
    enabled: [bool; TOGGLES.len()],
}

fn index_of(name: &str) -> Option<usize> {
    TOGGLES.iter().position(|(toggle, _)| *toggle == name)
}

impl QuickFilters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false for an unknown toggle name.
    pub fn set(&mut self, name: &str, enabled: bool) -> bool {
        match index_of(name) {
            Some(i) => {
                self.enabled[i] = enabled;
                true
            }
            None => false,
        }
    }

    pub fn is_enabled(&self, name: &str) -> bool {
        index_of(name).is_some_and(|i| self.enabled[i])
    }

    pub fn is_empty(&self) -> bool {
        !self.enabled.iter().any(|e| *e)
    }

    pub fn serialize(&self) -> String {
        TOGGLES
            .iter()
            .zip(self.enabled)
            .filter(|(_, enabled)| *enabled)
            .map(|((_, fragment), _)| format!("({})", fragment))
            .collect::<Vec<_>>()
            .join("&")
    }

    pub fn parse(input: &str) -> Self {
        let known: Vec<Option<Filter>> = TOGGLES.iter().map(|(_, fragment)| parse(fragment).ok()).collect();
        let mut filters = Self::default();

        for piece in split_top_level(input, '&') {
            let parsed = match parse(&piece) {
                Ok(filter) => filter,
                Err(e) => {
                    tracing::warn!("Ignoring unparsable quick filter fragment {:?}: {}", piece, e);
                    continue;
                }
            };
            match known.iter().position(|k| k.as_ref() == Some(&parsed)) {
                Some(i) => filters.enabled[i] = true,
                None => tracing::warn!("Ignoring unknown quick filter fragment {:?}", piece),
            }
        }
        filters
    }

    /// Conjunction of the enabled fragments, `None` when nothing is enabled.
    pub fn to_filter(&self) -> Option<Filter> {
        let mut parts: Vec<Filter> = TOGGLES
            .iter()
            .zip(self.enabled)
            .filter(|(_, enabled)| *enabled)
            .filter_map(|((_, fragment), _)| parse(fragment).ok())
            .collect();
        match parts.len() {
            0 => None,
            1 => parts.pop(),
            _ => Some(Filter::And(parts)),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, bool> {
        TOGGLES
            .iter()
            .zip(self.enabled)
            .map(|((name, _), enabled)| (name.to_string(), enabled))
            .collect()
    }

    /// Unknown names are ignored.
    pub fn from_map(map: &BTreeMap<String, bool>) -> Self {
        let mut filters = Self::default();
        for (name, enabled) in map {
            if !filters.set(name, *enabled) {
                tracing::warn!("Ignoring unknown quick filter {:?}", name);
            }
        }
        filters
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_combination_round_trips() {
        for mask in 0u32..(1 << TOGGLES.len()) {
            let mut filters = QuickFilters::new();
            for (i, (name, _)) in TOGGLES.iter().enumerate() {
                filters.set(name, mask & (1 << i) != 0);
            }
            let written = filters.serialize();
            assert_eq!(QuickFilters::parse(&written), filters, "mask {:#b} wrote {:?}", mask, written);
        }
    }

    #[test]
    fn test_serialize_format() {
        let mut filters = QuickFilters::new();
        assert_eq!(filters.serialize(), "");
        filters.set("non_empty", true);
        filters.set("no_password", true);
        assert_eq!(filters.serialize(), "(drivers>0)&(password-)");
    }

    #[test]
    fn test_parse_tolerates_unknown_and_broken_fragments() {
        let filters = QuickFilters::parse("(drivers>0)&(colour=red)&(track:a\\&b|full-)&(full-)&garbage((");
        assert!(filters.is_enabled("non_empty"));
        assert!(filters.is_enabled("not_full"));
        assert!(!filters.is_enabled("no_password"));
    }

    #[test]
    fn test_parse_ignores_spacing_and_unbracketed_fragments() {
        let filters = QuickFilters::parse(" ( drivers > 0 ) & favourite+ ");
        assert!(filters.is_enabled("non_empty"));
        assert!(filters.is_enabled("favourites"));
    }

    #[test]
    fn test_to_filter() {
        assert_eq!(QuickFilters::new().to_filter(), None);
        let mut filters = QuickFilters::new();
        filters.set("not_full", true);
        assert_eq!(filters.to_filter(), parse("full-").ok());
        filters.set("booked", true);
        assert_eq!(filters.to_filter(), parse("full- & booked+").ok());
    }

    #[test]
    fn test_map_conversion() {
        let mut map = BTreeMap::new();
        map.insert("installed".to_string(), true);
        map.insert("turbo".to_string(), true);
        let filters = QuickFilters::from_map(&map);
        assert!(filters.is_enabled("installed"));
        assert_eq!(filters.to_map().len(), TOGGLES.len());
        assert_eq!(filters.to_map()["installed"], true);
    }
}
