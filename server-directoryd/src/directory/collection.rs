use std::collections::{BTreeSet, HashMap};
use shared::record::{Property, PropertySet};
use shared::types::{ServerId, ServerRecord, SourceKind};
use crate::discovery::DiscoveredServer;

/// Servers returned by one scan, plus the sources that actually answered.
#[derive(Debug, Clone, Default)]
pub struct ScanBatch {
    pub servers: Vec<DiscoveredServer>,
    pub answered: BTreeSet<SourceKind>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub added: Vec<ServerId>,
    pub removed: Vec<ServerId>,
    pub changed: Vec<(ServerId, PropertySet)>,
    pub total: usize,
}

/// Identity-keyed records in insertion order.
#[derive(Debug, Default)]
pub struct Directory {
    records: Vec<ServerRecord>,
    index: HashMap<ServerId, usize>,
}

impl Directory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &ServerId) -> Option<&ServerRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn get_mut(&mut self, id: &ServerId) -> Option<&mut ServerRecord> {
        match self.index.get(id) {
            Some(&i) => Some(&mut self.records[i]),
            None => None,
        }
    }

    pub fn records(&self) -> &[ServerRecord] {
        &self.records
    }

    /// Merge a scan result by identity.
    ///
    /// New ids are appended as `Unloaded`. A record disappears once none of
    /// the sources that answered still list it and no unanswered source ever
    /// listed it, unless it is booked or being joined.
    pub fn merge(&mut self, batch: ScanBatch) -> MergeSummary {
        let mut summary = MergeSummary::default();
        let mut seen: HashMap<ServerId, DiscoveredServer> = HashMap::new();
        let mut order: Vec<ServerId> = Vec::new();

        for server in batch.servers {
            let id = ServerId::from_addr(server.address);
            match seen.get_mut(&id) {
                Some(existing) => existing.absorb(server),
                None => {
                    order.push(id.clone());
                    seen.insert(id, server);
                }
            }
        }

        for record in &mut self.records {
            let mut changed = PropertySet::EMPTY;
            record.origins.retain(|source| !batch.answered.contains(source));

            if let Some(found) = seen.remove(&record.id) {
                record.origins.extend(found.sources.iter().copied());
                if let Some(name) = found.name {
                    if record.live.ping_ms.is_none() && record.display_name != name {
                        record.display_name = name;
                        changed.insert(Property::DisplayName);
                    }
                }
                if found.favourite && !record.favourite {
                    record.favourite = true;
                    changed.insert(Property::Favourite);
                }
            }

            if !changed.is_empty() {
                summary.changed.push((record.id.clone(), changed));
            }
        }

        let before = self.records.len();
        self.records.retain(|record| {
            let keep = !record.origins.is_empty() || record.is_booked() || record.joined;
            if !keep {
                summary.removed.push(record.id.clone());
            }
            keep
        });

        for id in order {
            if let Some(found) = seen.remove(&id) {
                let mut record = ServerRecord::new(found.address, found.name, found.sources[0]);
                record.origins.extend(found.sources.iter().copied());
                record.favourite = found.favourite;
                summary.added.push(record.id.clone());
                self.records.push(record);
            }
        }

        if self.records.len() != before || !summary.removed.is_empty() {
            self.reindex();
        }
        summary.total = self.records.len();
        summary
    }

    fn reindex(&mut self) {
        self.index = self
            .records
            .iter()
            .enumerate()
            .map(|(i, r)| (r.id.clone(), i))
            .collect();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use shared::types::{Booking, Status};

    fn found(addr: &str, source: SourceKind) -> DiscoveredServer {
        DiscoveredServer::new(addr.parse().unwrap(), None, source)
    }

    fn batch(addrs: &[&str], source: SourceKind) -> ScanBatch {
        ScanBatch {
            servers: addrs.iter().map(|a| found(a, source)).collect(),
            answered: BTreeSet::from([source]),
        }
    }

    fn ids(dir: &Directory) -> Vec<String> {
        dir.records().iter().map(|r| r.id.to_string()).collect()
    }

    const A: &str = "10.0.0.1:9600";
    const B: &str = "10.0.0.2:9600";
    const C: &str = "10.0.0.3:9600";
    const D: &str = "10.0.0.4:9600";

    #[test]
    fn test_merge_prunes_missing_and_appends_new() {
        let mut dir = Directory::new();
        dir.merge(batch(&[A, B, C], SourceKind::Master));

        let summary = dir.merge(batch(&[B, C, D], SourceKind::Master));
        assert_eq!(ids(&dir), vec![B, C, D]);
        assert_eq!(summary.removed, vec![ServerId::from(A)]);
        assert_eq!(summary.added, vec![ServerId::from(D)]);
        assert_eq!(dir.get(&ServerId::from(D)).unwrap().status, Status::Unloaded);
        assert!(dir.get(&ServerId::from(A)).is_none());
    }

    #[test]
    fn test_merge_keeps_booked_record() {
        let mut dir = Directory::new();
        dir.merge(batch(&[A, B, C], SourceKind::Master));
        dir.get_mut(&ServerId::from(A)).unwrap().booking = Some(Booking {
            car_id: "ks_audi_r8_lms".to_string(),
            skin_id: None,
            expires_at: Utc::now(),
        });

        dir.merge(batch(&[B, C, D], SourceKind::Master));
        assert_eq!(ids(&dir), vec![A, B, C, D]);
    }

    #[test]
    fn test_merge_keeps_records_of_unanswered_source() {
        let mut dir = Directory::new();
        dir.merge(batch(&[A], SourceKind::Lan));
        dir.merge(batch(&[B], SourceKind::Master));

        // Master answered without B, LAN did not answer at all.
        let summary = dir.merge(ScanBatch {
            servers: vec![],
            answered: BTreeSet::from([SourceKind::Master]),
        });
        assert_eq!(ids(&dir), vec![A]);
        assert_eq!(summary.removed, vec![ServerId::from(B)]);
    }

    #[test]
    fn test_merge_deduplicates_across_sources() {
        let mut dir = Directory::new();
        let mut saved = found(A, SourceKind::Saved);
        saved.favourite = true;
        let summary = dir.merge(ScanBatch {
            servers: vec![found(A, SourceKind::Master), saved],
            answered: BTreeSet::from([SourceKind::Master, SourceKind::Saved]),
        });

        assert_eq!(summary.added.len(), 1);
        let record = dir.get(&ServerId::from(A)).unwrap();
        assert!(record.favourite);
        assert_eq!(record.origins.len(), 2);
    }
}
