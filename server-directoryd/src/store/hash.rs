use serde::Serialize;
use sha2::{Sha256, Digest};
use shared::types::{CarEntry, ErrorReason, ServerRecord, SessionType, Status};

/// Hash only what a list view shows. Ping changes on every probe and
/// would make the hash useless for change detection.
#[derive(Serialize)]
struct HashView<'a> {
    id: &'a str,
    display_name: &'a str,
    status: Status,
    error: Option<ErrorReason>,
    current_drivers: u32,
    connected_drivers: Option<u32>,
    capacity: u32,
    cars: &'a [CarEntry],
    session: Option<SessionType>,
    track_id: Option<&'a str>,
    has_password: bool,
    booked: bool,
    favourite: bool,
}

/// Computes a SHA-256 hash of the record list.
/// Records are hashed in id order so collection order does not matter.
pub fn compute_hash(records: &[ServerRecord]) -> String {
    let mut indices: Vec<usize> = (0..records.len()).collect();
    indices.sort_by(|&a, &b| records[a].id.cmp(&records[b].id));

    let views: Vec<HashView<'_>> = indices
        .iter()
        .map(|&i| {
            let r = &records[i];
            HashView {
                id: r.id.as_str(),
                display_name: &r.display_name,
                status: r.status,
                error: r.error,
                current_drivers: r.live.current_drivers,
                connected_drivers: r.live.connected_drivers,
                capacity: r.live.capacity,
                cars: &r.live.cars,
                session: r.live.session.as_ref().map(|s| s.kind),
                track_id: r.live.track_id.as_deref(),
                has_password: r.live.has_password,
                booked: r.is_booked(),
                favourite: r.favourite,
            }
        })
        .collect();

    let mut hasher = Sha256::new();
    for view in &views {
        // HashView only holds plain data, serialization cannot fail
        if let Ok(json) = serde_json::to_vec(view) {
            hasher.update(&json);
        }
        hasher.update(b"\n");
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::types::SourceKind;

    fn test_record(addr: &str) -> ServerRecord {
        ServerRecord::new(addr.parse().unwrap(), Some("Test".to_string()), SourceKind::Master)
    }

    #[test]
    fn test_hash_deterministic() {
        let a = test_record("10.0.0.1:9600");
        let b = test_record("10.0.0.2:9600");

        let hash1 = compute_hash(&[a.clone(), b.clone()]);
        let hash2 = compute_hash(&[b, a]);

        assert_eq!(hash1, hash2, "Hash should be same regardless of input order");
    }

    #[test]
    fn test_hash_changes_on_modification() {
        let a = test_record("10.0.0.1:9600");
        let mut b = a.clone();
        b.live.current_drivers = 3;
        b.live.capacity = 10;

        assert_ne!(compute_hash(&[a]), compute_hash(&[b]));
    }

    #[test]
    fn test_hash_stable_across_ping_changes() {
        let a = test_record("10.0.0.1:9600");
        let mut b = a.clone();
        b.live.ping_ms = Some(87);

        assert_eq!(compute_hash(&[a]), compute_hash(&[b]), "Ping should not affect the hash");
    }
}
