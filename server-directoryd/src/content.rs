use std::path::PathBuf;
use shared::types::ServerRecord;

/// Installed cars and tracks, by id.
pub trait ContentCatalog: Send + Sync {
    fn car_installed(&self, id: &str) -> bool;
    fn track_installed(&self, id: &str) -> bool;
}

/// Looks for `content/cars/<id>` and `content/tracks/<id>` under the game root.
pub struct InstalledContent {
    root: PathBuf,
}

impl InstalledContent {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn exists(&self, kind: &str, id: &str) -> bool {
        // Ids are folder names; anything that could escape the content dir is not content.
        if id.is_empty() || id.contains(['/', '\\']) || id.starts_with('.') {
            return false;
        }
        self.root.join("content").join(kind).join(id).is_dir()
    }
}

impl ContentCatalog for InstalledContent {
    fn car_installed(&self, id: &str) -> bool {
        self.exists("cars", id)
    }

    fn track_installed(&self, id: &str) -> bool {
        self.exists("tracks", id)
    }
}

/// True when the server runs a track or only cars the player does not have.
pub fn missing_content(record: &ServerRecord, catalog: &dyn ContentCatalog) -> bool {
    let track_missing = record
        .live
        .track_id
        .as_deref()
        .is_some_and(|track| !catalog.track_installed(track));
    let cars_missing = !record.live.cars.is_empty()
        && !record.live.cars.iter().any(|car| catalog.car_installed(&car.id));
    track_missing || cars_missing
}
