//! Filtered, sorted live views over the directory.
//!
//! A view keeps its visible rows in order and patches them from change
//! events. A change only re-tests the filter when the filter depends on
//! one of the changed properties, and only moves the row when the sort
//! order does.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use shared::record::PropertySet;
use shared::types::{ServerId, ServerRecord};
use crate::directory::DirectoryEvent;
use crate::error::DirectoryError;
use crate::filter::{parse, CombinedFilter, FilterContext, ParseError, QuickFilters};
use crate::manager::DirectoryManager;
use crate::sort::SortMode;
use crate::store_manager::SettingsStore;

pub struct LiveView {
    filter: CombinedFilter,
    sort: SortMode,
    records: HashMap<ServerId, ServerRecord>,
    visible: Vec<ServerId>,
}

impl LiveView {
    pub fn new(filter: CombinedFilter, sort: SortMode, records: Vec<ServerRecord>, ctx: &FilterContext<'_>) -> Self {
        let mut view = Self {
            filter,
            sort,
            records: records.into_iter().map(|r| (r.id.clone(), r)).collect(),
            visible: Vec::new(),
        };
        view.rebuild(ctx);
        view
    }

    fn rebuild(&mut self, ctx: &FilterContext<'_>) {
        let mut visible: Vec<&ServerRecord> = self
            .records
            .values()
            .filter(|r| self.filter.test(r, ctx))
            .collect();
        visible.sort_by(|a, b| self.sort.compare(a, b));
        self.visible = visible.into_iter().map(|r| r.id.clone()).collect();
    }

    pub fn filter(&self) -> &CombinedFilter {
        &self.filter
    }

    pub fn sort(&self) -> SortMode {
        self.sort
    }

    pub fn set_filter(&mut self, filter: CombinedFilter, ctx: &FilterContext<'_>) {
        self.filter = filter;
        self.rebuild(ctx);
    }

    pub fn set_sort(&mut self, sort: SortMode) {
        self.sort = sort;
        let records = &self.records;
        self.visible
            .sort_by(|a, b| sort.compare(&records[a], &records[b]));
    }

    /// Whether a change to `properties` matters to this view at all.
    pub fn depends_on(&self, properties: PropertySet) -> bool {
        self.filter.is_affected_by(properties) || self.sort.affected_by().intersects(properties)
    }

    fn position_for(&self, record: &ServerRecord) -> usize {
        self.visible
            .binary_search_by(|other| self.sort.compare(&self.records[other], record))
            .unwrap_or_else(|i| i)
    }

    fn place(&mut self, record: ServerRecord) {
        let at = self.position_for(&record);
        self.visible.insert(at, record.id.clone());
        self.records.insert(record.id.clone(), record);
    }

    pub fn insert(&mut self, record: ServerRecord, ctx: &FilterContext<'_>) {
        self.remove(&record.id);
        if self.filter.test(&record, ctx) {
            self.place(record);
        } else {
            self.records.insert(record.id.clone(), record);
        }
    }

    pub fn remove(&mut self, id: &ServerId) {
        self.records.remove(id);
        self.visible.retain(|v| v != id);
    }

    /// Patch one record after a change event.
    pub fn on_changed(&mut self, record: ServerRecord, properties: PropertySet, ctx: &FilterContext<'_>) {
        let index = self.visible.iter().position(|v| *v == record.id);
        if !self.records.contains_key(&record.id) {
            self.insert(record, ctx);
            return;
        }
        if !self.depends_on(properties) {
            self.records.insert(record.id.clone(), record);
            return;
        }

        let passes = if self.filter.is_affected_by(properties) {
            self.filter.test(&record, ctx)
        } else {
            index.is_some()
        };
        let moved = self.sort.affected_by().intersects(properties);

        match (index, passes) {
            (Some(i), true) if moved => {
                self.visible.remove(i);
                self.place(record);
            }
            (Some(i), false) => {
                self.visible.remove(i);
                self.records.insert(record.id.clone(), record);
            }
            (None, true) => self.place(record),
            _ => {
                self.records.insert(record.id.clone(), record);
            }
        }
    }

    pub fn rows(&self) -> Vec<ServerRecord> {
        self.visible.iter().map(|id| self.records[id].clone()).collect()
    }
}

/// Persisted per-view settings and the filter they produce.
#[derive(Debug, Clone, Default)]
pub struct ViewSettings {
    pub filter_text: String,
    pub quick: QuickFilters,
    pub sort: SortMode,
}

impl ViewSettings {
    fn quick_key(key: &str) -> String {
        format!("{}.quick_filter", key)
    }

    fn filter_key(key: &str) -> String {
        format!("{}.filter", key)
    }

    fn sort_key(key: &str) -> String {
        format!("{}.sort", key)
    }

    /// Missing or unreadable values fall back to defaults.
    pub async fn load(settings: &dyn SettingsStore, key: &str) -> Self {
        let read = |name: String| async move {
            match settings.get(&name).await {
                Ok(value) => value,
                Err(e) => {
                    tracing::warn!("Failed to read setting {}: {}", name, e);
                    None
                }
            }
        };

        let quick = read(Self::quick_key(key)).await.map(|s| QuickFilters::parse(&s)).unwrap_or_default();
        let filter_text = read(Self::filter_key(key)).await.unwrap_or_default();
        let sort = read(Self::sort_key(key))
            .await
            .and_then(|s| match s.parse() {
                Ok(sort) => Some(sort),
                Err(e) => {
                    tracing::warn!("Ignoring stored sort for {}: {}", key, e);
                    None
                }
            })
            .unwrap_or_default();
        Self { filter_text, quick, sort }
    }

    pub async fn save(&self, settings: &dyn SettingsStore, key: &str) {
        let values = [
            (Self::quick_key(key), self.quick.serialize()),
            (Self::filter_key(key), self.filter_text.clone()),
            (Self::sort_key(key), self.sort.to_string()),
        ];
        for (name, value) in values {
            if let Err(e) = settings.set(&name, &value).await {
                tracing::error!("Failed to save setting {}: {}", name, e);
            }
        }
    }

    /// The combined filter. A stored expression that no longer parses is
    /// dropped with a warning.
    pub fn combined(&self) -> (CombinedFilter, Option<ParseError>) {
        let (first, error) = match parse_optional(&self.filter_text) {
            Ok(first) => (first, None),
            Err(e) => (None, Some(e)),
        };
        (CombinedFilter::new(first, self.quick.to_filter()), error)
    }
}

fn parse_optional(text: &str) -> Result<Option<crate::filter::Filter>, ParseError> {
    if text.trim().is_empty() {
        Ok(None)
    } else {
        parse(text).map(Some)
    }
}

/// What the API returns for a view.
#[derive(Debug, Clone, Serialize)]
pub struct ViewSnapshot {
    pub key: String,
    pub filter: String,
    pub filter_error: Option<String>,
    pub quick_filters: BTreeMap<String, bool>,
    pub sort: SortMode,
    pub rows: Vec<ServerRecord>,
}

struct ViewState {
    view: LiveView,
    settings: ViewSettings,
    filter_error: Option<String>,
}

/// An open view: its live rows, persisted settings and sweep token.
/// Dropping or closing the session cancels its sweep.
pub struct ViewSession {
    key: String,
    manager: Arc<DirectoryManager>,
    settings: Arc<dyn SettingsStore>,
    state: Arc<RwLock<ViewState>>,
    cancel: CancellationToken,
    pump: JoinHandle<()>,
}

impl ViewSession {
    pub async fn open(
        key: String,
        manager: Arc<DirectoryManager>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self, DirectoryError> {
        let stored = ViewSettings::load(settings.as_ref(), &key).await;
        let (filter, error) = stored.combined();
        if let Some(e) = &error {
            tracing::warn!("Stored filter for view {} no longer parses: {}", key, e);
        }

        // Subscribe before the snapshot so no change falls in between
        let events = manager.directory().subscribe();
        let records = manager.directory().snapshot().await?;
        let view = LiveView::new(filter, stored.sort, records, &manager.filter_context());
        let state = Arc::new(RwLock::new(ViewState {
            view,
            settings: stored,
            filter_error: error.map(|e| e.to_string()),
        }));

        let cancel = manager.shutdown_token().child_token();
        let pump = tokio::spawn(pump(manager.clone(), state.clone(), events, cancel.clone()));
        tracing::debug!("Opened view {}", key);

        Ok(Self { key, manager, settings, state, cancel, pump })
    }

    pub async fn snapshot(&self) -> ViewSnapshot {
        let state = self.state.read().await;
        ViewSnapshot {
            key: self.key.clone(),
            filter: state.settings.filter_text.clone(),
            filter_error: state.filter_error.clone(),
            quick_filters: state.settings.quick.to_map(),
            sort: state.view.sort(),
            rows: state.view.rows(),
        }
    }

    /// Replace the typed filter. An expression that does not parse is
    /// rejected and nothing changes.
    pub async fn set_filter(&self, text: String) -> Result<(), ParseError> {
        let first = parse_optional(&text)?;
        let stored = {
            let mut state = self.state.write().await;
            let second = state.view.filter().second.clone();
            state.view.set_filter(CombinedFilter::new(first, second), &self.manager.filter_context());
            state.settings.filter_text = text;
            state.filter_error = None;
            state.settings.clone()
        };
        stored.save(self.settings.as_ref(), &self.key).await;
        Ok(())
    }

    pub async fn set_quick_filters(&self, quick: QuickFilters) {
        let stored = {
            let mut state = self.state.write().await;
            let first = state.view.filter().first.clone();
            state.view.set_filter(CombinedFilter::new(first, quick.to_filter()), &self.manager.filter_context());
            state.settings.quick = quick;
            state.settings.clone()
        };
        stored.save(self.settings.as_ref(), &self.key).await;
    }

    pub async fn set_sort(&self, sort: SortMode) {
        let stored = {
            let mut state = self.state.write().await;
            state.view.set_sort(sort);
            state.settings.sort = sort;
            state.settings.clone()
        };
        stored.save(self.settings.as_ref(), &self.key).await;
    }

    /// Sweep the records this view shows. Cancels the sweep already running.
    pub async fn refresh(&self) -> Result<(), DirectoryError> {
        let filter = self.state.read().await.view.filter().clone();
        let manager = self.manager.clone();
        let cancel = self.cancel.clone();
        let key = self.key.clone();
        tokio::spawn(async move {
            match manager.ping_everything(&filter, &cancel).await {
                Ok(summary) => tracing::debug!("View {} refreshed {} servers", key, summary.completed),
                Err(DirectoryError::Cancelled) => tracing::debug!("View {} refresh cancelled", key),
                Err(e) => tracing::warn!("View {} refresh failed: {}", key, e),
            }
        });
        Ok(())
    }

}

impl Drop for ViewSession {
    fn drop(&mut self) {
        tracing::debug!("Closed view {}", self.key);
        self.cancel.cancel();
        self.pump.abort();
    }
}

async fn pump(
    manager: Arc<DirectoryManager>,
    state: Arc<RwLock<ViewState>>,
    mut events: broadcast::Receiver<DirectoryEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;

            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        let ctx = manager.filter_context();
        match event {
            Ok(DirectoryEvent::Added(ids)) => {
                for id in ids {
                    if let Ok(Some(record)) = manager.directory().get(id).await {
                        state.write().await.view.insert(record, &ctx);
                    }
                }
            }
            Ok(DirectoryEvent::Removed(ids)) => {
                let mut state = state.write().await;
                for id in &ids {
                    state.view.remove(id);
                }
            }
            Ok(DirectoryEvent::Changed { id, properties }) => {
                // Hidden rows still take the fresh copy so a later filter
                // change rebuilds from current data
                if let Ok(Some(record)) = manager.directory().get(id).await {
                    state.write().await.view.on_changed(record, properties, &ctx);
                }
            }
            Ok(DirectoryEvent::ScanFailed { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!("View fell behind by {} events, rebuilding", skipped);
                match manager.directory().snapshot().await {
                    Ok(records) => {
                        let mut state = state.write().await;
                        let filter = state.view.filter().clone();
                        let sort = state.view.sort();
                        state.view = LiveView::new(filter, sort, records, &ctx);
                    }
                    Err(e) => {
                        tracing::warn!("View rebuild failed: {}", e);
                        break;
                    }
                }
            }
            Err(RecvError::Closed) => break,
        }
    }
}

/// Open views by save-key.
pub struct ViewRegistry {
    manager: Arc<DirectoryManager>,
    settings: Arc<dyn SettingsStore>,
    sessions: Mutex<HashMap<String, Arc<ViewSession>>>,
}

impl ViewRegistry {
    pub fn new(manager: Arc<DirectoryManager>, settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            manager,
            settings,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// The open session for `key`, opening it and starting a sweep if needed.
    pub async fn open(&self, key: &str) -> Result<Arc<ViewSession>, DirectoryError> {
        if let Some(session) = self.sessions.lock().await.get(key) {
            return Ok(session.clone());
        }
        let session = Arc::new(ViewSession::open(key.to_string(), self.manager.clone(), self.settings.clone()).await?);
        {
            let mut sessions = self.sessions.lock().await;
            // Another caller opened the same key while this one was loading
            if let Some(existing) = sessions.get(key) {
                return Ok(existing.clone());
            }
            sessions.insert(key.to_string(), session.clone());
        }
        session.refresh().await?;
        Ok(session)
    }

    /// Returns false when the view was not open.
    pub async fn close(&self, key: &str) -> bool {
        match self.sessions.lock().await.remove(key) {
            Some(session) => {
                // The last reference drops the session and cancels its sweep
                session.cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        for (_, session) in self.sessions.lock().await.drain() {
            session.cancel.cancel();
        }
    }
}
