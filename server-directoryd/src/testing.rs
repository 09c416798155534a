//! Fakes shared by the unit tests.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use anyhow::Result;
use futures::future::BoxFuture;
use shared::record::RefreshPolicy;
use shared::types::{CarEntry, ProbeReport, ServerId, SourceKind, UpdateMode};
use tokio_util::sync::CancellationToken;
use crate::content::ContentCatalog;
use crate::directory::{DirectoryHandle, ScanBatch};
use crate::discovery::{DiscoveredServer, DiscoverySource};
use crate::engine::RefreshEngine;
use crate::error::{ProbeError, SourceError};
use crate::launcher::{LaunchOutcome, Launcher, StartDescriptor};
use crate::manager::{Collaborators, DirectoryManager, ManagerOptions};
use crate::probe::{Booker, StateProbe};
use crate::store::db::StoreDb;
use crate::store_manager::{SettingsStore, StoreHandle};

pub fn test_addr(i: usize) -> SocketAddr {
    SocketAddr::from(([10, 0, (i / 256) as u8, (i % 256) as u8], 9600))
}

pub fn sample_report(current: u32, capacity: u32) -> ProbeReport {
    ProbeReport {
        name: "Fake Server".to_string(),
        capacity,
        current_drivers: current,
        cars: vec![CarEntry { id: "ks_mazda_mx5_cup".to_string(), total: capacity, used: None }],
        drivers: None,
        session: None,
        track_id: Some("magione".to_string()),
        has_password: false,
        ping_ms: 25,
    }
}

/// Directory holding `n` unloaded records at `test_addr(0..n)`.
pub async fn seeded_directory(n: usize) -> (DirectoryHandle, Vec<ServerId>) {
    let directory = DirectoryHandle::spawn();
    let servers: Vec<_> = (0..n)
        .map(|i| DiscoveredServer::new(test_addr(i), Some(format!("Server {:02}", i)), SourceKind::Master))
        .collect();
    directory
        .merge(ScanBatch {
            servers,
            answered: BTreeSet::from([SourceKind::Master]),
        })
        .await
        .unwrap();
    let ids = (0..n).map(|i| ServerId::from_addr(test_addr(i))).collect();
    (directory, ids)
}

#[derive(Debug, Clone)]
pub enum Behaviour {
    Reply,
    Fail(ProbeError),
    Hang,
    Delay(Duration),
}

/// Probe with scripted per-address behaviour that counts concurrent calls.
pub struct FakeProbe {
    default: Behaviour,
    overrides: Mutex<HashMap<SocketAddr, Behaviour>>,
    reports: Mutex<HashMap<SocketAddr, ProbeReport>>,
    in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub calls: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl FakeProbe {
    pub fn new(default: Behaviour) -> Self {
        Self {
            default,
            overrides: Mutex::new(HashMap::new()),
            reports: Mutex::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, address: SocketAddr, behaviour: Behaviour) {
        self.overrides.lock().unwrap().insert(address, behaviour);
    }

    pub fn set_report(&self, address: SocketAddr, report: ProbeReport) {
        self.reports.lock().unwrap().insert(address, report);
    }

    fn report_for(&self, address: SocketAddr) -> ProbeReport {
        self.reports
            .lock()
            .unwrap()
            .get(&address)
            .cloned()
            .unwrap_or_else(|| sample_report(3, 10))
    }
}

impl StateProbe for FakeProbe {
    fn probe(&self, address: SocketAddr, _mode: UpdateMode) -> BoxFuture<'_, Result<ProbeReport, ProbeError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let _guard = InFlight(&self.in_flight);

            let behaviour = self
                .overrides
                .lock()
                .unwrap()
                .get(&address)
                .cloned()
                .unwrap_or_else(|| self.default.clone());
            match behaviour {
                Behaviour::Reply => Ok(self.report_for(address)),
                Behaviour::Fail(e) => Err(e),
                Behaviour::Hang => futures::future::pending().await,
                Behaviour::Delay(delay) => {
                    tokio::time::sleep(delay).await;
                    Ok(self.report_for(address))
                }
            }
        })
    }
}

/// Discovery source returning whatever the test set last.
pub struct StaticSource {
    kind: SourceKind,
    result: Mutex<std::result::Result<Vec<SocketAddr>, String>>,
}

impl StaticSource {
    pub fn new(kind: SourceKind, addrs: Vec<SocketAddr>) -> Self {
        Self { kind, result: Mutex::new(Ok(addrs)) }
    }

    pub fn set(&self, result: std::result::Result<Vec<SocketAddr>, String>) {
        *self.result.lock().unwrap() = result;
    }
}

impl DiscoverySource for Arc<StaticSource> {
    fn kind(&self) -> SourceKind {
        self.kind
    }

    fn fetch(&self) -> BoxFuture<'_, std::result::Result<Vec<DiscoveredServer>, SourceError>> {
        Box::pin(async move {
            match &*self.result.lock().unwrap() {
                Ok(addrs) => Ok(addrs
                    .iter()
                    .map(|a| DiscoveredServer::new(*a, None, self.kind))
                    .collect()),
                Err(message) => Err(SourceError::new(self.kind, message.clone())),
            }
        })
    }
}

pub struct FakeBooker {
    pub time_left: Duration,
    pub refuse: bool,
    pub unbooked: AtomicUsize,
}

impl FakeBooker {
    pub fn new(time_left: Duration) -> Self {
        Self { time_left, refuse: false, unbooked: AtomicUsize::new(0) }
    }
}

impl Booker for FakeBooker {
    fn book<'a>(
        &'a self,
        _address: SocketAddr,
        _car: &'a str,
        _skin: Option<&'a str>,
        _driver: &'a str,
    ) -> BoxFuture<'a, Result<Duration, ProbeError>> {
        Box::pin(async move {
            if self.refuse {
                return Err(ProbeError::Protocol("server is not in booking".to_string()));
            }
            Ok(self.time_left)
        })
    }

    fn unbook<'a>(&'a self, _address: SocketAddr, _driver: &'a str) -> BoxFuture<'a, Result<(), ProbeError>> {
        Box::pin(async move {
            self.unbooked.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Launcher that records descriptors instead of starting anything.
#[derive(Default)]
pub struct RecordingLauncher {
    pub started: Mutex<Vec<StartDescriptor>>,
}

impl Launcher for RecordingLauncher {
    fn start(&self, descriptor: StartDescriptor) -> BoxFuture<'_, LaunchOutcome> {
        Box::pin(async move {
            self.started.lock().unwrap().push(descriptor);
            LaunchOutcome::Completed
        })
    }
}

/// Catalog listing a fixed set of installed cars and tracks.
#[derive(Default)]
pub struct StaticCatalog {
    pub cars: HashSet<String>,
    pub tracks: HashSet<String>,
}

impl StaticCatalog {
    pub fn everything() -> Self {
        Self {
            cars: HashSet::from(["ks_mazda_mx5_cup".to_string()]),
            tracks: HashSet::from(["magione".to_string()]),
        }
    }
}

impl ContentCatalog for StaticCatalog {
    fn car_installed(&self, id: &str) -> bool {
        self.cars.contains(id)
    }

    fn track_installed(&self, id: &str) -> bool {
        self.tracks.contains(id)
    }
}

#[derive(Default)]
pub struct MemorySettings {
    pub values: Mutex<HashMap<String, String>>,
}

impl SettingsStore for MemorySettings {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(async move { Ok(self.values.lock().unwrap().get(key).cloned()) })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.values.lock().unwrap().insert(key.to_string(), value.to_string());
            Ok(())
        })
    }
}

/// A manager wired to fakes, plus the fakes tests want to inspect.
pub struct TestRig {
    pub manager: Arc<DirectoryManager>,
    pub probe: Arc<FakeProbe>,
    pub source: Arc<StaticSource>,
    pub launcher: Arc<RecordingLauncher>,
    pub booker: Arc<FakeBooker>,
}

impl TestRig {
    pub fn new(addrs: Vec<SocketAddr>) -> Self {
        Self::with_probe(addrs, FakeProbe::new(Behaviour::Reply))
    }

    pub fn with_probe(addrs: Vec<SocketAddr>, probe: FakeProbe) -> Self {
        let probe = Arc::new(probe);
        let source = Arc::new(StaticSource::new(SourceKind::Master, addrs));
        let launcher = Arc::new(RecordingLauncher::default());
        let booker = Arc::new(FakeBooker::new(Duration::from_secs(60)));
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());

        let manager = DirectoryManager::new(
            DirectoryHandle::spawn(),
            RefreshEngine::new(probe.clone(), 4, Duration::from_millis(500)),
            vec![Box::new(source.clone())],
            Collaborators {
                booker: booker.clone(),
                launcher: launcher.clone(),
                catalog: Arc::new(StaticCatalog::everything()),
                store,
            },
            ManagerOptions {
                driver_name: "Tester".to_string(),
                policy: RefreshPolicy::default(),
            },
            CancellationToken::new(),
        );

        Self {
            manager: Arc::new(manager),
            probe,
            source,
            launcher,
            booker,
        }
    }
}
