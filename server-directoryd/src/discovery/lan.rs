use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use futures::future::BoxFuture;
use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use shared::protocol::TXT_NAME;
use shared::types::SourceKind;
use crate::discovery::{DiscoveredServer, DiscoverySource};
use crate::error::SourceError;

/// Servers advertising themselves over mDNS on the local network.
///
/// Each fetch browses for a fixed window and reports whatever resolved in
/// that time.
pub struct LanSource {
    daemon: ServiceDaemon,
    service_type: String,
    window: Duration,
}

/// Stops the browse when the fetch finishes or is dropped mid-scan.
struct BrowseGuard<'a> {
    daemon: &'a ServiceDaemon,
    service_type: &'a str,
}

impl Drop for BrowseGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.daemon.stop_browse(self.service_type) {
            tracing::debug!("Failed to stop browsing {}: {}", self.service_type, e);
        }
    }
}

impl LanSource {
    pub fn new(daemon: ServiceDaemon, service_type: String, window: Duration) -> Self {
        Self { daemon, service_type, window }
    }
}

impl DiscoverySource for LanSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Lan
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Vec<DiscoveredServer>, SourceError>> {
        Box::pin(async move {
            let receiver = self
                .daemon
                .browse(&self.service_type)
                .map_err(|e| SourceError::new(SourceKind::Lan, e.to_string()))?;
            let _guard = BrowseGuard {
                daemon: &self.daemon,
                service_type: &self.service_type,
            };

            let mut found: HashMap<String, DiscoveredServer> = HashMap::new();
            let deadline = tokio::time::sleep(self.window);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    event = receiver.recv_async() => {
                        match event {
                            Ok(ServiceEvent::ServiceResolved(info)) => {
                                if let Some(server) = convert_service_info(&info) {
                                    tracing::debug!("LAN server {} at {}", info.get_fullname(), server.address);
                                    found.insert(info.get_fullname().to_string(), server);
                                }
                            }
                            Ok(ServiceEvent::ServiceRemoved(_typ, fullname)) => {
                                found.remove(&fullname);
                            }
                            Ok(_) => {}
                            Err(e) => {
                                tracing::warn!("LAN browse receiver closed: {}", e);
                                break;
                            }
                        }
                    }
                    _ = &mut deadline => break,
                }
            }

            Ok(found.into_values().collect())
        })
    }
}

/// Convert an mdns-sd ServiceInfo to a discovered server. IPv4 is preferred
/// since most dedicated servers only listen there.
fn convert_service_info(info: &ServiceInfo) -> Option<DiscoveredServer> {
    let addresses = info.get_addresses();
    let ip = addresses
        .iter()
        .find(|a| matches!(a, IpAddr::V4(_)))
        .or_else(|| addresses.iter().next())
        .copied()?;

    if info.get_port() == 0 {
        return None;
    }

    let name = info
        .get_property_val_str(TXT_NAME)
        .map(str::to_string)
        .or_else(|| instance_label(info.get_fullname(), info.get_type()));

    Some(DiscoveredServer::new(
        SocketAddr::new(ip, info.get_port()),
        name,
        SourceKind::Lan,
    ))
}

/// "My Server._acserver._udp.local." -> "My Server"
fn instance_label(fullname: &str, service_type: &str) -> Option<String> {
    fullname
        .strip_suffix(service_type)
        .map(|s| s.trim_end_matches('.'))
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
