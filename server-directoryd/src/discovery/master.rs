use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use futures::future::BoxFuture;
use serde::Deserialize;
use shared::types::SourceKind;
use crate::discovery::{DiscoveredServer, DiscoverySource};
use crate::error::SourceError;

/// One entry of the master list JSON array.
#[derive(Debug, Deserialize)]
struct MasterEntry {
    ip: IpAddr,
    /// Query port
    port: u16,
    #[serde(default)]
    name: Option<String>,
}

/// Public lobby list fetched over HTTP. Mirrors are tried in order.
pub struct MasterListSource {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl MasterListSource {
    pub fn new(urls: Vec<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::new(SourceKind::Master, e.to_string()))?;
        Ok(Self { client, urls })
    }

    async fn fetch_one(&self, url: &str) -> Result<Vec<DiscoveredServer>, reqwest::Error> {
        let entries: Vec<MasterEntry> = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(parse_entries(entries))
    }
}

fn parse_entries(entries: Vec<MasterEntry>) -> Vec<DiscoveredServer> {
    entries
        .into_iter()
        .filter(|e| e.port != 0)
        .map(|e| {
            let name = e.name.filter(|n| !n.trim().is_empty());
            DiscoveredServer::new(SocketAddr::new(e.ip, e.port), name, SourceKind::Master)
        })
        .collect()
}

impl DiscoverySource for MasterListSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Master
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Vec<DiscoveredServer>, SourceError>> {
        Box::pin(async move {
            let mut last_error = String::from("no master list configured");
            for url in &self.urls {
                match self.fetch_one(url).await {
                    Ok(servers) => {
                        tracing::info!("Master list {} returned {} servers", url, servers.len());
                        return Ok(servers);
                    }
                    Err(e) => {
                        tracing::warn!("Master list {} failed: {}", url, e);
                        last_error = e.to_string();
                    }
                }
            }
            Err(SourceError::new(SourceKind::Master, last_error))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_entries_skips_invalid_ports_and_blank_names() {
        let entries: Vec<MasterEntry> = serde_json::from_str(
            r#"[
                {"ip": "203.0.113.7", "port": 9600, "name": "Club Race"},
                {"ip": "203.0.113.8", "port": 0},
                {"ip": "2001:db8::1", "port": 9601, "name": "  "}
            ]"#,
        )
        .unwrap();

        let servers = parse_entries(entries);
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name.as_deref(), Some("Club Race"));
        assert_eq!(servers[1].address, "[2001:db8::1]:9601".parse().unwrap());
        assert_eq!(servers[1].name, None);
    }

    #[tokio::test]
    async fn test_no_urls_is_a_source_error() {
        let source = MasterListSource::new(Vec::new(), Duration::from_secs(1)).unwrap();
        let err = source.fetch().await.unwrap_err();
        assert_eq!(err.kind, SourceKind::Master);
    }
}
