//! Sources of known servers: the public master list, the saved/recent list
//! and LAN advertisements.

pub mod lan;
pub mod master;
pub mod saved;

use std::net::SocketAddr;
use futures::future::BoxFuture;
use shared::types::SourceKind;
use crate::error::SourceError;

/// A server reported by a discovery source. Not probed yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub address: SocketAddr,
    pub name: Option<String>,
    /// Never empty.
    pub sources: Vec<SourceKind>,
    pub favourite: bool,
}

impl DiscoveredServer {
    pub fn new(address: SocketAddr, name: Option<String>, source: SourceKind) -> Self {
        Self {
            address,
            name,
            sources: vec![source],
            favourite: false,
        }
    }

    /// Fold a duplicate sighting of the same address into this one.
    pub fn absorb(&mut self, other: DiscoveredServer) {
        if self.name.is_none() {
            self.name = other.name;
        }
        for source in other.sources {
            if !self.sources.contains(&source) {
                self.sources.push(source);
            }
        }
        self.favourite |= other.favourite;
    }
}

pub trait DiscoverySource: Send + Sync {
    fn kind(&self) -> SourceKind;
    fn fetch(&self) -> BoxFuture<'_, Result<Vec<DiscoveredServer>, SourceError>>;
}
