use futures::future::BoxFuture;
use shared::types::SourceKind;
use crate::discovery::{DiscoveredServer, DiscoverySource};
use crate::error::SourceError;
use crate::store_manager::StoreHandle;

/// Servers the user saved, favourited or joined before.
pub struct SavedListSource {
    store: StoreHandle,
}

impl SavedListSource {
    pub fn new(store: StoreHandle) -> Self {
        Self { store }
    }
}

impl DiscoverySource for SavedListSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Saved
    }

    fn fetch(&self) -> BoxFuture<'_, Result<Vec<DiscoveredServer>, SourceError>> {
        Box::pin(async move {
            let saved = self
                .store
                .saved_servers()
                .await
                .map_err(|e| SourceError::new(SourceKind::Saved, e.to_string()))?;

            Ok(saved
                .into_iter()
                .map(|s| {
                    let mut server = DiscoveredServer::new(s.address, s.name, SourceKind::Saved);
                    server.favourite = s.favourite;
                    server
                })
                .collect())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::db::StoreDb;

    #[tokio::test]
    async fn test_saved_servers_carry_favourite_flag() {
        let store = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());
        store.save_server("10.0.0.5:9600".parse().unwrap(), Some("Garage".to_string())).await.unwrap();
        store.set_favourite("10.0.0.6:9600".parse().unwrap(), true).await.unwrap();

        let servers = SavedListSource::new(store.clone()).fetch().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].name.as_deref(), Some("Garage"));
        assert!(!servers[0].favourite);
        assert!(servers[1].favourite);
        assert_eq!(servers[1].sources, vec![SourceKind::Saved]);

        store.shutdown().await.unwrap();
    }
}
