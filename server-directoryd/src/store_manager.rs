use std::net::SocketAddr;
use std::thread;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use anyhow::Result;
use crate::store::db::{SavedServer, StoreDb};

/// Typed key/value settings persisted between runs.
pub trait SettingsStore: Send + Sync {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>>;
    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Commands sent to the store thread
pub enum StoreCommand {
    GetSetting(String, oneshot::Sender<Result<Option<String>>>),
    SetSetting(String, String, oneshot::Sender<Result<()>>),
    SaveServer(SocketAddr, Option<String>, oneshot::Sender<Result<()>>),
    SetFavourite(SocketAddr, bool, oneshot::Sender<Result<()>>),
    MarkJoined(SocketAddr, DateTime<Utc>, oneshot::Sender<Result<()>>),
    SavedServers(oneshot::Sender<Result<Vec<SavedServer>>>),
    Shutdown,
}

/// Handle to the SQLite store. The connection lives on its own thread.
#[derive(Clone)]
pub struct StoreHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl StoreHandle {
    /// Spawn a new store thread owning the given database
    pub fn spawn(db: StoreDb) -> Self {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);

        thread::spawn(move || {
            while let Some(cmd) = rx.blocking_recv() {
                match cmd {
                    StoreCommand::GetSetting(key, reply) => {
                        let _ = reply.send(db.get_setting(&key));
                    }
                    StoreCommand::SetSetting(key, value, reply) => {
                        let _ = reply.send(db.set_setting(&key, &value));
                    }
                    StoreCommand::SaveServer(address, name, reply) => {
                        let _ = reply.send(db.save_server(address, name.as_deref()));
                    }
                    StoreCommand::SetFavourite(address, favourite, reply) => {
                        let _ = reply.send(db.set_favourite(address, favourite));
                    }
                    StoreCommand::MarkJoined(address, at, reply) => {
                        let _ = reply.send(db.mark_joined(address, at));
                    }
                    StoreCommand::SavedServers(reply) => {
                        let _ = reply.send(db.saved_servers());
                    }
                    StoreCommand::Shutdown => {
                        tracing::info!("Store thread shutting down");
                        break;
                    }
                }
            }
        });

        Self { tx }
    }

    pub async fn get_setting(&self, key: String) -> Result<Option<String>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::GetSetting(key, reply)).await?;
        rx.await?
    }

    pub async fn set_setting(&self, key: String, value: String) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetSetting(key, value, reply)).await?;
        rx.await?
    }

    pub async fn save_server(&self, address: SocketAddr, name: Option<String>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SaveServer(address, name, reply)).await?;
        rx.await?
    }

    pub async fn set_favourite(&self, address: SocketAddr, favourite: bool) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SetFavourite(address, favourite, reply)).await?;
        rx.await?
    }

    pub async fn mark_joined(&self, address: SocketAddr, at: DateTime<Utc>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::MarkJoined(address, at, reply)).await?;
        rx.await?
    }

    pub async fn saved_servers(&self) -> Result<Vec<SavedServer>> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(StoreCommand::SavedServers(reply)).await?;
        rx.await?
    }

    /// Shutdown the store thread
    pub async fn shutdown(&self) -> Result<()> {
        self.tx.send(StoreCommand::Shutdown).await?;
        Ok(())
    }
}

impl SettingsStore for StoreHandle {
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>>> {
        Box::pin(self.get_setting(key.to_string()))
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(self.set_setting(key.to_string(), value.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_handle_round_trips_through_thread() {
        let handle = StoreHandle::spawn(StoreDb::open(":memory:").unwrap());

        SettingsStore::set(&handle, "online.quick_filter", "(drivers>0)").await.unwrap();
        let value = SettingsStore::get(&handle, "online.quick_filter").await.unwrap();
        assert_eq!(value.as_deref(), Some("(drivers>0)"));

        let addr: SocketAddr = "10.1.1.1:9600".parse().unwrap();
        handle.save_server(addr, Some("LAN box".to_string())).await.unwrap();
        handle.set_favourite(addr, true).await.unwrap();
        let saved = handle.saved_servers().await.unwrap();
        assert_eq!(saved.len(), 1);
        assert!(saved[0].favourite);

        handle.shutdown().await.unwrap();
    }
}
