use std::net::SocketAddr;
use std::path::Path;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, params, OptionalExtension};
use serde::Serialize;

/// A server the user added by hand, favourited or joined before.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SavedServer {
    pub address: SocketAddr,
    pub name: Option<String>,
    pub favourite: bool,
    pub last_joined: Option<DateTime<Utc>>,
}

pub struct StoreDb {
    conn: Connection,
}

impl StoreDb {
    /// Open or create the SQLite database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if path != Path::new(":memory:") {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database: {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")
            .context("Failed to enable WAL mode")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS settings (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS saved_servers (
                address     TEXT PRIMARY KEY,
                name        TEXT,
                favourite   INTEGER NOT NULL DEFAULT 0,
                last_joined TEXT
            );
            "#,
        )
        .context("Failed to create database schema")?;

        Ok(Self { conn })
    }

    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        self.conn
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .context("Failed to query setting")
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )
            .context("Failed to store setting")?;
        Ok(())
    }

    /// Remember a server. Existing favourite/joined data is kept; the name is
    /// only replaced when a new one is given.
    pub fn save_server(&self, address: SocketAddr, name: Option<&str>) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO saved_servers (address, name) VALUES (?1, ?2)
                 ON CONFLICT(address) DO UPDATE SET name = COALESCE(excluded.name, saved_servers.name)",
                params![address.to_string(), name],
            )
            .context("Failed to save server")?;
        Ok(())
    }

    pub fn set_favourite(&self, address: SocketAddr, favourite: bool) -> Result<()> {
        self.save_server(address, None)?;
        self.conn
            .execute(
                "UPDATE saved_servers SET favourite = ?1 WHERE address = ?2",
                params![favourite as i32, address.to_string()],
            )
            .context("Failed to update favourite")?;
        Ok(())
    }

    pub fn mark_joined(&self, address: SocketAddr, at: DateTime<Utc>) -> Result<()> {
        self.save_server(address, None)?;
        self.conn
            .execute(
                "UPDATE saved_servers SET last_joined = ?1 WHERE address = ?2",
                params![at.to_rfc3339(), address.to_string()],
            )
            .context("Failed to record join")?;
        Ok(())
    }

    pub fn saved_servers(&self) -> Result<Vec<SavedServer>> {
        let mut stmt = self
            .conn
            .prepare("SELECT address, name, favourite, last_joined FROM saved_servers ORDER BY address")
            .context("Failed to prepare query")?;

        let servers = stmt
            .query_map([], Self::row_to_saved)
            .context("Failed to query saved servers")?
            .collect::<Result<Vec<_>, _>>()
            .context("Failed to collect saved servers")?;

        Ok(servers)
    }

    fn row_to_saved(row: &rusqlite::Row) -> Result<SavedServer, rusqlite::Error> {
        let address_str: String = row.get(0)?;
        let favourite: i32 = row.get(2)?;
        let last_joined_str: Option<String> = row.get(3)?;

        let address = address_str.parse().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })?;

        let last_joined = last_joined_str
            .map(|s| {
                DateTime::parse_from_rfc3339(&s)
                    .map(|t| t.with_timezone(&Utc))
                    .map_err(|e| {
                        rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, Box::new(e))
                    })
            })
            .transpose()?;

        Ok(SavedServer {
            address,
            name: row.get(1)?,
            favourite: favourite != 0,
            last_joined,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.168.1.20:9600".parse().unwrap()
    }

    #[test]
    fn test_settings_roundtrip() {
        let db = StoreDb::open(":memory:").unwrap();
        assert_eq!(db.get_setting("online.sort").unwrap(), None);

        db.set_setting("online.sort", "drivers").unwrap();
        db.set_setting("online.sort", "ping").unwrap();
        assert_eq!(db.get_setting("online.sort").unwrap().as_deref(), Some("ping"));
    }

    #[test]
    fn test_save_server_keeps_name_and_flags() {
        let db = StoreDb::open(":memory:").unwrap();
        db.save_server(addr(), Some("Home server")).unwrap();
        db.set_favourite(addr(), true).unwrap();
        db.save_server(addr(), None).unwrap();

        let saved = db.saved_servers().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].name.as_deref(), Some("Home server"));
        assert!(saved[0].favourite);
        assert_eq!(saved[0].last_joined, None);
    }

    #[test]
    fn test_mark_joined_records_time() {
        let db = StoreDb::open(":memory:").unwrap();
        let at = Utc::now();
        db.mark_joined(addr(), at).unwrap();

        let saved = db.saved_servers().unwrap();
        assert_eq!(saved[0].address, addr());
        assert_eq!(
            saved[0].last_joined.map(|t| t.timestamp()),
            Some(at.timestamp())
        );
    }
}
