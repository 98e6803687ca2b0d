use anyhow::Result;
use diesel::connection::SimpleConnection;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::sqlite::SqliteConnection;
use tracing::info;

pub mod error;
pub mod memory_stores;
pub mod models;
pub mod sqlite_stores;
pub mod stores;

pub use error::{DatabaseError, DatabaseResult};
pub use memory_stores::MemoryStores;
pub use models::{
    FAKE_MXID_PREFIX, MessageErrorKind, MessageKind, MessageRecord, NameQuality, PortalRecord,
    PuppetRecord, UserRecord,
};
pub use sqlite_stores::{SqlitePool, SqliteStores};
pub use stores::{
    MessageStore, PortalStore, PuppetStore, SharedMessageStore, SharedPortalStore,
    SharedPuppetStore, SharedUserStore, Stores, UserStore,
};

#[derive(Clone)]
enum Backend {
    Sqlite(SqliteStores, SqlitePool),
    Memory(MemoryStores),
}

#[derive(Clone)]
pub struct Database {
    backend: Backend,
}

impl Database {
    pub async fn connect(db_type: &str, db_uri: &str, max_open: u32, max_idle: u32) -> Result<Self> {
        info!("Connecting to {} database", db_type);

        if db_type.eq_ignore_ascii_case("memory") {
            return Ok(Self::in_memory());
        }
        if !db_type.eq_ignore_ascii_case("sqlite") {
            anyhow::bail!("database type '{}' is not supported; use sqlite or memory", db_type);
        }

        let path = sqlite_path(db_uri);
        let in_memory = path == ":memory:";
        let manager = ConnectionManager::<SqliteConnection>::new(path);
        let pool = tokio::task::spawn_blocking(move || {
            let max_size = if in_memory { 1 } else { max_open.max(1) };
            Pool::builder()
                .max_size(max_size)
                .min_idle(Some(max_idle.min(max_size)))
                .build(manager)
        })
        .await??;

        Ok(Self {
            backend: Backend::Sqlite(SqliteStores::new(pool.clone()), pool),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            backend: Backend::Memory(MemoryStores::new()),
        }
    }

    pub async fn run_migrations(&self) -> Result<()> {
        let Backend::Sqlite(_, pool) = &self.backend else {
            return Ok(());
        };

        info!("Running database migrations");
        let pool = pool.clone();
        tokio::task::spawn_blocking(move || -> DatabaseResult<()> {
            let mut conn = pool.get()?;
            conn.batch_execute(sqlite_stores::SCHEMA)
                .map_err(|e| DatabaseError::Migration(e.to_string()))
        })
        .await??;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn stores(&self) -> Stores {
        match &self.backend {
            Backend::Sqlite(stores, _) => stores.stores(),
            Backend::Memory(stores) => stores.stores(),
        }
    }
}

fn sqlite_path(uri: &str) -> String {
    uri.strip_prefix("sqlite://")
        .or_else(|| uri.strip_prefix("sqlite:"))
        .unwrap_or(uri)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_uri_prefixes_are_stripped() {
        assert_eq!(sqlite_path("sqlite://bridge.db"), "bridge.db");
        assert_eq!(sqlite_path("sqlite:bridge.db"), "bridge.db");
        assert_eq!(sqlite_path("/var/lib/bridge.db"), "/var/lib/bridge.db");
    }

    #[tokio::test]
    async fn unknown_backend_is_rejected() {
        assert!(Database::connect("postgres", "x", 1, 1).await.is_err());
    }
}
