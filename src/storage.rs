use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use rusqlite::Connection;
use thiserror::Error;
use log::info;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database lock poisoned")]
    Poisoned,
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    username      TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS orders (
    seq       INTEGER PRIMARY KEY AUTOINCREMENT,
    id        TEXT NOT NULL UNIQUE,
    user_id   INTEGER NOT NULL,
    symbol    TEXT NOT NULL,
    side      TEXT NOT NULL,
    quantity  INTEGER NOT NULL,
    price     REAL NOT NULL,
    timestamp TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_orders_user ON orders (user_id, timestamp);
";

/// SQLite connection shared by the account and order stores.
///
/// Calls are blocking; async code reaches the stores through `spawn_blocking`.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Opens (or creates) the database file and brings the schema up to date.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let conn = Connection::open(path)?;
        info!("Opened database at {}", path.display());
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StorageError> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::Poisoned)
    }
}

#[cfg(test)]
impl Database {
    pub fn open_in_memory() -> Result<Self, StorageError> {
        Self::init(Connection::open_in_memory()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::UserStore;
    use crate::trading::order::OrderSide;
    use crate::trading::{OrderRequest, OrderStore};

    #[test]
    fn test_accounts_and_orders_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trading.db");

        let (user, order) = {
            let db = Database::open(&path).unwrap();
            let users = UserStore::new(db.clone(), 4);
            let orders = OrderStore::new(db);

            let user = users.create("alice", "secret1").unwrap();
            let order = orders.place(OrderRequest {
                symbol: "aapl".to_string(),
                side: OrderSide::Buy,
                quantity: 3,
                price: 175.5,
            }, user.id).unwrap();
            (user, order)
        };

        let db = Database::open(&path).unwrap();
        let users = UserStore::new(db.clone(), 4);
        let orders = OrderStore::new(db);

        assert_eq!(users.verify("alice", "secret1").unwrap(), user);
        assert!(users.seed_default().unwrap().is_none());

        let listed = orders.list_for_user(user.id).unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, order.id);
        assert_eq!(listed[0].symbol, "AAPL");
        assert_eq!(listed[0].side, OrderSide::Buy);
        assert_eq!(listed[0].quantity, 3);
        assert_eq!(listed[0].price, 175.5);
        assert_eq!(listed[0].timestamp, order.timestamp);
    }

    #[test]
    fn test_schema_creation_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trading.db");

        Database::open(&path).unwrap();
        assert!(Database::open(&path).is_ok());
    }
}
