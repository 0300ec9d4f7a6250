use serde::{Deserialize, Serialize};
use rusqlite::{params, Row};
use thiserror::Error;
use uuid::Uuid;
use chrono::{DateTime, SecondsFormat, Utc};
use log::info;

use crate::storage::{Database, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum OrderSide {
    #[serde(rename = "buy")]
    Buy,
    #[serde(rename = "sell")]
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "buy",
            OrderSide::Sell => "sell",
        }
    }

    fn parse(value: &str) -> Result<Self, OrderError> {
        match value {
            "buy" => Ok(OrderSide::Buy),
            "sell" => Ok(OrderSide::Sell),
            other => Err(OrderError::Store(format!("unknown order side '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub user_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: i64,
    pub price: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, PartialEq)]
pub enum OrderError {
    #[error("Symbol cannot be empty")]
    EmptySymbol,
    #[error("Quantity must be positive")]
    InvalidQuantity,
    #[error("Price must be positive")]
    InvalidPrice,
    #[error("Order store unavailable: {0}")]
    Store(String),
}

impl From<StorageError> for OrderError {
    fn from(err: StorageError) -> Self {
        OrderError::Store(err.to_string())
    }
}

impl From<rusqlite::Error> for OrderError {
    fn from(err: rusqlite::Error) -> Self {
        OrderError::Store(err.to_string())
    }
}

impl OrderRequest {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.symbol.trim().is_empty() {
            return Err(OrderError::EmptySymbol);
        }

        if self.quantity <= 0 {
            return Err(OrderError::InvalidQuantity);
        }

        if !self.price.is_finite() || self.price <= 0.0 {
            return Err(OrderError::InvalidPrice);
        }

        Ok(())
    }
}

impl Order {
    pub fn new(request: OrderRequest, user_id: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            symbol: request.symbol.trim().to_uppercase(),
            side: request.side,
            quantity: request.quantity,
            price: request.price,
            timestamp: Utc::now(),
        }
    }
}

// Column values as stored; converted to an `Order` outside the query.
struct OrderRow {
    id: String,
    user_id: i64,
    symbol: String,
    side: String,
    quantity: i64,
    price: f64,
    timestamp: String,
}

impl OrderRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            symbol: row.get(2)?,
            side: row.get(3)?,
            quantity: row.get(4)?,
            price: row.get(5)?,
            timestamp: row.get(6)?,
        })
    }

    fn into_order(self) -> Result<Order, OrderError> {
        let id = Uuid::parse_str(&self.id)
            .map_err(|e| OrderError::Store(format!("bad order id '{}': {}", self.id, e)))?;
        let timestamp = DateTime::parse_from_rfc3339(&self.timestamp)
            .map_err(|e| OrderError::Store(format!("bad timestamp '{}': {}", self.timestamp, e)))?
            .with_timezone(&Utc);

        Ok(Order {
            id,
            user_id: self.user_id as u64,
            symbol: self.symbol,
            side: OrderSide::parse(&self.side)?,
            quantity: self.quantity,
            price: self.price,
            timestamp,
        })
    }
}

/// Append-only order log in the `orders` table.
#[derive(Clone)]
pub struct OrderStore {
    db: Database,
}

impl OrderStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn place(&self, request: OrderRequest, user_id: u64) -> Result<Order, OrderError> {
        request.validate()?;

        let order = Order::new(request, user_id);

        let conn = self.db.lock()?;
        conn.execute(
            "INSERT INTO orders (id, user_id, symbol, side, quantity, price, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                order.id.to_string(),
                order.user_id as i64,
                order.symbol,
                order.side.as_str(),
                order.quantity,
                order.price,
                // Fixed width, so text order matches time order.
                order.timestamp.to_rfc3339_opts(SecondsFormat::Nanos, true),
            ],
        )?;

        info!("Order placed - ID: {}, User: {}, Symbol: {}, Side: {:?}, Quantity: {}, Price: {:.2}",
              order.id, user_id, order.symbol, order.side, order.quantity, order.price);

        Ok(order)
    }

    /// The user's orders, newest first.
    pub fn list_for_user(&self, user_id: u64) -> Result<Vec<Order>, OrderError> {
        let conn = self.db.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, user_id, symbol, side, quantity, price, timestamp
             FROM orders WHERE user_id = ?1
             ORDER BY timestamp DESC, seq DESC",
        )?;
        let rows = stmt
            .query_map(params![user_id as i64], OrderRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter().map(OrderRow::into_order).collect()
    }

    /// Total orders and the number of users who placed any.
    pub fn get_stats(&self) -> (usize, usize) {
        let stats = self.db.lock().map_err(OrderError::from).and_then(|conn| {
            conn.query_row(
                "SELECT COUNT(*), COUNT(DISTINCT user_id) FROM orders",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?)),
            )
            .map_err(OrderError::from)
        });

        match stats {
            Ok((orders, users)) => (orders as usize, users as usize),
            Err(_) => (0, 0),
        }
    }
}
