use std::env;
use log::warn;

// Server Configuration
pub const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1:8080";
pub const DEFAULT_API_BIND_ADDRESS: &str = "127.0.0.1:3000";
pub const STATS_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_DB_PATH: &str = "trading.db";

// JWT Configuration
pub const DEFAULT_JWT_SECRET: &str = "your-secret-key-change-in-production";
pub const TOKEN_TTL_HOURS: i64 = 24;

// Market Configuration
pub const DEFAULT_PRICE_TICK_SECS: u64 = 3;
pub const MAX_PRICE_CHANGE: f64 = 0.02;
pub const PRICE_FLOOR: f64 = 1.0;
pub const DEFAULT_SYMBOLS: [(&str, f64); 5] = [
    ("AAPL", 175.50),
    ("TSLA", 245.30),
    ("AMZN", 138.20),
    ("INFY", 18.75),
    ("TCS", 3450.00),
];

// Streaming Configuration
pub const MAX_CONNECTIONS: usize = 1000;
pub const CLIENT_OUTBOX_CAPACITY: usize = 16;
pub const WRITE_TIMEOUT_SECS: u64 = 5;
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const SHUTDOWN_GRACE_SECS: u64 = 5;

// Default account seeded into an empty user store
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "password123";

pub struct Config {
    pub bind_address: String,
    pub api_bind_address: String,
    pub db_path: String,
    pub jwt_secret: String,
    pub allowed_origins: Vec<String>,
    pub price_tick_secs: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_address: env::var("BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_BIND_ADDRESS.to_string()),
            api_bind_address: env::var("API_BIND_ADDRESS")
                .unwrap_or_else(|_| DEFAULT_API_BIND_ADDRESS.to_string()),
            db_path: env::var("DB_PATH")
                .ok()
                .filter(|path| !path.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            jwt_secret: env::var("JWT_SECRET")
                .unwrap_or_else(|_| {
                    warn!("JWT_SECRET not set, using default (NOT for production!)");
                    DEFAULT_JWT_SECRET.to_string()
                }),
            allowed_origins: env::var("ALLOWED_ORIGINS")
                .map(|origins| parse_origins(&origins))
                .unwrap_or_default(),
            price_tick_secs: env::var("PRICE_TICK_SECS")
                .ok()
                .and_then(|secs| secs.trim().parse().ok())
                .unwrap_or(DEFAULT_PRICE_TICK_SECS),
            log_level: env::var("RUST_LOG")
                .unwrap_or_else(|_| "info".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.jwt_secret == DEFAULT_JWT_SECRET {
            warn!("Using default JWT secret - change for production!");
        }

        if self.jwt_secret.chars().count() < 32 {
            return Err("JWT secret should be at least 32 characters long".to_string());
        }

        if self.price_tick_secs == 0 {
            return Err("PRICE_TICK_SECS must be greater than 0".to_string());
        }

        if let Some(origin) = self.allowed_origins.iter()
            .find(|origin| !(origin.starts_with("http://") || origin.starts_with("https://")))
        {
            return Err(format!("Invalid allowed origin: {}", origin));
        }

        Ok(())
    }

    pub fn log_config(&self) {
        println!("Server Configuration:");
        println!("  WebSocket Bind Address: {}", self.bind_address);
        println!("  API Bind Address: {}", self.api_bind_address);
        println!("  Database: {}", self.db_path);
        println!("  Price Tick: {}s", self.price_tick_secs);
        if self.allowed_origins.is_empty() {
            println!("  Allowed Origins: *");
        } else {
            println!("  Allowed Origins: {}", self.allowed_origins.join(", "));
        }
        println!("  Log Level: {}", self.log_level);
        println!("  JWT Secret: {}***", self.redacted_secret());
    }

    fn redacted_secret(&self) -> String {
        self.jwt_secret.chars().take(4).collect()
    }
}

fn parse_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|origin| origin.trim())
        .filter(|origin| !origin.is_empty())
        .map(|origin| origin.to_string())
        .collect()
}
