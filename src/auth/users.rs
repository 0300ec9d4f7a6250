use serde::{Deserialize, Serialize};
use rusqlite::{params, ErrorCode, OptionalExtension};
use log::info;

use crate::auth::AuthError;
use crate::config::{DEFAULT_PASSWORD, DEFAULT_USERNAME};
use crate::storage::Database;

pub const MIN_PASSWORD_LEN: usize = 6;
pub const MAX_USERNAME_LEN: usize = 32;

/// Public view of an account. The password hash never leaves the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: u64,
    pub username: String,
}

/// Credential store in the `users` table, with bcrypt-hashed passwords.
///
/// Hashing, verification and the SQLite calls all block; async callers should
/// run these methods on the blocking pool.
#[derive(Clone)]
pub struct UserStore {
    db: Database,
    cost: u32,
}

impl UserStore {
    pub fn new(db: Database, cost: u32) -> Self {
        Self { db, cost }
    }

    pub fn create(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AuthError::MissingUsername);
        }
        if username.chars().count() > MAX_USERNAME_LEN {
            return Err(AuthError::UsernameTooLong(MAX_USERNAME_LEN));
        }
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::PasswordTooShort(MIN_PASSWORD_LEN));
        }

        // Cheap rejection before paying for the hash; the UNIQUE column
        // catches a concurrent signup on insert.
        if self.exists(username)? {
            return Err(AuthError::UsernameTaken);
        }

        let password_hash = bcrypt::hash(password, self.cost)?;

        let conn = self.db.lock()?;
        let inserted = conn.execute(
            "INSERT INTO users (username, password_hash) VALUES (?1, ?2)",
            params![username, password_hash],
        );
        match inserted {
            Ok(_) => {}
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                return Err(AuthError::UsernameTaken);
            }
            Err(e) => return Err(e.into()),
        }

        let user = User {
            id: conn.last_insert_rowid() as u64,
            username: username.to_string(),
        };

        info!("Created user {} (id {})", user.username, user.id);
        Ok(user)
    }

    pub fn verify(&self, username: &str, password: &str) -> Result<User, AuthError> {
        let (user, password_hash) = {
            let conn = self.db.lock()?;
            conn.query_row(
                "SELECT id, username, password_hash FROM users WHERE username = ?1",
                params![username.trim()],
                |row| {
                    let id: i64 = row.get(0)?;
                    let user = User { id: id as u64, username: row.get(1)? };
                    Ok((user, row.get::<_, String>(2)?))
                },
            )
            .optional()?
            .ok_or(AuthError::InvalidCredentials)?
        };

        if bcrypt::verify(password, &password_hash)? {
            Ok(user)
        } else {
            Err(AuthError::InvalidCredentials)
        }
    }

    /// Creates the default account when no user exists yet.
    pub fn seed_default(&self) -> Result<Option<User>, AuthError> {
        if self.count()? > 0 {
            return Ok(None);
        }
        let user = self.create(DEFAULT_USERNAME, DEFAULT_PASSWORD)?;
        info!("Created default user: {} / {}", DEFAULT_USERNAME, DEFAULT_PASSWORD);
        Ok(Some(user))
    }

    pub fn user_count(&self) -> usize {
        self.count().unwrap_or(0)
    }

    fn count(&self) -> Result<usize, AuthError> {
        let conn = self.db.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    fn exists(&self, username: &str) -> Result<bool, AuthError> {
        let conn = self.db.lock()?;
        let found = conn
            .query_row("SELECT 1 FROM users WHERE username = ?1", params![username], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Minimum bcrypt cost keeps the tests fast.
    fn store() -> UserStore {
        UserStore::new(Database::open_in_memory().unwrap(), 4)
    }

    #[test]
    fn test_create_and_verify() {
        let store = store();
        let user = store.create("alice", "secret1").unwrap();

        assert_eq!(user.id, 1);
        assert_eq!(store.verify("alice", "secret1").unwrap(), user);
        assert_eq!(store.user_count(), 1);
    }

    #[test]
    fn test_ids_increase() {
        let store = store();
        let first = store.create("alice", "secret1").unwrap();
        let second = store.create("bob", "secret2").unwrap();
        assert!(second.id > first.id);
    }

    #[test]
    fn test_wrong_password_and_unknown_user_look_the_same() {
        let store = store();
        store.create("alice", "secret1").unwrap();

        let wrong = store.verify("alice", "nope123").unwrap_err();
        let unknown = store.verify("mallory", "secret1").unwrap_err();

        assert!(matches!(wrong, AuthError::InvalidCredentials));
        assert!(matches!(unknown, AuthError::InvalidCredentials));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[test]
    fn test_create_validation() {
        let store = store();

        assert!(matches!(store.create("  ", "secret1"), Err(AuthError::MissingUsername)));
        assert!(matches!(store.create("alice", "12345"), Err(AuthError::PasswordTooShort(6))));
        assert!(matches!(
            store.create(&"x".repeat(MAX_USERNAME_LEN + 1), "secret1"),
            Err(AuthError::UsernameTooLong(_))
        ));
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn test_duplicate_username() {
        let store = store();
        store.create("alice", "secret1").unwrap();

        assert!(matches!(store.create("alice", "secret2"), Err(AuthError::UsernameTaken)));
        assert!(matches!(store.create(" alice ", "secret2"), Err(AuthError::UsernameTaken)));
    }

    #[test]
    fn test_user_serialization_has_no_password() {
        let store = store();
        let user = store.create("alice", "secret1").unwrap();
        let json = serde_json::to_value(&user).unwrap();

        assert_eq!(json, serde_json::json!({ "id": 1, "username": "alice" }));
    }

    #[test]
    fn test_seed_default_only_when_empty() {
        let store = store();
        let seeded = store.seed_default().unwrap();
        assert_eq!(seeded.map(|u| u.username), Some(DEFAULT_USERNAME.to_string()));
        assert!(store.verify(DEFAULT_USERNAME, DEFAULT_PASSWORD).is_ok());

        assert!(store.seed_default().unwrap().is_none());
        assert_eq!(store.user_count(), 1);
    }
}
