use thiserror::Error;

use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum AuthError {
    /// Deliberately the same for unknown users and wrong passwords.
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Username is required")]
    MissingUsername,
    #[error("Username must be at most {0} characters")]
    UsernameTooLong(usize),
    #[error("Password must be at least {0} characters")]
    PasswordTooShort(usize),
    #[error("Username already exists")]
    UsernameTaken,
    #[error("Authorization header required")]
    MissingToken,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Failed to generate token: {0}")]
    TokenIssue(#[from] jsonwebtoken::errors::Error),
    #[error("Failed to hash password: {0}")]
    Hash(#[from] bcrypt::BcryptError),
    #[error("User store unavailable: {0}")]
    Store(#[from] StorageError),
}

impl From<rusqlite::Error> for AuthError {
    fn from(err: rusqlite::Error) -> Self {
        AuthError::Store(err.into())
    }
}
