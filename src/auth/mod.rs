pub mod error;
pub mod jwt;
pub mod users;

pub use error::AuthError;
pub use jwt::{Claims, JwtGenerator, JwtValidator, extract_bearer_token};
pub use users::{User, UserStore};
