pub mod order;

pub use order::{Order, OrderError, OrderRequest, OrderStore};
