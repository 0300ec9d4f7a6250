pub mod table;
pub mod driver;

pub use table::{PriceEntry, PriceTable};
pub use driver::PriceDriver;
