pub mod amount;
pub mod bin_range;
pub mod price_band;

pub use amount::{from_atomic, to_atomic};
pub use bin_range::BinRange;
pub use price_band::{BandViolation, PriceBand};
