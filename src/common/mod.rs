pub mod net;
pub mod sync;
pub mod units;
