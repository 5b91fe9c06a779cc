mod client;
mod helpers;
pub mod speed;

pub use client::Prober;

use crate::probe::Probe;

/// Builds a boxed curl prober; the default factory handed to worker threads.
pub fn curl_prober() -> Result<Box<dyn Probe>, curl::Error> {
    Ok(Box::new(Prober::new()?))
}
