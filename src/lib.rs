mod common;

pub mod config;
pub mod egress;
pub mod events;
pub mod metrics;
pub mod metrics_aggregate;
pub mod probe;
pub mod probe_engine;
pub mod relay;
pub mod report;
pub mod runtime;
pub mod settings;

#[cfg(test)]
mod test_support;
