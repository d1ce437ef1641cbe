pub mod banlist;
pub mod cli;
pub mod config;
pub mod device;
pub mod duration;
pub mod error;
pub mod intake;
pub mod metrics;
pub mod prometheus;
pub mod routeros_api;
pub mod tracing_setup;

pub(crate) const USER_AGENT: &str = "routeros-fwban/v0.1.0";
