#[macro_use]
pub mod metrics;

pub mod caching;
pub mod compile;
pub mod config;
pub mod logging;
pub mod plan;
pub mod resolver;
pub mod types;
