#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod loaders;
pub mod logging;
pub mod receiver;
pub mod utils;
