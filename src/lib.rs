//! Container and compose-service monitoring core for terminal dashboards

pub mod cli;
pub mod core;
pub mod utils;
