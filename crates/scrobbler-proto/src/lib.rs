pub mod config;
pub mod connectors;
pub mod options;
pub mod platform;
pub mod protocol;
