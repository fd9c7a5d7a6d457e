pub mod config;
pub mod engine;
pub mod log;
pub mod version;
