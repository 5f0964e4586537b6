pub mod config;
pub mod http_client;
pub mod logger;
pub mod metrics;
pub mod parsers;
pub mod server;

pub use config::{AppConfig, CargoEnv, Settings};
pub use logger::*;
pub use server::ApplicationServer;
