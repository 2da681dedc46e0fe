//! RTMP ingest server

pub mod config;
pub mod connection;
pub mod listener;

pub use config::ServerConfig;
pub use listener::RtmpServer;
