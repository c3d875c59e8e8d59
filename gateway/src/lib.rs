pub mod api;
pub mod auth;
pub mod backend_config;
pub mod config;
pub mod dedup;
pub mod dispatcher;
pub mod event;
pub mod extractors;
pub mod gateway;
pub mod health;
pub mod limiters;
pub mod prometheus;
pub mod router;
pub mod server;
pub mod sinks;
pub mod source_cache;
pub mod stats;
pub mod time;
