pub mod api;
pub mod app;
pub mod config;
pub mod cors;
pub mod db;
pub mod enrich;
pub mod error;
pub mod guard;
pub mod idempotency;
pub mod sweep;
