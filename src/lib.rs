pub mod clients;
pub mod config;
pub mod db;
pub mod engine;
pub mod error;
pub mod logging;
pub mod scheduler;
pub mod server;
