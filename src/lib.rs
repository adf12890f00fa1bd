pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod execution;
pub mod position;
pub mod pricing;
pub mod round;
pub mod server;
