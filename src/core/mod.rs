pub mod config;
pub mod connection;
pub mod dispatch;
pub mod errors;
pub mod kernel;
pub mod registry;
pub mod traits;
pub mod types;
