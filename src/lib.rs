pub mod core;

pub use crate::core::{
    config::{ConfigError, ConnectionOptions, Credentials},
    connection::{Connection, ConnectionBuilder},
    errors::GremlinError,
    traits::RemoteConnection,
    types::*,
};
