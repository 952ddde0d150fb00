use crate::core::{errors::GremlinError, types::Traversers};
use async_trait::async_trait;

/// A remote graph connection: can be opened, can run a traversal, can be closed
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// The traversal type accepted by `submit`
    type Query: Send;

    /// Open the connection, joining any attempt already in flight
    async fn open(&self) -> Result<(), GremlinError>;

    /// Submit a traversal and wait for all of its results
    async fn submit(&self, query: Self::Query) -> Result<Traversers, GremlinError>;

    /// Close the connection, failing whatever is still pending
    async fn close(&self) -> Result<(), GremlinError>;
}
