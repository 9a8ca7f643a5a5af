//! Test support: an in-process server and message collection helpers.

mod collector;
mod mock_server;

pub use collector::MessageCollector;
pub use mock_server::{MockServer, MockServerConfig};

use crate::client::NatsClient;
use crate::error::Result;
use natsio_protocol::ConnectOptions;

/// Connects a client to `server` with otherwise default options.
pub async fn connected_client(server: &MockServer) -> Result<NatsClient> {
    connected_client_with(ConnectOptions::new(server.url())).await
}

pub async fn connected_client_with(options: ConnectOptions) -> Result<NatsClient> {
    NatsClient::connect_with(options).await
}
