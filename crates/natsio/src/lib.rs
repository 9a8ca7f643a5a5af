#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::missing_panics_doc)]

//! # Async NATS client
//!
//! A tokio-based client for the NATS text protocol with cluster-aware
//! reconnection, request multiplexing over a shared inbox, and graceful
//! drain. Protocol state lives in the sans-IO `natsio-protocol` crate; this
//! crate owns the sockets, the background tasks and the callback surface.
//!
//! ## Architecture
//!
//! - One driver task per client rotates through the server pool, performs
//!   the `INFO`/`CONNECT` handshake and supervises the live connection
//! - Per connection, a writer task drains the outbound pipeline and a
//!   keepalive task sends `PING`s; inbound frames are dispatched in order
//! - Application calls never block on I/O: they update shared state under
//!   a short lock and wake the writer
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use natsio::{ConnectOptions, NatsClient, SubscribeOptions};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = NatsClient::connect_with(ConnectOptions::new("nats://127.0.0.1:4222")).await?;
//!
//!     client.subscribe("greet.*", SubscribeOptions::new(), |msg| {
//!         println!("{} -> {}", msg.subject, msg.payload_str());
//!     })?;
//!     client.publish("greet.joe", "hello")?;
//!
//!     client.subscribe("time", SubscribeOptions::new().with_queue("svc"), {
//!         let responder = client.clone();
//!         move |msg| {
//!             if let Some(reply) = &msg.reply {
//!                 let _ = responder.publish(reply, "12:00");
//!             }
//!         }
//!     })?;
//!     let reply = client
//!         .send_request("time", "", Duration::from_secs(1))
//!         .await?;
//!     println!("it is {}", reply.payload_str());
//!
//!     client.drain().await?;
//!     Ok(())
//! }
//! ```

pub mod auth_handlers;
pub mod callback;
pub mod client;
pub mod codec;
pub mod error;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod transport;

pub use client::{
    CancelledRequest, NatsClient, Request, RequestHandle, RequestId, RequestOptions, Statistics,
    SubscribeOptions, SubscriptionInfo,
};
pub use codec::{JsonCodec, PayloadCodec, TextCodec};
pub use error::{ErrorClass, NatsError, Result};
pub use transport::TlsConfig;

pub use natsio_protocol::{
    ConnectOptions, ConnectionEvent, ConnectionState, DisconnectReason, Encoding, JwtSource,
    Message, NonceSigner, ReconnectConfig, Server, ServerInfo, SubscriptionId, YieldPolicy,
};
