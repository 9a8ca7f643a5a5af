#![warn(clippy::pedantic)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::if_not_else)]
#![allow(clippy::missing_panics_doc)]

//! Sans-IO NATS client protocol engine.
//!
//! Everything here is synchronous state: frame encoding and incremental
//! decoding, subject matching, the subscription registry, the request
//! multiplexer, the outbound pipeline, the server pool, option parsing and
//! handshake decisions. The `natsio` crate drives it over tokio sockets.

pub mod auth;
pub mod codec;
pub mod connection;
pub mod error;
pub mod error_classification;
pub mod flow_control;
pub mod frame;
pub mod handshake;
pub mod inbox;
pub mod info;
pub mod message;
pub mod mux;
pub mod options;
pub mod outbound;
pub mod registry;
pub mod server_pool;
pub mod subject;

pub use auth::{
    Authenticator, CredentialInputs, JwtSource, NkeyAuth, NoAuth, NonceSigner, TokenAuth,
    UserJwtAuth, UserPasswordAuth,
};
pub use codec::{decode_client_op, decode_server_op, MAX_CONTROL_LINE, MAX_FRAME_PAYLOAD};
pub use connection::{
    ConnectionEvent, ConnectionState, ConnectionStateMachine, DisconnectReason, ReconnectConfig,
};
pub use error::{NatsError, Result};
pub use error_classification::ErrorClass;
pub use flow_control::{YieldBudget, YieldPolicy};
pub use frame::{ClientOp, ServerOp};
pub use inbox::{create_inbox, create_inbox_with_prefix, Nuid, INBOX_PREFIX};
pub use info::{ConnectInfo, ServerInfo};
pub use message::Message;
pub use mux::{MuxDelivery, MuxEntry, RequestMux, RequestToken};
pub use options::{ConnectOptions, Encoding};
pub use outbound::{FrameKind, OutboundBuffer};
pub use registry::{
    Delivery, ReplayEntry, Subscription, SubscriptionId, SubscriptionRegistry, ArmedTimeout,
    Unsubscribe,
};
pub use server_pool::{Server, ServerPool};
pub use subject::{matches, validate_pattern, validate_queue_group, validate_subject};
