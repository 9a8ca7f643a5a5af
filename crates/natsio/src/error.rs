pub use natsio_protocol::error::{NatsError, Result};
pub use natsio_protocol::error_classification::ErrorClass;
