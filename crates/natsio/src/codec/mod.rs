mod json;
mod text;

pub use json::JsonCodec;
pub use text::TextCodec;

use crate::error::Result;
use bytes::Bytes;
use natsio_protocol::ConnectOptions;
use serde_json::Value;
use std::sync::Arc;

/// Converts application values to message payloads and back.
pub trait PayloadCodec: Send + Sync {
    fn name(&self) -> &'static str;

    /// # Errors
    /// Returns an error if the value cannot be represented by this codec
    fn encode(&self, value: &Value) -> Result<Bytes>;

    /// # Errors
    /// Returns an error if the payload is not valid for this codec
    fn decode(&self, payload: &[u8]) -> Result<Value>;
}

/// Selects the codec configured by `json` and `encoding`.
#[must_use]
pub fn codec_for(options: &ConnectOptions) -> Arc<dyn PayloadCodec> {
    if options.json {
        Arc::new(JsonCodec)
    } else {
        Arc::new(TextCodec::new(options.encoding))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use natsio_protocol::Encoding;

    #[test]
    fn test_codec_selection() {
        let options = ConnectOptions::default();
        assert_eq!(codec_for(&options).name(), "utf8");

        let options = ConnectOptions::default().with_encoding(Encoding::Latin1);
        assert_eq!(codec_for(&options).name(), "latin1");

        let options = ConnectOptions::default()
            .with_encoding(Encoding::Ascii)
            .with_json(true);
        assert_eq!(codec_for(&options).name(), "json");
    }
}
