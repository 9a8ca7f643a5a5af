use super::PayloadCodec;
use crate::error::Result;
use bytes::Bytes;
use natsio_protocol::Encoding;
use serde_json::Value;

/// String bodies in one of the supported text encodings. Non-string values
/// are sent as their JSON text.
#[derive(Debug, Clone, Copy, Default)]
pub struct TextCodec {
    encoding: Encoding,
}

impl TextCodec {
    #[must_use]
    pub fn new(encoding: Encoding) -> Self {
        Self { encoding }
    }

    #[must_use]
    pub fn encoding(&self) -> Encoding {
        self.encoding
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encode_str(&self, text: &str) -> Bytes {
        match self.encoding {
            Encoding::Utf8 => Bytes::copy_from_slice(text.as_bytes()),
            Encoding::Ascii => text.chars().map(|c| (u32::from(c) as u8) & 0x7f).collect(),
            Encoding::Latin1 => text.chars().map(|c| u32::from(c) as u8).collect(),
        }
    }
}

impl PayloadCodec for TextCodec {
    fn name(&self) -> &'static str {
        self.encoding.as_str()
    }

    fn encode(&self, value: &Value) -> Result<Bytes> {
        Ok(match value {
            Value::String(text) => self.encode_str(text),
            other => self.encode_str(&other.to_string()),
        })
    }

    fn decode(&self, payload: &[u8]) -> Result<Value> {
        let text = match self.encoding {
            Encoding::Utf8 => String::from_utf8_lossy(payload).into_owned(),
            Encoding::Ascii => payload.iter().map(|b| char::from(b & 0x7f)).collect(),
            Encoding::Latin1 => payload.iter().map(|&b| char::from(b)).collect(),
        };
        Ok(Value::String(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_utf8_passthrough() {
        let codec = TextCodec::new(Encoding::Utf8);
        let bytes = codec.encode(&json!("héllo")).unwrap();
        assert_eq!(&bytes[..], "héllo".as_bytes());
        assert_eq!(codec.decode(&bytes).unwrap(), json!("héllo"));
    }

    #[test]
    fn test_latin1_one_byte_per_char() {
        let codec = TextCodec::new(Encoding::Latin1);
        let bytes = codec.encode(&json!("é")).unwrap();
        assert_eq!(&bytes[..], &[0xe9]);
        assert_eq!(codec.decode(&[0xe9, b'a']).unwrap(), json!("éa"));
    }

    #[test]
    fn test_ascii_masks_high_bit() {
        let codec = TextCodec::new(Encoding::Ascii);
        assert_eq!(codec.decode(&[0xc1, b'b']).unwrap(), json!("Ab"));
    }

    #[test]
    fn test_non_string_sent_as_json_text() {
        let codec = TextCodec::default();
        assert_eq!(&codec.encode(&json!(42)).unwrap()[..], b"42");
    }
}
