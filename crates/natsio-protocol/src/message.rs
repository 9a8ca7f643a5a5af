use bytes::Bytes;

/// A message delivered by the server for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    pub sid: u64,
    pub reply: Option<String>,
    pub payload: Bytes,
}

impl Message {
    #[must_use]
    pub fn new(subject: impl Into<String>, sid: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            subject: subject.into(),
            sid,
            reply: None,
            payload: payload.into(),
        }
    }

    #[must_use]
    pub fn with_reply(mut self, reply: impl Into<String>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Payload interpreted as UTF-8, with invalid sequences replaced.
    #[must_use]
    pub fn payload_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}
