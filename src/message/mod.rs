//! Application messages and their wire framing.
//!
//! ## Wire Format
//!
//! ```text
//! +-------------+--------------+----------------+------------------+
//! | length: i32 | route_id: i32| message_id: i32| body: length B   |
//! +-------------+--------------+----------------+------------------+
//! ```
//!
//! All header fields are big-endian. There is no magic number, version or
//! checksum; framing relies entirely on `length`, so decoders enforce a
//! maximum frame size.

pub mod codec;
pub mod pool;

use bytes::Bytes;

pub use codec::{decode, encode, read_message, write_message, Decoded};
pub use pool::MessagePool;

/// Size of the fixed frame header (length, route id, message id).
pub const HEADER_SIZE: usize = 12;

/// Default ceiling on a single frame body.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Pool tag for messages carried over TCP.
pub const TCP_KIND: &str = "tcp";

/// A single application-layer message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    body: Bytes,
    message_id: i32,
    route_id: i32,
    length: i32,
}

impl Message {
    /// Create a message; `length` is derived from `body`.
    pub fn new(body: impl Into<Bytes>, message_id: i32, route_id: i32) -> Self {
        let mut msg = Message::default();
        msg.write(body, message_id, route_id);
        msg
    }

    /// Overwrite every field, recomputing `length` from the body.
    pub fn write(&mut self, body: impl Into<Bytes>, message_id: i32, route_id: i32) {
        self.body = body.into();
        self.message_id = message_id;
        self.route_id = route_id;
        // Oversized bodies are rejected by the encoder.
        self.length = i32::try_from(self.body.len()).unwrap_or(i32::MAX);
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn message_id(&self) -> i32 {
        self.message_id
    }

    pub fn route_id(&self) -> i32 {
        self.route_id
    }

    pub fn length(&self) -> i32 {
        self.length
    }

    /// Clear the body and ids so the message can be reused.
    pub fn reset(&mut self) {
        self.body = Bytes::new();
        self.message_id = 0;
        self.route_id = 0;
        self.length = 0;
    }

    /// Install decoded fields. The caller guarantees `length == body.len()`.
    pub(crate) fn set_decoded(&mut self, body: Bytes, message_id: i32, route_id: i32) {
        self.length = body.len() as i32;
        self.body = body;
        self.message_id = message_id;
        self.route_id = route_id;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_recomputes_length() {
        let mut msg = Message::new("hello", 3, 9);
        assert_eq!(msg.length(), 5);
        assert_eq!(msg.message_id(), 3);
        assert_eq!(msg.route_id(), 9);

        msg.write(Bytes::new(), 4, 9);
        assert_eq!(msg.length(), 0);
        assert!(msg.body().is_empty());
    }

    #[test]
    fn test_reset_clears_fields() {
        let mut msg = Message::new(vec![1u8, 2, 3], 11, 12);
        msg.reset();
        assert_eq!(msg, Message::default());
    }
}
