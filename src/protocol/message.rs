//! Protocol message definitions
//!
//! Defines every message exchanged between the network process and the UI
//! process. Every message that concerns a request carries its id.

use serde::{Deserialize, Serialize};

use super::MAX_ERROR_LEN;
use crate::scheme::Scheme;

/// Caller-chosen request identifier, unique among live requests
pub type RequestId = u32;

/// Client certificate material for Gemini mutual TLS
///
/// Produced by the certificate manager; this process only hands it to the
/// TLS layer.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientIdentity {
    /// PEM encoded certificate chain
    pub cert_pem: Vec<u8>,
    /// PEM encoded PKCS#8 private key
    pub key_pem: Vec<u8>,
}

impl std::fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("cert_pem", &format_args!("{} bytes", self.cert_pem.len()))
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

/// All possible channel messages
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Start a new request
    Fetch {
        id: RequestId,
        scheme: Scheme,
        host: String,
        port: u16,
        /// Serialized wire request, CRLF included
        request: Vec<u8>,
        identity: Option<ClientIdentity>,
    },

    /// Ask the UI whether the peer certificate is trusted
    TrustCheck {
        id: RequestId,
        fingerprint: String,
    },

    /// Answer to a TrustCheck
    TrustVerdict {
        id: RequestId,
        accept: bool,
    },

    /// Parsed Gemini response header
    ReplyHeader {
        id: RequestId,
        status: u8,
        meta: String,
    },

    /// Continue streaming the body after a ReplyHeader
    Proceed {
        id: RequestId,
    },

    /// Abort a request
    Stop {
        id: RequestId,
    },

    /// A bounded slice of body data
    BodyChunk {
        id: RequestId,
        data: Vec<u8>,
    },

    /// No more body data will follow
    EndOfStream {
        id: RequestId,
    },

    /// The request failed; terminal for this id
    Error {
        id: RequestId,
        message: String,
    },

    /// Shut the whole process down
    Quit,
}

impl Message {
    /// Build an `Error`, cutting the text to [`MAX_ERROR_LEN`] bytes
    pub fn error(id: RequestId, message: impl Into<String>) -> Self {
        let mut message = message.into();
        if message.len() > MAX_ERROR_LEN {
            let mut end = MAX_ERROR_LEN;
            while !message.is_char_boundary(end) {
                end -= 1;
            }
            message.truncate(end);
        }
        Message::Error { id, message }
    }

    /// Get the message type identifier
    pub fn type_id(&self) -> u8 {
        match self {
            Message::Fetch { .. } => 0x01,
            Message::TrustCheck { .. } => 0x10,
            Message::TrustVerdict { .. } => 0x11,
            Message::ReplyHeader { .. } => 0x20,
            Message::Proceed { .. } => 0x21,
            Message::Stop { .. } => 0x22,
            Message::BodyChunk { .. } => 0x30,
            Message::EndOfStream { .. } => 0x31,
            Message::Error { .. } => 0xFE,
            Message::Quit => 0xFF,
        }
    }

    /// The request this message is about, if any
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            Message::Fetch { id, .. }
            | Message::TrustCheck { id, .. }
            | Message::TrustVerdict { id, .. }
            | Message::ReplyHeader { id, .. }
            | Message::Proceed { id }
            | Message::Stop { id }
            | Message::BodyChunk { id, .. }
            | Message::EndOfStream { id }
            | Message::Error { id, .. } => Some(*id),
            Message::Quit => None,
        }
    }

    /// Check if this message ends the life of its request
    pub fn is_terminal(&self) -> bool {
        matches!(self, Message::EndOfStream { .. } | Message::Error { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_type_ids() {
        assert_eq!(Message::Quit.type_id(), 0xFF);
        assert_eq!(Message::Proceed { id: 1 }.type_id(), 0x21);
    }

    #[test]
    fn test_request_id() {
        let msg = Message::BodyChunk { id: 42, data: vec![1, 2, 3] };
        assert_eq!(msg.request_id(), Some(42));
        assert_eq!(Message::Quit.request_id(), None);
    }

    #[test]
    fn test_terminal_messages() {
        assert!(Message::EndOfStream { id: 1 }.is_terminal());
        assert!(Message::Error { id: 1, message: "x".into() }.is_terminal());
        assert!(!Message::Stop { id: 1 }.is_terminal());
    }

    #[test]
    fn test_error_text_is_bounded() {
        let short = Message::error(3, "can't resolve example.org");
        assert_eq!(short, Message::Error { id: 3, message: "can't resolve example.org".into() });

        // Multi-byte characters straddle the limit
        let long = Message::error(3, format!("x{}", "é".repeat(MAX_ERROR_LEN)));
        match long {
            Message::Error { message, .. } => {
                assert_eq!(message.len(), MAX_ERROR_LEN - 1);
                assert!(message[1..].chars().all(|c| c == 'é'));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_identity_debug_hides_key() {
        let identity = ClientIdentity {
            cert_pem: b"cert".to_vec(),
            key_pem: b"secret".to_vec(),
        };
        let rendered = format!("{:?}", identity);
        assert!(!rendered.contains("secret"));
    }
}
