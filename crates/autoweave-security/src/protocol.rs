//! Wire protocol for host ↔ plugin messaging.
//!
//! Frames are JSON documents carried as length-prefixed blobs (u32 big-endian
//! length, then the body). When channel encryption is on, the body is
//! `nonce || ciphertext` sealed by the per-channel key; otherwise it is the
//! JSON itself. The protocol is request/reply plus one-way events:
//! `request{id, type, data}` is answered by `reply{id, ok|err, data}`.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound for any frame body on the wire
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A typed message crossing the boundary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Frame {
    /// Expects a `Reply` with the same id
    Request {
        id: u64,
        #[serde(rename = "type")]
        message_type: String,
        data: serde_json::Value,
    },
    /// Answer to a `Request`
    Reply {
        id: u64,
        ok: bool,
        data: serde_json::Value,
    },
    /// One-way notification
    Event {
        #[serde(rename = "type")]
        message_type: String,
        data: serde_json::Value,
    },
}

impl Frame {
    /// Message type tag, or `"reply"` for replies
    pub fn message_type(&self) -> &str {
        match self {
            Frame::Request { message_type, .. } | Frame::Event { message_type, .. } => message_type,
            Frame::Reply { .. } => "reply",
        }
    }

    pub fn data(&self) -> &serde_json::Value {
        match self {
            Frame::Request { data, .. } | Frame::Reply { data, .. } | Frame::Event { data, .. } => {
                data
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("frames serialize without error")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Well-known message types the host sends and understands
pub mod types {
    /// Host -> plugin on start
    pub const INITIALIZE: &str = "initialize";
    /// Host -> plugin, carries the code/task to run
    pub const EXECUTE: &str = "execute";
    /// Host -> plugin before the channel closes
    pub const CLEANUP: &str = "cleanup";
    /// Host -> plugin hotplug delivery
    pub const USB_ATTACHED: &str = "usb.device.attached";
    pub const USB_DETACHED: &str = "usb.device.detached";

    /// Plugin -> host usage sample
    pub const RESOURCE_USAGE: &str = "resource-usage";
    /// Plugin -> host denied-operation report
    pub const PERMISSION_DENIED: &str = "permission-denied";
    /// Plugin -> host pattern hit report
    pub const PATTERN_MATCH: &str = "pattern-match";
    /// Plugin -> host follow-up job submission
    pub const PUBLISH_JOB: &str = "publish-job";
    /// Plugin -> host free-form log line
    pub const LOG: &str = "log";
}

/// Required object keys per message type, applied in strict mode.
/// Types not listed here pass with any object payload.
pub fn required_keys(message_type: &str) -> &'static [&'static str] {
    match message_type {
        types::EXECUTE => &["code"],
        types::USB_ATTACHED | types::USB_DETACHED => &["device_info", "timestamp"],
        types::RESOURCE_USAGE => &["heap_bytes"],
        types::PERMISSION_DENIED => &["action", "required"],
        types::PATTERN_MATCH => &["pattern"],
        types::PUBLISH_JOB => &["queue", "job_type", "payload"],
        _ => &[],
    }
}

/// Strict-mode schema check: payload must be an object carrying every
/// required key for its type.
pub fn validate_schema(message_type: &str, data: &serde_json::Value) -> Result<(), String> {
    let Some(object) = data.as_object() else {
        return Err(format!("payload for `{message_type}` must be an object"));
    };
    for key in required_keys(message_type) {
        if !object.contains_key(*key) {
            return Err(format!("payload for `{message_type}` is missing `{key}`"));
        }
    }
    Ok(())
}

/// Write one length-prefixed body
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> std::io::Result<()> {
    if body.len() > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "frame exceeds maximum length",
        ));
    }
    writer.write_u32(body.len() as u32).await?;
    writer.write_all(body).await?;
    writer.flush().await
}

/// Read one length-prefixed body. `Ok(None)` on clean EOF at a frame edge.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "frame exceeds maximum length",
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Request {
            id: 7,
            message_type: types::EXECUTE.to_string(),
            data: json!({"code": "run()"}),
        };
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.message_type(), "execute");
    }

    #[test]
    fn test_frame_wire_shape() {
        let frame = Frame::Reply {
            id: 3,
            ok: false,
            data: json!({"error": "nope"}),
        };
        let value: serde_json::Value = serde_json::from_slice(&frame.encode()).unwrap();
        assert_eq!(value["kind"], "reply");
        assert_eq!(value["id"], 3);
        assert_eq!(value["ok"], false);
    }

    #[test]
    fn test_schema_validation() {
        assert!(validate_schema(types::EXECUTE, &json!({"code": "x"})).is_ok());
        assert!(validate_schema(types::EXECUTE, &json!({"src": "x"})).is_err());
        assert!(validate_schema(types::EXECUTE, &json!("just a string")).is_err());
        assert!(validate_schema("custom.type", &json!({"anything": 1})).is_ok());
    }

    #[tokio::test]
    async fn test_length_prefixed_io() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, b"hello").await.unwrap();
        write_frame(&mut client, b"").await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"hello");
        assert_eq!(read_frame(&mut server).await.unwrap().unwrap(), b"");
        assert!(read_frame(&mut server).await.unwrap().is_none());
    }
}
