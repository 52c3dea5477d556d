//! Record envelope for everything written to the store.
//!
//! A record is one line of JSON header, a newline, then the JSON body:
//!
//! ```text
//! {"format":1,"kind":"memento","id":"web","epoch":3,"sequence":17,"length":412,"checksum":"9f.."}
//! {"kind":"component","id":"web","type":"cairn.component",...}
//! ```
//!
//! The header records the body length and BLAKE3 checksum, so a torn or
//! truncated write is detected on read instead of half-parsed.

use bytes::{BufMut, Bytes, BytesMut};
use cairn_core::Checksum;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current record format
pub const FORMAT_VERSION: u32 = 1;

/// Store paths of the well-known records
pub mod paths {
    use cairn_core::{NodeId, ObjectId};

    /// Prefix of every memento record
    pub const MEMENTOS: &str = "mementos/";
    /// Prefix of node heartbeat records
    pub const PLANE_NODES: &str = "plane/nodes/";
    /// The master record
    pub const MASTER: &str = "plane/master";

    /// Path of a memento record
    #[must_use]
    pub fn memento(id: &ObjectId) -> String {
        format!("{}{}", MEMENTOS, id)
    }

    /// Path of a node heartbeat record
    #[must_use]
    pub fn node(id: &NodeId) -> String {
        format!("{}{}", PLANE_NODES, id)
    }

    /// Object id encoded in a memento path
    #[must_use]
    pub fn memento_id(path: &str) -> Option<ObjectId> {
        path.strip_prefix(MEMENTOS)
            .and_then(|raw| ObjectId::parse(raw).ok())
    }

    /// Node id encoded in a node path
    #[must_use]
    pub fn node_id(path: &str) -> Option<NodeId> {
        path.strip_prefix(PLANE_NODES)
            .and_then(|raw| NodeId::parse(raw).ok())
    }
}

/// What a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    /// A managed-object memento
    Memento,
    /// A node heartbeat
    Node,
    /// The master record
    Master,
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Memento => "memento",
            Self::Node => "node",
            Self::Master => "master",
        };
        f.write_str(s)
    }
}

/// Record header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordHeader {
    /// Format version
    pub format: u32,
    /// Record kind
    pub kind: RecordKind,
    /// Id of the thing recorded
    pub id: String,
    /// Master epoch of the writer; zero when written outside mastership
    pub epoch: u64,
    /// Writer-local sequence number, monotonic per id
    pub sequence: u64,
    /// Body length in bytes
    pub length: u64,
    /// Body checksum
    pub checksum: Checksum,
}

/// Encoding errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodingError {
    /// No header line
    #[error("record has no header line")]
    MissingHeader,

    /// Header not parseable
    #[error("invalid record header: {reason}")]
    InvalidHeader {
        /// Parser message
        reason: String,
    },

    /// Written by an unknown format
    #[error("unsupported record format {found} (supported: {supported})")]
    UnsupportedFormat {
        /// Format in the header
        found: u32,
        /// Format this build writes
        supported: u32,
    },

    /// Body shorter or longer than the header says
    #[error("record truncated: header says {expected} bytes, found {actual}")]
    Truncated {
        /// Length in the header
        expected: u64,
        /// Length read
        actual: u64,
    },

    /// Body checksum does not match
    #[error("record checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Checksum in the header
        expected: String,
        /// Checksum of the body
        actual: String,
    },

    /// Header kind differs from what the reader expected
    #[error("expected {expected} record, found {found}")]
    WrongKind {
        /// Kind the reader asked for
        expected: RecordKind,
        /// Kind in the header
        found: RecordKind,
    },

    /// Body not parseable
    #[error("invalid record body: {reason}")]
    InvalidBody {
        /// Parser message
        reason: String,
    },

    /// Malformed `$ref`
    #[error("invalid reference: {reason}")]
    InvalidReference {
        /// Why the reference was rejected
        reason: String,
    },
}

/// Encode a record
///
/// # Errors
///
/// Returns error if the body cannot be serialized
pub fn encode<T: Serialize>(
    kind: RecordKind,
    id: &str,
    epoch: u64,
    sequence: u64,
    body: &T,
) -> Result<Bytes, EncodingError> {
    let body = serde_json::to_vec(body).map_err(|e| EncodingError::InvalidBody {
        reason: e.to_string(),
    })?;
    let header = RecordHeader {
        format: FORMAT_VERSION,
        kind,
        id: id.to_string(),
        epoch,
        sequence,
        length: body.len() as u64,
        checksum: Checksum::compute(&body),
    };
    let header = serde_json::to_vec(&header).map_err(|e| EncodingError::InvalidHeader {
        reason: e.to_string(),
    })?;

    let mut out = BytesMut::with_capacity(header.len() + 1 + body.len());
    out.put_slice(&header);
    out.put_u8(b'\n');
    out.put_slice(&body);
    Ok(out.freeze())
}

fn split(bytes: &[u8]) -> Result<(RecordHeader, &[u8]), EncodingError> {
    let newline = bytes
        .iter()
        .position(|b| *b == b'\n')
        .ok_or(EncodingError::MissingHeader)?;
    let header: RecordHeader =
        serde_json::from_slice(&bytes[..newline]).map_err(|e| EncodingError::InvalidHeader {
            reason: e.to_string(),
        })?;
    if header.format != FORMAT_VERSION {
        return Err(EncodingError::UnsupportedFormat {
            found: header.format,
            supported: FORMAT_VERSION,
        });
    }
    Ok((header, &bytes[newline + 1..]))
}

/// Decode only the header, without verifying the body
///
/// # Errors
///
/// Returns error if the header is missing or malformed
pub fn decode_header(bytes: &[u8]) -> Result<RecordHeader, EncodingError> {
    split(bytes).map(|(header, _)| header)
}

/// Decode and verify a record of the expected kind
///
/// # Errors
///
/// Returns error if the record is malformed, truncated, fails its checksum,
/// or holds a different kind
pub fn decode<T: DeserializeOwned>(
    bytes: &[u8],
    expected: RecordKind,
) -> Result<(RecordHeader, T), EncodingError> {
    let (header, body) = split(bytes)?;
    if header.kind != expected {
        return Err(EncodingError::WrongKind {
            expected,
            found: header.kind,
        });
    }
    if body.len() as u64 != header.length {
        return Err(EncodingError::Truncated {
            expected: header.length,
            actual: body.len() as u64,
        });
    }
    let actual = Checksum::compute(body);
    if actual != header.checksum {
        return Err(EncodingError::ChecksumMismatch {
            expected: header.checksum.to_hex(),
            actual: actual.to_hex(),
        });
    }
    let value = serde_json::from_slice(body).map_err(|e| EncodingError::InvalidBody {
        reason: e.to_string(),
    })?;
    Ok((header, value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Memento, MementoKind};
    use cairn_core::ObjectId;

    fn sample() -> Memento {
        Memento::builder(
            MementoKind::Component,
            ObjectId::parse("web").unwrap(),
            "cairn.component",
        )
        .display_name("web")
        .build()
    }

    #[test]
    fn test_encode_decode() {
        let bytes = encode(RecordKind::Memento, "web", 3, 17, &sample()).unwrap();
        let (header, memento): (RecordHeader, Memento) =
            decode(&bytes, RecordKind::Memento).unwrap();
        assert_eq!(header.epoch, 3);
        assert_eq!(header.sequence, 17);
        assert_eq!(header.id, "web");
        assert_eq!(memento, sample());
    }

    #[test]
    fn test_truncated_detected() {
        let bytes = encode(RecordKind::Memento, "web", 1, 1, &sample()).unwrap();
        let cut = &bytes[..bytes.len() - 5];
        let result: Result<(RecordHeader, Memento), _> = decode(cut, RecordKind::Memento);
        assert!(matches!(result, Err(EncodingError::Truncated { .. })));
    }

    #[test]
    fn test_corruption_detected() {
        let bytes = encode(RecordKind::Memento, "web", 1, 1, &sample()).unwrap();
        let mut corrupt = bytes.to_vec();
        let last = corrupt.len() - 2;
        corrupt[last] ^= 0x20;
        let result: Result<(RecordHeader, Memento), _> = decode(&corrupt, RecordKind::Memento);
        assert!(matches!(result, Err(EncodingError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_missing_header() {
        let result: Result<(RecordHeader, Memento), _> = decode(b"garbage", RecordKind::Memento);
        assert_eq!(result.unwrap_err(), EncodingError::MissingHeader);
    }

    #[test]
    fn test_wrong_kind() {
        let bytes = encode(RecordKind::Node, "a", 0, 0, &42u32).unwrap();
        let result: Result<(RecordHeader, u32), _> = decode(&bytes, RecordKind::Master);
        assert!(matches!(result, Err(EncodingError::WrongKind { .. })));
    }

    #[test]
    fn test_decode_header_only() {
        let bytes = encode(RecordKind::Memento, "web", 9, 2, &sample()).unwrap();
        let header = decode_header(&bytes[..bytes.len() - 3]).unwrap();
        assert_eq!(header.epoch, 9);
    }

    #[test]
    fn test_paths() {
        let id = ObjectId::parse("web").unwrap();
        assert_eq!(paths::memento(&id), "mementos/web");
        assert_eq!(paths::memento_id("mementos/web"), Some(id));
        assert_eq!(paths::memento_id("plane/master"), None);
    }
}
