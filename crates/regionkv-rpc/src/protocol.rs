//! Wire format for region server RPCs.
//!
//! Every RPC travels as one frame: a fixed 19-byte header followed by a
//! bincode-encoded [`RpcBody`]. A frame carries either a single action or a
//! multi-action holding several actions in submission order.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::error::{Result, RpcError};

/// Frame header size in bytes (magic:4 + version:1 + opcode:2 + request_id:8 + payload_length:4)
pub const FRAME_HEADER_SIZE: usize = 19;

/// Protocol magic number for frame validation
pub const MAGIC: u32 = 0x524B_5601;

/// Protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Operation carried by a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u16)]
pub enum Opcode {
    /// Point read
    Get = 0x0001,
    /// Cell write
    Put = 0x0002,
    /// Append to an existing cell
    Append = 0x0003,
    /// Cell, family or row delete
    Delete = 0x0004,
    /// Several actions in one frame
    Multi = 0x0010,
}

impl TryFrom<u16> for Opcode {
    type Error = RpcError;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            0x0001 => Ok(Opcode::Get),
            0x0002 => Ok(Opcode::Put),
            0x0003 => Ok(Opcode::Append),
            0x0004 => Ok(Opcode::Delete),
            0x0010 => Ok(Opcode::Multi),
            other => Err(RpcError::InvalidFrame {
                reason: format!("unknown opcode 0x{other:04X}"),
            }),
        }
    }
}

/// Identifies the region an action is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionRef {
    /// Table the region belongs to.
    pub table: Bytes,
    /// Fully qualified region name as reported by the lookup service.
    pub name: Bytes,
}

impl RegionRef {
    /// Creates a region reference.
    pub fn new(table: impl Into<Bytes>, name: impl Into<Bytes>) -> Self {
        Self {
            table: table.into(),
            name: name.into(),
        }
    }
}

/// A single key-value operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum Action {
    /// Reads one family, or one cell when `qualifier` is set.
    Get {
        key: Bytes,
        family: Bytes,
        qualifier: Option<Bytes>,
    },
    /// Writes one cell.
    Put {
        key: Bytes,
        family: Bytes,
        qualifier: Bytes,
        value: Bytes,
    },
    /// Appends to one cell.
    Append {
        key: Bytes,
        family: Bytes,
        qualifier: Bytes,
        value: Bytes,
    },
    /// Deletes a row, a family, or a single cell.
    Delete {
        key: Bytes,
        family: Option<Bytes>,
        qualifier: Option<Bytes>,
    },
}

impl Action {
    /// Opcode used when this action travels alone.
    pub fn opcode(&self) -> Opcode {
        match self {
            Action::Get { .. } => Opcode::Get,
            Action::Put { .. } => Opcode::Put,
            Action::Append { .. } => Opcode::Append,
            Action::Delete { .. } => Opcode::Delete,
        }
    }

    /// Short lowercase name for logs and errors.
    pub fn name(&self) -> &'static str {
        match self {
            Action::Get { .. } => "get",
            Action::Put { .. } => "put",
            Action::Append { .. } => "append",
            Action::Delete { .. } => "delete",
        }
    }

    /// Row key the action touches.
    pub fn key(&self) -> &Bytes {
        match self {
            Action::Get { key, .. }
            | Action::Put { key, .. }
            | Action::Append { key, .. }
            | Action::Delete { key, .. } => key,
        }
    }

    /// Returns true for writes.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Action::Get { .. })
    }
}

/// An action together with its target region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionAction {
    /// Target region, absent until the lookup service resolved it.
    pub region: Option<RegionRef>,
    /// The operation itself.
    pub action: Action,
}

/// Frame body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RpcBody {
    /// One action.
    Single(RegionAction),
    /// Two or more actions, in submission order.
    Multi(Vec<RegionAction>),
}

impl RpcBody {
    /// Opcode written in the frame header.
    pub fn opcode(&self) -> Opcode {
        match self {
            RpcBody::Single(single) => single.action.opcode(),
            RpcBody::Multi(_) => Opcode::Multi,
        }
    }
}

/// Frame header containing metadata about the body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number
    pub magic: u32,
    /// Protocol version
    pub version: u8,
    /// Operation code
    pub opcode: Opcode,
    /// Request ID used to match the response
    pub request_id: u64,
    /// Body length in bytes
    pub payload_length: u32,
}

impl FrameHeader {
    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u16(self.opcode as u16);
        buf.put_u64(self.request_id);
        buf.put_u32(self.payload_length);
    }

    fn parse(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(RpcError::InvalidFrame {
                reason: format!("short header: {} bytes", buf.len()),
            });
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(RpcError::InvalidFrame {
                reason: format!("bad magic 0x{magic:08X}"),
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(RpcError::InvalidFrame {
                reason: format!("unsupported version {version}"),
            });
        }
        let opcode = Opcode::try_from(buf.get_u16())?;
        let request_id = buf.get_u64();
        let payload_length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            opcode,
            request_id,
            payload_length,
        })
    }
}

/// Encodes `body` into a complete frame.
pub fn encode_frame(request_id: u64, body: &RpcBody) -> Result<Bytes> {
    let payload =
        bincode::serialize(body).map_err(|e| RpcError::Serialization(e.to_string()))?;
    let header = FrameHeader {
        magic: MAGIC,
        version: PROTOCOL_VERSION,
        opcode: body.opcode(),
        request_id,
        payload_length: payload.len() as u32,
    };
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
    header.put(&mut buf);
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decodes a complete frame produced by [`encode_frame`].
pub fn decode_frame(frame: &[u8]) -> Result<(FrameHeader, RpcBody)> {
    let header = FrameHeader::parse(frame)?;
    let body = &frame[FRAME_HEADER_SIZE..];
    if body.len() != header.payload_length as usize {
        return Err(RpcError::InvalidFrame {
            reason: format!(
                "payload length {} does not match header {}",
                body.len(),
                header.payload_length
            ),
        });
    }
    let body: RpcBody =
        bincode::deserialize(body).map_err(|e| RpcError::Serialization(e.to_string()))?;
    if body.opcode() != header.opcode {
        return Err(RpcError::InvalidFrame {
            reason: "opcode does not match body".to_string(),
        });
    }
    Ok((header, body))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(key: &'static [u8]) -> RegionAction {
        RegionAction {
            region: Some(RegionRef::new("t", "t,,1")),
            action: Action::Put {
                key: Bytes::from_static(key),
                family: Bytes::from_static(b"f"),
                qualifier: Bytes::from_static(b"q"),
                value: Bytes::from_static(b"*"),
            },
        }
    }

    #[test]
    fn test_header_layout() {
        let frame = encode_frame(7, &RpcBody::Single(put(b"k"))).unwrap();
        assert_eq!(&frame[0..4], &MAGIC.to_be_bytes());
        assert_eq!(frame[4], PROTOCOL_VERSION);
        assert_eq!(&frame[5..7], &(Opcode::Put as u16).to_be_bytes());
        assert_eq!(&frame[7..15], &7u64.to_be_bytes());
        let len = u32::from_be_bytes(frame[15..19].try_into().unwrap()) as usize;
        assert_eq!(frame.len(), FRAME_HEADER_SIZE + len);
    }

    #[test]
    fn test_multi_keeps_order() {
        let body = RpcBody::Multi(vec![put(b"a"), put(b"b"), put(b"c")]);
        let frame = encode_frame(2, &body).unwrap();
        let (header, decoded) = decode_frame(&frame).unwrap();
        assert_eq!(header.opcode, Opcode::Multi);
        assert_eq!(header.request_id, 2);
        let RpcBody::Multi(actions) = decoded else {
            panic!("expected multi body");
        };
        let keys: Vec<_> = actions.iter().map(|a| a.action.key().clone()).collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut frame = encode_frame(1, &RpcBody::Single(put(b"k"))).unwrap().to_vec();
        frame[0] ^= 0xFF;
        assert!(matches!(
            decode_frame(&frame),
            Err(RpcError::InvalidFrame { .. })
        ));
    }

    #[test]
    fn test_truncated_frame_rejected() {
        let frame = encode_frame(1, &RpcBody::Single(put(b"k"))).unwrap();
        assert!(decode_frame(&frame[..10]).is_err());
        assert!(decode_frame(&frame[..frame.len() - 1]).is_err());
    }

    #[test]
    fn test_unknown_opcode() {
        assert!(Opcode::try_from(0x7777).is_err());
        assert_eq!(Opcode::try_from(0x0010).unwrap(), Opcode::Multi);
    }

    #[test]
    fn test_action_classification() {
        let get = Action::Get {
            key: Bytes::from_static(b"k"),
            family: Bytes::from_static(b"f"),
            qualifier: None,
        };
        assert!(!get.is_mutation());
        assert_eq!(get.name(), "get");
        assert!(put(b"k").action.is_mutation());
    }
}
