//! Mach message format - what user code hands to and gets from `mach_msg`
//!
//! Based on Mach4 mach/message.h
//!
//! The wire form is little-endian: a 24-byte header followed by typed body
//! items. Each item starts with a 4-byte tag:
//!
//! | item   | layout after the tag                           | size |
//! |--------|------------------------------------------------|------|
//! | inline | `count: u32`, `count` bytes, padded to 4       | 8+n  |
//! | port   | `disposition: u32`, `name: u32`                | 12   |
//! | ool    | `address: u64`, `size: u64`, `deallocate: u32` | 24   |

use alloc::vec::Vec;

use super::entry::MachPortName;
use super::mach_msg::MsgError;
use super::MACH_PORT_NULL;
use crate::mach_vm::VmAddress;

// ============================================================================
// Message Size Constants
// ============================================================================

/// Size of the fixed message header on the wire
pub const MACH_MSG_HEADER_SIZE: usize = 24;

/// Maximum message size (header plus inline body)
pub const MACH_MSG_SIZE_MAX: usize = 64 * 1024;

/// Maximum number of body items
pub const MACH_MSG_DESC_MAX: usize = 256;

const ITEM_INLINE: u32 = 0;
const ITEM_PORT: u32 = 1;
const ITEM_OOL: u32 = 2;

// ============================================================================
// Message Types
// ============================================================================

/// Message type bits (in msgh_bits)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachMsgBits(pub u32);

impl MachMsgBits {
    /// Remote port type mask
    pub const REMOTE_MASK: u32 = 0x0000_00ff;
    /// Local port type mask
    pub const LOCAL_MASK: u32 = 0x0000_ff00;
    /// Complex message (has ports or out-of-line memory)
    pub const COMPLEX: u32 = 0x8000_0000;
    /// Bits a sender may set
    pub const USER: u32 = Self::REMOTE_MASK | Self::LOCAL_MASK | Self::COMPLEX;

    /// Create new message bits from raw dispositions
    pub const fn new(remote: u32, local: u32) -> Self {
        Self((remote & Self::REMOTE_MASK) | ((local << 8) & Self::LOCAL_MASK))
    }

    /// Raw remote (destination) disposition
    pub const fn remote(self) -> u32 {
        self.0 & Self::REMOTE_MASK
    }

    /// Raw local (reply) disposition
    pub const fn local(self) -> u32 {
        (self.0 & Self::LOCAL_MASK) >> 8
    }

    /// Check if message is complex
    pub const fn is_complex(self) -> bool {
        (self.0 & Self::COMPLEX) != 0
    }

    /// Set or clear the complex bit
    pub fn set_complex(&mut self, complex: bool) {
        if complex {
            self.0 |= Self::COMPLEX;
        } else {
            self.0 &= !Self::COMPLEX;
        }
    }
}

/// Port right dispositions (from Mach4 mach/message.h)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MsgTypeName {
    /// Move receive right
    MoveReceive = 16,
    /// Move send right
    MoveSend = 17,
    /// Move send-once right
    MoveSendOnce = 18,
    /// Copy send right
    CopySend = 19,
    /// Make send right
    MakeSend = 20,
    /// Make send-once right
    MakeSendOnce = 21,
}

impl MsgTypeName {
    /// Receive right in transit
    pub const PORT_RECEIVE: Self = Self::MoveReceive;
    /// Send right in transit
    pub const PORT_SEND: Self = Self::MoveSend;
    /// Send-once right in transit
    pub const PORT_SEND_ONCE: Self = Self::MoveSendOnce;

    /// Convert from raw value
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            16 => Some(Self::MoveReceive),
            17 => Some(Self::MoveSend),
            18 => Some(Self::MoveSendOnce),
            19 => Some(Self::CopySend),
            20 => Some(Self::MakeSend),
            21 => Some(Self::MakeSendOnce),
            _ => None,
        }
    }

    /// Kind of right the receiver ends up with
    pub fn result_type(self) -> Self {
        match self {
            Self::MoveReceive => Self::PORT_RECEIVE,
            Self::MoveSend | Self::CopySend | Self::MakeSend => Self::PORT_SEND,
            Self::MoveSendOnce | Self::MakeSendOnce => Self::PORT_SEND_ONCE,
        }
    }

    /// Check if this creates a right
    pub fn is_make(self) -> bool {
        matches!(self, Self::MakeSend | Self::MakeSendOnce)
    }

    /// Is this a legal disposition for a header port (dest or reply)?
    pub fn is_send_disposition(self) -> bool {
        self != Self::MoveReceive
    }
}

// ============================================================================
// Message Header
// ============================================================================

/// Mach message header
///
/// On send, `msgh_remote_port` names the destination and
/// `msgh_local_port` the optional reply right. On receive they are swapped:
/// remote is the reply right now held by the receiver, local names the port
/// the message arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MachMsgHeader {
    /// Message bits (port dispositions, complexity)
    pub msgh_bits: MachMsgBits,
    /// Total message size in bytes (header plus inline body)
    pub msgh_size: u32,
    /// Destination port name
    pub msgh_remote_port: MachPortName,
    /// Reply port name
    pub msgh_local_port: MachPortName,
    /// Sequence number, filled in on receive
    pub msgh_seqno: u32,
    /// Message ID (application-defined)
    pub msgh_id: i32,
}

impl MachMsgHeader {
    /// Serialize to the 24-byte wire header
    pub fn to_bytes(&self) -> [u8; MACH_MSG_HEADER_SIZE] {
        let mut out = [0u8; MACH_MSG_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.msgh_bits.0.to_le_bytes());
        out[4..8].copy_from_slice(&self.msgh_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.msgh_remote_port.to_le_bytes());
        out[12..16].copy_from_slice(&self.msgh_local_port.to_le_bytes());
        out[16..20].copy_from_slice(&self.msgh_seqno.to_le_bytes());
        out[20..24].copy_from_slice(&self.msgh_id.to_le_bytes());
        out
    }

    /// Parse a wire header
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let mut r = Reader::new(bytes.get(..MACH_MSG_HEADER_SIZE)?);
        Some(Self {
            msgh_bits: MachMsgBits(r.u32()?),
            msgh_size: r.u32()?,
            msgh_remote_port: r.u32()?,
            msgh_local_port: r.u32()?,
            msgh_seqno: r.u32()?,
            msgh_id: r.u32()? as i32,
        })
    }
}

// ============================================================================
// Message Body
// ============================================================================

/// One typed body item
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MsgItem {
    /// Data copied with the message
    Inline(Vec<u8>),
    /// A port right; on receive, `disposition` is the right now held
    Port {
        name: MachPortName,
        disposition: MsgTypeName,
    },
    /// Memory transferred by mapping; `deallocate` removes the sender's
    /// region once the message is queued
    OutOfLine {
        address: VmAddress,
        size: u64,
        deallocate: bool,
    },
}

impl MsgItem {
    /// Bytes this item occupies on the wire
    pub fn wire_size(&self) -> usize {
        match self {
            MsgItem::Inline(data) => 8 + ((data.len() + 3) & !3),
            MsgItem::Port { .. } => 12,
            MsgItem::OutOfLine { .. } => 24,
        }
    }

    /// Does this item make the message complex?
    pub fn is_complex(&self) -> bool {
        !matches!(self, MsgItem::Inline(_))
    }
}

/// A complete user-level message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MachMessage {
    pub header: MachMsgHeader,
    pub body: Vec<MsgItem>,
}

impl MachMessage {
    /// Message to `dest` carrying the right named by `disposition`
    pub fn new(dest: MachPortName, disposition: MsgTypeName, id: i32) -> Self {
        let mut msg = Self {
            header: MachMsgHeader {
                msgh_bits: MachMsgBits::new(disposition as u32, 0),
                msgh_remote_port: dest,
                msgh_local_port: MACH_PORT_NULL,
                msgh_id: id,
                ..MachMsgHeader::default()
            },
            body: Vec::new(),
        };
        msg.update_header();
        msg
    }

    /// Attach a reply right
    pub fn with_reply(mut self, reply: MachPortName, disposition: MsgTypeName) -> Self {
        let remote = self.header.msgh_bits.remote();
        let complex = self.header.msgh_bits.is_complex();
        self.header.msgh_bits = MachMsgBits::new(remote, disposition as u32);
        self.header.msgh_bits.set_complex(complex);
        self.header.msgh_local_port = reply;
        self
    }

    /// Append inline data
    pub fn with_inline(mut self, data: &[u8]) -> Self {
        self.body.push(MsgItem::Inline(data.to_vec()));
        self.update_header();
        self
    }

    /// Append a port right
    pub fn with_port(mut self, name: MachPortName, disposition: MsgTypeName) -> Self {
        self.body.push(MsgItem::Port { name, disposition });
        self.update_header();
        self
    }

    /// Append an out-of-line region
    pub fn with_ool(mut self, address: VmAddress, size: u64, deallocate: bool) -> Self {
        self.body.push(MsgItem::OutOfLine {
            address,
            size,
            deallocate,
        });
        self.update_header();
        self
    }

    /// Wire size implied by the body
    pub fn wire_size(&self) -> usize {
        MACH_MSG_HEADER_SIZE + self.body.iter().map(MsgItem::wire_size).sum::<usize>()
    }

    /// Recompute `msgh_size` and the complex bit from the body
    pub fn update_header(&mut self) {
        self.header.msgh_size = self.wire_size() as u32;
        let complex = self.body.iter().any(MsgItem::is_complex);
        self.header.msgh_bits.set_complex(complex);
    }

    /// All inline bytes of the body, concatenated
    pub fn inline_data(&self) -> Vec<u8> {
        self.body
            .iter()
            .filter_map(|item| match item {
                MsgItem::Inline(data) => Some(data.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    /// Serialize to the wire form
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.wire_size());
        out.extend_from_slice(&self.header.to_bytes());
        for item in &self.body {
            match item {
                MsgItem::Inline(data) => {
                    out.extend_from_slice(&ITEM_INLINE.to_le_bytes());
                    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
                    out.extend_from_slice(data);
                    out.resize(out.len() + (((data.len() + 3) & !3) - data.len()), 0);
                }
                MsgItem::Port { name, disposition } => {
                    out.extend_from_slice(&ITEM_PORT.to_le_bytes());
                    out.extend_from_slice(&(*disposition as u32).to_le_bytes());
                    out.extend_from_slice(&name.to_le_bytes());
                }
                MsgItem::OutOfLine {
                    address,
                    size,
                    deallocate,
                } => {
                    out.extend_from_slice(&ITEM_OOL.to_le_bytes());
                    out.extend_from_slice(&address.to_le_bytes());
                    out.extend_from_slice(&size.to_le_bytes());
                    out.extend_from_slice(&(*deallocate as u32).to_le_bytes());
                }
            }
        }
        out
    }

    /// Parse the wire form; `msgh_size` bounds the parse
    pub fn decode(bytes: &[u8]) -> Result<Self, MsgError> {
        let header = MachMsgHeader::from_bytes(bytes).ok_or(MsgError::SendMsgTooSmall)?;
        let size = header.msgh_size as usize;
        if size < MACH_MSG_HEADER_SIZE || size > bytes.len() {
            return Err(MsgError::SendMsgTooSmall);
        }
        if size > MACH_MSG_SIZE_MAX {
            return Err(MsgError::SendTooLarge);
        }
        let mut r = Reader::new(&bytes[MACH_MSG_HEADER_SIZE..size]);
        let mut body = Vec::new();
        while !r.is_empty() {
            let tag = r.u32().ok_or(MsgError::SendInvalidData)?;
            let item = match tag {
                ITEM_INLINE => {
                    let count = r.u32().ok_or(MsgError::SendInvalidData)? as usize;
                    let data = r.bytes(count).ok_or(MsgError::SendInvalidData)?.to_vec();
                    r.bytes(((count + 3) & !3) - count)
                        .ok_or(MsgError::SendInvalidData)?;
                    MsgItem::Inline(data)
                }
                ITEM_PORT => {
                    let raw = r.u32().ok_or(MsgError::SendInvalidData)?;
                    let disposition = MsgTypeName::from_u32(raw).ok_or(MsgError::SendInvalidType)?;
                    let name = r.u32().ok_or(MsgError::SendInvalidData)?;
                    MsgItem::Port { name, disposition }
                }
                ITEM_OOL => MsgItem::OutOfLine {
                    address: r.u64().ok_or(MsgError::SendInvalidData)?,
                    size: r.u64().ok_or(MsgError::SendInvalidData)?,
                    deallocate: r.u32().ok_or(MsgError::SendInvalidData)? != 0,
                },
                _ => return Err(MsgError::SendInvalidType),
            };
            body.push(item);
            if body.len() > MACH_MSG_DESC_MAX {
                return Err(MsgError::SendTooLarge);
            }
        }
        Ok(Self { header, body })
    }
}

/// Little-endian cursor over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.buf.len() < n {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u32(&mut self) -> Option<u32> {
        self.bytes(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Option<u64> {
        let lo = self.u32()? as u64;
        let hi = self.u32()? as u64;
        Some(lo | (hi << 32))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_bits() {
        let mut bits = MachMsgBits::new(
            MsgTypeName::CopySend as u32,
            MsgTypeName::MakeSendOnce as u32,
        );
        assert_eq!(bits.remote(), 19);
        assert_eq!(bits.local(), 21);
        assert!(!bits.is_complex());
        bits.set_complex(true);
        assert!(bits.is_complex());
        assert_eq!(bits.remote(), 19);
    }

    #[test]
    fn test_result_types() {
        assert_eq!(MsgTypeName::CopySend.result_type(), MsgTypeName::PORT_SEND);
        assert_eq!(MsgTypeName::MakeSendOnce.result_type(), MsgTypeName::PORT_SEND_ONCE);
        assert_eq!(MsgTypeName::MoveReceive.result_type(), MsgTypeName::PORT_RECEIVE);
        assert!(!MsgTypeName::MoveReceive.is_send_disposition());
        assert_eq!(MsgTypeName::from_u32(15), None);
    }

    #[test]
    fn test_builder_sizes() {
        let msg = MachMessage::new(0x0100_0001, MsgTypeName::CopySend, 7).with_inline(b"hello");
        assert_eq!(msg.header.msgh_size as usize, MACH_MSG_HEADER_SIZE + 8 + 8);
        assert!(!msg.header.msgh_bits.is_complex());

        let msg = msg.with_port(0x0100_0002, MsgTypeName::MakeSend);
        assert!(msg.header.msgh_bits.is_complex());
        assert_eq!(msg.wire_size(), MACH_MSG_HEADER_SIZE + 16 + 12);
    }

    #[test]
    fn test_wire_format() {
        let msg = MachMessage::new(3, MsgTypeName::MoveSendOnce, -2)
            .with_reply(9, MsgTypeName::MakeSend)
            .with_inline(&[1, 2, 3])
            .with_port(4, MsgTypeName::MoveReceive)
            .with_ool(0x1000_0000, 65536, true);
        let bytes = msg.encode();
        assert_eq!(bytes.len(), msg.header.msgh_size as usize);
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());
        assert_eq!(MachMessage::decode(&bytes).unwrap(), msg);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(MachMessage::decode(&[0u8; 10]), Err(MsgError::SendMsgTooSmall));

        let mut bytes = MachMessage::new(3, MsgTypeName::CopySend, 0)
            .with_port(4, MsgTypeName::CopySend)
            .encode();
        // Corrupt the disposition
        bytes[28] = 99;
        assert_eq!(MachMessage::decode(&bytes), Err(MsgError::SendInvalidType));

        // Truncated item
        let mut bytes = MachMessage::new(3, MsgTypeName::CopySend, 0).encode();
        bytes.extend_from_slice(&ITEM_OOL.to_le_bytes());
        let len = bytes.len() as u32;
        bytes[4..8].copy_from_slice(&len.to_le_bytes());
        assert_eq!(MachMessage::decode(&bytes), Err(MsgError::SendInvalidData));
    }
}
