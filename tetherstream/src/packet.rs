//! Datagram header codec.
//!
//! Every datagram starts with a one-byte send-option that selects how the rest
//! of the header is laid out. Multi-byte fields are big-endian.
//!
//! ```text
//! +--------+---------- variable ----------+---------+
//! | option |  header fields per option    | payload |
//! |  (1B)  |                              |         |
//! +--------+------------------------------+---------+
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TetherStreamError};

/// Width of the ordering sequence space. Valid sequences are `0..255`.
pub const SEQUENCE_MODULUS: u8 = 255;

/// Sequence byte carried by fragments of a message that is not ordered.
pub const NO_SEQUENCE: u8 = 255;

/// Number of preceding reliable ids covered by an acknowledgement bitfield.
pub const ACK_WINDOW: u16 = 32;

/// Leading byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SendOption {
    Unreliable = 0x00,
    ReliableUnordered = 0x01,
    ReliableOrdered = 0x02,
    Fragment = 0x03,
    Handshake = 0x08,
    Disconnect = 0x09,
    Acknowledgement = 0x0a,
    Ping = 0x0c,
    Pong = 0x0d,
}

impl SendOption {
    /// Total header length in bytes, including the send-option byte itself.
    pub const fn header_len(self) -> usize {
        match self {
            SendOption::Unreliable
            | SendOption::Disconnect
            | SendOption::Ping
            | SendOption::Pong => 1,
            SendOption::ReliableUnordered | SendOption::Handshake => 1 + 2,
            SendOption::ReliableOrdered => 1 + 2 + 1,
            SendOption::Fragment => 1 + 2 + 2 + 2 + 2 + 1,
            SendOption::Acknowledgement => 1 + 2 + 4,
        }
    }

    /// Whether datagrams with this option carry a reliable id and must be
    /// acknowledged by the receiver.
    pub const fn is_reliable(self) -> bool {
        matches!(
            self,
            SendOption::ReliableUnordered
                | SendOption::ReliableOrdered
                | SendOption::Fragment
                | SendOption::Handshake
        )
    }
}

impl TryFrom<u8> for SendOption {
    type Error = TetherStreamError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0x00 => Ok(SendOption::Unreliable),
            0x01 => Ok(SendOption::ReliableUnordered),
            0x02 => Ok(SendOption::ReliableOrdered),
            0x03 => Ok(SendOption::Fragment),
            0x08 => Ok(SendOption::Handshake),
            0x09 => Ok(SendOption::Disconnect),
            0x0a => Ok(SendOption::Acknowledgement),
            0x0c => Ok(SendOption::Ping),
            0x0d => Ok(SendOption::Pong),
            other => Err(TetherStreamError::UnknownSendOption(other)),
        }
    }
}

/// Fragment header: which slice of which message this datagram carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub message_id: u16,
    pub index: u16,
    pub total: u16,
    /// Ordering sequence shared by every fragment of an ordered message.
    pub sequence: Option<u8>,
}

/// Decoded header fields. Only the fields implied by `send_option` are set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub send_option: SendOption,
    pub reliable_id: Option<u16>,
    pub sequence: Option<u8>,
    pub fragment: Option<FragmentHeader>,
    pub ack_bitfield: Option<u32>,
}

impl Header {
    pub fn new(send_option: SendOption) -> Self {
        Self {
            send_option,
            reliable_id: None,
            sequence: None,
            fragment: None,
            ack_bitfield: None,
        }
    }

    /// Write the header prefix. Fields the send-option requires but that are
    /// unset are written as zero.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.send_option as u8);
        match self.send_option {
            SendOption::Unreliable
            | SendOption::Disconnect
            | SendOption::Ping
            | SendOption::Pong => {}
            SendOption::ReliableUnordered | SendOption::Handshake => {
                buf.put_u16(self.reliable_id.unwrap_or(0));
            }
            SendOption::ReliableOrdered => {
                buf.put_u16(self.reliable_id.unwrap_or(0));
                buf.put_u8(self.sequence.unwrap_or(0));
            }
            SendOption::Fragment => {
                buf.put_u16(self.reliable_id.unwrap_or(0));
                let fragment = self.fragment.unwrap_or(FragmentHeader {
                    message_id: 0,
                    index: 0,
                    total: 0,
                    sequence: None,
                });
                buf.put_u16(fragment.message_id);
                buf.put_u16(fragment.index);
                buf.put_u16(fragment.total);
                buf.put_u8(fragment.sequence.unwrap_or(NO_SEQUENCE));
            }
            SendOption::Acknowledgement => {
                buf.put_u16(self.reliable_id.unwrap_or(0));
                buf.put_u32(self.ack_bitfield.unwrap_or(0));
            }
        }
    }

    /// Parse a header. Returns the header and the offset of the payload.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let Some(&first) = data.first() else {
            return Err(TetherStreamError::MalformedPacket {
                expected: 1,
                actual: 0,
            });
        };
        let send_option = SendOption::try_from(first)?;
        let len = send_option.header_len();
        if data.len() < len {
            return Err(TetherStreamError::MalformedPacket {
                expected: len,
                actual: data.len(),
            });
        }

        let mut body = &data[1..len];
        let mut header = Header::new(send_option);
        match send_option {
            SendOption::Unreliable
            | SendOption::Disconnect
            | SendOption::Ping
            | SendOption::Pong => {}
            SendOption::ReliableUnordered | SendOption::Handshake => {
                header.reliable_id = Some(body.get_u16());
            }
            SendOption::ReliableOrdered => {
                header.reliable_id = Some(body.get_u16());
                let sequence = body.get_u8();
                if sequence >= SEQUENCE_MODULUS {
                    return Err(TetherStreamError::InvalidSequence(sequence));
                }
                header.sequence = Some(sequence);
            }
            SendOption::Fragment => {
                header.reliable_id = Some(body.get_u16());
                let message_id = body.get_u16();
                let index = body.get_u16();
                let total = body.get_u16();
                if total == 0 || index >= total {
                    return Err(TetherStreamError::InvalidFragment {
                        message_id,
                        index,
                        total,
                    });
                }
                let sequence = match body.get_u8() {
                    NO_SEQUENCE => None,
                    seq => Some(seq),
                };
                header.fragment = Some(FragmentHeader {
                    message_id,
                    index,
                    total,
                    sequence,
                });
            }
            SendOption::Acknowledgement => {
                header.reliable_id = Some(body.get_u16());
                header.ack_bitfield = Some(body.get_u32());
            }
        }
        Ok((header, len))
    }
}

/// A fully decoded datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Unreliable {
        payload: Bytes,
    },
    ReliableUnordered {
        id: u16,
        payload: Bytes,
    },
    ReliableOrdered {
        id: u16,
        sequence: u8,
        payload: Bytes,
    },
    Fragment {
        id: u16,
        fragment: FragmentHeader,
        chunk: Bytes,
    },
    Handshake {
        id: u16,
        payload: Bytes,
    },
    Disconnect,
    /// Acknowledges `id`; bit `i` of `bitfield` acknowledges `id - (i + 1)`.
    Ack {
        id: u16,
        bitfield: u32,
    },
    Ping,
    Pong,
}

impl Packet {
    pub fn send_option(&self) -> SendOption {
        match self {
            Packet::Unreliable { .. } => SendOption::Unreliable,
            Packet::ReliableUnordered { .. } => SendOption::ReliableUnordered,
            Packet::ReliableOrdered { .. } => SendOption::ReliableOrdered,
            Packet::Fragment { .. } => SendOption::Fragment,
            Packet::Handshake { .. } => SendOption::Handshake,
            Packet::Disconnect => SendOption::Disconnect,
            Packet::Ack { .. } => SendOption::Acknowledgement,
            Packet::Ping => SendOption::Ping,
            Packet::Pong => SendOption::Pong,
        }
    }

    /// The reliable id of a packet that must be acknowledged.
    pub fn reliable_id(&self) -> Option<u16> {
        match self {
            Packet::ReliableUnordered { id, .. }
            | Packet::ReliableOrdered { id, .. }
            | Packet::Fragment { id, .. }
            | Packet::Handshake { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn header(&self) -> Header {
        let mut header = Header::new(self.send_option());
        match self {
            Packet::ReliableUnordered { id, .. } | Packet::Handshake { id, .. } => {
                header.reliable_id = Some(*id);
            }
            Packet::ReliableOrdered { id, sequence, .. } => {
                header.reliable_id = Some(*id);
                header.sequence = Some(*sequence);
            }
            Packet::Fragment { id, fragment, .. } => {
                header.reliable_id = Some(*id);
                header.fragment = Some(*fragment);
            }
            Packet::Ack { id, bitfield } => {
                header.reliable_id = Some(*id);
                header.ack_bitfield = Some(*bitfield);
            }
            Packet::Unreliable { .. } | Packet::Disconnect | Packet::Ping | Packet::Pong => {}
        }
        header
    }

    fn body(&self) -> &[u8] {
        match self {
            Packet::Unreliable { payload }
            | Packet::ReliableUnordered { payload, .. }
            | Packet::ReliableOrdered { payload, .. }
            | Packet::Handshake { payload, .. } => payload,
            Packet::Fragment { chunk, .. } => chunk,
            Packet::Disconnect | Packet::Ack { .. } | Packet::Ping | Packet::Pong => &[],
        }
    }

    /// Encode this packet into a byte buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Encode into a pre-allocated `BytesMut`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        self.header().encode_into(buf);
        buf.put_slice(self.body());
    }

    /// The total number of bytes this packet occupies when encoded.
    pub fn encoded_len(&self) -> usize {
        self.send_option().header_len() + self.body().len()
    }

    /// Decode a datagram.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let (header, offset) = Header::decode(data)?;
        let body = || Bytes::copy_from_slice(&data[offset..]);
        // Header::decode guarantees every field required by the option is set.
        let id = header.reliable_id.unwrap_or(0);
        let packet = match header.send_option {
            SendOption::Unreliable => Packet::Unreliable { payload: body() },
            SendOption::ReliableUnordered => Packet::ReliableUnordered { id, payload: body() },
            SendOption::ReliableOrdered => Packet::ReliableOrdered {
                id,
                sequence: header.sequence.unwrap_or(0),
                payload: body(),
            },
            SendOption::Fragment => match header.fragment {
                Some(fragment) => Packet::Fragment {
                    id,
                    fragment,
                    chunk: body(),
                },
                None => {
                    return Err(TetherStreamError::MalformedPacket {
                        expected: SendOption::Fragment.header_len(),
                        actual: data.len(),
                    })
                }
            },
            SendOption::Handshake => Packet::Handshake { id, payload: body() },
            SendOption::Disconnect => Packet::Disconnect,
            SendOption::Acknowledgement => Packet::Ack {
                id,
                bitfield: header.ack_bitfield.unwrap_or(0),
            },
            SendOption::Ping => Packet::Ping,
            SendOption::Pong => Packet::Pong,
        };
        Ok(packet)
    }
}
