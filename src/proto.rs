//! Wire packet codec.
//!
//! Every packet starts with an 8-byte header: a magic byte, a protocol
//! version byte, a type byte, a flags byte, and four reserved bytes kept
//! zero on the wire (padding in the original C struct, preserved here so
//! the header stays a fixed, struct-aligned size). The payload is
//! type-discriminated: `Request`/`Response` carry a fixed 8-byte body,
//! `Error` carries none, and `BoardSample` carries a variable-length
//! sample array sized by its own `nchips`/`nlines` fields.
//!
//! All integers are big-endian on the wire. Board-sample conversion order
//! matters in the original: `raw_msg_bsamp_hton` converts the sample
//! array before the dimensions (the loop bound must still be in host
//! order while it runs), and `raw_msg_bsamp_ntoh` converts the dimensions
//! before the samples (the loop bound must already be host order before
//! it runs). This module reads and writes each field directly through
//! `byteorder` rather than mutating a shared buffer in place, so that
//! hazard doesn't reappear here, but the field order on the wire itself
//! (idx, nchips, nlines, samples) is kept exactly as specified.

use std::convert::TryFrom;
use std::io::{self, Cursor, Read, Write};

use bitflags::bitflags;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::error::CoreError;

pub const MAGIC: u8 = 0x5A;
pub const PROTO_VERSION: u8 = 0x00;

const HEADER_SIZE: usize = 8;
const HEADER_RESERVED: usize = 4;
const REQ_RES_PAYLOAD_SIZE: usize = 8;
const BSAMP_DIMS_SIZE: usize = 8;

/// Packet type discriminant, carried in byte 2 of the header.
#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
pub enum PacketType {
    BoardSample = 1,
    Request = 2,
    Response = 3,
    Error = 4,
}

bitflags! {
    /// Header flags byte. Only one bit is assigned today; the rest are
    /// reserved, same as the original's flags field.
    #[derive(Default)]
    pub struct Flags: u8 {
        /// Set on the final `BoardSample` packet of a batch.
        const BSAMP_IS_LAST = 0b0000_0001;
    }
}

/// Shared payload shape for `Request` and `Response` packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReqRes {
    pub r_id: u16,
    pub r_type: u8,
    pub r_addr: u8,
    pub r_val: u32,
}

/// A single board's worth of digitized samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoardSample {
    pub bs_idx: u32,
    pub bs_nchips: u16,
    pub bs_nlines: u16,
    pub samples: Vec<u16>,
}

impl BoardSample {
    /// Allocates a zero-filled sample board, the moral equivalent of
    /// `raw_packet_create_bsamp`. Fails with `OutOfMemory` rather than
    /// silently wrapping if `nchips * nlines` doesn't fit a `usize`.
    pub fn new(bs_idx: u32, bs_nchips: u16, bs_nlines: u16) -> Result<Self, CoreError> {
        let nsamps = (bs_nchips as usize)
            .checked_mul(bs_nlines as usize)
            .ok_or_else(|| CoreError::OutOfMemory("nchips * nlines overflowed usize".into()))?;
        Ok(BoardSample {
            bs_idx,
            bs_nchips,
            bs_nlines,
            samples: vec![0u16; nsamps],
        })
    }
}

/// A packet's payload, one variant per `PacketType`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    BoardSample(BoardSample),
    Request(ReqRes),
    Response(ReqRes),
    Error,
}

impl Payload {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Payload::BoardSample(_) => PacketType::BoardSample,
            Payload::Request(_) => PacketType::Request,
            Payload::Response(_) => PacketType::Response,
            Payload::Error => PacketType::Error,
        }
    }
}

/// A fully decoded packet: header flags plus a typed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub flags: Flags,
    pub payload: Payload,
}

impl Packet {
    pub fn request(flags: Flags, req: ReqRes) -> Self {
        Packet {
            flags,
            payload: Payload::Request(req),
        }
    }

    pub fn response(flags: Flags, res: ReqRes) -> Self {
        Packet {
            flags,
            payload: Payload::Response(res),
        }
    }

    pub fn error(flags: Flags) -> Self {
        Packet {
            flags,
            payload: Payload::Error,
        }
    }

    pub fn board_sample(flags: Flags, bsamp: BoardSample) -> Self {
        Packet {
            flags,
            payload: Payload::BoardSample(bsamp),
        }
    }

    pub fn packet_type(&self) -> PacketType {
        self.payload.packet_type()
    }

    /// Overwrites `self` with `src`'s contents. Mirrors `raw_packet_copy`;
    /// unlike the C version there is no "unknown type" case to assert on,
    /// since `Payload` is a closed enum and every value of it is already
    /// one of the four known shapes.
    pub fn copy_from(&mut self, src: &Packet) {
        self.clone_from(src);
    }
}

/// Serializes a packet to its wire form.
pub fn encode(packet: &Packet) -> Result<Vec<u8>, CoreError> {
    let mut out = Vec::with_capacity(HEADER_SIZE + REQ_RES_PAYLOAD_SIZE);
    out.push(MAGIC);
    out.push(PROTO_VERSION);
    out.push(packet.packet_type().into());
    out.push(packet.flags.bits());
    out.extend_from_slice(&[0u8; HEADER_RESERVED]);

    match &packet.payload {
        Payload::Request(r) | Payload::Response(r) => {
            out.write_u16::<BigEndian>(r.r_id)?;
            out.write_u8(r.r_type)?;
            out.write_u8(r.r_addr)?;
            out.write_u32::<BigEndian>(r.r_val)?;
        }
        Payload::Error => {}
        Payload::BoardSample(bs) => {
            out.write_u32::<BigEndian>(bs.bs_idx)?;
            out.write_u16::<BigEndian>(bs.bs_nchips)?;
            out.write_u16::<BigEndian>(bs.bs_nlines)?;
            for sample in &bs.samples {
                out.write_u16::<BigEndian>(*sample)?;
            }
        }
    }
    Ok(out)
}

/// Attempts to decode one packet from the front of `buf`, without
/// consuming it. Returns `Ok(None)` if `buf` doesn't yet hold a complete
/// packet (the caller should wait for more bytes); `Ok(Some((packet,
/// consumed)))` on success, where `consumed` is how many leading bytes of
/// `buf` made up the packet; `Err` the moment a validation that doesn't
/// depend on having the whole packet fails (bad magic, bad version,
/// unknown type, or a type mismatch against `expected_type`).
///
/// `expected_type`, like `raw_packet_recv`'s in/out type parameter,
/// either pins the accepted type (`Some`) or accepts whatever arrives
/// (`None`).
pub fn decode_from_buffer(
    buf: &[u8],
    expected_type: Option<PacketType>,
) -> Result<Option<(Packet, usize)>, CoreError> {
    if buf.len() < HEADER_SIZE {
        return Ok(None);
    }
    let magic = buf[0];
    if magic != MAGIC {
        return Err(CoreError::Protocol(format!(
            "bad header magic 0x{magic:02x}, expected 0x{MAGIC:02x}"
        )));
    }
    let proto_version = buf[1];
    if proto_version != PROTO_VERSION {
        return Err(CoreError::Protocol(format!(
            "bad protocol version 0x{proto_version:02x}, expected 0x{PROTO_VERSION:02x}"
        )));
    }
    let type_byte = buf[2];
    let packet_type = PacketType::try_from(type_byte)
        .map_err(|_| CoreError::Protocol(format!("unknown packet type {type_byte}")))?;
    if let Some(expected) = expected_type {
        if expected != packet_type {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected packet type {expected:?}, got {packet_type:?}"),
            )));
        }
    }
    let flags = Flags::from_bits_truncate(buf[3]);
    let body = &buf[HEADER_SIZE..];

    match packet_type {
        PacketType::Request | PacketType::Response => {
            if body.len() < REQ_RES_PAYLOAD_SIZE {
                return Ok(None);
            }
            let mut cur = Cursor::new(body);
            let r_id = cur.read_u16::<BigEndian>()?;
            let r_type = cur.read_u8()?;
            let r_addr = cur.read_u8()?;
            let r_val = cur.read_u32::<BigEndian>()?;
            let req_res = ReqRes {
                r_id,
                r_type,
                r_addr,
                r_val,
            };
            let payload = if packet_type == PacketType::Request {
                Payload::Request(req_res)
            } else {
                Payload::Response(req_res)
            };
            Ok(Some((
                Packet { flags, payload },
                HEADER_SIZE + REQ_RES_PAYLOAD_SIZE,
            )))
        }
        PacketType::Error => Ok(Some((
            Packet {
                flags,
                payload: Payload::Error,
            },
            HEADER_SIZE,
        ))),
        PacketType::BoardSample => {
            if body.len() < BSAMP_DIMS_SIZE {
                return Ok(None);
            }
            let mut cur = Cursor::new(body);
            let bs_idx = cur.read_u32::<BigEndian>()?;
            let bs_nchips = cur.read_u16::<BigEndian>()?;
            let bs_nlines = cur.read_u16::<BigEndian>()?;
            let nsamps = (bs_nchips as usize) * (bs_nlines as usize);
            let samples_len = nsamps * 2;
            if body.len() < BSAMP_DIMS_SIZE + samples_len {
                return Ok(None);
            }
            let mut samples = Vec::with_capacity(nsamps);
            for _ in 0..nsamps {
                samples.push(cur.read_u16::<BigEndian>()?);
            }
            Ok(Some((
                Packet {
                    flags,
                    payload: Payload::BoardSample(BoardSample {
                        bs_idx,
                        bs_nchips,
                        bs_nlines,
                        samples,
                    }),
                },
                HEADER_SIZE + BSAMP_DIMS_SIZE + samples_len,
            )))
        }
    }
}

/// Blocking send: encodes `packet` and writes it whole to `stream`.
/// Intended for peers that are known-ready (tests, or a `Cursor`), not
/// the non-blocking sockets the reactor drives, those go through
/// `decode_from_buffer` against their own ingress buffers instead.
pub fn send<W: Write>(stream: &mut W, packet: &Packet) -> Result<usize, CoreError> {
    let bytes = encode(packet)?;
    stream.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Blocking receive: reads exactly one packet from `stream`, validating
/// the header before reading any payload bytes, matching
/// `raw_packet_recv`'s "check magic/type before trusting the rest of the
/// packet" behavior.
pub fn recv<R: Read>(
    stream: &mut R,
    expected_type: Option<PacketType>,
) -> Result<Packet, CoreError> {
    let mut header = [0u8; HEADER_SIZE];
    stream.read_exact(&mut header)?;
    if header[0] != MAGIC {
        return Err(CoreError::Protocol(format!(
            "bad header magic 0x{:02x}, expected 0x{:02x}",
            header[0], MAGIC
        )));
    }
    if header[1] != PROTO_VERSION {
        return Err(CoreError::Protocol(format!(
            "bad protocol version 0x{:02x}, expected 0x{:02x}",
            header[1], PROTO_VERSION
        )));
    }
    let packet_type = PacketType::try_from(header[2])
        .map_err(|_| CoreError::Protocol(format!("unknown packet type {}", header[2])))?;
    if let Some(expected) = expected_type {
        if expected != packet_type {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected packet type {expected:?}, got {packet_type:?}"),
            )));
        }
    }

    let mut rest = Vec::from(&header[..]);
    match packet_type {
        PacketType::Request | PacketType::Response => {
            let mut payload = [0u8; REQ_RES_PAYLOAD_SIZE];
            stream.read_exact(&mut payload)?;
            rest.extend_from_slice(&payload);
        }
        PacketType::Error => {}
        PacketType::BoardSample => {
            let mut dims = [0u8; BSAMP_DIMS_SIZE];
            stream.read_exact(&mut dims)?;
            rest.extend_from_slice(&dims);
            let nchips = u16::from_be_bytes([dims[4], dims[5]]);
            let nlines = u16::from_be_bytes([dims[6], dims[7]]);
            let samples_len = (nchips as usize) * (nlines as usize) * 2;
            let mut samples = vec![0u8; samples_len];
            stream.read_exact(&mut samples)?;
            rest.extend_from_slice(&samples);
        }
    }

    match decode_from_buffer(&rest, expected_type)? {
        Some((packet, _consumed)) => Ok(packet),
        None => Err(CoreError::Protocol(
            "packet truncated after a complete header+payload read".into(),
        )),
    }
}
