//! Bit-exact wire encode/decode: header framing, PKCS#7 block padding, and
//! raw-DEFLATE compression.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use flate2::Compression;

use crate::error::{CodecError, Result};

use super::constants::*;
use super::types::{Packet, PeerId};

/// Stateless codec: encode/decode between [`Packet`] and its wire frame.
pub struct Codec;

impl Codec {
    /// Encode a packet, choosing v1 or v2 framing and applying compression
    /// and padding, per the frame contract.
    pub fn encode(packet: &Packet) -> Result<Vec<u8>> {
        let frame = Self::encode_unpadded(packet)?;
        Ok(pad(frame))
    }

    /// Encode without padding, used both by [`Self::encode`] and by the
    /// signing plane (which re-encodes with `signature = None, ttl = 0`).
    fn encode_unpadded(packet: &Packet) -> Result<Vec<u8>> {
        let version = if packet.requires_v2() {
            PROTOCOL_VERSION_2
        } else {
            packet.version.max(PROTOCOL_VERSION_1)
        };
        if packet.has_route() && version != PROTOCOL_VERSION_2 {
            return Err(CodecError::RouteOnV1.into());
        }
        if !packet.route_is_valid() {
            return Err(CodecError::DuplicateRouteHop.into());
        }

        let mut flags = 0u8;
        if packet.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if packet.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }
        if packet.has_route() {
            flags |= FLAG_HAS_ROUTE;
        }

        let payload_area = build_payload_area(packet, version, &mut flags)?;

        let max = if message_type_is_large_payload(packet.message_type) {
            MAX_LARGE_PAYLOAD
        } else {
            MAX_STANDARD_PAYLOAD
        };
        if payload_area.len() > max {
            return Err(CodecError::PayloadTooLarge {
                len: payload_area.len(),
                max,
            }
            .into());
        }

        let mut out = Vec::with_capacity(HEADER_SIZE_V2 + payload_area.len() + SIGNATURE_SIZE);
        out.write_u8(version)?;
        out.write_u8(packet.message_type)?;
        out.write_u8(packet.ttl)?;
        out.write_u64::<BigEndian>(packet.timestamp_ms)?;
        out.write_u8(flags)?;
        if version == PROTOCOL_VERSION_1 {
            out.write_u16::<BigEndian>(payload_area.len() as u16)?;
        } else {
            out.write_u32::<BigEndian>(payload_area.len() as u32)?;
        }
        out.write_all(&packet.sender_id)?;
        if let Some(recipient) = packet.recipient_id {
            out.write_all(&recipient)?;
        }
        if version == PROTOCOL_VERSION_2 {
            if let Some(route) = &packet.route {
                if !route.is_empty() {
                    out.write_u8(route.len() as u8)?;
                    for hop in route {
                        out.write_all(hop)?;
                    }
                }
            }
        }
        out.write_all(&payload_area)?;
        if let Some(sig) = packet.signature {
            out.write_all(&sig)?;
        }
        Ok(out)
    }

    /// Decode a wire frame. Tries the frame as-is first; on failure, strips
    /// PKCS#7 padding and retries once.
    pub fn decode(frame: &[u8]) -> Result<Packet> {
        match decode_unpadded(frame) {
            Ok(packet) => Ok(packet),
            Err(_) => {
                let unpadded = unpad(frame)?;
                decode_unpadded(&unpadded)
            }
        }
    }

    /// The exact bytes signed/verified with Ed25519: the packet re-encoded
    /// with `signature = None` and `ttl = 0`, unpadded.
    pub fn signing_bytes(packet: &Packet) -> Result<Vec<u8>> {
        let mut for_signing = packet.clone();
        for_signing.signature = None;
        for_signing.ttl = 0;
        Self::encode_unpadded(&for_signing)
    }
}

/// Build the payload area: original payload, optionally compressed with a
/// size prefix, setting `IS_COMPRESSED` in `flags` when applied.
fn build_payload_area(packet: &Packet, version: u8, flags: &mut u8) -> Result<Vec<u8>> {
    if should_compress(packet) {
        let compressed = deflate(&packet.payload)?;
        if compressed.len() < packet.payload.len() {
            *flags |= FLAG_IS_COMPRESSED;
            let mut area = Vec::with_capacity(compressed.len() + 4);
            if version == PROTOCOL_VERSION_1 {
                area.write_u16::<BigEndian>(packet.payload.len() as u16)?;
            } else {
                area.write_u32::<BigEndian>(packet.payload.len() as u32)?;
            }
            area.extend_from_slice(&compressed);
            return Ok(area);
        }
    }
    Ok(packet.payload.clone())
}

fn should_compress(packet: &Packet) -> bool {
    message_type_is_compressible(packet.message_type)
        && packet.payload.len() >= COMPRESSION_MIN_SIZE
        && unique_byte_ratio(&packet.payload) < COMPRESSION_ENTROPY_THRESHOLD
}

/// Fraction of distinct byte values present in `data`; a proxy for
/// compressibility without computing true Shannon entropy.
fn unique_byte_ratio(data: &[u8]) -> f64 {
    let mut seen = [false; 256];
    let mut count = 0usize;
    for &b in data {
        if !seen[b as usize] {
            seen[b as usize] = true;
            count += 1;
        }
    }
    count as f64 / 256.0
}

fn deflate(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::CompressionFailed(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::CompressionFailed(e.to_string()).into())
}

fn inflate(data: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    if expected_size > 0 {
        let ratio = expected_size as u64 / (data.len().max(1) as u64);
        if ratio > MAX_DECOMPRESSION_RATIO {
            return Err(CodecError::DecompressionBomb.into());
        }
    }
    let mut decoder = DeflateDecoder::new(data);
    let mut out = Vec::with_capacity(expected_size);
    decoder
        .read_to_end(&mut out)
        .map_err(|e| CodecError::DecompressionFailed(e.to_string()))?;
    if out.len() != expected_size {
        return Err(CodecError::DecompressionFailed(format!(
            "decompressed {} bytes, expected {}",
            out.len(),
            expected_size
        ))
        .into());
    }
    Ok(out)
}

fn decode_unpadded(frame: &[u8]) -> Result<Packet> {
    let mut cursor = Cursor::new(frame);
    let version = cursor.read_u8()?;
    if version != PROTOCOL_VERSION_1 && version != PROTOCOL_VERSION_2 {
        return Err(CodecError::UnsupportedVersion(version).into());
    }
    let message_type = cursor.read_u8()?;
    if !known_message_type(message_type) {
        return Err(CodecError::UnknownType(message_type).into());
    }
    let ttl = cursor.read_u8()?;
    let timestamp_ms = cursor.read_u64::<BigEndian>()?;
    let flags = cursor.read_u8()?;

    let payload_len = if version == PROTOCOL_VERSION_1 {
        cursor.read_u16::<BigEndian>()? as usize
    } else {
        cursor.read_u32::<BigEndian>()? as usize
    };

    let max = if message_type_is_large_payload(message_type) {
        MAX_LARGE_PAYLOAD
    } else {
        MAX_STANDARD_PAYLOAD
    };
    if payload_len > max {
        return Err(CodecError::PayloadTooLarge {
            len: payload_len,
            max,
        }
        .into());
    }

    let sender_id = read_peer_id(&mut cursor)?;

    let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
        Some(read_peer_id(&mut cursor)?)
    } else {
        None
    };

    let route = if version == PROTOCOL_VERSION_2 && flags & FLAG_HAS_ROUTE != 0 {
        let count = cursor.read_u8()? as usize;
        let mut hops = Vec::with_capacity(count);
        for _ in 0..count {
            hops.push(read_peer_id(&mut cursor)?);
        }
        Some(hops)
    } else {
        None
    };

    let mut payload_area = vec![0u8; payload_len];
    cursor
        .read_exact(&mut payload_area)
        .map_err(|_| CodecError::Truncated)?;

    let payload = if flags & FLAG_IS_COMPRESSED != 0 {
        let prefix_len = if version == PROTOCOL_VERSION_1 { 2 } else { 4 };
        require(payload_area.len(), prefix_len, "compression size prefix")?;
        let (size_bytes, compressed) = payload_area.split_at(prefix_len);
        let expected = if version == PROTOCOL_VERSION_1 {
            u16::from_be_bytes([size_bytes[0], size_bytes[1]]) as usize
        } else {
            u32::from_be_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]])
                as usize
        };
        inflate(compressed, expected)?
    } else {
        payload_area
    };

    let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
        let mut sig = [0u8; SIGNATURE_SIZE];
        cursor
            .read_exact(&mut sig)
            .map_err(|_| CodecError::Truncated)?;
        Some(sig)
    } else {
        None
    };

    let packet = Packet {
        version,
        message_type,
        ttl,
        timestamp_ms,
        sender_id,
        recipient_id,
        route,
        payload,
        signature,
    };
    if !packet.route_is_valid() {
        return Err(CodecError::DuplicateRouteHop.into());
    }
    Ok(packet)
}

fn known_message_type(t: u8) -> bool {
    matches!(
        t,
        MESSAGE_TYPE_ANNOUNCE
            | MESSAGE_TYPE_MESSAGE
            | MESSAGE_TYPE_LEAVE
            | MESSAGE_TYPE_NOISE_HANDSHAKE
            | MESSAGE_TYPE_NOISE_ENCRYPTED
            | MESSAGE_TYPE_FRAGMENT
            | MESSAGE_TYPE_REQUEST_SYNC
            | MESSAGE_TYPE_FILE_TRANSFER
    )
}

fn read_peer_id(cursor: &mut Cursor<&[u8]>) -> Result<PeerId> {
    let mut id = [0u8; PEER_ID_SIZE];
    cursor.read_exact(&mut id).map_err(|_| CodecError::Truncated)?;
    Ok(id)
}

fn require(have: usize, need: usize, _what: &str) -> Result<()> {
    if have < need {
        return Err(CodecError::TooSmall { need, got: have }.into());
    }
    Ok(())
}

/// Pad `frame` to the smallest block in [`PADDING_BLOCK_SIZES`] that is
/// `>= frame.len() + PADDING_RESERVE`, via PKCS#7. Frames that don't fit
/// under [`MAX_PADDED_SIZE`] are left unpadded.
fn pad(frame: Vec<u8>) -> Vec<u8> {
    let target = PADDING_BLOCK_SIZES
        .iter()
        .find(|&&block| block >= frame.len() + PADDING_RESERVE);
    let Some(&block) = target else {
        return frame;
    };
    let pad_len = block - frame.len();
    let mut out = frame;
    out.resize(out.len() + pad_len, pad_len as u8);
    out
}

/// Strip PKCS#7 padding. Strict: every pad byte must equal the pad length.
fn unpad(frame: &[u8]) -> Result<Vec<u8>> {
    let pad_len = *frame.last().ok_or(CodecError::InvalidPadding)? as usize;
    if pad_len == 0 || pad_len > frame.len() {
        return Err(CodecError::InvalidPadding.into());
    }
    let boundary = frame.len() - pad_len;
    if frame[boundary..].iter().any(|&b| b as usize != pad_len) {
        return Err(CodecError::InvalidPadding.into());
    }
    Ok(frame[..boundary].to_vec())
}

impl From<std::io::Error> for crate::error::Error {
    fn from(e: std::io::Error) -> Self {
        CodecError::DecompressionFailed(e.to_string()).into()
    }
}
