//! TLV (Type-Length-Value) structures carried inside packet payloads:
//! identity announcements, private-message inner frames, and file transfers.

use std::io::{Cursor, Read, Write};

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};

use crate::error::{CodecError, Result};

/// `ANNOUNCE` payload. All three fields are required.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAnnouncement {
    pub nickname: String,
    pub noise_pubkey: [u8; 32],
    pub signing_pubkey: [u8; 32],
}

const TAG_NICKNAME: u8 = 0x01;
const TAG_NOISE_PUBKEY: u8 = 0x02;
const TAG_SIGNING_PUBKEY: u8 = 0x03;

impl IdentityAnnouncement {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_tlv8(&mut out, TAG_NICKNAME, self.nickname.as_bytes());
        write_tlv8(&mut out, TAG_NOISE_PUBKEY, &self.noise_pubkey);
        write_tlv8(&mut out, TAG_SIGNING_PUBKEY, &self.signing_pubkey);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut nickname = None;
        let mut noise_pubkey = None;
        let mut signing_pubkey = None;

        for (tag, value) in iter_tlv8(data)? {
            match tag {
                TAG_NICKNAME => {
                    nickname = Some(
                        String::from_utf8(value.to_vec()).map_err(|_| CodecError::InvalidPadding)?,
                    )
                }
                TAG_NOISE_PUBKEY => noise_pubkey = Some(fixed32(value)?),
                TAG_SIGNING_PUBKEY => signing_pubkey = Some(fixed32(value)?),
                _ => {}
            }
        }

        Ok(Self {
            nickname: nickname.ok_or(CodecError::Truncated)?,
            noise_pubkey: noise_pubkey.ok_or(CodecError::Truncated)?,
            signing_pubkey: signing_pubkey.ok_or(CodecError::Truncated)?,
        })
    }
}

/// Inner content of a decrypted `NOISE_ENCRYPTED` private payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrivatePayload {
    PrivateMessage {
        message_id: Vec<u8>,
        content: Vec<u8>,
        mentions: Option<Vec<u8>>,
    },
    ReadReceipt(Vec<u8>),
    Delivered(Vec<u8>),
    VerifyChallenge(Vec<u8>),
    VerifyResponse(Vec<u8>),
    FileTransfer(FilePacket),
}

const TYPE_PRIVATE_MESSAGE: u8 = 0x01;
const TYPE_READ_RECEIPT: u8 = 0x02;
const TYPE_DELIVERED: u8 = 0x03;
const TYPE_VERIFY_CHALLENGE: u8 = 0x10;
const TYPE_VERIFY_RESPONSE: u8 = 0x11;
const TYPE_FILE_TRANSFER: u8 = 0x20;

const PM_TAG_MESSAGE_ID: u8 = 0x00;
const PM_TAG_CONTENT: u8 = 0x01;
const PM_TAG_MENTIONS: u8 = 0x02;

impl PrivatePayload {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            PrivatePayload::PrivateMessage {
                message_id,
                content,
                mentions,
            } => {
                let mut inner = Vec::new();
                write_tlv8(&mut inner, PM_TAG_MESSAGE_ID, message_id);
                write_tlv8(&mut inner, PM_TAG_CONTENT, content);
                if let Some(m) = mentions {
                    write_tlv8(&mut inner, PM_TAG_MENTIONS, m);
                }
                wrap(TYPE_PRIVATE_MESSAGE, &inner)
            }
            PrivatePayload::ReadReceipt(data) => wrap(TYPE_READ_RECEIPT, data),
            PrivatePayload::Delivered(data) => wrap(TYPE_DELIVERED, data),
            PrivatePayload::VerifyChallenge(data) => wrap(TYPE_VERIFY_CHALLENGE, data),
            PrivatePayload::VerifyResponse(data) => wrap(TYPE_VERIFY_RESPONSE, data),
            PrivatePayload::FileTransfer(file) => wrap(TYPE_FILE_TRANSFER, &file.encode()),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let (tag, value) = read_one_tlv8(data)?;
        Ok(match tag {
            TYPE_PRIVATE_MESSAGE => {
                let mut message_id = None;
                let mut content = None;
                let mut mentions = None;
                for (t, v) in iter_tlv8(value)? {
                    match t {
                        PM_TAG_MESSAGE_ID => message_id = Some(v.to_vec()),
                        PM_TAG_CONTENT => content = Some(v.to_vec()),
                        PM_TAG_MENTIONS => mentions = Some(v.to_vec()),
                        _ => {}
                    }
                }
                PrivatePayload::PrivateMessage {
                    message_id: message_id.ok_or(CodecError::Truncated)?,
                    content: content.ok_or(CodecError::Truncated)?,
                    mentions,
                }
            }
            TYPE_READ_RECEIPT => PrivatePayload::ReadReceipt(value.to_vec()),
            TYPE_DELIVERED => PrivatePayload::Delivered(value.to_vec()),
            TYPE_VERIFY_CHALLENGE => PrivatePayload::VerifyChallenge(value.to_vec()),
            TYPE_VERIFY_RESPONSE => PrivatePayload::VerifyResponse(value.to_vec()),
            TYPE_FILE_TRANSFER => PrivatePayload::FileTransfer(FilePacket::decode(value)?),
            other => return Err(CodecError::UnknownType(other).into()),
        })
    }
}

/// Maximum accepted file size for [`FilePacket`], 50 MiB.
pub const MAX_FILE_SIZE: u32 = 50 * 1024 * 1024;

/// File packet, carried inside `FILE_TRANSFER` or as a private-payload inner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePacket {
    pub file_name: String,
    pub file_size: u32,
    pub mime_type: String,
    pub content: Vec<u8>,
}

const FILE_TAG_NAME: u8 = 0x01;
const FILE_TAG_SIZE: u8 = 0x02;
const FILE_TAG_MIME: u8 = 0x03;
const FILE_TAG_CONTENT: u8 = 0x04;

impl FilePacket {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        write_tlv16(&mut out, FILE_TAG_NAME, self.file_name.as_bytes());
        out.push(FILE_TAG_SIZE);
        out.write_u32::<BigEndian>(self.file_size).expect("vec write");
        write_tlv16(&mut out, FILE_TAG_MIME, self.mime_type.as_bytes());
        out.push(FILE_TAG_CONTENT);
        out.write_u32::<BigEndian>(self.content.len() as u32)
            .expect("vec write");
        out.extend_from_slice(&self.content);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);
        let mut file_name = None;
        let mut file_size = None;
        let mut mime_type = None;
        let mut content = None;

        while (cursor.position() as usize) < data.len() {
            let tag = cursor.read_u8().map_err(|_| CodecError::Truncated)?;
            match tag {
                FILE_TAG_NAME => {
                    let len = cursor.read_u16::<BigEndian>().map_err(|_| CodecError::Truncated)? as usize;
                    let mut buf = vec![0u8; len];
                    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
                    file_name =
                        Some(String::from_utf8(buf).map_err(|_| CodecError::InvalidPadding)?);
                }
                FILE_TAG_SIZE => {
                    file_size = Some(cursor.read_u32::<BigEndian>().map_err(|_| CodecError::Truncated)?);
                }
                FILE_TAG_MIME => {
                    let len = cursor.read_u16::<BigEndian>().map_err(|_| CodecError::Truncated)? as usize;
                    let mut buf = vec![0u8; len];
                    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
                    mime_type =
                        Some(String::from_utf8(buf).map_err(|_| CodecError::InvalidPadding)?);
                }
                FILE_TAG_CONTENT => {
                    let len = cursor.read_u32::<BigEndian>().map_err(|_| CodecError::Truncated)? as usize;
                    let mut buf = vec![0u8; len];
                    cursor.read_exact(&mut buf).map_err(|_| CodecError::Truncated)?;
                    content = Some(buf);
                }
                other => return Err(CodecError::UnknownType(other).into()),
            }
        }

        let file_size = file_size.ok_or(CodecError::Truncated)?;
        if file_size > MAX_FILE_SIZE {
            return Err(CodecError::PayloadTooLarge {
                len: file_size as usize,
                max: MAX_FILE_SIZE as usize,
            }
            .into());
        }

        Ok(Self {
            file_name: file_name.ok_or(CodecError::Truncated)?,
            file_size,
            mime_type: mime_type.ok_or(CodecError::Truncated)?,
            content: content.ok_or(CodecError::Truncated)?,
        })
    }
}

fn wrap(type_tag: u8, inner: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(inner.len() + 2);
    write_tlv8(&mut out, type_tag, inner);
    out
}

fn read_one_tlv8(data: &[u8]) -> Result<(u8, &[u8])> {
    iter_tlv8(data)?.into_iter().next().ok_or_else(|| CodecError::Truncated.into())
}

fn write_tlv8(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.push(value.len() as u8);
    out.extend_from_slice(value);
}

fn write_tlv16(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.write_u16::<BigEndian>(value.len() as u16).expect("vec write");
    out.extend_from_slice(value);
}

/// Parse a flat sequence of 1-byte-tag/1-byte-length TLV entries.
fn iter_tlv8(data: &[u8]) -> Result<Vec<(u8, &[u8])>> {
    let mut out = Vec::new();
    let mut pos = 0usize;
    while pos < data.len() {
        if pos + 2 > data.len() {
            return Err(CodecError::Truncated.into());
        }
        let tag = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        if pos + len > data.len() {
            return Err(CodecError::Truncated.into());
        }
        out.push((tag, &data[pos..pos + len]));
        pos += len;
    }
    Ok(out)
}

fn fixed32(data: &[u8]) -> Result<[u8; 32]> {
    data.try_into().map_err(|_| CodecError::Truncated.into())
}
