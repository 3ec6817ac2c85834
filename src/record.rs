//! Record catalog: the self-describing binary units exchanged over a
//! connection.
//!
//! Every record starts with the same 12-byte header, little-endian:
//!
//! ```text
//! [u32 kind] [u64 size: total record bytes, header included] [body]
//! ```
//!
//! Bodies are flat, fixed-offset layouts. Text fields are NUL padded to a
//! fixed width and are never assumed to be NUL terminated on read:
//!
//! - `1` Stdout:     `[text: size - 12 bytes]`
//! - `2` UserInfo:   `[name: 33][major: u16][minor: u16][patch: u16]`
//! - `3` Connect:    `[UserInfo body: 39][validate_only: u8]`
//! - `4` Disconnect: `[name: 33]`
//! - `5` Message:    `[text: 257]`

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::DecodeError;

/// Size of the common header in bytes.
pub const HEADER_SIZE: usize = 12;
/// Longest name, in bytes, a member may use.
pub const MAX_NAME_LENGTH: usize = 32;
/// Longest chat message, in bytes.
pub const MAX_MESSAGE_LENGTH: usize = 256;
/// Hard ceiling on any declared record size.
pub const MAX_RECORD_SIZE: usize = 4096;

const NAME_FIELD: usize = MAX_NAME_LENGTH + 1;
const MESSAGE_FIELD: usize = MAX_MESSAGE_LENGTH + 1;
const USERINFO_BODY: usize = NAME_FIELD + 3 * 2;
const MAX_STDOUT_TEXT: usize = MAX_RECORD_SIZE - HEADER_SIZE;

/// Record kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Kind {
    Stdout = 1,
    UserInfo = 2,
    Connect = 3,
    Disconnect = 4,
    Message = 5,
}

impl Kind {
    pub const ALL: [Kind; 5] = [
        Kind::Stdout,
        Kind::UserInfo,
        Kind::Connect,
        Kind::Disconnect,
        Kind::Message,
    ];

    pub fn tag(self) -> u32 {
        self as u32
    }

    pub fn from_tag(tag: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }

    /// Smallest declared size a frame of this kind may carry.
    ///
    /// Fixed-layout kinds need their whole body; Stdout only needs the header
    /// since an empty notice is legal.
    pub fn min_size(self) -> usize {
        HEADER_SIZE
            + match self {
                Kind::Stdout => 0,
                Kind::UserInfo => USERINFO_BODY,
                Kind::Connect => USERINFO_BODY + 1,
                Kind::Disconnect => NAME_FIELD,
                Kind::Message => MESSAGE_FIELD,
            }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Kind::Stdout => "Stdout",
            Kind::UserInfo => "UserInfo",
            Kind::Connect => "Connect",
            Kind::Disconnect => "Disconnect",
            Kind::Message => "Message",
        };
        f.write_str(name)
    }
}

/// The raw common header, before the kind tag has been trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub tag: u32,
    pub size: u64,
}

impl Header {
    pub fn parse(bytes: &[u8; HEADER_SIZE]) -> Self {
        let mut tag = [0u8; 4];
        let mut size = [0u8; 8];
        tag.copy_from_slice(&bytes[0..4]);
        size.copy_from_slice(&bytes[4..12]);
        Self {
            tag: u32::from_le_bytes(tag),
            size: u64::from_le_bytes(size),
        }
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.tag.to_le_bytes());
        bytes[4..12].copy_from_slice(&self.size.to_le_bytes());
        bytes
    }

    /// Check the header against the catalog before any body byte is read.
    ///
    /// Returns the kind and the number of bytes the whole record occupies.
    ///
    /// # Errors
    ///
    /// `UnknownKind` for an unrecognised tag, `Undersized` when the size is
    /// below the kind's minimum, `Oversized` above [`MAX_RECORD_SIZE`].
    pub fn validate(self) -> Result<(Kind, usize), DecodeError> {
        let kind = Kind::from_tag(self.tag).ok_or(DecodeError::UnknownKind(self.tag))?;
        let minimum = kind.min_size();
        if self.size < minimum as u64 {
            return Err(DecodeError::Undersized {
                kind,
                declared: self.size,
                minimum,
            });
        }
        match usize::try_from(self.size) {
            Ok(size) if size <= MAX_RECORD_SIZE => Ok((kind, size)),
            _ => Err(DecodeError::Oversized {
                declared: self.size,
                maximum: MAX_RECORD_SIZE,
            }),
        }
    }
}

/// Protocol version a client must match exactly to be admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl ProtocolVersion {
    pub const CURRENT: Self = Self::new(1, 0, 0);

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl Default for ProtocolVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Handshake credential, and the identity every member is known by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub version: ProtocolVersion,
}

impl UserInfo {
    /// Names longer than [`MAX_NAME_LENGTH`] bytes are cut at a character
    /// boundary, matching what the peer would decode.
    pub fn new(name: &str, version: ProtocolVersion) -> Self {
        Self {
            name: clamp(name, MAX_NAME_LENGTH).to_string(),
            version,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// Text for the receiver to display as-is.
    Stdout(String),
    UserInfo(UserInfo),
    /// Roster sync (`validate_only == false`) or handshake acknowledgement.
    Connect { user: UserInfo, validate_only: bool },
    Disconnect { name: String },
    Message(String),
}

impl Record {
    pub fn kind(&self) -> Kind {
        match self {
            Record::Stdout(_) => Kind::Stdout,
            Record::UserInfo(_) => Kind::UserInfo,
            Record::Connect { .. } => Kind::Connect,
            Record::Disconnect { .. } => Kind::Disconnect,
            Record::Message(_) => Kind::Message,
        }
    }

    pub fn stdout(text: impl Into<String>) -> Self {
        Record::Stdout(text.into())
    }

    pub fn message(text: &str) -> Self {
        Record::Message(clamp(text, MAX_MESSAGE_LENGTH).to_string())
    }

    pub fn disconnect(name: &str) -> Self {
        Record::Disconnect {
            name: clamp(name, MAX_NAME_LENGTH).to_string(),
        }
    }

    /// Encode into wire bytes, header first. The size field always equals the
    /// length of the returned buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(self.kind().min_size());
        match self {
            Record::Stdout(text) => {
                let text = clamp(text, MAX_STDOUT_TEXT);
                body.extend(text.bytes().filter(|&b| b != 0));
            }
            Record::UserInfo(user) => put_user(&mut body, user),
            Record::Connect {
                user,
                validate_only,
            } => {
                put_user(&mut body, user);
                body.push(u8::from(*validate_only));
            }
            Record::Disconnect { name } => put_text(&mut body, name, NAME_FIELD),
            Record::Message(text) => put_text(&mut body, text, MESSAGE_FIELD),
        }

        let header = Header {
            tag: self.kind().tag(),
            size: (HEADER_SIZE + body.len()) as u64,
        };
        let mut frame = Vec::with_capacity(HEADER_SIZE + body.len());
        frame.extend_from_slice(&header.to_bytes());
        frame.extend_from_slice(&body);
        frame
    }

    /// Decode one complete frame, header included.
    ///
    /// Bytes past the kind's fixed layout, up to the declared size, are
    /// ignored. Bytes past the declared size are not looked at.
    ///
    /// # Errors
    ///
    /// Any header validation failure, or `Truncated` if `frame` is shorter
    /// than the size it declares.
    pub fn decode(frame: &[u8]) -> Result<Self, DecodeError> {
        let Some(head) = frame.first_chunk::<HEADER_SIZE>() else {
            return Err(DecodeError::Truncated {
                expected: HEADER_SIZE,
                received: frame.len(),
            });
        };
        let (kind, size) = Header::parse(head).validate()?;
        if frame.len() < size {
            return Err(DecodeError::Truncated {
                expected: size,
                received: frame.len(),
            });
        }
        Ok(Self::decode_body(kind, &frame[HEADER_SIZE..size]))
    }

    /// `body` must be at least `kind.min_size() - HEADER_SIZE` bytes long,
    /// which [`Header::validate`] guarantees.
    pub(crate) fn decode_body(kind: Kind, body: &[u8]) -> Self {
        match kind {
            Kind::Stdout => Record::Stdout(take_text(body, MAX_STDOUT_TEXT)),
            Kind::UserInfo => Record::UserInfo(take_user(body)),
            Kind::Connect => Record::Connect {
                user: take_user(body),
                validate_only: body[USERINFO_BODY] != 0,
            },
            Kind::Disconnect => Record::Disconnect {
                name: take_text(&body[..NAME_FIELD], MAX_NAME_LENGTH),
            },
            Kind::Message => Record::Message(take_text(&body[..MESSAGE_FIELD], MAX_MESSAGE_LENGTH)),
        }
    }
}

/// Longest prefix of `text` that fits in `max` bytes without splitting a
/// character.
pub(crate) fn clamp(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

fn put_text(buf: &mut Vec<u8>, text: &str, field: usize) {
    let text = clamp(text, field - 1);
    let start = buf.len();
    buf.extend_from_slice(text.as_bytes());
    buf.resize(start + field, 0);
}

fn put_user(buf: &mut Vec<u8>, user: &UserInfo) {
    put_text(buf, &user.name, NAME_FIELD);
    buf.extend_from_slice(&user.version.major.to_le_bytes());
    buf.extend_from_slice(&user.version.minor.to_le_bytes());
    buf.extend_from_slice(&user.version.patch.to_le_bytes());
}

// Reads at most `max` bytes and stops early at the first NUL.
fn take_text(field: &[u8], max: usize) -> String {
    let field = &field[..field.len().min(max)];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn take_u16(body: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([body[offset], body[offset + 1]])
}

fn take_user(body: &[u8]) -> UserInfo {
    UserInfo {
        name: take_text(&body[..NAME_FIELD], MAX_NAME_LENGTH),
        version: ProtocolVersion {
            major: take_u16(body, NAME_FIELD),
            minor: take_u16(body, NAME_FIELD + 2),
            patch: take_u16(body, NAME_FIELD + 4),
        },
    }
}
