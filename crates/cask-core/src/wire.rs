//! Cask wire format — the request and response layouts of the upload protocol.
//!
//! These types ARE the protocol. Every field and every size here is fixed by
//! deployed clients; changing one is a breaking change.
//!
//! All multi-byte integers are little-endian. All text fields are
//! NUL-terminated inside a fixed capacity. Both directions move data in
//! frames of exactly `PACKET_SIZE` bytes, zero-padded at the end; frames are
//! a transport quantum, never a message boundary.
//!
//! Fixed layouts are #[repr(C, packed)] with zerocopy derives, so encoding
//! and decoding is a plain byte copy. There is no unsafe code in this module.

use std::mem::size_of;

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes};

type LeU16 = U16<LittleEndian>;
type LeU32 = U32<LittleEndian>;

// ── Sizes ─────────────────────────────────────────────────────────────────────

/// Version byte the server writes into every response header.
pub const SERVER_VERSION: u8 = 3;

/// Frame size, both directions.
pub const PACKET_SIZE: usize = 1024;

pub const CLIENT_ID_SIZE: usize = 16;
pub const NAME_SIZE: usize = 255;
pub const PUBLIC_KEY_SIZE: usize = 160;
pub const AES_KEY_SIZE: usize = 16;
pub const FILE_NAME_SIZE: usize = 255;

/// Opaque 16-byte client identifier, assigned at registration.
pub type ClientId = [u8; CLIENT_ID_SIZE];

/// The raw public-key field of a PublicKey request.
pub type PublicKeyField = [u8; PUBLIC_KEY_SIZE];

/// One transport frame.
pub type Frame = [u8; PACKET_SIZE];

// ── Codes ─────────────────────────────────────────────────────────────────────

/// Request codes, client → server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum RequestCode {
    Registration = 1100,
    PublicKey = 1101,
    SendFile = 1103,
    ValidCrc = 1104,
    InvalidCrc = 1105,
    LastInvalidCrc = 1106,
}

impl TryFrom<u16> for RequestCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            1100 => Ok(RequestCode::Registration),
            1101 => Ok(RequestCode::PublicKey),
            1103 => Ok(RequestCode::SendFile),
            1104 => Ok(RequestCode::ValidCrc),
            1105 => Ok(RequestCode::InvalidCrc),
            1106 => Ok(RequestCode::LastInvalidCrc),
            other => Err(WireError::UnrecognizedRequestCode(other)),
        }
    }
}

impl From<RequestCode> for u16 {
    fn from(c: RequestCode) -> u16 {
        c as u16
    }
}

/// Response codes, server → client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ResponseCode {
    RegistrationSuccess = 2100,
    RegistrationFailed = 2101,
    AesKey = 2102,
    FileReceived = 2103,
    MessageReceived = 2104,
}

impl TryFrom<u16> for ResponseCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            2100 => Ok(ResponseCode::RegistrationSuccess),
            2101 => Ok(ResponseCode::RegistrationFailed),
            2102 => Ok(ResponseCode::AesKey),
            2103 => Ok(ResponseCode::FileReceived),
            2104 => Ok(ResponseCode::MessageReceived),
            other => Err(WireError::UnrecognizedResponseCode(other)),
        }
    }
}

impl From<ResponseCode> for u16 {
    fn from(c: ResponseCode) -> u16 {
        c as u16
    }
}

// ── Request header ────────────────────────────────────────────────────────────

/// Leads every request. The client id is the canonical identity for every
/// request except Registration, where it is ignored.
///
/// Wire size: 23 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RequestHeader {
    pub client_id: ClientId,
    /// Client protocol version. Logged, not enforced.
    pub version: u8,
    pub code: LeU16,
    /// Bytes of payload the client says follow the header.
    /// For SendFile this includes the streamed ciphertext.
    pub payload_size: LeU32,
}

assert_eq_size!(RequestHeader, [u8; 23]);

pub const REQUEST_HEADER_SIZE: usize = size_of::<RequestHeader>();

impl RequestHeader {
    pub fn new(client_id: ClientId, version: u8, code: RequestCode, payload_size: u32) -> Self {
        Self {
            client_id,
            version,
            code: LeU16::new(code.into()),
            payload_size: LeU32::new(payload_size),
        }
    }

    /// Parse the header from the front of `data`.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        Self::read_from_prefix(data).ok_or(WireError::MalformedHeader {
            need: REQUEST_HEADER_SIZE,
            got: data.len(),
        })
    }

    pub fn request_code(&self) -> Result<RequestCode, WireError> {
        RequestCode::try_from(self.code.get())
    }

    pub fn payload_size(&self) -> u32 {
        self.payload_size.get()
    }
}

// ── Request bodies ────────────────────────────────────────────────────────────

/// Wire size: 255 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct RegistrationBody {
    pub name: [u8; NAME_SIZE],
}

assert_eq_size!(RegistrationBody, [u8; 255]);

/// Wire size: 415 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct PublicKeyBody {
    pub name: [u8; NAME_SIZE],
    /// DER-encoded RSA public key, zero padded. Opaque to the codec.
    pub public_key: PublicKeyField,
}

assert_eq_size!(PublicKeyBody, [u8; 415]);

/// Precedes the ciphertext of an upload. The ciphertext starts immediately
/// after this body, in the same frame.
///
/// Wire size: 275 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct SendFileBody {
    pub client_id: ClientId,
    /// Declared ciphertext length.
    pub content_size: LeU32,
    pub file_name: [u8; FILE_NAME_SIZE],
}

assert_eq_size!(SendFileBody, [u8; 275]);

/// Shared by ValidCRC, InvalidCRC and LastInvalidCRC.
///
/// Wire size: 271 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct CrcBody {
    pub client_id: ClientId,
    pub file_name: [u8; FILE_NAME_SIZE],
}

assert_eq_size!(CrcBody, [u8; 271]);

/// Offset of the first ciphertext byte inside the first frame of an upload.
pub const SEND_FILE_DATA_OFFSET: usize = REQUEST_HEADER_SIZE + size_of::<SendFileBody>();

// ── Response layouts ──────────────────────────────────────────────────────────

/// Leads every response.
///
/// Wire size: 7 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct ResponseHeader {
    pub version: u8,
    pub code: LeU16,
    /// True length of the payload that follows.
    pub payload_size: LeU32,
}

assert_eq_size!(ResponseHeader, [u8; 7]);

pub const RESPONSE_HEADER_SIZE: usize = size_of::<ResponseHeader>();

impl ResponseHeader {
    pub fn new(code: ResponseCode, payload_size: u32) -> Self {
        Self {
            version: SERVER_VERSION,
            code: LeU16::new(code.into()),
            payload_size: LeU32::new(payload_size),
        }
    }
}

/// Wire size: 279 bytes.
#[derive(Debug, Clone, AsBytes, FromBytes, FromZeroes)]
#[repr(C, packed)]
pub struct FileReceivedBody {
    pub client_id: ClientId,
    /// Ciphertext bytes consumed for the upload.
    pub content_size: LeU32,
    pub file_name: [u8; FILE_NAME_SIZE],
    pub checksum: LeU32,
}

assert_eq_size!(FileReceivedBody, [u8; 279]);

// ── Text fields ───────────────────────────────────────────────────────────────

/// Decode a fixed-width text field: everything before the first NUL.
/// Bytes after the terminator are ignored.
pub fn read_text(field: &[u8]) -> Result<String, WireError> {
    let end = field
        .iter()
        .position(|&b| b == 0)
        .ok_or(WireError::UnterminatedText(field.len()))?;
    std::str::from_utf8(&field[..end])
        .map(str::to_owned)
        .map_err(|_| WireError::InvalidText)
}

/// Encode text into a fixed-width field, NUL terminated and zero padded.
/// The terminator always fits: at most `N - 1` bytes of text.
pub fn write_text<const N: usize>(text: &str) -> Result<[u8; N], WireError> {
    let bytes = text.as_bytes();
    if bytes.len() >= N {
        return Err(WireError::TextTooLong {
            len: bytes.len(),
            capacity: N,
        });
    }
    if bytes.contains(&0) {
        return Err(WireError::EmbeddedNul);
    }
    let mut field = [0u8; N];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

// ── Requests ──────────────────────────────────────────────────────────────────

/// File reference carried by the three CRC confirmation requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrcRequest {
    pub client_id: ClientId,
    pub file_name: String,
}

/// A decoded request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Registration {
        name: String,
    },
    PublicKey {
        name: String,
        public_key: PublicKeyField,
    },
    SendFile {
        client_id: ClientId,
        content_size: u32,
        file_name: String,
    },
    ValidCrc(CrcRequest),
    InvalidCrc(CrcRequest),
    LastInvalidCrc(CrcRequest),
}

impl Request {
    pub fn code(&self) -> RequestCode {
        match self {
            Request::Registration { .. } => RequestCode::Registration,
            Request::PublicKey { .. } => RequestCode::PublicKey,
            Request::SendFile { .. } => RequestCode::SendFile,
            Request::ValidCrc(_) => RequestCode::ValidCrc,
            Request::InvalidCrc(_) => RequestCode::InvalidCrc,
            Request::LastInvalidCrc(_) => RequestCode::LastInvalidCrc,
        }
    }

    /// Decode the body that follows a header carrying `code`.
    /// `body` may be longer than the layout; the excess is not consumed.
    pub fn decode(code: RequestCode, body: &[u8]) -> Result<Self, WireError> {
        match code {
            RequestCode::Registration => {
                let b: RegistrationBody = read_body(body, "registration")?;
                Ok(Request::Registration {
                    name: read_text(&b.name)?,
                })
            }
            RequestCode::PublicKey => {
                let b: PublicKeyBody = read_body(body, "public key")?;
                Ok(Request::PublicKey {
                    name: read_text(&b.name)?,
                    public_key: b.public_key,
                })
            }
            RequestCode::SendFile => {
                let b: SendFileBody = read_body(body, "send file")?;
                Ok(Request::SendFile {
                    client_id: b.client_id,
                    content_size: b.content_size.get(),
                    file_name: read_text(&b.file_name)?,
                })
            }
            RequestCode::ValidCrc | RequestCode::InvalidCrc | RequestCode::LastInvalidCrc => {
                let b: CrcBody = read_body(body, "crc")?;
                let crc = CrcRequest {
                    client_id: b.client_id,
                    file_name: read_text(&b.file_name)?,
                };
                Ok(match code {
                    RequestCode::ValidCrc => Request::ValidCrc(crc),
                    RequestCode::InvalidCrc => Request::InvalidCrc(crc),
                    _ => Request::LastInvalidCrc(crc),
                })
            }
        }
    }

    /// Encode the fixed-layout body.
    pub fn encode_body(&self) -> Result<Vec<u8>, WireError> {
        let bytes = match self {
            Request::Registration { name } => RegistrationBody {
                name: write_text(name)?,
            }
            .as_bytes()
            .to_vec(),
            Request::PublicKey { name, public_key } => PublicKeyBody {
                name: write_text(name)?,
                public_key: *public_key,
            }
            .as_bytes()
            .to_vec(),
            Request::SendFile {
                client_id,
                content_size,
                file_name,
            } => SendFileBody {
                client_id: *client_id,
                content_size: LeU32::new(*content_size),
                file_name: write_text(file_name)?,
            }
            .as_bytes()
            .to_vec(),
            Request::ValidCrc(crc) | Request::InvalidCrc(crc) | Request::LastInvalidCrc(crc) => {
                CrcBody {
                    client_id: crc.client_id,
                    file_name: write_text(&crc.file_name)?,
                }
                .as_bytes()
                .to_vec()
            }
        };
        Ok(bytes)
    }

    /// Encode header + body. For SendFile the header's payload size also
    /// counts the ciphertext that the caller streams after the body.
    pub fn encode(&self, client_id: &ClientId, version: u8) -> Result<Vec<u8>, WireError> {
        let body = self.encode_body()?;
        let payload_size = match self {
            Request::SendFile { content_size, .. } => (body.len() as u32)
                .checked_add(*content_size)
                .ok_or(WireError::PayloadTooLarge {
                    content_size: *content_size,
                })?,
            _ => body.len() as u32,
        };
        let header = RequestHeader::new(*client_id, version, self.code(), payload_size);
        let mut out = Vec::with_capacity(REQUEST_HEADER_SIZE + body.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }
}

fn read_body<T: FromBytes>(body: &[u8], what: &'static str) -> Result<T, WireError> {
    T::read_from_prefix(body).ok_or(WireError::MalformedBody {
        what,
        need: size_of::<T>(),
        got: body.len(),
    })
}

// ── Responses ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    RegistrationSuccess {
        client_id: ClientId,
    },
    RegistrationFailed,
    AesKey {
        client_id: ClientId,
        /// Session key wrapped under the client's public key. Variable length.
        wrapped_key: Vec<u8>,
    },
    FileReceived {
        client_id: ClientId,
        content_size: u32,
        file_name: String,
        checksum: u32,
    },
    MessageReceived,
}

impl Response {
    pub fn code(&self) -> ResponseCode {
        match self {
            Response::RegistrationSuccess { .. } => ResponseCode::RegistrationSuccess,
            Response::RegistrationFailed => ResponseCode::RegistrationFailed,
            Response::AesKey { .. } => ResponseCode::AesKey,
            Response::FileReceived { .. } => ResponseCode::FileReceived,
            Response::MessageReceived => ResponseCode::MessageReceived,
        }
    }

    /// Encode header + payload. The header's payload size is always the
    /// true payload length, including a wrapped key of any length.
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let payload = match self {
            Response::RegistrationSuccess { client_id } => client_id.to_vec(),
            Response::RegistrationFailed | Response::MessageReceived => Vec::new(),
            Response::AesKey {
                client_id,
                wrapped_key,
            } => {
                let mut p = Vec::with_capacity(CLIENT_ID_SIZE + wrapped_key.len());
                p.extend_from_slice(client_id);
                p.extend_from_slice(wrapped_key);
                p
            }
            Response::FileReceived {
                client_id,
                content_size,
                file_name,
                checksum,
            } => FileReceivedBody {
                client_id: *client_id,
                content_size: LeU32::new(*content_size),
                file_name: write_text(file_name)?,
                checksum: LeU32::new(*checksum),
            }
            .as_bytes()
            .to_vec(),
        };

        let header = ResponseHeader::new(self.code(), payload.len() as u32);
        let mut out = Vec::with_capacity(RESPONSE_HEADER_SIZE + payload.len());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode a response from the front of `data` (typically a whole frame,
    /// padding included). Only `payload_size` bytes after the header are read.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let header = ResponseHeader::read_from_prefix(data).ok_or(WireError::MalformedHeader {
            need: RESPONSE_HEADER_SIZE,
            got: data.len(),
        })?;
        let code = ResponseCode::try_from(header.code.get())?;
        let len = header.payload_size.get() as usize;
        let payload = data
            .get(RESPONSE_HEADER_SIZE..RESPONSE_HEADER_SIZE + len)
            .ok_or(WireError::MalformedBody {
                what: "response",
                need: len,
                got: data.len().saturating_sub(RESPONSE_HEADER_SIZE),
            })?;

        match code {
            ResponseCode::RegistrationSuccess => {
                let client_id: ClientId = read_body(payload, "registration success")?;
                Ok(Response::RegistrationSuccess { client_id })
            }
            ResponseCode::RegistrationFailed => Ok(Response::RegistrationFailed),
            ResponseCode::AesKey => {
                let client_id: ClientId = read_body(payload, "aes key")?;
                Ok(Response::AesKey {
                    client_id,
                    wrapped_key: payload[CLIENT_ID_SIZE..].to_vec(),
                })
            }
            ResponseCode::FileReceived => {
                let b: FileReceivedBody = read_body(payload, "file received")?;
                Ok(Response::FileReceived {
                    client_id: b.client_id,
                    content_size: b.content_size.get(),
                    file_name: read_text(&b.file_name)?,
                    checksum: b.checksum.get(),
                })
            }
            ResponseCode::MessageReceived => Ok(Response::MessageReceived),
        }
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Split outbound bytes into `PACKET_SIZE` frames, zero-padding the last.
/// The result is always a whole number of frames.
pub fn pad_to_frames(data: &[u8]) -> Vec<u8> {
    let frames = data.len().div_ceil(PACKET_SIZE);
    let mut out = vec![0u8; frames * PACKET_SIZE];
    out[..data.len()].copy_from_slice(data);
    out
}

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting or producing wire-format data.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("malformed header: need {need} bytes, got {got}")]
    MalformedHeader { need: usize, got: usize },

    #[error("malformed {what} body: need {need} bytes, got {got}")]
    MalformedBody {
        what: &'static str,
        need: usize,
        got: usize,
    },

    #[error("text of {len} bytes does not fit a {capacity}-byte field with its terminator")]
    TextTooLong { len: usize, capacity: usize },

    #[error("text contains a NUL byte")]
    EmbeddedNul,

    #[error("{0}-byte text field has no NUL terminator")]
    UnterminatedText(usize),

    #[error("text field is not valid UTF-8")]
    InvalidText,

    #[error("unrecognized request code: {0}")]
    UnrecognizedRequestCode(u16),

    #[error("content size {content_size} does not fit the payload size field")]
    PayloadTooLarge { content_size: u32 },

    #[error("unrecognized response code: {0}")]
    UnrecognizedResponseCode(u16),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
