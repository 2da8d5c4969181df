//! Response decoding for the meta command set.
//!
//! A record is one header line, plus a body for `VA`:
//!
//! ```text
//! EN\r\n
//! HD[ flags]\r\n
//! VA <len>[ flags]\r\n<len bytes>\r\n
//! NS\r\n | EX\r\n | NF\r\n
//! OK\r\n
//! VERSION <version>\r\n
//! SERVER_ERROR <msg>\r\n
//! CLIENT_ERROR <msg>\r\n
//! ```
//!
//! Flags are space separated: `W` (won the lease), `X` (stale),
//! `Z` (a lease was already won elsewhere), `c<cas>`. Other flags are
//! skipped.

use bytes::Bytes;

use crate::error::{MemcacheError, Result};

/// Status code of a decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Miss.
    En,
    /// Success without a body.
    Hd,
    /// Success with a body.
    Va,
    /// Not stored.
    Ns,
    /// CAS mismatch.
    Ex,
    /// Not found.
    Nf,
    /// `flush_all` acknowledgement.
    Ok,
    /// `version` reply.
    Version,
}

/// Single-letter flags returned after the status code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResponseFlags {
    /// `W`: this client won the right to repopulate the item.
    pub won: bool,
    /// `X`: the item is stale.
    pub stale: bool,
    /// `Z`: a winning lease was already handed out to another client.
    pub lease_elsewhere: bool,
}

/// Decoded header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    pub kind: ResponseType,
    pub flags: ResponseFlags,
    /// Value of the `c<cas>` flag.
    pub cas: Option<u64>,
    /// Declared body length of a `VA` record.
    pub value_len: Option<usize>,
    /// Text after `VERSION `.
    pub version: Option<String>,
}

impl ResponseHeader {
    fn new(kind: ResponseType) -> Self {
        Self {
            kind,
            flags: ResponseFlags::default(),
            cas: None,
            value_len: None,
            version: None,
        }
    }
}

/// Parse one header line, including its trailing CRLF.
///
/// `SERVER_ERROR` and `CLIENT_ERROR` lines come back as their error
/// variants. Anything that does not follow the grammar is `BrokenPipe`.
pub fn parse_header(line: &[u8]) -> Result<ResponseHeader> {
    let body = line
        .strip_suffix(b"\r\n")
        .ok_or_else(|| MemcacheError::broken_pipe("missing CRLF terminator"))?;
    if body.contains(&b'\n') || body.contains(&b'\r') {
        return Err(MemcacheError::broken_pipe("CRLF inside header line"));
    }

    if let Some(msg) = body.strip_prefix(b"SERVER_ERROR") {
        return Err(MemcacheError::ServerError {
            message: error_message(msg),
        });
    }
    if let Some(msg) = body.strip_prefix(b"CLIENT_ERROR") {
        return Err(MemcacheError::ClientError {
            message: error_message(msg),
        });
    }
    if body == b"ERROR" {
        return Err(MemcacheError::ClientError {
            message: "ERROR".to_string(),
        });
    }
    if let Some(version) = body.strip_prefix(b"VERSION ") {
        let mut header = ResponseHeader::new(ResponseType::Version);
        header.version = Some(String::from_utf8_lossy(version).into_owned());
        return Ok(header);
    }
    if body == b"OK" {
        return Ok(ResponseHeader::new(ResponseType::Ok));
    }

    if body.len() < 2 || (body.len() > 2 && body[2] != b' ') {
        return Err(MemcacheError::broken_pipe(format!(
            "unknown response line: {}",
            String::from_utf8_lossy(body)
        )));
    }
    let kind = match &body[..2] {
        b"EN" => ResponseType::En,
        b"HD" => ResponseType::Hd,
        b"VA" => ResponseType::Va,
        b"NS" => ResponseType::Ns,
        b"EX" => ResponseType::Ex,
        b"NF" => ResponseType::Nf,
        other => {
            return Err(MemcacheError::broken_pipe(format!(
                "unknown status code: {}",
                String::from_utf8_lossy(other)
            )))
        }
    };

    let mut header = ResponseHeader::new(kind);
    let mut tokens = body[2..].split(|&b| b == b' ').filter(|t| !t.is_empty());

    if kind == ResponseType::Va {
        let len = tokens
            .next()
            .ok_or_else(|| MemcacheError::broken_pipe("VA without length"))?;
        header.value_len = Some(parse_decimal(len)? as usize);
    }

    for token in tokens {
        match token[0] {
            b'W' => header.flags.won = true,
            b'X' => header.flags.stale = true,
            b'Z' => header.flags.lease_elsewhere = true,
            b'c' => header.cas = Some(parse_decimal(&token[1..])?),
            _ => {}
        }
    }

    Ok(header)
}

/// Parse a header line together with its `VA` body, if any.
///
/// The body must be exactly the declared length.
pub fn parse_response(line: &[u8], body: Option<&[u8]>) -> Result<(ResponseHeader, Option<Bytes>)> {
    let header = parse_header(line)?;
    match (header.value_len, body) {
        (Some(len), Some(body)) if body.len() == len => {
            Ok((header, Some(Bytes::copy_from_slice(body))))
        }
        (Some(len), Some(body)) => Err(MemcacheError::broken_pipe(format!(
            "VA declared {} bytes but carried {}",
            len,
            body.len()
        ))),
        (Some(_), None) => Err(MemcacheError::broken_pipe("VA record without body")),
        (None, Some(_)) => Err(MemcacheError::broken_pipe("unexpected body after header")),
        (None, None) => Ok((header, None)),
    }
}

/// Parse an unsigned decimal with no sign or whitespace.
pub(crate) fn parse_decimal(data: &[u8]) -> Result<u64> {
    if data.is_empty() {
        return Err(MemcacheError::broken_pipe("empty number"));
    }
    let mut value: u64 = 0;
    for &b in data {
        if !b.is_ascii_digit() {
            return Err(MemcacheError::broken_pipe(format!(
                "invalid number: {}",
                String::from_utf8_lossy(data)
            )));
        }
        value = value
            .checked_mul(10)
            .and_then(|v| v.checked_add((b - b'0') as u64))
            .ok_or_else(|| MemcacheError::broken_pipe("number overflow"))?;
    }
    Ok(value)
}

fn error_message(rest: &[u8]) -> String {
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    String::from_utf8_lossy(rest).into_owned()
}

/// Typed decoding of one sub-command's record.
pub trait DecodeResponse: Sized {
    /// Decode from the header line and the optional `VA` body.
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self>;
}

fn unexpected(kind: ResponseType, command: &str) -> MemcacheError {
    MemcacheError::broken_pipe(format!("unexpected {:?} reply to {}", kind, command))
}

/// Status of an `mg` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MGetResponseType {
    En,
    Hd,
    Va,
}

/// Reply to `mg`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MGetResponse {
    pub kind: MGetResponseType,
    /// Value bytes, empty unless `kind` is `Va`.
    pub data: Bytes,
    pub flags: ResponseFlags,
    pub cas: Option<u64>,
}

impl DecodeResponse for MGetResponse {
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self> {
        let (header, data) = parse_response(line, body)?;
        let kind = match header.kind {
            ResponseType::En => MGetResponseType::En,
            ResponseType::Hd => MGetResponseType::Hd,
            ResponseType::Va => MGetResponseType::Va,
            other => return Err(unexpected(other, "mg")),
        };
        Ok(MGetResponse {
            kind,
            data: data.unwrap_or_default(),
            flags: header.flags,
            cas: header.cas,
        })
    }
}

/// Status of an `ms` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MSetResponseType {
    Hd,
    Ns,
    Ex,
    Nf,
}

/// Reply to `ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MSetResponse {
    pub kind: MSetResponseType,
}

impl DecodeResponse for MSetResponse {
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self> {
        let (header, _) = parse_response(line, body)?;
        let kind = match header.kind {
            ResponseType::Hd => MSetResponseType::Hd,
            ResponseType::Ns => MSetResponseType::Ns,
            ResponseType::Ex => MSetResponseType::Ex,
            ResponseType::Nf => MSetResponseType::Nf,
            other => return Err(unexpected(other, "ms")),
        };
        Ok(MSetResponse { kind })
    }
}

/// Status of an `md` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MDelResponseType {
    Hd,
    Nf,
    Ex,
}

/// Reply to `md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MDelResponse {
    pub kind: MDelResponseType,
}

impl DecodeResponse for MDelResponse {
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self> {
        let (header, _) = parse_response(line, body)?;
        let kind = match header.kind {
            ResponseType::Hd => MDelResponseType::Hd,
            ResponseType::Nf => MDelResponseType::Nf,
            ResponseType::Ex => MDelResponseType::Ex,
            other => return Err(unexpected(other, "md")),
        };
        Ok(MDelResponse { kind })
    }
}

/// Reply to `flush_all`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushAllResponse;

impl DecodeResponse for FlushAllResponse {
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self> {
        let (header, _) = parse_response(line, body)?;
        match header.kind {
            ResponseType::Ok => Ok(FlushAllResponse),
            other => Err(unexpected(other, "flush_all")),
        }
    }
}

/// Reply to `version`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionResponse {
    pub version: String,
}

impl DecodeResponse for VersionResponse {
    fn decode(line: &[u8], body: Option<&[u8]>) -> Result<Self> {
        let (header, _) = parse_response(line, body)?;
        match (header.kind, header.version) {
            (ResponseType::Version, Some(version)) => Ok(VersionResponse { version }),
            (other, _) => Err(unexpected(other, "version")),
        }
    }
}
