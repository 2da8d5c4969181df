//! Request encoding for the meta command set.
//!
//! Every encoder appends one complete command to a shared batch buffer:
//!
//! ```text
//! mg <key>[ c][ N<n>] v\r\n
//! ms <key> <len>[ C<cas>][ T<ttl>]\r\n<data>\r\n
//! md <key>[ C<cas>][ I[ T<ttl>]]\r\n
//! flush_all\r\n
//! version\r\n
//! ```

use bytes::{BufMut, BytesMut};

use crate::error::{MemcacheError, Result};

/// Longest key the server accepts.
pub const MAX_KEY_LEN: usize = 250;

/// Options for `mg`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MGetOptions {
    /// `N<n>` flag: vivify on miss, creating a placeholder with TTL `n`.
    /// `Some(0)` is sent as `N0`; `None` omits the flag.
    pub n: Option<u32>,
    /// `c` flag: return the CAS value.
    pub cas: bool,
}

/// Options for `ms`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MSetOptions {
    /// Compare-and-swap token, 0 means unset.
    pub cas: u64,
    /// Time to live in seconds, 0 means unset.
    pub ttl: u32,
}

/// Options for `md`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MDelOptions {
    /// Compare-and-swap token, 0 means unset.
    pub cas: u64,
    /// `I` flag: mark the item stale instead of removing it.
    pub mark_stale: bool,
    /// TTL applied together with `I`. Ignored unless `mark_stale` is set.
    pub ttl: u32,
}

/// Reject keys the text protocol cannot carry.
pub fn validate_key(key: &[u8]) -> Result<()> {
    if key.is_empty() {
        return Err(MemcacheError::InvalidKey("empty key".to_string()));
    }
    if key.len() > MAX_KEY_LEN {
        return Err(MemcacheError::InvalidKey(format!(
            "key length {} exceeds maximum {}",
            key.len(),
            MAX_KEY_LEN
        )));
    }
    if key.iter().any(|&b| b <= b' ' || b == 0x7f) {
        return Err(MemcacheError::InvalidKey(
            "key contains whitespace or control bytes".to_string(),
        ));
    }
    Ok(())
}

/// Append `mg <key>[ c][ N<n>] v\r\n`.
pub fn encode_mget(buf: &mut BytesMut, key: &[u8], opts: &MGetOptions) {
    buf.put_slice(b"mg ");
    buf.put_slice(key);
    if opts.cas {
        buf.put_slice(b" c");
    }
    if let Some(n) = opts.n {
        buf.put_slice(b" N");
        put_u64(buf, n as u64);
    }
    buf.put_slice(b" v\r\n");
}

/// Append `ms <key> <len>[ C<cas>][ T<ttl>]\r\n<data>\r\n`.
pub fn encode_mset(buf: &mut BytesMut, key: &[u8], data: &[u8], opts: &MSetOptions) {
    buf.put_slice(b"ms ");
    buf.put_slice(key);
    buf.put_u8(b' ');
    put_u64(buf, data.len() as u64);
    if opts.cas > 0 {
        buf.put_slice(b" C");
        put_u64(buf, opts.cas);
    }
    if opts.ttl > 0 {
        buf.put_slice(b" T");
        put_u64(buf, opts.ttl as u64);
    }
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

/// Append `md <key>[ C<cas>][ I[ T<ttl>]]\r\n`.
///
/// A TTL without `mark_stale` is dropped: the server only honours `T` on a
/// delete when the item is being marked stale.
pub fn encode_mdel(buf: &mut BytesMut, key: &[u8], opts: &MDelOptions) {
    buf.put_slice(b"md ");
    buf.put_slice(key);
    if opts.cas > 0 {
        buf.put_slice(b" C");
        put_u64(buf, opts.cas);
    }
    if opts.mark_stale {
        buf.put_slice(b" I");
        if opts.ttl > 0 {
            buf.put_slice(b" T");
            put_u64(buf, opts.ttl as u64);
        }
    }
    buf.put_slice(b"\r\n");
}

/// Append `flush_all\r\n`.
pub fn encode_flush_all(buf: &mut BytesMut) {
    buf.put_slice(b"flush_all\r\n");
}

/// Append `version\r\n`.
pub fn encode_version(buf: &mut BytesMut) {
    buf.put_slice(b"version\r\n");
}

/// Append the decimal form of `value` without going through `fmt`.
///
/// Digits are written low-to-high straight into `buf` and then reversed in
/// place.
pub(crate) fn put_u64(buf: &mut BytesMut, mut value: u64) {
    let start = buf.len();
    loop {
        buf.put_u8(b'0' + (value % 10) as u8);
        value /= 10;
        if value == 0 {
            break;
        }
    }
    buf[start..].reverse();
}
