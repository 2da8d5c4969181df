//! Protocol module - meta command encoding, response framing and decoding.
//!
//! - Request encoders appending `mg`/`ms`/`md`/`flush_all`/`version`
//! - Ring-buffer framer splitting the response stream into records
//! - Response parser producing typed replies or per-record errors

mod frame_buffer;
mod request;
mod response;

pub use frame_buffer::{
    FrameBuffer, Record, DEFAULT_FRAME_CAPACITY, DEFAULT_MAX_VALUE_SIZE, MAX_HEADER_LEN,
};
pub use request::{
    encode_flush_all, encode_mdel, encode_mget, encode_mset, encode_version, validate_key,
    MDelOptions, MGetOptions, MSetOptions, MAX_KEY_LEN,
};
pub use response::{
    parse_header, parse_response, DecodeResponse, FlushAllResponse, MDelResponse,
    MDelResponseType, MGetResponse, MGetResponseType, MSetResponse, MSetResponseType,
    ResponseFlags, ResponseHeader, ResponseType, VersionResponse,
};
