//! Frontend↔Worker query serialization.
//!
//! # Frame Layout
//! ```text
//! u32 payload length
//! payload:
//!     u8   method
//!     u8   flags
//!     str  date, user_ip, user_host, user_agent
//!     u32  n_langs,   n × str
//!     u32  n_args,    n × { u8 type, str content_type, str key, bytes value }
//!     u32  n_cookies, n × { str name, str value, u8 flags }
//!     str  content_type
//!     u64  content_length
//!     u8   range presence (bit 0 first, bit 1 last), u64 first, u64 last
//! ```
//!
//! Headers are not carried; each side regenerates its own. A frame is
//! written with a single `write_all` so that a failed save never leaves a
//! partial frame observable as a valid one.

mod cursor;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub use cursor::{Decoder, Encoder};

use crate::query::{
    ArgType, Argument, ByteRange, Cookie, CookieFlags, Method, Query, QueryError, QueryFlags, MAX_ARGS,
    MAX_COOKIES, MAX_KEY_LEN, MAX_LANGS,
};

/// Largest frame accepted from the wire.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;
/// Ceiling for the date, address, host and agent strings.
pub const MAX_FIELD_LEN: usize = 1024;
pub const MAX_LANG_LEN: usize = 32;
pub const MAX_CONTENT_TYPE_LEN: usize = 256;
pub const MAX_COOKIE_NAME_LEN: usize = 128;
pub const MAX_COOKIE_VALUE_LEN: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("truncated frame")]
    Truncated,
    #[error("{0} trailing bytes after frame")]
    TrailingBytes(usize),
    #[error("too many {what}: {count} (max {max})")]
    CountExceeded {
        what: &'static str,
        count: usize,
        max: usize,
    },
    #[error("{what} too long: {len} bytes (max {max})")]
    LengthExceeded {
        what: &'static str,
        len: usize,
        max: usize,
    },
    #[error("frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("invalid method tag {0}")]
    InvalidMethod(u8),
    #[error("invalid argument type {0}")]
    InvalidArgType(u8),
    #[error("{0} is not valid UTF-8")]
    Utf8(&'static str),
    #[error("invalid query: {0}")]
    Query(#[from] QueryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// The peer closed its end; for Worker sockets this means respawn.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }

    /// The peer closed the stream cleanly before a new frame started.
    pub fn is_eof(&self) -> bool {
        matches!(self, CodecError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof)
    }
}

/// Encode a query into a complete frame (length prefix included).
pub fn encode_query(q: &Query) -> Result<Vec<u8>, CodecError> {
    let mut enc = Encoder::with_capacity(256);
    enc.put_u32(0);

    enc.put_u8(q.method as u8);
    enc.put_u8(q.flags.bits());
    enc.put_str("date", &q.date, MAX_FIELD_LEN)?;
    enc.put_str("user_ip", &q.user_ip, MAX_FIELD_LEN)?;
    enc.put_str("user_host", &q.user_host, MAX_FIELD_LEN)?;
    enc.put_str("user_agent", &q.user_agent, MAX_FIELD_LEN)?;

    enc.put_count("langs", q.langs.len(), MAX_LANGS)?;
    for lang in &q.langs {
        enc.put_str("lang", lang, MAX_LANG_LEN)?;
    }

    enc.put_count("args", q.args().len(), MAX_ARGS)?;
    for arg in q.args() {
        enc.put_u8(arg.kind as u8);
        enc.put_str(
            "arg content_type",
            arg.content_type.as_deref().unwrap_or(""),
            MAX_CONTENT_TYPE_LEN,
        )?;
        enc.put_str("arg key", &arg.key, MAX_KEY_LEN)?;
        enc.put_bytes("arg value", &arg.value, MAX_FRAME_SIZE)?;
    }

    enc.put_count("cookies", q.cookies().len(), MAX_COOKIES)?;
    for cookie in q.cookies() {
        enc.put_str("cookie name", &cookie.name, MAX_COOKIE_NAME_LEN)?;
        enc.put_str("cookie value", &cookie.value, MAX_COOKIE_VALUE_LEN)?;
        enc.put_u8(cookie.flags.bits());
    }

    enc.put_str("content_type", &q.content_type, MAX_CONTENT_TYPE_LEN)?;
    enc.put_u64(q.content_length);
    let range = q.range.unwrap_or(ByteRange {
        first: None,
        last: None,
    });
    enc.put_u8(u8::from(range.first.is_some()) | u8::from(range.last.is_some()) << 1);
    enc.put_u64(range.first.unwrap_or(0));
    enc.put_u64(range.last.unwrap_or(0));

    let mut frame = enc.into_inner();
    let payload_len = frame.len() - 4;
    if payload_len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(payload_len));
    }
    frame[..4].copy_from_slice(&(payload_len as u32).to_le_bytes());
    Ok(frame)
}

/// Decode a frame payload (length prefix already stripped).
pub fn decode_query(payload: &[u8]) -> Result<Query, CodecError> {
    let mut dec = Decoder::new(payload);

    let tag = dec.get_u8()?;
    let method = Method::from_u8(tag).ok_or(CodecError::InvalidMethod(tag))?;
    let mut q = Query::new(method);
    q.flags = QueryFlags::from_bits_truncate(dec.get_u8()?);
    q.date = dec.get_str("date", MAX_FIELD_LEN)?.to_string();
    q.user_ip = dec.get_str("user_ip", MAX_FIELD_LEN)?.to_string();
    q.user_host = dec.get_str("user_host", MAX_FIELD_LEN)?.to_string();
    q.user_agent = dec.get_str("user_agent", MAX_FIELD_LEN)?.to_string();

    let n_langs = dec.get_count("langs", MAX_LANGS, 4)?;
    let mut langs = Vec::with_capacity(n_langs);
    for _ in 0..n_langs {
        langs.push(dec.get_str("lang", MAX_LANG_LEN)?.to_string());
    }
    q.langs = langs;

    // type + three length prefixes
    let n_args = dec.get_count("args", MAX_ARGS, 13)?;
    for _ in 0..n_args {
        let tag = dec.get_u8()?;
        let kind = ArgType::from_u8(tag).ok_or(CodecError::InvalidArgType(tag))?;
        let content_type = dec.get_str("arg content_type", MAX_CONTENT_TYPE_LEN)?;
        let key = dec.get_str("arg key", MAX_KEY_LEN)?;
        let value = dec.get_bytes("arg value", MAX_FRAME_SIZE)?;
        let mut arg = Argument::new(key, value.to_vec(), kind)?;
        if !content_type.is_empty() {
            arg.content_type = Some(content_type.to_string());
        }
        q.push_arg(arg)?;
    }

    let n_cookies = dec.get_count("cookies", MAX_COOKIES, 9)?;
    for _ in 0..n_cookies {
        let name = dec.get_str("cookie name", MAX_COOKIE_NAME_LEN)?;
        let value = dec.get_str("cookie value", MAX_COOKIE_VALUE_LEN)?;
        let mut cookie = Cookie::new(name, value);
        cookie.flags = CookieFlags::from_bits_truncate(dec.get_u8()?);
        q.push_cookie(cookie)?;
    }

    q.content_type = dec
        .get_str("content_type", MAX_CONTENT_TYPE_LEN)?
        .to_string();
    q.content_length = dec.get_u64()?;
    let present = dec.get_u8()?;
    let first = dec.get_u64()?;
    let last = dec.get_u64()?;
    if present & 0b11 != 0 {
        q.range = Some(ByteRange {
            first: (present & 0b01 != 0).then_some(first),
            last: (present & 0b10 != 0).then_some(last),
        });
    }
    dec.finish()?;
    Ok(q)
}

/// Serialize `q` to `w` in one write.
pub async fn save_query<W>(w: &mut W, q: &Query) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_query(q)?;
    w.write_all(&frame).await?;
    w.flush().await?;
    Ok(())
}

/// Read one frame from `r` and deserialize it.
pub async fn load_query<R>(r: &mut R) -> Result<Query, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(CodecError::FrameTooLarge(len));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    decode_query(&payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_query() -> Query {
        let mut q = Query::new(Method::Post);
        q.flags.insert(QueryFlags::KEEP_ALIVE);
        q.flags.insert(QueryFlags::COMPRESSED);
        q.date = "Mon, 01 Jan 2024 00:00:00 GMT".into();
        q.user_ip = "10.0.0.1".into();
        q.user_host = "example.com".into();
        q.user_agent = "test/1.0".into();
        q.langs = vec!["fr".into(), "en".into()];
        q.set("op", "counter").unwrap();
        q.push_arg(
            Argument::new("upload", vec![0, 1, 2, 0, 255], ArgType::Post)
                .unwrap()
                .with_content_type("application/octet-stream"),
        )
        .unwrap();
        q.push_arg(Argument::new("op", b"dup".to_vec(), ArgType::Post).unwrap())
            .unwrap();
        q.push_cookie(Cookie::new("sess", "12345")).unwrap();
        q.content_type = "multipart/form-data; boundary=x".into();
        q.content_length = 777;
        q.range = Some(ByteRange {
            first: None,
            last: Some(499),
        });
        q
    }

    #[test]
    fn frame_round_trip() {
        let q = sample_query();
        let frame = encode_query(&q).unwrap();
        let len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let back = decode_query(&frame[4..]).unwrap();
        assert_eq!(back.method, Method::Post);
        assert_eq!(back.flags, q.flags);
        assert_eq!(back.args(), q.args());
        assert_eq!(back.cookies(), q.cookies());
        assert_eq!(back.langs, q.langs);
        assert_eq!(back.content_type, q.content_type);
        assert_eq!(back.content_length, 777);
        assert_eq!(back.user_agent, "test/1.0");
        assert_eq!(back.range, q.range);
    }

    #[tokio::test]
    async fn save_then_load_over_a_stream() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let q = sample_query();
        save_query(&mut a, &q).await.unwrap();
        let back = load_query(&mut b).await.unwrap();
        assert_eq!(back.get("op").unwrap(), "counter");
        assert_eq!(back.get_bytes("upload"), Some(&[0u8, 1, 2, 0, 255][..]));
    }

    #[test]
    fn too_many_args_fails_closed() {
        let mut enc = Encoder::new();
        enc.put_u8(Method::Get as u8);
        enc.put_u8(0);
        for _ in 0..4 {
            enc.put_str("s", "", 0).unwrap();
        }
        enc.put_u32(0);
        enc.put_u32(MAX_ARGS as u32 + 1);
        let payload = enc.into_inner();
        assert!(matches!(
            decode_query(&payload),
            Err(CodecError::CountExceeded { what: "args", .. })
        ));
    }

    #[test]
    fn too_many_langs_fails_closed() {
        let mut enc = Encoder::new();
        enc.put_u8(Method::Get as u8);
        enc.put_u8(0);
        for _ in 0..4 {
            enc.put_str("s", "", 0).unwrap();
        }
        enc.put_u32(u32::MAX);
        let payload = enc.into_inner();
        assert!(matches!(
            decode_query(&payload),
            Err(CodecError::CountExceeded { what: "langs", .. })
        ));
    }

    #[test]
    fn oversize_key_rejected() {
        let mut enc = Encoder::new();
        enc.put_u8(Method::Get as u8);
        enc.put_u8(0);
        for _ in 0..4 {
            enc.put_str("s", "", 0).unwrap();
        }
        enc.put_u32(0);
        enc.put_u32(1);
        enc.put_u8(0);
        enc.put_str("ct", "", 0).unwrap();
        enc.put_u32(MAX_KEY_LEN as u32 + 1);
        enc.put_u32(0);
        enc.put_u32(0);
        let payload = enc.into_inner();
        assert!(matches!(
            decode_query(&payload),
            Err(CodecError::LengthExceeded { what: "arg key", .. })
        ));
    }

    #[test]
    fn truncated_payload() {
        let frame = encode_query(&sample_query()).unwrap();
        let cut = &frame[4..frame.len() - 3];
        assert!(decode_query(cut).is_err());
    }

    #[test]
    fn invalid_method_tag() {
        assert!(matches!(
            decode_query(&[42, 0]),
            Err(CodecError::InvalidMethod(42))
        ));
    }

    #[tokio::test]
    async fn oversize_frame_rejected_before_allocation() {
        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes();
        let mut r: &[u8] = &header;
        assert!(matches!(
            load_query(&mut r).await,
            Err(CodecError::FrameTooLarge(_))
        ));
    }

    #[tokio::test]
    async fn broken_pipe_is_distinguished() {
        let (mut a, b) = tokio::io::duplex(16);
        drop(b);
        let err = save_query(&mut a, &sample_query()).await.unwrap_err();
        assert!(err.is_broken_pipe());
    }
}
