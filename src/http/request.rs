//! Request parsing.
//!
//! # Responsibilities
//! - Read the raw header block, preserving any body bytes that arrived with it
//! - Validate the request line (exactly `HTTP/1.1`)
//! - Route the target into an operation name plus GET arguments
//! - Decode supported request headers into the `Query`
//! - Read and decode POST bodies
//!
//! # Design Decisions
//! - Limits checked before anything is allocated (header size, URL length,
//!   argument counts, body size)
//! - Bytes read past the header boundary stay in the caller's buffer

use tokio::io::{AsyncRead, AsyncReadExt};
use url::form_urlencoded;

use crate::codec::{MAX_COOKIE_NAME_LEN, MAX_COOKIE_VALUE_LEN, MAX_FIELD_LEN};
use crate::config::ServerConfig;
use crate::http::multipart;
use crate::query::{
    http_date, is_valid_key, parse_cookie_header, ArgType, Argument, ByteRange, Cookie, Method,
    Query, QueryError, QueryFlags,
};

/// Longest operation name accepted in a URL.
pub const MAX_OP_LEN: usize = 64;

/// Argument holding a URL remainder that is not form-encoded.
pub const RAW_ARGUMENT_KEY: &str = "_argument";

/// Argument holding an opaque request body.
pub const RAW_BODY_KEY: &str = "_body";

const READ_CHUNK: usize = 4096;

/// Error type for request parsing.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("Bad request: {0}")]
    BadRequest(&'static str),
    #[error("Method not allowed")]
    MethodNotAllowed,
    #[error("Request URI too long")]
    UriTooLong,
    #[error("Request header fields too large")]
    HeaderTooLarge,
    #[error("Payload too large")]
    PayloadTooLarge,
    #[error("Length required")]
    LengthRequired,
    #[error("Requested range not satisfiable")]
    RangeNotSatisfiable,
    #[error("HTTP version not supported")]
    VersionNotSupported,
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::BadRequest(_) | HttpError::Query(_) => 400,
            HttpError::MethodNotAllowed => 405,
            HttpError::LengthRequired => 411,
            HttpError::PayloadTooLarge => 413,
            HttpError::UriTooLong => 414,
            HttpError::RangeNotSatisfiable => 416,
            HttpError::HeaderTooLarge => 431,
            HttpError::VersionNotSupported => 505,
            HttpError::Io(_) => 500,
        }
    }

    /// Whether the connection must be closed after reporting this error.
    ///
    /// Only errors raised once the request has been fully consumed leave
    /// the stream in a usable state.
    pub fn must_close(&self) -> bool {
        !matches!(self, HttpError::RangeNotSatisfiable)
    }
}

/// Operation names are alphanumerics plus `_`, `-` and `.`.
pub fn is_valid_op(op: &str) -> bool {
    !op.is_empty()
        && op.len() <= MAX_OP_LEN
        && op
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'-' | b'.'))
}

pub(crate) fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Read until the end of the header block.
///
/// `buf` holds bytes carried over from earlier reads. On success the header
/// block (terminator included) is returned and `buf` keeps whatever followed
/// it. Returns `Ok(None)` if the peer closed before sending anything.
pub async fn read_head<R>(r: &mut R, buf: &mut Vec<u8>, max: usize) -> Result<Option<Vec<u8>>, HttpError>
where
    R: AsyncRead + Unpin,
{
    let mut scanned = 0;
    loop {
        if let Some(pos) = find(&buf[scanned..], b"\r\n\r\n") {
            let end = scanned + pos + 4;
            let head: Vec<u8> = buf.drain(..end).collect();
            return Ok(Some(head));
        }
        if buf.len() > max {
            return Err(HttpError::HeaderTooLarge);
        }
        scanned = buf.len().saturating_sub(3);

        let mut chunk = [0u8; READ_CHUNK];
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HttpError::BadRequest("incomplete request header"));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Parse a header block into a new `Query`.
pub fn parse_request(head: &[u8], peer_ip: &str, config: &ServerConfig) -> Result<Query, HttpError> {
    let head = std::str::from_utf8(head).map_err(|_| HttpError::BadRequest("header is not UTF-8"))?;
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or(HttpError::BadRequest("empty request"))?;

    let (method_tok, rest) = request_line
        .split_once(' ')
        .ok_or(HttpError::BadRequest("malformed request line"))?;
    let target = match rest.strip_suffix(" HTTP/1.1") {
        Some(target) => target,
        None if rest.contains(" HTTP/") => return Err(HttpError::VersionNotSupported),
        None => return Err(HttpError::BadRequest("malformed request line")),
    };

    let method = Method::from_token(method_tok).ok_or(HttpError::BadRequest("unknown method"))?;
    if !method.is_supported() {
        return Err(HttpError::MethodNotAllowed);
    }
    if target.len() > config.http.max_url_length {
        return Err(HttpError::UriTooLong);
    }

    let mut q = Query::new(method);
    q.date = http_date(chrono::Utc::now());
    q.user_ip = peer_ip.to_string();
    if config.http.keep_alive {
        q.flags.insert(QueryFlags::KEEP_ALIVE);
    }

    parse_target(target, &mut q, &config.http.default_op)?;

    let mut forwarded_host = false;
    for line in lines.filter(|l| !l.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or(HttpError::BadRequest("malformed header line"))?;
        let value = value.trim();

        match name.trim().to_ascii_lowercase().as_str() {
            "connection" => {
                if value.split(',').any(|t| t.trim().eq_ignore_ascii_case("close")) {
                    q.flags.remove(QueryFlags::KEEP_ALIVE);
                }
            }
            "accept-encoding" => {
                if value
                    .split(',')
                    .any(|t| t.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("deflate"))
                {
                    q.flags.insert(QueryFlags::COMPRESSED);
                }
            }
            "x-forwarded-for" => {
                let first = value.split(',').next().unwrap_or("").trim();
                if !first.is_empty() {
                    q.user_ip = bounded_field(first)?;
                }
            }
            "x-forwarded-host" => {
                q.user_host = bounded_field(value)?;
                forwarded_host = true;
            }
            "host" if !forwarded_host => q.user_host = bounded_field(value)?,
            "user-agent" => q.user_agent = bounded_field(value)?,
            "accept-language" => q.langs = parse_accept_language(value, config.limits.max_langs)?,
            "cookie" => {
                for (name, value) in parse_cookie_header(value) {
                    if name.len() > MAX_COOKIE_NAME_LEN || value.len() > MAX_COOKIE_VALUE_LEN {
                        return Err(HttpError::HeaderTooLarge);
                    }
                    if q.cookies().len() >= config.limits.max_cookies {
                        return Err(QueryError::TooManyCookies(config.limits.max_cookies).into());
                    }
                    q.push_cookie(Cookie::new(name, value))?;
                }
            }
            "range" => {
                q.range = Some(parse_range(value)?);
                q.flags.insert(QueryFlags::RANGE);
            }
            "content-type" => {
                if value.len() > crate::codec::MAX_CONTENT_TYPE_LEN {
                    return Err(HttpError::HeaderTooLarge);
                }
                q.content_type = value.to_string();
            }
            "content-length" => {
                q.content_length = value
                    .parse()
                    .map_err(|_| HttpError::BadRequest("invalid Content-Length"))?;
            }
            "transfer-encoding" => return Err(HttpError::LengthRequired),
            _ => {}
        }
    }

    if q.args().len() > config.limits.max_args {
        return Err(QueryError::TooManyArguments(config.limits.max_args).into());
    }
    Ok(q)
}

fn bounded_field(value: &str) -> Result<String, HttpError> {
    if value.len() > MAX_FIELD_LEN {
        return Err(HttpError::HeaderTooLarge);
    }
    Ok(value.to_string())
}

/// Split the request target into the operation and its arguments.
fn parse_target(target: &str, q: &mut Query, default_op: &str) -> Result<(), HttpError> {
    let path = target.strip_prefix('/').unwrap_or(target);
    let (op, remainder) = match path.find(['?', '&', '/']) {
        Some(idx) => (&path[..idx], &path[idx + 1..]),
        None => (path, ""),
    };
    let op = if op.is_empty() { default_op } else { op };
    if !is_valid_op(op) {
        return Err(HttpError::BadRequest("invalid operation name"));
    }
    q.set("op", op)?;

    if remainder.is_empty() {
        return Ok(());
    }
    if remainder.contains('=') {
        push_form_args(q, remainder.as_bytes(), ArgType::Get)?;
    } else {
        q.push_arg(Argument::new(RAW_ARGUMENT_KEY, remainder.as_bytes().to_vec(), ArgType::Get)?)?;
    }
    Ok(())
}

fn push_form_args(q: &mut Query, data: &[u8], kind: ArgType) -> Result<(), QueryError> {
    for (key, value) in form_urlencoded::parse(data) {
        if !is_valid_key(&key) {
            continue;
        }
        q.push_arg(Argument::new(&key, value.into_owned().into_bytes(), kind)?)?;
    }
    Ok(())
}

/// Parse `Accept-Language`, most preferred first.
pub fn parse_accept_language(value: &str, max: usize) -> Result<Vec<String>, HttpError> {
    let mut ranked: Vec<(f32, String)> = Vec::new();
    for item in value.split(',') {
        let mut parts = item.split(';');
        let tag = parts.next().unwrap_or("").trim();
        if tag.is_empty() || tag == "*" {
            continue;
        }
        if tag.len() > crate::codec::MAX_LANG_LEN
            || !tag.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-')
        {
            continue;
        }
        let weight = parts
            .filter_map(|p| p.trim().strip_prefix("q="))
            .next()
            .and_then(|w| w.parse::<f32>().ok())
            .unwrap_or(1.0);
        if weight <= 0.0 {
            continue;
        }
        if ranked.len() >= max {
            return Err(HttpError::BadRequest("too many languages"));
        }
        ranked.push((weight, tag.to_ascii_lowercase()));
    }
    // stable: equal weights keep header order
    ranked.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
    Ok(ranked.into_iter().map(|(_, tag)| tag).collect())
}

/// Parse a single-range `Range` header.
pub fn parse_range(value: &str) -> Result<ByteRange, HttpError> {
    let ranges = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(HttpError::RangeNotSatisfiable)?;
    if ranges.contains(',') {
        return Err(HttpError::RangeNotSatisfiable);
    }
    let (first, last) = ranges.split_once('-').ok_or(HttpError::RangeNotSatisfiable)?;
    let parse = |s: &str| -> Result<Option<u64>, HttpError> {
        let s = s.trim();
        if s.is_empty() {
            Ok(None)
        } else {
            s.parse().map(Some).map_err(|_| HttpError::RangeNotSatisfiable)
        }
    };
    let range = ByteRange {
        first: parse(first)?,
        last: parse(last)?,
    };
    match (range.first, range.last) {
        (None, None) => Err(HttpError::RangeNotSatisfiable),
        (Some(f), Some(l)) if f > l => Err(HttpError::RangeNotSatisfiable),
        _ => Ok(range),
    }
}

/// Read a POST body and decode it into arguments.
///
/// Bytes already in `buf` (read along with the header) are consumed first.
pub async fn read_body<R>(
    r: &mut R,
    buf: &mut Vec<u8>,
    q: &mut Query,
    config: &ServerConfig,
) -> Result<(), HttpError>
where
    R: AsyncRead + Unpin,
{
    if q.method != Method::Post || q.flags.contains(QueryFlags::CONTENT_READ) {
        return Ok(());
    }
    let len = q.content_length;
    if len > config.http.max_body_size as u64 {
        return Err(HttpError::PayloadTooLarge);
    }
    let len = len as usize;

    let from_buf = len.min(buf.len());
    let mut body: Vec<u8> = buf.drain(..from_buf).collect();
    if body.len() < len {
        let start = body.len();
        body.resize(len, 0);
        r.read_exact(&mut body[start..]).await?;
    }

    let content_type = q.content_type.clone();
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or("")
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "application/x-www-form-urlencoded" => push_form_args(q, &body, ArgType::Post)?,
        "multipart/form-data" => {
            for arg in multipart::parse(&body, &content_type, config.limits.max_multipart_parts)? {
                q.push_arg(arg)?;
            }
        }
        _ if body.is_empty() => {}
        _ => {
            let mut arg = Argument::new(RAW_BODY_KEY, body, ArgType::Post)?;
            if !content_type.is_empty() {
                arg.content_type = Some(content_type);
            }
            q.push_arg(arg)?;
        }
    }
    if q.args().len() > config.limits.max_args {
        return Err(QueryError::TooManyArguments(config.limits.max_args).into());
    }
    q.flags.insert(QueryFlags::CONTENT_READ);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(head: &str) -> Result<Query, HttpError> {
        parse_request(head.as_bytes(), "127.0.0.1", &ServerConfig::default())
    }

    #[test]
    fn op_and_query_string() {
        let q = parse("GET /counter?n=5&name=a%20b HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
        assert_eq!(q.op(), Some("counter"));
        assert_eq!(q.get_int("n"), Ok(5));
        assert_eq!(q.get("name").unwrap(), "a b");
        assert_eq!(q.user_host, "x");
        assert!(q.keep_alive());
    }

    #[test]
    fn root_uses_default_op() {
        let q = parse("GET / HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(q.op(), Some("index"));
    }

    #[test]
    fn path_remainder_stored_verbatim() {
        let q = parse("GET /file/some/path.txt HTTP/1.1\r\n\r\n").unwrap();
        assert_eq!(q.op(), Some("file"));
        assert_eq!(q.get(RAW_ARGUMENT_KEY).unwrap(), "some/path.txt");
    }

    #[test]
    fn invalid_op_rejected() {
        assert!(matches!(
            parse("GET /a%2fb HTTP/1.1\r\n\r\n"),
            Err(HttpError::BadRequest(_))
        ));
    }

    #[test]
    fn requires_http_11() {
        assert!(matches!(
            parse("GET / HTTP/1.0\r\n\r\n"),
            Err(HttpError::VersionNotSupported)
        ));
        assert!(matches!(parse("GET /\r\n\r\n"), Err(HttpError::BadRequest(_))));
    }

    #[test]
    fn unsupported_methods() {
        for m in ["PUT", "DELETE", "TRACE", "CONNECT"] {
            let err = parse(&format!("{} / HTTP/1.1\r\n\r\n", m)).unwrap_err();
            assert_eq!(err.status(), 405);
        }
        assert_eq!(parse("BREW / HTTP/1.1\r\n\r\n").unwrap_err().status(), 400);
    }

    #[test]
    fn headers_decoded() {
        let q = parse(
            "POST /login HTTP/1.1\r\n\
             Connection: close\r\n\
             Accept-Encoding: gzip, deflate\r\n\
             X-Forwarded-For: 10.1.1.1, 10.2.2.2\r\n\
             X-Forwarded-Host: public.example\r\n\
             Host: internal\r\n\
             User-Agent: curl/8\r\n\
             Accept-Language: de;q=0.5, fr, en;q=0.8\r\n\
             Cookie: sess=123; theme=dark\r\n\
             Content-Type: application/x-www-form-urlencoded\r\n\
             Content-Length: 10\r\n\r\n",
        )
        .unwrap();
        assert!(!q.keep_alive());
        assert!(q.flags.contains(QueryFlags::COMPRESSED));
        assert_eq!(q.user_ip, "10.1.1.1");
        assert_eq!(q.user_host, "public.example");
        assert_eq!(q.user_agent, "curl/8");
        assert_eq!(q.langs, vec!["fr", "en", "de"]);
        assert_eq!(q.get_cookie("sess").unwrap().value, "123");
        assert_eq!(q.content_length, 10);
    }

    #[test]
    fn multi_range_rejected() {
        let err = parse("GET / HTTP/1.1\r\nRange: bytes=0-1,5-6\r\n\r\n").unwrap_err();
        assert_eq!(err.status(), 416);
        let q = parse("GET / HTTP/1.1\r\nRange: bytes=5-\r\n\r\n").unwrap();
        assert_eq!(
            q.range,
            Some(ByteRange {
                first: Some(5),
                last: None
            })
        );
    }

    #[test]
    fn oversize_cookies_rejected() {
        let long_value = format!(
            "GET / HTTP/1.1\r\nCookie: sess=1; big={}\r\n\r\n",
            "a".repeat(MAX_COOKIE_VALUE_LEN + 1)
        );
        assert_eq!(parse(&long_value).unwrap_err().status(), 431);

        let long_name = format!(
            "GET / HTTP/1.1\r\nCookie: {}=1\r\n\r\n",
            "n".repeat(MAX_COOKIE_NAME_LEN + 1)
        );
        assert_eq!(parse(&long_name).unwrap_err().status(), 431);

        let at_limit = format!(
            "GET / HTTP/1.1\r\nCookie: big={}\r\n\r\n",
            "a".repeat(MAX_COOKIE_VALUE_LEN)
        );
        assert!(parse(&at_limit).is_ok());
    }

    #[test]
    fn url_length_limit() {
        let long = format!("GET /{} HTTP/1.1\r\n\r\n", "a".repeat(5000));
        assert!(matches!(parse(&long), Err(HttpError::UriTooLong)));
    }

    #[tokio::test]
    async fn leftover_body_bytes_preserved() {
        let raw = b"POST /login HTTP/1.1\r\nContent-Length: 26\r\n\
Content-Type: application/x-www-form-urlencoded\r\n\r\nusername=alice&password=pw";
        // everything arrives in one read
        let mut r: &[u8] = raw;
        let mut buf = Vec::new();
        let head = read_head(&mut r, &mut buf, 16 * 1024).await.unwrap().unwrap();
        assert!(head.ends_with(b"\r\n\r\n"));
        assert_eq!(buf, b"username=alice&password=pw");

        let config = ServerConfig::default();
        let mut q = parse_request(&head, "::1", &config).unwrap();
        read_body(&mut r, &mut buf, &mut q, &config).await.unwrap();
        assert_eq!(q.get("username").unwrap(), "alice");
        assert_eq!(q.get("password").unwrap(), "pw");
        assert!(buf.is_empty());
    }

    #[tokio::test]
    async fn body_split_across_reads() {
        let head = b"POST /x HTTP/1.1\r\nContent-Length: 11\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n";
        let mut buf = b"a=1&".to_vec();
        let mut rest: &[u8] = b"b=22222NEXT";
        let config = ServerConfig::default();
        let mut q = parse_request(head, "::1", &config).unwrap();
        read_body(&mut rest, &mut buf, &mut q, &config).await.unwrap();
        assert_eq!(q.get("a").unwrap(), "1");
        assert_eq!(q.get("b").unwrap(), "22222");
        assert_eq!(rest, b"NEXT");
    }

    #[tokio::test]
    async fn oversize_header_rejected() {
        let data = vec![b'a'; 2048];
        let mut r: &[u8] = &data;
        let mut buf = Vec::new();
        assert!(matches!(
            read_head(&mut r, &mut buf, 1024).await,
            Err(HttpError::HeaderTooLarge)
        ));
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let mut r: &[u8] = b"";
        let mut buf = Vec::new();
        assert!(read_head(&mut r, &mut buf, 1024).await.unwrap().is_none());
    }
}
