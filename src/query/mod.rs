//! In-memory representation of one HTTP request/response exchange.
//!
//! # Data Flow
//! ```text
//! Frontend: raw HTTP → http::request (parse) → Query
//!     → codec (serialize) → Worker socket
//! Worker:   codec (deserialize) → Query → module command
//!     → response buffer → http::response (render) → Frontend relay
//! ```
//!
//! # Design Decisions
//! - Arguments and cookies keep insertion order; keys are not unique and
//!   lookups return the first match
//! - Argument values are byte buffers; text accessors validate UTF-8
//! - Every accessor reports failure through `QueryError`, never by
//!   truncating or clamping

mod argument;
mod cookie;

use std::fmt;

pub use argument::{is_valid_key, ArgType, Argument};
pub use cookie::{http_date, parse_cookie_header, Cookie, CookieFlags, EXPIRED_DATE};

/// Maximum number of arguments in one query.
pub const MAX_ARGS: usize = 1024;
/// Maximum number of cookies in one query.
pub const MAX_COOKIES: usize = 64;
/// Maximum number of accepted languages.
pub const MAX_LANGS: usize = 32;
/// Maximum length of an argument key.
pub const MAX_KEY_LEN: usize = 128;
/// Default bound applied by [`Query::get`].
pub const DEFAULT_VALUE_MAX: usize = 4096;

/// Errors raised by argument and cookie accessors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum QueryError {
    #[error("Missing argument: {0}")]
    Missing(String),
    #[error("Argument {key} exceeds {max} bytes")]
    TooLong { key: String, max: usize },
    #[error("Argument {0} is not valid text")]
    NotText(String),
    #[error("Invalid number for {key}: {value:?}")]
    InvalidNumber { key: String, value: String },
    #[error("Argument {0} is out of range")]
    OutOfRange(String),
    #[error("Argument {key} must be >= {min}")]
    BelowMinimum { key: String, min: String },
    #[error("Argument {key} must be <= {max}")]
    AboveMaximum { key: String, max: String },
    #[error("Invalid argument key {0:?}")]
    InvalidKey(String),
    #[error("No such argument: {0}")]
    NotFound(String),
    #[error("Too many arguments (max {0})")]
    TooManyArguments(usize),
    #[error("Too many cookies (max {0})")]
    TooManyCookies(usize),
    #[error("Response already flushed")]
    AlreadyFlushed,
}

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Method {
    Get = 0,
    Head = 1,
    Post = 2,
    Options = 3,
    Put = 4,
    Delete = 5,
    Trace = 6,
    Connect = 7,
}

impl Method {
    /// Methods with a full implementation.
    pub const ALLOWED: &'static str = "GET, HEAD, POST, OPTIONS";

    pub fn from_token(token: &str) -> Option<Self> {
        Some(match token {
            "GET" => Method::Get,
            "HEAD" => Method::Head,
            "POST" => Method::Post,
            "OPTIONS" => Method::Options,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => return None,
        })
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Method::Get,
            1 => Method::Head,
            2 => Method::Post,
            3 => Method::Options,
            4 => Method::Put,
            5 => Method::Delete,
            6 => Method::Trace,
            7 => Method::Connect,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
            Method::Options => "OPTIONS",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }

    /// True for the methods this server implements.
    pub fn is_supported(&self) -> bool {
        matches!(self, Method::Get | Method::Head | Method::Post | Method::Options)
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-request flags carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueryFlags(u8);

impl QueryFlags {
    pub const KEEP_ALIVE: QueryFlags = QueryFlags(0x01);
    /// Client accepts deflate.
    pub const COMPRESSED: QueryFlags = QueryFlags(0x02);
    pub const RANGE: QueryFlags = QueryFlags(0x04);
    /// The request body has been consumed into arguments.
    pub const CONTENT_READ: QueryFlags = QueryFlags(0x08);

    pub const fn empty() -> Self {
        QueryFlags(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        QueryFlags(bits & 0x0f)
    }

    pub fn contains(&self, other: QueryFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: QueryFlags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: QueryFlags) {
        self.0 &= !other.0;
    }
}

/// A single `bytes=first-last` range requested by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub first: Option<u64>,
    pub last: Option<u64>,
}

impl ByteRange {
    /// Resolve against a body length into an inclusive `(start, end)`.
    pub fn resolve(&self, len: u64) -> Option<(u64, u64)> {
        if len == 0 {
            return None;
        }
        match (self.first, self.last) {
            (Some(first), Some(last)) if first <= last && first < len => {
                Some((first, last.min(len - 1)))
            }
            (Some(first), None) if first < len => Some((first, len - 1)),
            (None, Some(suffix)) if suffix > 0 => Some((len.saturating_sub(suffix), len - 1)),
            _ => None,
        }
    }
}

/// One HTTP request/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub method: Method,
    pub flags: QueryFlags,
    args: Vec<Argument>,
    cookies: Vec<Cookie>,
    pub date: String,
    pub user_ip: String,
    pub user_host: String,
    pub user_agent: String,
    /// Accepted languages, most preferred first.
    pub langs: Vec<String>,
    /// Request `Content-Type`.
    pub content_type: String,
    /// Request `Content-Length`.
    pub content_length: u64,
    pub range: Option<ByteRange>,

    status: u16,
    resp_content_type: String,
    resp_headers: Vec<(String, String)>,
    body: Vec<u8>,
    flushed: bool,
}

impl Query {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            flags: QueryFlags::empty(),
            args: Vec::new(),
            cookies: Vec::new(),
            date: String::new(),
            user_ip: String::new(),
            user_host: String::new(),
            user_agent: String::new(),
            langs: Vec::new(),
            content_type: String::new(),
            content_length: 0,
            range: None,
            status: 200,
            resp_content_type: "text/html; charset=utf-8".to_string(),
            resp_headers: Vec::new(),
            body: Vec::new(),
            flushed: false,
        }
    }

    /// Preferred language, `en` when the client sent none.
    pub fn lang(&self) -> &str {
        self.langs.first().map(String::as_str).unwrap_or("en")
    }

    /// The operation this query was routed to.
    pub fn op(&self) -> Option<&str> {
        self.get_bounded("op", MAX_KEY_LEN).ok()
    }

    // --- Arguments ---

    pub fn args(&self) -> &[Argument] {
        &self.args
    }

    pub fn find_arg(&self, key: &str) -> Option<&Argument> {
        self.args.iter().find(|a| a.key == key)
    }

    /// Raw bytes of the first argument named `key`.
    pub fn get_bytes(&self, key: &str) -> Option<&[u8]> {
        self.find_arg(key).map(|a| a.value.as_slice())
    }

    /// Text value of `key`, bounded by [`DEFAULT_VALUE_MAX`].
    pub fn get(&self, key: &str) -> Result<&str, QueryError> {
        self.get_bounded(key, DEFAULT_VALUE_MAX)
    }

    /// Text value of `key`; fails if it is longer than `max` bytes.
    pub fn get_bounded(&self, key: &str, max: usize) -> Result<&str, QueryError> {
        let arg = self
            .find_arg(key)
            .ok_or_else(|| QueryError::Missing(key.to_string()))?;
        if arg.value.len() > max {
            return Err(QueryError::TooLong {
                key: key.to_string(),
                max,
            });
        }
        std::str::from_utf8(&arg.value).map_err(|_| QueryError::NotText(key.to_string()))
    }

    pub fn get_int(&self, key: &str) -> Result<i32, QueryError> {
        self.parse_int(key)
    }

    pub fn get_uint(&self, key: &str) -> Result<u32, QueryError> {
        self.parse_int(key)
    }

    pub fn get_long(&self, key: &str) -> Result<i64, QueryError> {
        self.parse_int(key)
    }

    pub fn get_float(&self, key: &str) -> Result<f32, QueryError> {
        let value = self.get_bounded(key, 64)?;
        let v: f32 = value.parse().map_err(|_| invalid_number(key, value))?;
        if !v.is_finite() {
            return Err(QueryError::OutOfRange(key.to_string()));
        }
        Ok(v)
    }

    pub fn get_double(&self, key: &str) -> Result<f64, QueryError> {
        let value = self.get_bounded(key, 64)?;
        let v: f64 = value.parse().map_err(|_| invalid_number(key, value))?;
        if !v.is_finite() {
            return Err(QueryError::OutOfRange(key.to_string()));
        }
        Ok(v)
    }

    /// Parse an enumeration index in `0..=last`.
    pub fn get_enum(&self, key: &str, last: u32) -> Result<u32, QueryError> {
        let v = self.get_uint(key)?;
        if v > last {
            return Err(QueryError::AboveMaximum {
                key: key.to_string(),
                max: last.to_string(),
            });
        }
        Ok(v)
    }

    pub fn get_int_range(&self, key: &str, min: i32, max: i32) -> Result<i32, QueryError> {
        let v = self.get_int(key)?;
        if v < min {
            return Err(QueryError::BelowMinimum {
                key: key.to_string(),
                min: min.to_string(),
            });
        }
        if v > max {
            return Err(QueryError::AboveMaximum {
                key: key.to_string(),
                max: max.to_string(),
            });
        }
        Ok(v)
    }

    fn parse_int<T>(&self, key: &str) -> Result<T, QueryError>
    where
        T: std::str::FromStr<Err = std::num::ParseIntError>,
    {
        use std::num::IntErrorKind;

        let value = self.get_bounded(key, 64)?;
        value.parse::<T>().map_err(|e| match e.kind() {
            IntErrorKind::PosOverflow | IntErrorKind::NegOverflow => {
                QueryError::OutOfRange(key.to_string())
            }
            _ => invalid_number(key, value),
        })
    }

    /// Set `key` to a text value, replacing the first existing match.
    pub fn set(&mut self, key: &str, value: impl Into<String>) -> Result<(), QueryError> {
        self.set_bytes(key, value.into().into_bytes())
    }

    /// Set `key` to a binary value, replacing the first existing match.
    pub fn set_bytes(&mut self, key: &str, value: Vec<u8>) -> Result<(), QueryError> {
        if let Some(arg) = self.args.iter_mut().find(|a| a.key == key) {
            arg.value = value;
            return Ok(());
        }
        self.push_arg(Argument::new(key, value, ArgType::Get)?)
    }

    /// Append an argument without replacing duplicates.
    pub fn push_arg(&mut self, arg: Argument) -> Result<(), QueryError> {
        if self.args.len() >= MAX_ARGS {
            return Err(QueryError::TooManyArguments(MAX_ARGS));
        }
        self.args.push(arg);
        Ok(())
    }

    /// Remove the first argument named `key`.
    pub fn unset(&mut self, key: &str) -> Result<(), QueryError> {
        let idx = self
            .args
            .iter()
            .position(|a| a.key == key)
            .ok_or_else(|| QueryError::NotFound(key.to_string()))?;
        self.args.remove(idx);
        Ok(())
    }

    // --- Cookies ---

    pub fn cookies(&self) -> &[Cookie] {
        &self.cookies
    }

    pub fn get_cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.iter().find(|c| c.name == name)
    }

    /// Append a cookie received from the client.
    pub fn push_cookie(&mut self, cookie: Cookie) -> Result<(), QueryError> {
        if self.cookies.len() >= MAX_COOKIES {
            return Err(QueryError::TooManyCookies(MAX_COOKIES));
        }
        self.cookies.push(cookie);
        Ok(())
    }

    /// Find-or-create a cookie to be sent to the client.
    pub fn set_cookie(&mut self, name: &str, value: &str) -> Result<&mut Cookie, QueryError> {
        let idx = match self.cookies.iter().position(|c| c.name == name) {
            Some(idx) => idx,
            None => {
                self.push_cookie(Cookie::new(name, ""))?;
                self.cookies.len() - 1
            }
        };
        let cookie = &mut self.cookies[idx];
        cookie.value = value.to_string();
        cookie.flags.insert(CookieFlags::SET);
        Ok(cookie)
    }

    /// Instruct the client to discard a cookie.
    ///
    /// The entry stays in the list with an already-expired date so that
    /// header generation emits the clearing `Set-Cookie`.
    pub fn del_cookie(&mut self, name: &str) -> Result<&mut Cookie, QueryError> {
        let cookie = self.set_cookie(name, "")?;
        cookie.expires = Some(EXPIRED_DATE.to_string());
        Ok(cookie)
    }

    /// `Set-Cookie` header values for every cookie set by the server.
    pub fn set_cookie_headers(&self) -> Vec<String> {
        self.cookies
            .iter()
            .filter(|c| c.flags.contains(CookieFlags::SET))
            .map(Cookie::to_header_value)
            .collect()
    }

    // --- Response ---

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn response_content_type(&self) -> &str {
        &self.resp_content_type
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.resp_content_type = content_type.into();
    }

    pub fn response_headers(&self) -> &[(String, String)] {
        &self.resp_headers
    }

    /// Set a response header, replacing any previous value.
    pub fn set_header(&mut self, name: &str, value: impl Into<String>) {
        let value = value.into();
        match self
            .resp_headers
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(entry) => entry.1 = value,
            None => self.resp_headers.push((name.to_string(), value)),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.resp_headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn clear_body(&mut self) {
        self.body.clear();
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Take the response body for transmission. Succeeds once per query.
    pub fn take_response(&mut self) -> Result<Vec<u8>, QueryError> {
        if self.flushed {
            return Err(QueryError::AlreadyFlushed);
        }
        self.flushed = true;
        Ok(std::mem::take(&mut self.body))
    }

    /// Whether the client asked for JSON-formatted output.
    pub fn wants_json(&self) -> bool {
        matches!(self.get_bounded("format", 8), Ok("json"))
    }

    /// Whether the connection should persist after this exchange.
    pub fn keep_alive(&self) -> bool {
        self.flags.contains(QueryFlags::KEEP_ALIVE)
    }
}

impl fmt::Write for Query {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.body.extend_from_slice(s.as_bytes());
        Ok(())
    }
}

fn invalid_number(key: &str, value: &str) -> QueryError {
    QueryError::InvalidNumber {
        key: key.to_string(),
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write;

    fn query_with(key: &str, value: &str) -> Query {
        let mut q = Query::new(Method::Get);
        q.set(key, value).unwrap();
        q
    }

    #[test]
    fn set_then_get() {
        let mut q = Query::new(Method::Get);
        q.set("name", "alice").unwrap();
        q.set("lang", "fr").unwrap();
        assert_eq!(q.get("name").unwrap(), "alice");
        assert_eq!(q.get("lang").unwrap(), "fr");

        q.set("name", "bob").unwrap();
        assert_eq!(q.get("name").unwrap(), "bob");
        assert_eq!(q.args().len(), 2);
    }

    #[test]
    fn get_fails_rather_than_truncating() {
        let q = query_with("k", "0123456789");
        assert_eq!(q.get_bounded("k", 10).unwrap(), "0123456789");
        assert_eq!(
            q.get_bounded("k", 9),
            Err(QueryError::TooLong {
                key: "k".into(),
                max: 9
            })
        );
    }

    #[test]
    fn missing_argument() {
        let q = Query::new(Method::Get);
        assert_eq!(q.get("nope"), Err(QueryError::Missing("nope".into())));
    }

    #[test]
    fn binary_values_survive() {
        let mut q = Query::new(Method::Post);
        q.set_bytes("blob", vec![0, 159, 0, 1]).unwrap();
        assert_eq!(q.get_bytes("blob"), Some(&[0u8, 159, 0, 1][..]));
        assert_eq!(q.get("blob"), Err(QueryError::NotText("blob".into())));
    }

    #[test]
    fn duplicate_keys_first_match_wins() {
        let mut q = Query::new(Method::Get);
        q.push_arg(Argument::new("x", b"1".to_vec(), ArgType::Get).unwrap())
            .unwrap();
        q.push_arg(Argument::new("x", b"2".to_vec(), ArgType::Post).unwrap())
            .unwrap();
        assert_eq!(q.get("x").unwrap(), "1");

        q.unset("x").unwrap();
        assert_eq!(q.get("x").unwrap(), "2");
        q.unset("x").unwrap();
        assert_eq!(q.unset("x"), Err(QueryError::NotFound("x".into())));
    }

    #[test]
    fn int_parse_is_strict() {
        assert_eq!(query_with("n", "42").get_int("n"), Ok(42));
        assert_eq!(query_with("n", "-7").get_int("n"), Ok(-7));
        assert!(matches!(
            query_with("n", "42abc").get_int("n"),
            Err(QueryError::InvalidNumber { .. })
        ));
        assert!(matches!(
            query_with("n", "").get_int("n"),
            Err(QueryError::InvalidNumber { .. })
        ));
        assert_eq!(
            query_with("n", "999999999999999999999").get_int("n"),
            Err(QueryError::OutOfRange("n".into()))
        );
    }

    #[test]
    fn uint_rejects_negative() {
        assert!(query_with("n", "-1").get_uint("n").is_err());
        assert_eq!(query_with("n", "4294967295").get_uint("n"), Ok(u32::MAX));
        assert_eq!(
            query_with("n", "4294967296").get_uint("n"),
            Err(QueryError::OutOfRange("n".into()))
        );
    }

    #[test]
    fn float_parse() {
        assert_eq!(query_with("f", "1.5").get_double("f"), Ok(1.5));
        assert!(query_with("f", "1.5x").get_double("f").is_err());
        assert_eq!(
            query_with("f", "1e999").get_double("f"),
            Err(QueryError::OutOfRange("f".into()))
        );
        assert_eq!(
            query_with("f", "1e39").get_float("f"),
            Err(QueryError::OutOfRange("f".into()))
        );
    }

    #[test]
    fn ranges_and_enums() {
        let q = query_with("n", "5");
        assert_eq!(q.get_int_range("n", 0, 10), Ok(5));
        assert!(matches!(
            q.get_int_range("n", 6, 10),
            Err(QueryError::BelowMinimum { .. })
        ));
        assert!(matches!(
            q.get_int_range("n", 0, 4),
            Err(QueryError::AboveMaximum { .. })
        ));
        assert_eq!(q.get_enum("n", 5), Ok(5));
        assert!(q.get_enum("n", 4).is_err());
    }

    #[test]
    fn set_cookie_is_find_or_create() {
        let mut q = Query::new(Method::Get);
        q.push_cookie(Cookie::new("sess", "123")).unwrap();
        q.set_cookie("sess", "456").unwrap().path = Some("/".into());
        assert_eq!(q.cookies().len(), 1);
        assert_eq!(q.get_cookie("sess").unwrap().value, "456");
        assert_eq!(q.set_cookie_headers(), vec!["sess=456; Path=/".to_string()]);
    }

    #[test]
    fn client_cookies_are_not_echoed() {
        let mut q = Query::new(Method::Get);
        q.push_cookie(Cookie::new("theme", "dark")).unwrap();
        assert!(q.set_cookie_headers().is_empty());
    }

    #[test]
    fn del_cookie_expires_in_the_past() {
        let mut q = Query::new(Method::Get);
        q.push_cookie(Cookie::new("sess", "123")).unwrap();
        q.del_cookie("sess").unwrap();

        assert_eq!(q.cookies().len(), 1);
        let headers = q.set_cookie_headers();
        assert_eq!(headers.len(), 1);
        assert!(headers[0].starts_with("sess=;"));
        assert!(headers[0].contains("Expires=Thu, 01 Jan 1970 00:00:00 GMT"));
    }

    #[test]
    fn response_taken_once() {
        let mut q = Query::new(Method::Get);
        write!(q, "hello {}", 1).unwrap();
        assert_eq!(q.take_response().unwrap(), b"hello 1");
        assert_eq!(q.take_response(), Err(QueryError::AlreadyFlushed));
    }

    #[test]
    fn byte_range_resolution() {
        let r = ByteRange {
            first: Some(2),
            last: Some(100),
        };
        assert_eq!(r.resolve(10), Some((2, 9)));
        let suffix = ByteRange {
            first: None,
            last: Some(3),
        };
        assert_eq!(suffix.resolve(10), Some((7, 9)));
        let past = ByteRange {
            first: Some(10),
            last: None,
        };
        assert_eq!(past.resolve(10), None);
    }
}
