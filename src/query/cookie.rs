use chrono::{DateTime, Utc};

/// `Expires` value instructing the browser to drop a cookie.
pub const EXPIRED_DATE: &str = "Thu, 01 Jan 1970 00:00:00 GMT";

/// Cookie attribute flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CookieFlags(u8);

impl CookieFlags {
    pub const SECURE: CookieFlags = CookieFlags(0x01);
    pub const HTTP_ONLY: CookieFlags = CookieFlags(0x02);
    /// Set (or modified) by the server; emitted as `Set-Cookie`.
    pub const SET: CookieFlags = CookieFlags(0x04);

    pub const fn empty() -> Self {
        CookieFlags(0)
    }

    pub const fn bits(&self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        CookieFlags(bits & 0x07)
    }

    pub fn contains(&self, other: CookieFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: CookieFlags) {
        self.0 |= other.0;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    pub expires: Option<String>,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub flags: CookieFlags,
}

impl Cookie {
    pub fn new(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            value: value.to_string(),
            expires: None,
            domain: None,
            path: None,
            flags: CookieFlags::empty(),
        }
    }

    pub fn set_expires_at(&mut self, at: DateTime<Utc>) {
        self.expires = Some(http_date(at));
    }

    /// Render as the value of a `Set-Cookie` header.
    pub fn to_header_value(&self) -> String {
        let mut out = format!("{}={}", self.name, self.value);
        if let Some(expires) = &self.expires {
            out.push_str("; Expires=");
            out.push_str(expires);
        }
        if let Some(domain) = &self.domain {
            out.push_str("; Domain=");
            out.push_str(domain);
        }
        if let Some(path) = &self.path {
            out.push_str("; Path=");
            out.push_str(path);
        }
        if self.flags.contains(CookieFlags::SECURE) {
            out.push_str("; Secure");
        }
        if self.flags.contains(CookieFlags::HTTP_ONLY) {
            out.push_str("; HttpOnly");
        }
        out
    }
}

/// Format a timestamp as an IMF-fixdate.
pub fn http_date(at: DateTime<Utc>) -> String {
    at.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Parse a `Cookie` request header into name/value pairs.
pub fn parse_cookie_header(value: &str) -> impl Iterator<Item = (&str, &str)> {
    value.split(';').filter_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        Some((name, value.trim().trim_matches('"')))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn header_value_with_attributes() {
        let mut c = Cookie::new("sess", "42");
        c.domain = Some("example.com".into());
        c.path = Some("/".into());
        c.flags.insert(CookieFlags::SECURE);
        c.set_expires_at(Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).unwrap());
        assert_eq!(
            c.to_header_value(),
            "sess=42; Expires=Wed, 02 Jan 2030 03:04:05 GMT; Domain=example.com; Path=/; Secure"
        );
    }

    #[test]
    fn epoch_matches_expired_constant() {
        assert_eq!(http_date(Utc.timestamp_opt(0, 0).unwrap()), EXPIRED_DATE);
    }

    #[test]
    fn parses_request_header() {
        let pairs: Vec<_> = parse_cookie_header("a=1; sess=\"99\";;bad; c=").collect();
        assert_eq!(pairs, vec![("a", "1"), ("sess", "99"), ("c", "")]);
    }
}
