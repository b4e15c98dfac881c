//! `multipart/form-data` decoding.

use super::request::{find, HttpError};
use crate::codec::MAX_CONTENT_TYPE_LEN;
use crate::query::{is_valid_key, ArgType, Argument};

/// Parse a multipart body into POST arguments.
///
/// Each part becomes one argument named after its `name` disposition
/// parameter. File parts keep their content type; the client-supplied
/// file name is stored as `<name>_filename`.
pub fn parse(body: &[u8], content_type: &str, max_parts: usize) -> Result<Vec<Argument>, HttpError> {
    let boundary = boundary(content_type).ok_or(HttpError::BadRequest("missing multipart boundary"))?;
    let delimiter = format!("--{}", boundary).into_bytes();
    let mut next_delim = Vec::with_capacity(delimiter.len() + 2);
    next_delim.extend_from_slice(b"\r\n");
    next_delim.extend_from_slice(&delimiter);

    let start = find(body, &delimiter).ok_or(HttpError::BadRequest("multipart boundary not found"))?;
    let mut rest = &body[start + delimiter.len()..];
    let mut args = Vec::new();
    let mut parts = 0usize;

    loop {
        if rest.starts_with(b"--") {
            return Ok(args);
        }
        rest = rest
            .strip_prefix(b"\r\n")
            .ok_or(HttpError::BadRequest("malformed multipart delimiter"))?;

        parts += 1;
        if parts > max_parts {
            return Err(HttpError::PayloadTooLarge);
        }

        let header_end = find(rest, b"\r\n\r\n").ok_or(HttpError::BadRequest("malformed multipart headers"))?;
        let headers = std::str::from_utf8(&rest[..header_end])
            .map_err(|_| HttpError::BadRequest("multipart headers are not UTF-8"))?;
        let data_start = header_end + 4;
        let data_len = find(&rest[data_start..], &next_delim)
            .ok_or(HttpError::BadRequest("unterminated multipart part"))?;
        let data = &rest[data_start..data_start + data_len];
        rest = &rest[data_start + data_len + next_delim.len()..];

        let part = PartHeaders::parse(headers);
        let Some(name) = part.name.filter(|n| is_valid_key(n)) else {
            continue;
        };

        let mut arg = Argument::new(&name, data.to_vec(), ArgType::Post)?;
        if let Some(ct) = part.content_type {
            if ct.len() > MAX_CONTENT_TYPE_LEN {
                return Err(HttpError::BadRequest("multipart content type too long"));
            }
            arg = arg.with_content_type(ct);
        }
        args.push(arg);

        if let Some(filename) = part.filename {
            let key = format!("{}_filename", name);
            if is_valid_key(&key) {
                args.push(Argument::new(&key, filename.into_bytes(), ArgType::Post)?);
            }
        }
    }
}

fn boundary(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .skip(1)
        .filter_map(|p| p.trim().strip_prefix("boundary="))
        .map(|b| b.trim_matches('"'))
        .find(|b| !b.is_empty() && b.len() <= 70)
}

#[derive(Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

impl PartHeaders {
    fn parse(block: &str) -> Self {
        let mut out = PartHeaders::default();
        for line in block.split("\r\n") {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            if name.trim().eq_ignore_ascii_case("content-disposition") {
                for param in value.split(';').skip(1) {
                    let Some((k, v)) = param.trim().split_once('=') else {
                        continue;
                    };
                    let v = v.trim().trim_matches('"').to_string();
                    match k.trim() {
                        "name" => out.name = Some(v),
                        "filename" => out.filename = Some(v),
                        _ => {}
                    }
                }
            } else if name.trim().eq_ignore_ascii_case("content-type") {
                out.content_type = Some(value.to_string());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CT: &str = "multipart/form-data; boundary=XyZ";

    fn body() -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(b"--XyZ\r\nContent-Disposition: form-data; name=\"title\"\r\n\r\nhello\r\n");
        b.extend_from_slice(
            b"--XyZ\r\nContent-Disposition: form-data; name=\"file\"; filename=\"a.bin\"\r\n\
Content-Type: application/octet-stream\r\n\r\n",
        );
        b.extend_from_slice(&[0, 1, 2, b'\r', b'\n', 3]);
        b.extend_from_slice(b"\r\n--XyZ--\r\n");
        b
    }

    #[test]
    fn parses_fields_and_files() {
        let args = parse(&body(), CT, 8).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].key, "title");
        assert_eq!(args[0].value, b"hello");
        assert_eq!(args[1].key, "file");
        assert_eq!(args[1].value, vec![0, 1, 2, b'\r', b'\n', 3]);
        assert_eq!(args[1].content_type.as_deref(), Some("application/octet-stream"));
        assert_eq!(args[2].key, "file_filename");
        assert_eq!(args[2].value, b"a.bin");
    }

    #[test]
    fn part_limit() {
        assert!(matches!(parse(&body(), CT, 1), Err(HttpError::PayloadTooLarge)));
    }

    #[test]
    fn missing_boundary() {
        assert!(matches!(
            parse(&body(), "multipart/form-data", 8),
            Err(HttpError::BadRequest(_))
        ));
    }

    #[test]
    fn oversize_part_content_type() {
        let b = format!(
            "--XyZ\r\nContent-Disposition: form-data; name=\"f\"\r\nContent-Type: {}\r\n\r\nx\r\n--XyZ--\r\n",
            "t".repeat(MAX_CONTENT_TYPE_LEN + 1)
        );
        let err = parse(b.as_bytes(), CT, 8).unwrap_err();
        assert_eq!(err.status(), 400);
    }

    #[test]
    fn unterminated_part() {
        let b = b"--XyZ\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end";
        assert!(parse(b, CT, 8).is_err());
    }
}
