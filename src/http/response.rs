//! Response rendering.
//!
//! # Responsibilities
//! - Serialize a finished `Query` into status line, headers and body
//! - Apply deflate, single-range (206) and HEAD semantics
//! - Choose framing: `Content-Length` or chunked above a threshold
//! - Render error pages as HTML or JSON
//!
//! # Design Decisions
//! - Compression is only applied when it actually shrinks the body
//! - A range is never combined with compression

use std::io::Write;

use flate2::write::ZlibEncoder;
use flate2::Compression;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use crate::config::ServerConfig;
use crate::query::{Method, Query, QueryError, QueryFlags};

/// Rendering settings shared by the Frontend and Workers.
#[derive(Debug, Clone)]
pub struct ResponseOptions {
    pub server_name: String,
    pub compression_threshold: usize,
    /// Bodies larger than this are sent chunked.
    pub chunk_threshold: Option<usize>,
    pub keep_alive: bool,
}

impl ResponseOptions {
    /// Responses produced in the Frontend are always length-delimited.
    pub fn frontend(config: &ServerConfig) -> Self {
        Self {
            server_name: config.http.server_name.clone(),
            compression_threshold: config.http.compression_threshold,
            chunk_threshold: None,
            keep_alive: config.http.keep_alive,
        }
    }

    pub fn worker(config: &ServerConfig) -> Self {
        Self {
            chunk_threshold: Some(config.worker.chunk_threshold),
            ..Self::frontend(config)
        }
    }
}

pub fn status_text(code: u16) -> &'static str {
    match code {
        200 => "OK",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        416 => "Range Not Satisfiable",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn deflate(body: &[u8]) -> Option<Vec<u8>> {
    let mut enc = ZlibEncoder::new(Vec::with_capacity(body.len() / 2), Compression::default());
    enc.write_all(body).ok()?;
    enc.finish().ok()
}

/// Whether the connection persists after this response.
pub fn response_keep_alive(q: &Query, opts: &ResponseOptions) -> bool {
    opts.keep_alive
        && q.keep_alive()
        && !q
            .header("Connection")
            .is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

/// Render the complete response for `q`. Consumes the response body.
pub fn render_response(q: &mut Query, opts: &ResponseOptions) -> Result<Vec<u8>, QueryError> {
    let mut body = q.take_response()?;
    let mut status = q.status();
    let mut extra: Vec<(&str, String)> = Vec::new();

    if status == 200 {
        if let Some(range) = q.range.filter(|_| q.flags.contains(QueryFlags::RANGE)) {
            let len = body.len() as u64;
            match range.resolve(len) {
                Some((start, end)) => {
                    status = 206;
                    body = body[start as usize..=end as usize].to_vec();
                    extra.push(("Content-Range", format!("bytes {}-{}/{}", start, end, len)));
                }
                None => {
                    status = 416;
                    body.clear();
                    extra.push(("Content-Range", format!("bytes */{}", len)));
                }
            }
        } else if q.flags.contains(QueryFlags::COMPRESSED) && body.len() >= opts.compression_threshold {
            if let Some(packed) = deflate(&body).filter(|p| p.len() < body.len()) {
                body = packed;
                extra.push(("Content-Encoding", "deflate".to_string()));
            }
        }
    }

    let keep_alive = response_keep_alive(q, opts);
    let chunked = q.method != Method::Head && opts.chunk_threshold.is_some_and(|t| body.len() > t);

    let mut head = format!("HTTP/1.1 {} {}\r\n", status, status_text(status));
    head.push_str(&format!("Date: {}\r\n", crate::query::http_date(chrono::Utc::now())));
    head.push_str(&format!("Server: {}\r\n", opts.server_name));
    if !body.is_empty() || q.method == Method::Head {
        head.push_str(&format!("Content-Type: {}\r\n", q.response_content_type()));
    }
    for (name, value) in extra {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    for (name, value) in q.response_headers() {
        if name.eq_ignore_ascii_case("connection") || name.eq_ignore_ascii_case("content-length") {
            continue;
        }
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    for cookie in q.set_cookie_headers() {
        head.push_str(&format!("Set-Cookie: {}\r\n", cookie));
    }
    if q.header("Cache-Control").is_none() {
        head.push_str("Cache-Control: no-cache\r\n");
    }
    head.push_str(if keep_alive {
        "Connection: keep-alive\r\n"
    } else {
        "Connection: close\r\n"
    });

    let mut out = Vec::with_capacity(head.len() + body.len() + 64);
    if chunked {
        head.push_str("Transfer-Encoding: chunked\r\n\r\n");
        out.extend_from_slice(head.as_bytes());
        let size = opts.chunk_threshold.unwrap_or(body.len()).max(1);
        for chunk in body.chunks(size) {
            out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0\r\n\r\n");
    } else {
        head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));
        out.extend_from_slice(head.as_bytes());
        if q.method != Method::Head {
            out.extend_from_slice(&body);
        }
    }
    Ok(out)
}

/// Render and send the response for `q`.
pub async fn flush_query<W>(w: &mut W, q: &mut Query, opts: &ResponseOptions) -> std::io::Result<bool>
where
    W: AsyncWrite + Unpin,
{
    let keep_alive = response_keep_alive(q, opts);
    let bytes = render_response(q, opts)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    w.write_all(&bytes).await?;
    w.flush().await?;
    Ok(keep_alive)
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

/// Replace the response of `q` with an error page.
pub fn write_error(q: &mut Query, status: u16, message: &str, json: bool) {
    q.clear_body();
    q.set_status(status);
    if json {
        q.set_content_type("application/json");
        let body = serde_json::json!({ "error": message, "code": status });
        q.write(body.to_string().as_bytes());
    } else {
        q.set_content_type("text/html; charset=utf-8");
        let text = status_text(status);
        q.write(
            format!(
                "<!DOCTYPE html>\n<html><head><title>{code} {text}</title></head>\
<body><h1>{code} {text}</h1><p>{msg}</p></body></html>\n",
                code = status,
                text = text,
                msg = escape_html(message)
            )
            .as_bytes(),
        );
    }
    if status == 405 {
        q.set_header("Allow", Method::ALLOWED);
    }
}

/// Build an error response for a request that may not have parsed.
pub fn error_query(method: Method, status: u16, message: &str, json: bool, keep_alive: bool) -> Query {
    let mut q = Query::new(method);
    if keep_alive {
        q.flags.insert(QueryFlags::KEEP_ALIVE);
    }
    write_error(&mut q, status, message, json);
    q
}
