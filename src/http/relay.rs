//! Relay of Worker responses to the client.
//!
//! The Frontend never re-renders a Worker response. It reads the header
//! block to learn the framing, forwards it verbatim and then streams the
//! body, so large responses are never held in memory whole.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::request::find;

/// Longest chunk-size line accepted.
const MAX_CHUNK_LINE: usize = 1024;

const READ_CHUNK: usize = 16 * 1024;

/// How the body following a Worker header is delimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    Chunked,
    Length(u64),
}

/// A parsed Worker response header.
#[derive(Debug, Clone)]
pub struct WorkerHead {
    /// Header block exactly as received, terminator included.
    pub raw: Vec<u8>,
    pub status: u16,
    pub framing: Framing,
    /// Worker asked for `Connection: close`.
    pub close: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Worker response timed out")]
    Timeout,
    #[error("Worker closed the connection")]
    Closed,
    #[error("Malformed worker response: {0}")]
    Malformed(&'static str),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read into `buf` until it holds at least `min` bytes.
pub async fn refill_buffer_min<R>(r: &mut R, buf: &mut Vec<u8>, min: usize) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut chunk = [0u8; READ_CHUNK];
    while buf.len() < min {
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return Err(RelayError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(())
}

/// Wait for and parse a Worker response header.
///
/// Bytes following the header stay in `buf`.
pub async fn read_worker_head<R>(
    r: &mut R,
    buf: &mut Vec<u8>,
    max: usize,
    timeout: Duration,
) -> Result<WorkerHead, RelayError>
where
    R: AsyncRead + Unpin,
{
    let end = tokio::time::timeout(timeout, async {
        loop {
            if let Some(pos) = find(buf, b"\r\n\r\n") {
                return Ok(pos + 4);
            }
            if buf.len() > max {
                return Err(RelayError::Malformed("header too large"));
            }
            let want = buf.len() + 1;
            refill_buffer_min(r, buf, want).await?;
        }
    })
    .await
    .map_err(|_| RelayError::Timeout)??;

    let raw: Vec<u8> = buf.drain(..end).collect();
    let (status, framing, close) = parse_head(&raw)?;
    Ok(WorkerHead {
        raw,
        status,
        framing,
        close,
    })
}

fn parse_head(raw: &[u8]) -> Result<(u16, Framing, bool), RelayError> {
    let text = std::str::from_utf8(raw).map_err(|_| RelayError::Malformed("header is not UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status = lines
        .next()
        .and_then(|l| l.strip_prefix("HTTP/1.1 "))
        .and_then(|l| l.get(..3))
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or(RelayError::Malformed("bad status line"))?;

    let mut framing = None;
    let mut close = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match name.trim().to_ascii_lowercase().as_str() {
            "transfer-encoding" if value.eq_ignore_ascii_case("chunked") => {
                framing = Some(Framing::Chunked);
            }
            "content-length" if framing.is_none() => {
                let len = value
                    .parse()
                    .map_err(|_| RelayError::Malformed("bad Content-Length"))?;
                framing = Some(Framing::Length(len));
            }
            "connection" => close = value.eq_ignore_ascii_case("close"),
            _ => {}
        }
    }
    let framing = framing.ok_or(RelayError::Malformed("no body framing"))?;
    Ok((status, framing, close))
}

/// Forward exactly `n` bytes, draining `buf` first.
async fn relay_exact<R, W>(worker: &mut R, buf: &mut Vec<u8>, client: &mut W, mut n: u64) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while n > 0 {
        if buf.is_empty() {
            refill_buffer_min(worker, buf, 1).await?;
        }
        let take = (buf.len() as u64).min(n) as usize;
        client.write_all(&buf[..take]).await?;
        buf.drain(..take);
        n -= take as u64;
    }
    Ok(())
}

/// Forward a `Content-Length` body.
pub async fn relay_content_length<R, W>(
    worker: &mut R,
    buf: &mut Vec<u8>,
    client: &mut W,
    len: u64,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    relay_exact(worker, buf, client, len).await?;
    client.flush().await?;
    Ok(())
}

/// Forward a chunked body up to and including the terminating chunk.
///
/// Returns the number of payload bytes relayed.
pub async fn relay_chunked<R, W>(worker: &mut R, buf: &mut Vec<u8>, client: &mut W) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0u64;
    loop {
        let line_end = loop {
            if let Some(p) = find(buf, b"\r\n") {
                break p;
            }
            if buf.len() > MAX_CHUNK_LINE {
                return Err(RelayError::Malformed("chunk size line too long"));
            }
            let want = buf.len() + 1;
            refill_buffer_min(worker, buf, want).await?;
        };

        let line = std::str::from_utf8(&buf[..line_end]).map_err(|_| RelayError::Malformed("bad chunk size"))?;
        let size_hex = line.split(';').next().unwrap_or("").trim();
        let size =
            u64::from_str_radix(size_hex, 16).map_err(|_| RelayError::Malformed("bad chunk size"))?;

        if size == 0 {
            // no trailers: "0\r\n\r\n"
            refill_buffer_min(worker, buf, line_end + 4).await?;
            if &buf[line_end + 2..line_end + 4] != b"\r\n" {
                return Err(RelayError::Malformed("chunk trailers are not supported"));
            }
            client.write_all(&buf[..line_end + 4]).await?;
            buf.drain(..line_end + 4);
            client.flush().await?;
            return Ok(total);
        }

        client.write_all(&buf[..line_end + 2]).await?;
        buf.drain(..line_end + 2);
        relay_exact(worker, buf, client, size).await?;

        refill_buffer_min(worker, buf, 2).await?;
        if &buf[..2] != b"\r\n" {
            return Err(RelayError::Malformed("missing chunk terminator"));
        }
        client.write_all(b"\r\n").await?;
        buf.drain(..2);
        total += size;
    }
}
