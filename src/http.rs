//! HTTP/1.x message reader used for request-level racing.
//!
//! Every byte consumed while reading a message is captured in `raw`, which is
//! what gets forwarded. The parsed fields only drive control decisions
//! (body framing, connection persistence) and are never re-serialized.

use bytes::{Bytes, BytesMut};
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a single start line, header line or chunk-size line
pub const MAX_LINE_LEN: usize = 64 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The stream ended cleanly before the first byte of a message
    #[error("connection closed")]
    Closed,

    #[error("unexpected end of stream")]
    UnexpectedEof,

    #[error("line exceeds {} bytes", MAX_LINE_LEN)]
    LineTooLong,

    #[error("invalid request line: {0:?}")]
    InvalidRequestLine(String),

    #[error("invalid status line: {0:?}")]
    InvalidStatusLine(String),

    #[error("invalid chunk size: {0:?}")]
    InvalidChunkSize(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl HttpError {
    /// True for errors caused by the peer sending something that is not HTTP
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            HttpError::LineTooLong
                | HttpError::InvalidRequestLine(_)
                | HttpError::InvalidStatusLine(_)
                | HttpError::InvalidChunkSize(_)
        )
    }
}

pub type HttpResult<T> = Result<T, HttpError>;

/// Ordered header multimap. Names are kept exactly as received; lookups are
/// ASCII case-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    pub fn append(&mut self, name: &str, value: &str) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, values)) => values.push(value.to_string()),
            None => self
                .entries
                .push((name.to_string(), vec![value.to_string()])),
        }
    }

    /// All values of `name`, in the order they were received
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, values)| values.iter().map(String::as_str))
    }

    /// First value of `name`; the result borrows only the headers
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .find_map(|(_, values)| values.first())
            .map(String::as_str)
    }

    /// Header names in first-seen order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    fn is_chunked(&self) -> bool {
        self.get_all("Transfer-Encoding")
            .any(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    fn content_length(&self) -> u64 {
        self.get_all("Content-Length")
            .find_map(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
    }
}

fn should_close(version: &str, headers: &Headers) -> bool {
    if headers.has_token("Connection", "close") {
        return true;
    }
    version == "HTTP/1.0" && !headers.has_token("Connection", "keep-alive")
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub raw: Bytes,
    pub method: String,
    pub uri: String,
    pub version: String,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl HttpRequest {
    pub fn should_close(&self) -> bool {
        should_close(&self.version, &self.headers)
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub raw: Bytes,
    pub version: String,
    pub status_code: u16,
    pub reason: Option<String>,
    pub headers: Headers,
    pub body: Option<Bytes>,
}

impl HttpResponse {
    pub fn should_close(&self) -> bool {
        should_close(&self.version, &self.headers)
    }

    /// Status code and reason, e.g. `404 Not Found`
    pub fn status(&self) -> String {
        match &self.reason {
            Some(reason) => format!("{} {}", self.status_code, reason),
            None => self.status_code.to_string(),
        }
    }
}

fn request_has_body(method: &str) -> bool {
    !matches!(method, "GET" | "HEAD" | "DELETE")
}

fn response_has_body(status_code: u16, request_method: &str) -> bool {
    if request_method == "HEAD" {
        return false;
    }
    !((100..200).contains(&status_code) || status_code == 204 || status_code == 304)
}

/// Reads from the underlying stream while recording every consumed byte
struct TeeReader<'a, R> {
    inner: &'a mut R,
    raw: BytesMut,
}

impl<'a, R> TeeReader<'a, R>
where
    R: AsyncBufRead + Unpin,
{
    fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            raw: BytesMut::new(),
        }
    }

    /// Read one `\n`-terminated line, returning it without the terminator
    async fn read_line(&mut self) -> HttpResult<String> {
        let mut line = Vec::new();
        let n = (&mut *self.inner)
            .take(MAX_LINE_LEN as u64)
            .read_until(b'\n', &mut line)
            .await?;
        self.raw.extend_from_slice(&line);

        if n == 0 {
            return Err(if self.raw.is_empty() {
                HttpError::Closed
            } else {
                HttpError::UnexpectedEof
            });
        }
        if line.last() != Some(&b'\n') {
            return Err(if n >= MAX_LINE_LEN {
                HttpError::LineTooLong
            } else {
                HttpError::UnexpectedEof
            });
        }

        let text = String::from_utf8_lossy(&line);
        Ok(text.trim_end_matches(['\r', '\n']).to_string())
    }

    /// Read exactly `len` bytes and return them
    async fn read_exact(&mut self, len: u64) -> HttpResult<Bytes> {
        let mut buf = Vec::new();
        let n = (&mut *self.inner).take(len).read_to_end(&mut buf).await?;
        self.raw.extend_from_slice(&buf);
        if (n as u64) < len {
            return Err(HttpError::UnexpectedEof);
        }
        Ok(Bytes::from(buf))
    }

    async fn read_headers(&mut self) -> HttpResult<Headers> {
        let mut headers = Headers::default();
        loop {
            let line = self.read_line().await?;
            if line.is_empty() {
                return Ok(headers);
            }
            // Lines without a colon carry no header and are skipped
            if let Some((name, value)) = line.split_once(':') {
                headers.append(name.trim(), value.trim());
            }
        }
    }

    async fn read_body(&mut self, headers: &Headers) -> HttpResult<Option<Bytes>> {
        if headers.is_chunked() {
            return self.read_chunked().await.map(Some);
        }
        match headers.content_length() {
            0 => Ok(None),
            len => self.read_exact(len).await.map(Some),
        }
    }

    async fn read_chunked(&mut self) -> HttpResult<Bytes> {
        let mut body = BytesMut::new();
        loop {
            let line = self.read_line().await?;
            let size = line.split(';').next().unwrap_or_default().trim();
            let size = u64::from_str_radix(size, 16)
                .map_err(|_| HttpError::InvalidChunkSize(line.clone()))?;

            if size == 0 {
                // Trailer section ends with an empty line
                while !self.read_line().await?.is_empty() {}
                return Ok(body.freeze());
            }

            body.extend_from_slice(&self.read_exact(size).await?);
            self.read_line().await?;
        }
    }
}

/// Read one request from `reader`
pub async fn read_request<R>(reader: &mut R) -> HttpResult<HttpRequest>
where
    R: AsyncBufRead + Unpin,
{
    let mut tee = TeeReader::new(reader);

    let line = tee.read_line().await?;
    let parts: Vec<String> = line.split_whitespace().map(str::to_string).collect();
    let Ok([method, uri, version]) = <[String; 3]>::try_from(parts) else {
        return Err(HttpError::InvalidRequestLine(line));
    };

    let headers = tee.read_headers().await?;
    let body = if request_has_body(&method) {
        tee.read_body(&headers).await?
    } else {
        None
    };

    Ok(HttpRequest {
        raw: tee.raw.freeze(),
        method,
        uri,
        version,
        headers,
        body,
    })
}

/// Read one response to a request made with `request_method`
pub async fn read_response<R>(reader: &mut R, request_method: &str) -> HttpResult<HttpResponse>
where
    R: AsyncBufRead + Unpin,
{
    let mut tee = TeeReader::new(reader);

    let line = tee.read_line().await?;
    let mut parts = line.split_whitespace();
    let (version, code) = match (parts.next(), parts.next()) {
        (Some(version), Some(code)) => (version.to_string(), code),
        _ => return Err(HttpError::InvalidStatusLine(line)),
    };
    let status_code = code
        .parse::<u16>()
        .map_err(|_| HttpError::InvalidStatusLine(line.clone()))?;
    let reason = parts.collect::<Vec<_>>().join(" ");
    let reason = (!reason.is_empty()).then_some(reason);

    let headers = tee.read_headers().await?;
    let body = if response_has_body(status_code, request_method) {
        tee.read_body(&headers).await?
    } else {
        None
    };

    Ok(HttpResponse {
        raw: tee.raw.freeze(),
        version,
        status_code,
        reason,
        headers,
        body,
    })
}

/// Minimal error response sent to the client when racing cannot produce one
pub fn error_response(status_code: u16, reason: &str) -> String {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        status_code, reason
    )
}
