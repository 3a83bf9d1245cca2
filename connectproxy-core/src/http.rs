use std::error::Error;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

// Performance tuning constants
const READ_BUFFER_SIZE: usize = 8192;
/// Upper bound for a request or response head, terminator included.
pub const MAX_HEAD_SIZE: usize = 32 * 1024;

#[derive(Debug)]
pub enum HttpError {
    Io(io::Error),
    /// The peer closed the connection before sending anything.
    ConnectionClosed,
    /// The peer closed the connection in the middle of a head.
    Truncated,
    InvalidRequest,
    InvalidResponse,
    HeadTooLarge,
    Timeout,
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpError::Io(e) => write!(f, "IO error: {}", e),
            HttpError::ConnectionClosed => write!(f, "Connection closed before request"),
            HttpError::Truncated => write!(f, "Connection closed mid-head"),
            HttpError::InvalidRequest => write!(f, "Invalid HTTP request"),
            HttpError::InvalidResponse => write!(f, "Invalid HTTP response"),
            HttpError::HeadTooLarge => write!(f, "HTTP head exceeds {} bytes", MAX_HEAD_SIZE),
            HttpError::Timeout => write!(f, "Operation timed out"),
        }
    }
}

impl Error for HttpError {}

impl From<io::Error> for HttpError {
    fn from(err: io::Error) -> Self {
        HttpError::Io(err)
    }
}

impl From<tokio::time::error::Elapsed> for HttpError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        HttpError::Timeout
    }
}

/// A parsed request line and header block.
///
/// Header names keep the case the client sent; order is preserved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    /// Request target as sent: `host:port` for CONNECT, usually an absolute URL otherwise
    pub url: String,
    pub version: String,
    pub headers: Vec<(String, String)>,
}

impl RequestHead {
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            url: url.into(),
            version: "HTTP/1.1".to_string(),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[inline]
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")?.trim().parse().ok()
    }
}

/// A parsed status line and header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Reads from `stream` into `buffer` until it holds a complete head.
///
/// Returns the length of the head including the blank line. Bytes past the head
/// stay in `buffer` and belong to whatever follows (a body or tunnelled data).
pub async fn read_head<R>(stream: &mut R, buffer: &mut Vec<u8>) -> Result<usize, HttpError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(end) = find_headers_end(buffer) {
            return Ok(end);
        }
        if buffer.len() >= MAX_HEAD_SIZE {
            return Err(HttpError::HeadTooLarge);
        }

        let mut chunk = [0u8; READ_BUFFER_SIZE];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(if buffer.is_empty() {
                HttpError::ConnectionClosed
            } else {
                HttpError::Truncated
            });
        }
        buffer.extend_from_slice(&chunk[..n]);
    }
}

#[inline]
pub fn find_headers_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

pub fn parse_request_head(head: &[u8]) -> Result<RequestHead, HttpError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpError::InvalidRequest)?;
    let mut lines = text.lines();

    let request_line = lines.next().ok_or(HttpError::InvalidRequest)?;
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(url), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HttpError::InvalidRequest);
    };
    if !version.starts_with("HTTP/") {
        return Err(HttpError::InvalidRequest);
    }

    Ok(RequestHead {
        method: method.to_string(),
        url: url.to_string(),
        version: version.to_string(),
        headers: parse_headers(lines).ok_or(HttpError::InvalidRequest)?,
    })
}

pub fn parse_response_head(head: &[u8]) -> Result<ResponseHead, HttpError> {
    let text = std::str::from_utf8(head).map_err(|_| HttpError::InvalidResponse)?;
    let mut lines = text.lines();

    let status_line = lines.next().ok_or(HttpError::InvalidResponse)?;
    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(HttpError::InvalidResponse);
    }
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..=999).contains(code))
        .ok_or(HttpError::InvalidResponse)?;
    let reason = parts.next().unwrap_or_default().trim();

    Ok(ResponseHead {
        version: version.to_string(),
        status,
        reason: reason.to_string(),
        headers: parse_headers(lines).ok_or(HttpError::InvalidResponse)?,
    })
}

fn parse_headers<'a>(lines: impl Iterator<Item = &'a str>) -> Option<Vec<(String, String)>> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        let name = name.trim_end();
        if name.is_empty() || name.contains(' ') {
            return None;
        }
        headers.push((name.to_string(), value.trim().to_string()));
    }
    Some(headers)
}

/// Renders headers as `name: value` lines, each terminated by CRLF.
pub fn render_headers(headers: &[(String, String)], out: &mut String) {
    for (name, value) in headers {
        out.push_str(name);
        out.push_str(": ");
        out.push_str(value);
        out.push_str("\r\n");
    }
}
