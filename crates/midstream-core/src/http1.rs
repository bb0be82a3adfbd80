use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

pub(crate) const IO_CHUNK_SIZE: usize = 8 * 1024;
const CHUNK_SIZE_LINE_LIMIT: usize = 1024;

pub(crate) const ESTABLISHED_RESPONSE: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";

fn protocol_error(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, detail.into())
}

fn blank_line(line: &[u8]) -> bool {
    line == b"\r\n" || line == b"\n"
}

fn truncated(detail: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::UnexpectedEof, detail.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpVersion {
    Http10,
    Http11,
}

impl HttpVersion {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub version: HttpVersion,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub version: HttpVersion,
    pub status: u16,
    pub reason: String,
    pub headers: HeaderMap,
    pub body_mode: BodyMode,
    pub connection_close: bool,
}

pub struct BufferedStream<S> {
    pub(crate) stream: S,
    pub(crate) read_buf: Vec<u8>,
}

impl<S> BufferedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    fn take(&mut self, count: usize) -> Vec<u8> {
        let rest = self.read_buf.split_off(count);
        std::mem::replace(&mut self.read_buf, rest)
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    async fn fill(&mut self) -> io::Result<usize> {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let read = self.stream.read(&mut chunk).await?;
        self.read_buf.extend_from_slice(&chunk[..read]);
        Ok(read)
    }

    // One LF-terminated line, terminator included. `Ok(None)` only when the
    // peer closed on a line boundary with nothing buffered.
    pub(crate) async fn read_line(&mut self, limit: usize) -> io::Result<Option<Vec<u8>>> {
        let mut scanned = 0_usize;
        loop {
            if let Some(newline) = self.read_buf[scanned..]
                .iter()
                .position(|byte| *byte == b'\n')
            {
                return Ok(Some(self.take(scanned + newline + 1)));
            }
            scanned = self.read_buf.len();
            if scanned > limit {
                return Err(protocol_error("line length over configured limit"));
            }
            if self.fill().await? == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(truncated("peer closed mid-line"));
            }
        }
    }

    // A full message head: every line up to and including the blank line.
    // The limit spans the whole head, so each line only gets the budget the
    // previous lines left over.
    pub(crate) async fn read_head(&mut self, limit: usize) -> io::Result<Option<Vec<u8>>> {
        let mut head: Vec<u8> = Vec::with_capacity(512);
        loop {
            let budget = limit.saturating_sub(head.len());
            let line = match self.read_line(budget).await? {
                Some(line) => line,
                None if head.is_empty() => return Ok(None),
                None => return Err(truncated("peer closed inside message head")),
            };
            let blank = blank_line(&line);
            head.extend_from_slice(&line);
            if blank {
                return Ok(Some(head));
            }
            if head.len() > limit {
                return Err(protocol_error("message head over configured limit"));
            }
        }
    }

    // Moves one message body into `sink` according to its framing and
    // reports the bytes moved (chunk framing included), which callers fold
    // into the request context's accounting.
    pub(crate) async fn relay_body_into<W>(
        &mut self,
        sink: &mut W,
        mode: BodyMode,
        head_limit: usize,
    ) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let moved = match mode {
            BodyMode::None => 0,
            BodyMode::ContentLength(length) => self.copy_counted(sink, length).await?,
            BodyMode::Chunked => self.relay_chunks(sink, head_limit).await?,
            BodyMode::CloseDelimited => self.copy_to_eof(sink).await?,
        };
        sink.flush().await?;
        Ok(moved)
    }

    async fn copy_counted<W>(&mut self, sink: &mut W, length: u64) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let mut left = length;
        while left > 0 {
            let want = (chunk.len() as u64).min(left) as usize;
            let read = self.read(&mut chunk[..want]).await?;
            if read == 0 {
                return Err(truncated("body ended before its declared length"));
            }
            sink.write_all(&chunk[..read]).await?;
            left -= read as u64;
        }
        Ok(length)
    }

    async fn copy_to_eof<W>(&mut self, sink: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut chunk = [0_u8; IO_CHUNK_SIZE];
        let mut moved = 0_u64;
        loop {
            let read = self.read(&mut chunk).await?;
            if read == 0 {
                return Ok(moved);
            }
            sink.write_all(&chunk[..read]).await?;
            moved += read as u64;
        }
    }

    async fn relay_chunks<W>(&mut self, sink: &mut W, head_limit: usize) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut moved = 0_u64;
        loop {
            let size_line = self
                .read_line(CHUNK_SIZE_LINE_LIMIT)
                .await?
                .ok_or_else(|| truncated("body ended before a chunk size line"))?;
            let size = chunk_size(&size_line)?;
            sink.write_all(&size_line).await?;
            moved += size_line.len() as u64;

            if size == 0 {
                break;
            }

            moved += self.copy_counted(sink, size).await?;

            let terminator = self
                .read_line(2)
                .await?
                .filter(|line| line.as_slice() == b"\r\n")
                .ok_or_else(|| protocol_error("chunk data not followed by CRLF"))?;
            sink.write_all(&terminator).await?;
            moved += terminator.len() as u64;
        }

        // Trailer section: header lines relayed untouched, ended by a blank
        // line. The head limit bounds the whole section.
        let mut trailer_total = 0_usize;
        loop {
            let budget = head_limit.saturating_sub(trailer_total);
            let line = self
                .read_line(budget)
                .await?
                .ok_or_else(|| truncated("body ended inside chunk trailers"))?;
            let blank = blank_line(&line);
            sink.write_all(&line).await?;
            moved += line.len() as u64;
            trailer_total += line.len();
            if blank {
                return Ok(moved);
            }
            if trailer_total > head_limit {
                return Err(protocol_error("chunk trailers over configured limit"));
            }
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for BufferedStream<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.read_buf.is_empty() {
            let take = self.read_buf.len().min(buf.remaining());
            buf.put_slice(&self.read_buf[..take]);
            self.read_buf.drain(..take);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for BufferedStream<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

fn chunk_size(line: &[u8]) -> io::Result<u64> {
    let text =
        std::str::from_utf8(line).map_err(|_| protocol_error("chunk size line is not UTF-8"))?;
    let digits = text.split(';').next().unwrap_or_default().trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| protocol_error(format!("unparseable chunk size {digits:?}")))
}

pub fn parse_request_head(raw: &[u8]) -> io::Result<RequestHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| protocol_error("request head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| protocol_error("empty request head"))?;
    let fields = request_line.split_whitespace().collect::<Vec<_>>();
    let [method, target, version_text] = fields.as_slice() else {
        return Err(protocol_error(format!(
            "malformed request line {request_line:?}"
        )));
    };
    let version = parse_http_version(version_text)?;

    let headers = parse_header_lines(lines)?;
    let body_mode = request_body_mode(&headers)?;
    let connection_close = is_connection_close(version, &headers);

    Ok(RequestHead {
        method: (*method).to_string(),
        target: (*target).to_string(),
        version,
        headers,
        body_mode,
        connection_close,
    })
}

pub fn parse_response_head(raw: &[u8], request_method: &str) -> io::Result<ResponseHead> {
    let text = std::str::from_utf8(raw)
        .map_err(|_| protocol_error("response head is not valid UTF-8"))?;
    let mut lines = text.split("\r\n");
    let status_line = lines
        .next()
        .ok_or_else(|| protocol_error("empty response head"))?;

    // Version and code are single tokens; everything after them is the
    // reason phrase, spaces and all.
    let mut fields = status_line.splitn(3, ' ');
    let version = parse_http_version(fields.next().unwrap_or_default())?;
    let status = fields
        .next()
        .unwrap_or_default()
        .parse::<u16>()
        .map_err(|_| protocol_error(format!("malformed status line {status_line:?}")))?;
    let reason = fields.next().unwrap_or_default().trim_end().to_string();

    let headers = parse_header_lines(lines)?;
    let body_mode = response_body_mode(&headers, request_method, status)?;
    let mut connection_close = is_connection_close(version, &headers);
    if body_mode == BodyMode::CloseDelimited {
        connection_close = true;
    }

    Ok(ResponseHead {
        version,
        status,
        reason,
        headers,
        body_mode,
        connection_close,
    })
}

fn parse_http_version(text: &str) -> io::Result<HttpVersion> {
    match text {
        "HTTP/1.1" => Ok(HttpVersion::Http11),
        "HTTP/1.0" => Ok(HttpVersion::Http10),
        other => Err(protocol_error(format!(
            "unsupported protocol version {other:?}"
        ))),
    }
}

fn parse_header_lines<'a>(lines: impl Iterator<Item = &'a str>) -> io::Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| protocol_error(format!("header line {line:?} has no colon")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| protocol_error(format!("bad header name in {line:?}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| protocol_error(format!("bad header value in {line:?}")))?;
        headers.append(name, value);
    }
    Ok(headers)
}

fn request_body_mode(headers: &HeaderMap) -> io::Result<BodyMode> {
    if header_has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match parse_content_length(headers)? {
        Some(0) | None => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
    }
}

fn response_body_mode(
    headers: &HeaderMap,
    request_method: &str,
    status: u16,
) -> io::Result<BodyMode> {
    if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        return Ok(BodyMode::None);
    }

    if header_has_token(headers, "transfer-encoding", "chunked") {
        return Ok(BodyMode::Chunked);
    }
    match parse_content_length(headers)? {
        Some(0) => Ok(BodyMode::None),
        Some(length) => Ok(BodyMode::ContentLength(length)),
        None => Ok(BodyMode::CloseDelimited),
    }
}

fn parse_content_length(headers: &HeaderMap) -> io::Result<Option<u64>> {
    let Some(value) = headers.get_all("content-length").iter().last() else {
        return Ok(None);
    };
    value
        .to_str()
        .ok()
        .and_then(|text| text.trim().parse::<u64>().ok())
        .map(Some)
        .ok_or_else(|| protocol_error("unparseable Content-Length"))
}

pub(crate) fn header_has_token(headers: &HeaderMap, name: &str, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|candidate| candidate.trim().eq_ignore_ascii_case(token))
}

fn is_connection_close(version: HttpVersion, headers: &HeaderMap) -> bool {
    if header_has_token(headers, "connection", "close") {
        return true;
    }
    if version == HttpVersion::Http10 && !header_has_token(headers, "connection", "keep-alive") {
        return true;
    }
    false
}

// Head serializers regenerate framing headers from the body mode so a
// sanitized head still frames its body correctly on the next hop.
pub(crate) fn serialize_request_head(
    method: &str,
    target: &str,
    version: HttpVersion,
    headers: &HeaderMap,
    body_mode: BodyMode,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version.as_str().as_bytes());
    out.extend_from_slice(b"\r\n");
    serialize_headers(&mut out, headers);
    if body_mode == BodyMode::Chunked && !headers.contains_key("transfer-encoding") {
        out.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

pub(crate) fn serialize_response_head(head: &ResponseHead) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(head.version.as_str().as_bytes());
    out.push(b' ');
    out.extend_from_slice(head.status.to_string().as_bytes());
    if !head.reason.is_empty() {
        out.push(b' ');
        out.extend_from_slice(head.reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    serialize_headers(&mut out, &head.headers);
    if head.body_mode == BodyMode::Chunked && !head.headers.contains_key("transfer-encoding") {
        out.extend_from_slice(b"transfer-encoding: chunked\r\n");
    }
    if head.body_mode == BodyMode::CloseDelimited && !head.headers.contains_key("connection") {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out
}

fn serialize_headers(out: &mut Vec<u8>, headers: &HeaderMap) {
    for (name, value) in headers {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}
