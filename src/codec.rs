//! Request/response codec collaborators.
//!
//! The spec treats full HTTP/1.1 parsing and response serialization as an
//! external, pluggable concern (§1, §6) -- the reactor only needs
//! something that can turn bytes into a `ParsedRequest` and a status code
//! into response bytes plus an optional body slice for `iov[1]`. What
//! follows is the minimal concrete implementation used to drive and test
//! the reactor end to end; a production deployment can swap it for a
//! fuller parser without touching `conn.rs` or `reactor.rs`.

use std::path::{Path, PathBuf};

use crate::buffer::ByteBuffer;
use crate::error::CodecError;

#[derive(Debug, Clone)]
pub struct ParsedRequest {
    pub path: String,
    pub keep_alive: bool,
}

/// Parses one request out of the front of a read buffer.
///
/// Implementations consume exactly the bytes belonging to the request
/// (up to and including its terminating delimiter) on success, leaving
/// any pipelined bytes behind for the next call. On failure the buffer
/// may be left in any state -- the caller is about to synthesize a 400
/// and close the connection either way.
pub trait RequestCodec: Send {
    fn parse(&mut self, buf: &mut ByteBuffer) -> Result<ParsedRequest, CodecError>;
}

/// A line-oriented HTTP/1.1 request-line-and-headers parser. Bodies are
/// not supported (matching the spec's GET-only static file server scope).
#[derive(Default)]
pub struct HttpRequestCodec;

impl RequestCodec for HttpRequestCodec {
    fn parse(&mut self, buf: &mut ByteBuffer) -> Result<ParsedRequest, CodecError> {
        let readable = buf.peek();
        let end = find_subslice(readable, b"\r\n\r\n").ok_or(CodecError::Incomplete)?;
        let header_block = &readable[..end];
        let text = std::str::from_utf8(header_block).map_err(|_| CodecError::MalformedRequestLine)?;

        let mut lines = text.split("\r\n");
        let request_line = lines.next().ok_or(CodecError::MalformedRequestLine)?;
        let mut parts = request_line.split(' ');
        let method = parts.next().ok_or(CodecError::MalformedRequestLine)?;
        let path = parts.next().ok_or(CodecError::MalformedRequestLine)?;
        let version = parts.next().ok_or(CodecError::MalformedRequestLine)?;
        if !version.starts_with("HTTP/1.") {
            return Err(CodecError::MalformedRequestLine);
        }
        if method != "GET" && method != "HEAD" {
            return Err(CodecError::UnsupportedMethod(method.to_string()));
        }

        let mut keep_alive = version == "HTTP/1.1";
        for line in lines {
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("Connection") {
                    keep_alive = value.trim().eq_ignore_ascii_case("keep-alive");
                }
            }
        }

        let path = normalize_path(path);
        let absolute_end = buf.prependable_bytes() + end + 4;
        buf.retrieve_until(absolute_end);

        Ok(ParsedRequest { path, keep_alive })
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn normalize_path(path: &str) -> String {
    let path = path.split('?').next().unwrap_or(path);
    if path == "/" {
        "/index.html".to_string()
    } else {
        path.to_string()
    }
}

/// Maps a response status code and (for successes) a static file body to
/// response bytes. The body slot stands in for the original's `mmap`-ed
/// file region: a plain `Vec<u8>` read-in, since no memory-mapping crate
/// is part of this codebase's dependency set (see DESIGN.md).
pub struct HttpResponse {
    code: u16,
    keep_alive: bool,
    src_dir: PathBuf,
    path: String,
    body: Option<Vec<u8>>,
}

impl HttpResponse {
    pub fn new(src_dir: impl AsRef<Path>, path: impl Into<String>, keep_alive: bool, code: u16) -> Self {
        Self {
            code,
            keep_alive,
            src_dir: src_dir.as_ref().to_path_buf(),
            path: path.into(),
            body: None,
        }
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn code(&self) -> u16 {
        self.code
    }

    pub fn file(&self) -> Option<&[u8]> {
        self.body.as_deref()
    }

    pub fn file_len(&self) -> usize {
        self.body.as_ref().map_or(0, Vec::len)
    }

    pub fn unmap_file(&mut self) {
        self.body = None;
    }

    /// Appends the status line and headers to `buf`, and for a successful
    /// GET, reads the requested file into `self.body` so the caller can
    /// map it into `iov[1]` without copying it into `buf` as well. Falls
    /// back to 404 if the file can't be opened, matching the original's
    /// stat-then-degrade behavior.
    pub fn make_response(&mut self, buf: &mut ByteBuffer) {
        if self.code == 200 {
            let full = resolve_path(&self.src_dir, &self.path);
            match std::fs::read(&full) {
                Ok(bytes) => self.body = Some(bytes),
                Err(_) => self.code = 404,
            }
        }

        let status_line = format!(
            "HTTP/1.1 {} {}\r\n",
            self.code,
            reason_phrase(self.code)
        );
        buf.append(status_line.as_bytes());

        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        buf.append(format!("Connection: {connection}\r\n").as_bytes());

        if self.code == 200 {
            let content_type = content_type_for(&self.path);
            buf.append(format!("Content-Type: {content_type}\r\n").as_bytes());
            buf.append(format!("Content-Length: {}\r\n\r\n", self.file_len()).as_bytes());
        } else {
            let body = error_body(self.code);
            buf.append(b"Content-Type: text/html\r\n");
            buf.append(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
            buf.append(body.as_bytes());
        }
    }
}

fn resolve_path(src_dir: &Path, path: &str) -> PathBuf {
    src_dir.join(path.trim_start_matches('/'))
}

fn reason_phrase(code: u16) -> &'static str {
    match code {
        200 => "OK",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        _ => "Internal Server Error",
    }
}

fn error_body(code: u16) -> String {
    format!("<html><title>Error</title><body>{} {}</body></html>", code, reason_phrase(code))
}

fn content_type_for(path: &str) -> &'static str {
    match Path::new(path).extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("json") => "application/json",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_simple_get_and_consumes_the_header_block() {
        let mut buf = ByteBuffer::new();
        buf.append(b"GET /index.html HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n");
        let req = HttpRequestCodec.parse(&mut buf).unwrap();
        assert_eq!(req.path, "/index.html");
        assert!(req.keep_alive);
        assert_eq!(buf.readable_bytes(), 0);
    }

    #[test]
    fn leaves_a_pipelined_second_request_untouched() {
        let mut buf = ByteBuffer::new();
        buf.append(b"GET /a HTTP/1.1\r\n\r\nGET /b HTTP/1.1\r\n\r\n");
        let first = HttpRequestCodec.parse(&mut buf).unwrap();
        assert_eq!(first.path, "/a");
        let second = HttpRequestCodec.parse(&mut buf).unwrap();
        assert_eq!(second.path, "/b");
    }

    #[test]
    fn root_path_maps_to_index_html() {
        let mut buf = ByteBuffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");
        let req = HttpRequestCodec.parse(&mut buf).unwrap();
        assert_eq!(req.path, "/index.html");
    }

    #[test]
    fn malformed_request_line_is_rejected() {
        let mut buf = ByteBuffer::new();
        buf.append(b"NOT-HTTP\r\n\r\n");
        assert!(HttpRequestCodec.parse(&mut buf).is_err());
    }

    #[test]
    fn http_1_0_defaults_to_connection_close() {
        let mut buf = ByteBuffer::new();
        buf.append(b"GET /a HTTP/1.0\r\n\r\n");
        let req = HttpRequestCodec.parse(&mut buf).unwrap();
        assert!(!req.keep_alive);
    }

    #[test]
    fn missing_file_degrades_response_to_404() {
        let dir = tempfile::tempdir().unwrap();
        let mut resp = HttpResponse::new(dir.path(), "/nope.html", true, 200);
        let mut buf = ByteBuffer::new();
        resp.make_response(&mut buf);
        assert_eq!(resp.code(), 404);
        assert!(String::from_utf8_lossy(buf.peek()).starts_with("HTTP/1.1 404"));
    }

    #[test]
    fn existing_file_is_mapped_into_the_body_slot() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("index.html"), b"hello").unwrap();
        let mut resp = HttpResponse::new(dir.path(), "/index.html", true, 200);
        let mut buf = ByteBuffer::new();
        resp.make_response(&mut buf);
        assert_eq!(resp.code(), 200);
        assert_eq!(resp.file(), Some(b"hello".as_slice()));
        assert!(String::from_utf8_lossy(buf.peek()).contains("Content-Length: 5"));
    }
}
