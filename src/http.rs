//! HTTP/1.x engine
//!
//! Incremental zero-copy parser plus response helpers, chunked transfer,
//! multipart walking, static file serving, credential extraction and the
//! glob URI matcher. Parsed messages are byte spans into the connection's
//! `recv` buffer; the engine consumes a message's bytes after the user
//! handler has seen it.

use std::ops::Range;
use std::rc::Rc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use thiserror::Error;
use tracing::debug;

use crate::connection::{Connection, EventFn, Proto};
use crate::event::Event;
use crate::fs::{Fs, StdFs};
use crate::manager::{Error, Manager};
use crate::ws;

/// Headers beyond this count are silently dropped
pub const MAX_HEADERS: usize = 40;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed HTTP message")]
    Malformed,
}

/// How the body of a message is delimited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BodyKind {
    /// `Content-Length` (or no body at all)
    #[default]
    Known,
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// Response without a length: body runs to connection close
    TillClose,
}

/// A parsed request or response
///
/// Every field is a byte span into the buffer the message was parsed from;
/// resolve them by slicing (`&buf[m.uri.clone()]`). Responses reuse the
/// request-line fields the way the wire does: `method` holds the protocol,
/// `uri` the status code and `proto` the reason phrase.
#[derive(Debug, Clone, Default)]
pub struct HttpMessage {
    pub method: Range<usize>,
    pub uri: Range<usize>,
    /// Query string (after `?`), empty span when absent
    pub query: Range<usize>,
    pub proto: Range<usize>,
    pub headers: Vec<(Range<usize>, Range<usize>)>,
    pub body: Range<usize>,
    /// The whole message, once its extent is known
    pub message: Range<usize>,
    pub head_len: usize,
    pub kind: BodyKind,
}

impl HttpMessage {
    /// Look up a header value, case-insensitively
    pub fn header<'a>(&self, buf: &'a [u8], name: &str) -> Option<&'a [u8]> {
        self.headers
            .iter()
            .find(|(n, _)| buf[n.clone()].eq_ignore_ascii_case(name.as_bytes()))
            .map(|(_, v)| &buf[v.clone()])
    }

    pub fn is_response(&self, buf: &[u8]) -> bool {
        buf[self.method.clone()].starts_with(b"HTTP/")
    }

    /// Status code of a response, 0 for requests
    pub fn status(&self, buf: &[u8]) -> u16 {
        if !self.is_response(buf) {
            return 0;
        }
        buf[self.uri.clone()]
            .iter()
            .take_while(|c| c.is_ascii_digit())
            .fold(0u16, |acc, c| acc.wrapping_mul(10) + (c - b'0') as u16)
    }
}

/// Length of the header block through the terminating blank line
///
/// `Ok(None)` means the block is still incomplete. Both CRLF and bare LF
/// line endings are accepted; control bytes in the header block are fatal.
pub fn request_len(buf: &[u8]) -> Result<Option<usize>, ParseError> {
    for i in 0..buf.len() {
        let c = buf[i];
        if c < b' ' && c != b'\r' && c != b'\n' {
            return Err(ParseError::Malformed);
        }
        if c == b'\n' {
            if buf.get(i + 1) == Some(&b'\n') {
                return Ok(Some(i + 2));
            }
            if buf.get(i + 1) == Some(&b'\r') && buf.get(i + 2) == Some(&b'\n') {
                return Ok(Some(i + 3));
            }
        }
    }
    Ok(None)
}

fn read_line(buf: &[u8], start: usize, limit: usize) -> (Range<usize>, usize) {
    let mut end = start;
    while end < limit && buf[end] != b'\n' {
        end += 1;
    }
    let next = if end < limit { end + 1 } else { end };
    let mut line_end = end;
    if line_end > start && buf[line_end - 1] == b'\r' {
        line_end -= 1;
    }
    (start..line_end, next)
}

fn next_token(buf: &[u8], cursor: &mut Range<usize>) -> Option<Range<usize>> {
    let mut s = cursor.start;
    while s < cursor.end && buf[s] == b' ' {
        s += 1;
    }
    let mut e = s;
    while e < cursor.end && buf[e] != b' ' {
        e += 1;
    }
    cursor.start = e;
    (s != e).then(|| s..e)
}

/// Parse one message out of `buf`
///
/// Returns `Ok(None)` while the header block is incomplete. The body span
/// reflects the declared length and may extend past the bytes currently
/// buffered; `message` covers head plus body. Parsing never consumes.
pub fn parse(buf: &[u8]) -> Result<Option<HttpMessage>, ParseError> {
    let head = match request_len(buf)? {
        Some(n) => n,
        None => return Ok(None),
    };
    let mut m = HttpMessage {
        head_len: head,
        ..Default::default()
    };
    let (line, mut pos) = read_line(buf, 0, head);
    let mut cursor = line;
    m.method = next_token(buf, &mut cursor).ok_or(ParseError::Malformed)?;
    m.uri = next_token(buf, &mut cursor).ok_or(ParseError::Malformed)?;
    m.proto = next_token(buf, &mut cursor).ok_or(ParseError::Malformed)?;
    if let Some(q) = buf[m.uri.clone()].iter().position(|&c| c == b'?') {
        let q = m.uri.start + q;
        m.query = q + 1..m.uri.end;
        m.uri = m.uri.start..q;
    } else {
        m.query = m.uri.end..m.uri.end;
    }

    while pos < head {
        let (line, next) = read_line(buf, pos, head);
        pos = next;
        if line.is_empty() {
            break;
        }
        let colon = buf[line.clone()]
            .iter()
            .position(|&c| c == b':')
            .ok_or(ParseError::Malformed)?;
        let name = line.start..line.start + colon;
        if name.is_empty() || buf[name.clone()].contains(&b' ') {
            return Err(ParseError::Malformed);
        }
        let mut vs = name.end + 1;
        while vs < line.end && buf[vs] == b' ' {
            vs += 1;
        }
        if m.headers.len() < MAX_HEADERS {
            m.headers.push((name, vs..line.end));
        }
    }

    m.body = head..head;
    m.message = 0..head;
    let chunked = m
        .header(buf, "Transfer-Encoding")
        .is_some_and(|v| contains_ignore_case(v, b"chunked"));
    if chunked {
        // a Content-Length alongside chunked is ignored
        m.kind = BodyKind::Chunked;
    } else if let Some(v) = m.header(buf, "Content-Length") {
        let n = atoi(v).ok_or(ParseError::Malformed)?;
        m.kind = BodyKind::Known;
        m.body = head..head + n;
        m.message = 0..head + n;
    } else if m.is_response(buf) {
        m.kind = BodyKind::TillClose;
    }
    Ok(Some(m))
}

fn atoi(v: &[u8]) -> Option<usize> {
    if v.is_empty() || !v.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    let mut n: usize = 0;
    for &c in v {
        n = n.checked_mul(10)?.checked_add((c - b'0') as usize)?;
    }
    Some(n)
}

fn contains_ignore_case(hay: &[u8], needle: &[u8]) -> bool {
    hay.windows(needle.len())
        .any(|w| w.eq_ignore_ascii_case(needle))
}

/// Percent-decode `s`, mapping `+` to space
pub fn url_decode(s: &[u8]) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let mut i = 0;
    while i < s.len() {
        match s[i] {
            b'%' => {
                let hi = hex_val(*s.get(i + 1)?)?;
                let lo = hex_val(*s.get(i + 2)?)?;
                out.push(hi << 4 | lo);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

fn hex_val(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Fetch and decode variable `name` from a query string or form body
pub fn var(data: &[u8], name: &str) -> Option<String> {
    for pair in data.split(|&c| c == b'&') {
        let mut it = pair.splitn(2, |&c| c == b'=');
        let k = it.next()?;
        if k == name.as_bytes() {
            return url_decode(it.next().unwrap_or(b""));
        }
    }
    None
}

/// Extract credentials per the precedence: `Authorization: Basic`,
/// `Authorization: Bearer`, the `access_token` cookie, the `access_token`
/// query variable. Returns `(user, password)`; bearer tokens land in the
/// password slot.
pub fn credentials(buf: &[u8], m: &HttpMessage) -> (String, String) {
    if let Some(auth) = m.header(buf, "Authorization") {
        if let Some(b64) = strip_prefix_ignore_case(auth, b"Basic ") {
            if let Ok(plain) = BASE64.decode(b64) {
                let mut it = plain.splitn(2, |&c| c == b':');
                let user = it.next().unwrap_or(b"");
                let pass = it.next().unwrap_or(b"");
                return (
                    String::from_utf8_lossy(user).into_owned(),
                    String::from_utf8_lossy(pass).into_owned(),
                );
            }
        } else if let Some(token) = strip_prefix_ignore_case(auth, b"Bearer ") {
            return (String::new(), String::from_utf8_lossy(token).into_owned());
        }
    }
    if let Some(cookie) = m.header(buf, "Cookie") {
        for part in cookie.split(|&c| c == b';') {
            let part = trim(part);
            if let Some(v) = part.strip_prefix(b"access_token=") {
                return (String::new(), String::from_utf8_lossy(v).into_owned());
            }
        }
    }
    if let Some(token) = var(&buf[m.query.clone()], "access_token") {
        return (String::new(), token);
    }
    (String::new(), String::new())
}

fn strip_prefix_ignore_case<'a>(s: &'a [u8], prefix: &[u8]) -> Option<&'a [u8]> {
    if s.len() >= prefix.len() && s[..prefix.len()].eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}

fn trim(s: &[u8]) -> &[u8] {
    let start = s.iter().position(|c| !c.is_ascii_whitespace()).unwrap_or(s.len());
    let end = s.iter().rposition(|c| !c.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &s[start..end]
}

/// Glob URI matcher: `?` one character, `*` any run excluding `/`, `#` any
/// run including `/`, everything else literal
pub fn glob_match(pattern: &str, text: &str) -> bool {
    fn rec(p: &[u8], t: &[u8]) -> bool {
        match p.first() {
            None => t.is_empty(),
            Some(b'?') => !t.is_empty() && rec(&p[1..], &t[1..]),
            Some(b'*') => rec(&p[1..], t) || (!t.is_empty() && t[0] != b'/' && rec(p, &t[1..])),
            Some(b'#') => rec(&p[1..], t) || (!t.is_empty() && rec(p, &t[1..])),
            Some(&c) => !t.is_empty() && t[0] == c && rec(&p[1..], &t[1..]),
        }
    }
    rec(pattern.as_bytes(), text.as_bytes())
}

/// One part of a `multipart/form-data` body; spans index into the body
/// slice passed to [`next_multipart`]
#[derive(Debug, Clone, Default)]
pub struct Part {
    pub name: Range<usize>,
    pub filename: Range<usize>,
    pub body: Range<usize>,
}

/// Walk a multipart body. Start with `ofs == 0`; feed the returned offset
/// back in to get the next part. The boundary is recovered from the body
/// itself. Returns `None` at the terminating boundary or on malformed
/// input.
pub fn next_multipart(body: &[u8], ofs: usize) -> Option<(usize, Part)> {
    let s = body.get(ofs..)?;
    if !s.starts_with(b"--") {
        return None;
    }
    let line_end = find(s, b"\r\n")?;
    let boundary = &s[..line_end];
    if boundary.ends_with(b"--") {
        return None; // terminator
    }
    let head_start = ofs + line_end + 2;
    let head_len = find(body.get(head_start..)?, b"\r\n\r\n")?;
    let mut part = Part::default();
    // part headers: only Content-Disposition matters
    for line in body[head_start..head_start + head_len].split(|&c| c == b'\n') {
        let base = line.as_ptr() as usize - body.as_ptr() as usize;
        if strip_prefix_ignore_case(line, b"Content-Disposition:").is_some() {
            if let Some(r) = quoted_attr(line, b"name=\"") {
                part.name = base + r.start..base + r.end;
            }
            if let Some(r) = quoted_attr(line, b"filename=\"") {
                part.filename = base + r.start..base + r.end;
            }
        }
    }
    let body_start = head_start + head_len + 4;
    let mut needle = Vec::with_capacity(boundary.len() + 2);
    needle.extend_from_slice(b"\r\n");
    needle.extend_from_slice(boundary);
    let rel = find(body.get(body_start..)?, &needle)?;
    part.body = body_start..body_start + rel;
    Some((body_start + rel + 2, part))
}

fn find(hay: &[u8], needle: &[u8]) -> Option<usize> {
    hay.windows(needle.len()).position(|w| w == needle)
}

fn quoted_attr(line: &[u8], key: &[u8]) -> Option<Range<usize>> {
    let start = find(line, key)? + key.len();
    let len = line[start..].iter().position(|&c| c == b'"')?;
    Some(start..start + len)
}

/// Reason phrase for a status code
pub fn status_text(code: u16) -> &'static str {
    match code {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        _ => "",
    }
}

/// Send a complete response: status line, `Content-Length`, the caller's
/// extra headers (each `\r\n`-terminated), a blank line, then the body
pub fn reply(c: &mut Connection, code: u16, extra_headers: &str, body: &str) {
    c.send_fmt(format_args!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n{}\r\n",
        code,
        status_text(code),
        body.len(),
        extra_headers
    ));
    c.send_bytes(body.as_bytes());
}

/// [`reply`] with a formatted body; the body is formatted first so its
/// length is exact
pub fn reply_fmt(c: &mut Connection, code: u16, extra_headers: &str, args: std::fmt::Arguments<'_>) {
    reply(c, code, extra_headers, &args.to_string());
}

/// Emit one chunk of a chunked response; close with a zero-length chunk
pub fn write_chunk(c: &mut Connection, data: &[u8]) {
    c.send_fmt(format_args!("{:x}\r\n", data.len()));
    c.send_bytes(data);
    c.send_bytes(b"\r\n");
}

pub fn printf_chunk(c: &mut Connection, args: std::fmt::Arguments<'_>) {
    write_chunk(c, args.to_string().as_bytes());
}

/// Request that the chunk just delivered via `HttpChunk` be dropped from
/// the receive buffer instead of assembled into the final message body.
/// Only meaningful inside an `HttpChunk` callback.
pub fn delete_chunk(c: &mut Connection) {
    c.delete_chunk = true;
}

/// Listen with the HTTP engine attached; accepted connections emit
/// `HttpMsg`/`HttpChunk`
pub fn listen(mgr: &mut Manager, url: &str, handler: EventFn) -> Result<u64, Error> {
    let id = mgr.listen(url, handler)?;
    if let Some(c) = mgr.conn_mut(id) {
        c.proto = Proto::Http(HttpState::default());
    }
    Ok(id)
}

/// Connect with the HTTP engine attached; send the request from the
/// `Connect` handler (`https://` URLs also need `tls_init` there)
pub fn connect(mgr: &mut Manager, url: &str, handler: EventFn) -> Result<u64, Error> {
    let id = mgr.connect(url, handler)?;
    if let Some(c) = mgr.conn_mut(id) {
        c.proto = Proto::Http(HttpState::default());
    }
    Ok(id)
}

/// Per-connection engine state
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct HttpState {
    /// Parsed header length of the in-flight message, 0 when between
    /// messages
    head_len: usize,
    body_len: usize,
    chunked: bool,
    till_close: bool,
    /// Chunked: where the next chunk header starts; doubles as the end of
    /// the assembled body since retained chunks are compacted in place
    scan: usize,
}

fn state(c: &Connection) -> HttpState {
    match c.proto {
        Proto::Http(s) => s,
        _ => HttpState::default(),
    }
}

fn set_state(c: &mut Connection, st: HttpState) {
    if let Proto::Http(ref mut s) = c.proto {
        *s = st;
    }
}

/// Protocol stage for HTTP connections
pub(crate) fn cb(mgr: &mut Manager, c: &mut Connection, ev: &Event) {
    match ev {
        Event::Read(_) => drive(mgr, c),
        Event::Close => {
            let st = state(c);
            if st.head_len > 0 && st.till_close {
                // body delimited by connection close
                if let Ok(Some(mut m)) = parse(c.recv.as_slice()) {
                    m.body = st.head_len..c.recv.len();
                    m.message = 0..c.recv.len();
                    mgr.deliver(c, &Event::HttpMsg(m));
                }
            }
        }
        _ => {}
    }
}

fn drive(mgr: &mut Manager, c: &mut Connection) {
    loop {
        if c.is_closing {
            return;
        }
        let mut st = state(c);
        let m = match parse(c.recv.as_slice()) {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                mgr.error(c, e.to_string());
                return;
            }
        };
        if st.head_len == 0 {
            st.head_len = m.head_len;
            st.body_len = m.body.len();
            st.chunked = m.kind == BodyKind::Chunked;
            st.till_close = m.kind == BodyKind::TillClose;
            st.scan = m.head_len;
            set_state(c, st);
        }
        if st.chunked {
            if !walk_chunks(mgr, c, &m) {
                return;
            }
        } else if st.till_close {
            return; // delivered at close
        } else {
            let total = st.head_len + st.body_len;
            if c.recv.len() < total {
                return;
            }
            mgr.deliver(c, &Event::HttpMsg(m));
            finish_message(mgr, c, total);
            if !matches!(c.proto, Proto::Http(_)) {
                return;
            }
        }
    }
}

/// Deliver complete chunks; returns false when out of data or the
/// connection is done
fn walk_chunks(mgr: &mut Manager, c: &mut Connection, m: &HttpMessage) -> bool {
    loop {
        if c.is_closing {
            return false;
        }
        let mut st = state(c);
        let (head, size) = match chunk_at(&c.recv.as_slice()[st.scan..]) {
            Ok(Some(x)) => x,
            Ok(None) => return false,
            Err(e) => {
                mgr.error(c, e.to_string());
                return false;
            }
        };
        let data_start = st.scan + head;
        let data_end = data_start + size;
        if c.recv.len() < data_end + 2 {
            return false;
        }
        if &c.recv.as_slice()[data_end..data_end + 2] != b"\r\n" {
            mgr.error(c, "bad chunk trailer");
            return false;
        }
        if size == 0 {
            // final chunk: strip its framing, deliver the assembled message
            c.recv.delete(st.scan, head + 2);
            let mut whole = m.clone();
            whole.body = st.head_len..st.scan;
            whole.message = 0..st.scan;
            let total = st.scan;
            mgr.deliver(c, &Event::HttpMsg(whole));
            finish_message(mgr, c, total);
            return matches!(c.proto, Proto::Http(_)) && !c.is_closing;
        }
        let mut chunk = m.clone();
        chunk.body = data_start..data_end;
        c.delete_chunk = false;
        mgr.deliver(c, &Event::HttpChunk(chunk));
        if c.delete_chunk {
            c.delete_chunk = false;
            c.recv.delete(st.scan, head + size + 2);
        } else {
            // compact: drop the framing, keep the data in place
            c.recv.delete(data_end, 2);
            c.recv.delete(st.scan, head);
            st.scan += size;
        }
        set_state(c, st);
    }
}

/// Consume a delivered message and reset for the next one on the wire
fn finish_message(mgr: &mut Manager, c: &mut Connection, total: usize) {
    set_state(c, HttpState::default());
    c.recv.delete(0, total);
    if !matches!(c.proto, Proto::Http(_)) && c.recv.len() > 0 {
        // upgraded mid-buffer (WebSocket): hand the remainder to the new
        // engine
        ws::cb(mgr, c, &Event::Read(0));
    }
}

/// Parse a chunk-size line: returns (header length incl CRLF, chunk size)
fn chunk_at(buf: &[u8]) -> Result<Option<(usize, usize)>, ParseError> {
    let mut size = 0usize;
    let mut digits = 0;
    let mut i = 0;
    while i < buf.len() {
        match hex_val(buf[i]) {
            Some(v) => {
                size = size << 4 | v as usize;
                digits += 1;
                if digits > 8 {
                    return Err(ParseError::Malformed);
                }
                i += 1;
            }
            None => break,
        }
    }
    if digits == 0 {
        return if buf.is_empty() {
            Ok(None)
        } else {
            Err(ParseError::Malformed)
        };
    }
    // tolerate chunk extensions up to the CRLF
    while i < buf.len() && buf[i] != b'\r' && buf[i] != b'\n' {
        i += 1;
    }
    if i + 1 >= buf.len() {
        return Ok(None);
    }
    if buf[i] != b'\r' || buf[i + 1] != b'\n' {
        return Err(ParseError::Malformed);
    }
    Ok(Some((i + 2, size)))
}

/// Static file serving options
#[derive(Clone, Default)]
pub struct ServeOpts {
    pub root_dir: String,
    /// Extra response headers, each `\r\n`-terminated
    pub extra_headers: String,
    /// Extension → MIME type overrides, consulted before the builtin map
    pub mime_types: Vec<(String, String)>,
    /// Filesystem backend; the host filesystem when unset
    pub fs: Option<Rc<dyn Fs>>,
}

const BUILTIN_MIME: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css"),
    ("js", "text/javascript"),
    ("json", "application/json"),
    ("txt", "text/plain; charset=utf-8"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("svg", "image/svg+xml"),
    ("ico", "image/x-icon"),
    ("pdf", "application/pdf"),
    ("mp3", "audio/mpeg"),
    ("mp4", "video/mp4"),
    ("wasm", "application/wasm"),
    ("xml", "text/xml"),
    ("zip", "application/zip"),
    ("gz", "application/gzip"),
    ("csv", "text/csv"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

fn guess_mime<'a>(path: &str, opts: &'a ServeOpts) -> &'a str {
    let ext = path.rsplit('.').next().unwrap_or("");
    for (e, t) in &opts.mime_types {
        if e.eq_ignore_ascii_case(ext) {
            return t;
        }
    }
    for (e, t) in BUILTIN_MIME {
        if e.eq_ignore_ascii_case(ext) {
            return t;
        }
    }
    "application/octet-stream"
}

/// Serve the request's URI out of `opts.root_dir`; directories resolve to
/// `index.html`
pub fn serve_dir(c: &mut Connection, m: &HttpMessage, opts: &ServeOpts) {
    let uri = match url_decode(&c.recv.as_slice()[m.uri.clone()]) {
        Some(u) => u,
        None => return reply(c, 400, "", "bad uri\n"),
    };
    if uri.split('/').any(|seg| seg == "..") {
        return reply(c, 400, "", "bad uri\n");
    }
    let path = format!("{}/{}", opts.root_dir, uri.trim_start_matches('/'));
    serve_file(c, m, &path, opts);
}

/// Serve one file, honoring `If-None-Match` and single `Range: bytes=a-b`
/// requests
pub fn serve_file(c: &mut Connection, m: &HttpMessage, path: &str, opts: &ServeOpts) {
    let std_fs = StdFs;
    let fs: &dyn Fs = opts.fs.as_deref().unwrap_or(&std_fs);
    let mut path = path.to_owned();
    let mut st = match fs.stat(&path) {
        Some(st) => st,
        None => return reply(c, 404, "", "not found\n"),
    };
    if st.is_dir {
        path = format!("{}/index.html", path.trim_end_matches('/'));
        st = match fs.stat(&path) {
            Some(st) => st,
            None => return reply(c, 404, "", "not found\n"),
        };
    }
    let etag = format!("W/\"{}.{}\"", st.size, st.mtime);
    // everything needed from the request, before touching the send queue
    let buf = c.recv.as_slice();
    let inm_match = m.header(buf, "If-None-Match") == Some(etag.as_bytes());
    let range = m
        .header(buf, "Range")
        .filter(|h| h.starts_with(b"bytes="))
        .map(|h| parse_range(h, st.size));
    let head_only = &buf[m.method.clone()] == b"HEAD";

    if inm_match {
        c.send_fmt(format_args!(
            "HTTP/1.1 304 Not Modified\r\nETag: {}\r\n{}Content-Length: 0\r\n\r\n",
            etag, opts.extra_headers
        ));
        return;
    }
    let (status, start, len) = match range {
        None => (200, 0, st.size),
        Some(Some((start, len))) => (206, start, len),
        Some(None) => {
            c.send_fmt(format_args!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{}\r\nContent-Length: 0\r\n\r\n",
                st.size
            ));
            return;
        }
    };
    let mut file = match fs.open(&path, false) {
        Ok(f) => f,
        Err(_) => return reply(c, 404, "", "not found\n"),
    };
    if start > 0 && file.seek(start).is_err() {
        return reply(c, 500, "", "seek failed\n");
    }
    debug!(id = c.id(), path, status, "serving");
    c.send_fmt(format_args!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\nContent-Type: {}\r\nETag: {}\r\n",
        status,
        status_text(status),
        len,
        guess_mime(&path, opts),
        etag
    ));
    if status == 206 {
        c.send_fmt(format_args!(
            "Content-Range: bytes {}-{}/{}\r\n",
            start,
            start + len.saturating_sub(1),
            st.size
        ));
    }
    c.send_fmt(format_args!("{}\r\n", opts.extra_headers));
    if head_only {
        return;
    }
    let mut remaining = len;
    let mut chunk = vec![0u8; 16 * 1024];
    while remaining > 0 {
        let want = remaining.min(chunk.len() as u64) as usize;
        match file.read(&mut chunk[..want]) {
            Ok(0) => break,
            Ok(n) => {
                c.send_bytes(&chunk[..n]);
                remaining -= n as u64;
            }
            Err(_) => break,
        }
    }
}

/// `bytes=a-b` | `bytes=a-` | `bytes=-suffix`; `Some(None)` upstream means
/// unsatisfiable, a plain `None` from the caller's map means no header
fn parse_range(h: &[u8], size: u64) -> Option<(u64, u64)> {
    let expr = h.strip_prefix(b"bytes=")?;
    let dash = expr.iter().position(|&c| c == b'-')?;
    let (a, b) = (&expr[..dash], &expr[dash + 1..]);
    let parse = |s: &[u8]| -> Option<u64> {
        if s.is_empty() || !s.iter().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let mut n: u64 = 0;
        for &c in s {
            n = n.checked_mul(10)?.checked_add((c - b'0') as u64)?;
        }
        Some(n)
    };
    if a.is_empty() {
        // suffix form
        let suffix = parse(b)?;
        if suffix == 0 {
            return None;
        }
        let start = size.saturating_sub(suffix);
        return Some((start, size - start));
    }
    let start = parse(a)?;
    if start >= size {
        return None;
    }
    let end = if b.is_empty() {
        size - 1
    } else {
        parse(b)?.min(size - 1)
    };
    if end < start {
        return None;
    }
    Some((start, end - start + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_accepts_both_line_endings() {
        assert_eq!(request_len(b"GET / HTTP/1.0\n\n"), Ok(Some(16)));
        assert_eq!(request_len(b"GET / HTTP/1.0\r\n\r\n"), Ok(Some(18)));
        assert_eq!(request_len(b"GET / HTTP/1.0\r\n"), Ok(None));
        assert_eq!(request_len(b""), Ok(None));
        assert!(request_len(b"GET \x01/ HTTP/1.0\r\n\r\n").is_err());
    }

    #[test]
    fn parses_request_line_and_query() {
        let buf = b"GET /x?y=1 HTTP/1.1\r\nHost: h\r\n\r\n";
        let m = parse(buf).unwrap().unwrap();
        assert_eq!(&buf[m.method.clone()], b"GET");
        assert_eq!(&buf[m.uri.clone()], b"/x");
        assert_eq!(&buf[m.query.clone()], b"y=1");
        assert_eq!(&buf[m.proto.clone()], b"HTTP/1.1");
        assert_eq!(m.header(buf, "host"), Some(&b"h"[..]));
        assert!(!m.is_response(buf));
        assert_eq!(m.body.len(), 0);
    }

    #[test]
    fn parses_response_and_status() {
        let buf = b"HTTP/1.1 404 Not Found\r\nContent-Length: 2\r\n\r\nno";
        let m = parse(buf).unwrap().unwrap();
        assert!(m.is_response(buf));
        assert_eq!(m.status(buf), 404);
        assert_eq!(&buf[m.body.clone()], b"no");
        assert_eq!(m.kind, BodyKind::Known);
    }

    #[test]
    fn response_without_length_reads_till_close() {
        let buf = b"HTTP/1.0 200 OK\r\n\r\nstreaming";
        let m = parse(buf).unwrap().unwrap();
        assert_eq!(m.kind, BodyKind::TillClose);
    }

    #[test]
    fn chunked_wins_over_content_length() {
        let buf = b"POST /u HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n";
        let m = parse(buf).unwrap().unwrap();
        assert_eq!(m.kind, BodyKind::Chunked);
    }

    #[test]
    fn header_cap_drops_extras_silently() {
        let mut req = String::from("GET / HTTP/1.1\r\n");
        for i in 0..MAX_HEADERS + 5 {
            req.push_str(&format!("X-H{i}: v\r\n"));
        }
        req.push_str("\r\n");
        let m = parse(req.as_bytes()).unwrap().unwrap();
        assert_eq!(m.headers.len(), MAX_HEADERS);
    }

    #[test]
    fn reserialized_message_reparses_identically() {
        let buf: &[u8] = b"POST /submit?a=b HTTP/1.1\r\nHost: x\r\nContent-Length: 3\r\n\r\nabc";
        let m = parse(buf).unwrap().unwrap();
        // rebuild from the parsed views
        let rebuilt = format!(
            "{} {}?{} {}\r\nHost: {}\r\nContent-Length: {}\r\n\r\n{}",
            String::from_utf8_lossy(&buf[m.method.clone()]),
            String::from_utf8_lossy(&buf[m.uri.clone()]),
            String::from_utf8_lossy(&buf[m.query.clone()]),
            String::from_utf8_lossy(&buf[m.proto.clone()]),
            String::from_utf8_lossy(m.header(buf, "Host").unwrap()),
            m.body.len(),
            String::from_utf8_lossy(&buf[m.body.clone()]),
        );
        let m2 = parse(rebuilt.as_bytes()).unwrap().unwrap();
        assert_eq!(&rebuilt.as_bytes()[m2.method.clone()], &buf[m.method]);
        assert_eq!(&rebuilt.as_bytes()[m2.uri.clone()], &buf[m.uri]);
        assert_eq!(&rebuilt.as_bytes()[m2.body.clone()], &buf[m.body]);
    }

    #[test]
    fn malformed_headers_rejected() {
        assert!(parse(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n").is_err());
        assert!(parse(b"GET / HTTP/1.1\r\nBad Name: v\r\n\r\n").is_err());
        assert!(parse(b"GET /\r\n\r\n").is_err()); // missing protocol token
        assert!(parse(b"GET / HTTP/1.1\r\nContent-Length: 12x\r\n\r\n").is_err());
    }

    #[test]
    fn chunk_size_lines() {
        assert_eq!(chunk_at(b"3\r\nabc"), Ok(Some((3, 3))));
        assert_eq!(chunk_at(b"1A;ext=1\r\n"), Ok(Some((10, 26))));
        assert_eq!(chunk_at(b"0\r\n\r\n"), Ok(Some((3, 0))));
        assert_eq!(chunk_at(b"3"), Ok(None));
        assert_eq!(chunk_at(b""), Ok(None));
        assert!(chunk_at(b"zz\r\n").is_err());
    }

    #[test]
    fn vars_and_decoding() {
        assert_eq!(var(b"a=1&b=hello+world%21", "b").as_deref(), Some("hello world!"));
        assert_eq!(var(b"a=1", "missing"), None);
        assert_eq!(url_decode(b"%4a%6F%65"), Some("Joe".into()));
        assert_eq!(url_decode(b"%zz"), None);
    }

    #[test]
    fn credential_precedence() {
        let basic = b"GET / HTTP/1.1\r\nAuthorization: Basic am9lOnNlY3JldA==\r\n\r\n";
        let m = parse(basic).unwrap().unwrap();
        assert_eq!(credentials(basic, &m), ("joe".into(), "secret".into()));

        let bearer = b"GET / HTTP/1.1\r\nAuthorization: Bearer tok123\r\n\r\n";
        let m = parse(bearer).unwrap().unwrap();
        assert_eq!(credentials(bearer, &m), ("".into(), "tok123".into()));

        let cookie = b"GET / HTTP/1.1\r\nCookie: sid=1; access_token=ck\r\n\r\n";
        let m = parse(cookie).unwrap().unwrap();
        assert_eq!(credentials(cookie, &m), ("".into(), "ck".into()));

        let query = b"GET /?access_token=qt HTTP/1.1\r\n\r\n";
        let m = parse(query).unwrap().unwrap();
        assert_eq!(credentials(query, &m), ("".into(), "qt".into()));

        let none = b"GET / HTTP/1.1\r\n\r\n";
        let m = parse(none).unwrap().unwrap();
        assert_eq!(credentials(none, &m), ("".into(), "".into()));
    }

    #[test]
    fn glob_wildcards() {
        assert!(glob_match("/api/*", "/api/users"));
        assert!(!glob_match("/api/*", "/api/users/7"));
        assert!(glob_match("/api/#", "/api/users/7"));
        assert!(glob_match("/file-?.txt", "/file-a.txt"));
        assert!(!glob_match("/file-?.txt", "/file-ab.txt"));
        assert!(glob_match("#.js", "/static/app.js"));
        assert!(!glob_match("/exact", "/exact/no"));
        assert!(glob_match("", ""));
    }

    #[test]
    fn multipart_walk() {
        let body: &[u8] = b"--xyz\r\n\
            Content-Disposition: form-data; name=\"f1\"\r\n\r\n\
            value1\r\n\
            --xyz\r\n\
            Content-Disposition: form-data; name=\"up\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file data\r\n\
            --xyz--\r\n";
        let (ofs, p1) = next_multipart(body, 0).unwrap();
        assert_eq!(&body[p1.name.clone()], b"f1");
        assert_eq!(&body[p1.body.clone()], b"value1");
        assert!(p1.filename.is_empty());
        let (ofs2, p2) = next_multipart(body, ofs).unwrap();
        assert_eq!(&body[p2.name.clone()], b"up");
        assert_eq!(&body[p2.filename.clone()], b"a.txt");
        assert_eq!(&body[p2.body.clone()], b"file data");
        assert!(next_multipart(body, ofs2).is_none());
    }

    #[test]
    fn range_parsing() {
        assert_eq!(parse_range(b"bytes=0-4", 10), Some((0, 5)));
        assert_eq!(parse_range(b"bytes=5-", 10), Some((5, 5)));
        assert_eq!(parse_range(b"bytes=-3", 10), Some((7, 3)));
        assert_eq!(parse_range(b"bytes=4-2", 10), None);
        assert_eq!(parse_range(b"bytes=10-", 10), None);
        assert_eq!(parse_range(b"chars=0-1", 10), None);
        // end clamps to the file size
        assert_eq!(parse_range(b"bytes=8-99", 10), Some((8, 2)));
    }

    #[test]
    fn reply_shape() {
        // formatted exactly as the wire contract requires
        let mut out = String::new();
        std::fmt::write(
            &mut out,
            format_args!(
                "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n{}\r\n{}",
                200,
                status_text(200),
                2,
                "X-Extra: 1\r\n",
                "ok"
            ),
        )
        .unwrap();
        assert_eq!(
            out,
            "HTTP/1.1 200 OK\r\nContent-Length: 2\r\nX-Extra: 1\r\n\r\nok"
        );
    }
}
