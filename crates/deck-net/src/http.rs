//! HTTP/1.1 message helpers: client request composition and
//! Content-Length framed response assembly.

pub const USER_AGENT: &str = "Deck-Assistant";
pub const MIME_TEXT: &str = "text/plain; charset=UTF-8";
pub const MIME_JSON: &str = "application/json; charset=UTF-8";

pub const ERR_EOF_BEFORE_FINISHED: &str = "EOF before response finished";
pub const ERR_INVALID_CONTENT_LENGTH: &str = "Invalid Content-Length in response";

/// Status line plus headers of a response; `body_start` indexes the first
/// byte after the blank line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
    pub body_start: usize,
}

impl ResponseHead {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(name))
        .map(|(_, v)| v.as_str())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Parses the head of a response. `Ok(None)` means the blank line has not
/// arrived yet.
pub fn parse_response_head(buf: &[u8]) -> Result<Option<ResponseHead>, String> {
    let Some(end) = find_subslice(buf, b"\r\n\r\n") else {
        return Ok(None);
    };
    let head = std::str::from_utf8(&buf[..end])
        .map_err(|_| "response head is not valid UTF-8".to_string())?;
    let mut lines = head.split("\r\n");
    let status = lines.next().unwrap_or_default();

    let mut parts = status.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(format!("malformed status line {status:?}"));
    }
    let code = parts
        .next()
        .and_then(|c| c.trim().parse::<u16>().ok())
        .ok_or_else(|| format!("malformed status line {status:?}"))?;
    let reason = parts.next().unwrap_or_default().trim().to_string();

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some((name, value)) = line.split_once(':') else {
            return Err(format!("malformed header line {line:?}"));
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(ResponseHead {
        version: version.to_string(),
        code,
        reason,
        headers,
        body_start: end + 4,
    }))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub code: u16,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn ok(&self) -> bool {
        self.code < 400
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseProgress {
    Incomplete,
    Complete {
        response: HttpResponse,
        consumed: usize,
    },
    Failed(String),
}

/// Decides whether `buf` holds a full response. With a Content-Length the
/// body is exactly that many bytes; without one the body runs to EOF.
pub fn assemble_response(buf: &[u8], eof: bool) -> ResponseProgress {
    let head = match parse_response_head(buf) {
        Ok(Some(head)) => head,
        Ok(None) if eof => return ResponseProgress::Failed(ERR_EOF_BEFORE_FINISHED.to_string()),
        Ok(None) => return ResponseProgress::Incomplete,
        Err(e) => return ResponseProgress::Failed(e),
    };
    let available = buf.len() - head.body_start;

    let body_len = match head.header("Content-Length") {
        Some(raw) => match raw.trim().parse::<usize>() {
            Ok(n) => n,
            Err(_) => return ResponseProgress::Failed(ERR_INVALID_CONTENT_LENGTH.to_string()),
        },
        None if eof => available,
        None => return ResponseProgress::Incomplete,
    };

    if available < body_len {
        return if eof {
            ResponseProgress::Failed(ERR_EOF_BEFORE_FINISHED.to_string())
        } else {
            ResponseProgress::Incomplete
        };
    }

    let body = buf[head.body_start..head.body_start + body_len].to_vec();
    ResponseProgress::Complete {
        consumed: head.body_start + body_len,
        response: HttpResponse {
            code: head.code,
            headers: head.headers,
            body,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestBody<'a> {
    Empty,
    Text(&'a [u8]),
    Json(&'a [u8]),
}

impl RequestBody<'_> {
    fn bytes(&self) -> &[u8] {
        match self {
            RequestBody::Empty => &[],
            RequestBody::Text(b) | RequestBody::Json(b) => b,
        }
    }

    fn mime(&self) -> Option<&'static str> {
        match self {
            RequestBody::Empty => None,
            RequestBody::Text(_) => Some(MIME_TEXT),
            RequestBody::Json(_) => Some(MIME_JSON),
        }
    }
}

/// Joins the connector base path with a request path, collapsing the
/// duplicate slash at the seam.
pub fn join_paths(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

pub fn compose_request(
    method: &str,
    host_header: &str,
    base_path: &str,
    path: &str,
    headers: &[(String, String)],
    body: RequestBody<'_>,
) -> Vec<u8> {
    let mut out = String::new();
    out.push_str(method);
    out.push(' ');
    out.push_str(&join_paths(base_path, path));
    out.push_str(" HTTP/1.1\r\n");
    push_header(&mut out, "Host", host_header);
    push_header(&mut out, "User-Agent", USER_AGENT);
    push_header(&mut out, "Cache-Control", "no-cache");
    push_header(&mut out, "Connection", "keep-alive");

    let mut seen_content_type = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("Content-Length") {
            continue;
        }
        if name.eq_ignore_ascii_case("Content-Type") {
            if seen_content_type {
                continue;
            }
            seen_content_type = true;
        }
        push_header(&mut out, name, value);
    }
    if !seen_content_type {
        if let Some(mime) = body.mime() {
            push_header(&mut out, "Content-Type", mime);
        }
    }
    let bytes = body.bytes();
    push_header(&mut out, "Content-Length", &bytes.len().to_string());
    out.push_str("\r\n");

    let mut payload = out.into_bytes();
    payload.extend_from_slice(bytes);
    payload
}

fn push_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_length_frames_the_body() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-A: b\r\n\r\nhello extra";
        match assemble_response(raw, false) {
            ResponseProgress::Complete { response, consumed } => {
                assert!(response.ok());
                assert_eq!(response.body, b"hello");
                assert_eq!(response.header("x-a"), Some("b"));
                assert_eq!(consumed, raw.len() - " extra".len());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn partial_body_waits_then_fails_on_eof() {
        let raw = b"HTTP/1.1 404 Not Found\r\nContent-Length: 10\r\n\r\nabc";
        assert_eq!(assemble_response(raw, false), ResponseProgress::Incomplete);
        assert_eq!(
            assemble_response(raw, true),
            ResponseProgress::Failed(ERR_EOF_BEFORE_FINISHED.to_string())
        );
    }

    #[test]
    fn missing_content_length_needs_eof() {
        let raw = b"HTTP/1.0 500 Boom\r\n\r\nall of it";
        assert_eq!(assemble_response(raw, false), ResponseProgress::Incomplete);
        match assemble_response(raw, true) {
            ResponseProgress::Complete { response, .. } => {
                assert!(!response.ok());
                assert_eq!(response.code, 500);
                assert_eq!(response.body, b"all of it");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn invalid_content_length_fails() {
        let raw = b"HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n";
        assert_eq!(
            assemble_response(raw, false),
            ResponseProgress::Failed(ERR_INVALID_CONTENT_LENGTH.to_string())
        );
        assert!(matches!(
            assemble_response(b"SSH-2.0\r\n\r\n", false),
            ResponseProgress::Failed(_)
        ));
    }

    #[test]
    fn request_headers_and_body() {
        let headers = vec![
            ("X-Token".to_string(), "t".to_string()),
            ("content-type".to_string(), "text/csv".to_string()),
            ("Content-Type".to_string(), "ignored".to_string()),
        ];
        let req = compose_request(
            "POST",
            "api.example:8080",
            "/v1/",
            "/items",
            &headers,
            RequestBody::Text(b"a,b"),
        );
        let text = String::from_utf8(req).unwrap();
        assert!(text.starts_with("POST /v1/items HTTP/1.1\r\nHost: api.example:8080\r\n"));
        assert!(text.contains("User-Agent: Deck-Assistant\r\n"));
        assert!(text.contains("X-Token: t\r\n"));
        assert!(text.contains("content-type: text/csv\r\n"));
        assert!(!text.contains("ignored"));
        assert!(text.ends_with("Content-Length: 3\r\n\r\na,b"));
    }

    #[test]
    fn json_body_gets_json_content_type() {
        let req = compose_request("POST", "h", "/", "x", &[], RequestBody::Json(b"{}"));
        let text = String::from_utf8(req).unwrap();
        assert!(text.contains(&format!("Content-Type: {MIME_JSON}\r\n")));
        let get = compose_request("GET", "h", "", "", &[], RequestBody::Empty);
        let get = String::from_utf8(get).unwrap();
        assert!(get.starts_with("GET / HTTP/1.1\r\n"));
        assert!(!get.contains("Content-Type"));
    }
}
