//! RFC 6455 client role: upgrade handshake and frame codec.

use base64::Engine;
use deck_util::{Blob, BlobError};

use crate::http::parse_response_head;

pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Responses larger than this without a complete head are rejected.
pub const MAX_HANDSHAKE_BYTES: usize = 2048;

pub const OP_CONTINUATION: u8 = 0x0;
pub const OP_TEXT: u8 = 0x1;
pub const OP_BINARY: u8 = 0x2;
pub const OP_CLOSE: u8 = 0x8;
pub const OP_PING: u8 = 0x9;
pub const OP_PONG: u8 = 0xa;

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_PROTOCOL_ERROR: u16 = 1002;
pub const CLOSE_NO_STATUS: u16 = 1005;
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_MESSAGE_TOO_LARGE: u16 = 1009;

/// base64 of 16 random bytes.
pub fn generate_key() -> Result<String, BlobError> {
    Ok(Blob::random(16)?.to_base64())
}

pub fn accept_key(key_b64: &str) -> String {
    let mut material = Blob::from_slice(key_b64.as_bytes());
    material.append(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(material.sha1())
}

pub fn random_mask() -> Result<[u8; 4], BlobError> {
    let blob = Blob::random(4)?;
    let mut mask = [0u8; 4];
    mask.copy_from_slice(&blob);
    Ok(mask)
}

pub fn build_handshake(
    host: &str,
    port: u16,
    path: &str,
    key_b64: &str,
    protocols: Option<&str>,
) -> String {
    let mut req = format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}:{port}\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Version: 13\r\n\
         Sec-WebSocket-Key: {key_b64}\r\n"
    );
    if let Some(p) = protocols.filter(|p| !p.is_empty()) {
        req.push_str(&format!("Sec-WebSocket-Protocol: {p}\r\n"));
    }
    req.push_str("\r\n");
    req
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeResult {
    Incomplete,
    Accepted {
        protocol: Option<String>,
        consumed: usize,
    },
    Rejected(String),
}

pub fn verify_handshake_response(buf: &[u8], key_b64: &str) -> HandshakeResult {
    let head = match parse_response_head(buf) {
        Ok(Some(head)) => head,
        Ok(None) if buf.len() > MAX_HANDSHAKE_BYTES => {
            return HandshakeResult::Rejected("Websocket upgrade failed".to_string())
        }
        Ok(None) => return HandshakeResult::Incomplete,
        Err(e) => return HandshakeResult::Rejected(e),
    };

    if head.code != 101 {
        return HandshakeResult::Rejected(format!(
            "Websocket upgrade failed: {} {}",
            head.code, head.reason
        ));
    }
    let header_is = |name: &str, want: &str| {
        head.header(name)
            .map(|v| v.eq_ignore_ascii_case(want))
            .unwrap_or(false)
    };
    if !header_is("Connection", "upgrade") {
        return HandshakeResult::Rejected("Websocket upgrade failed: bad Connection header".to_string());
    }
    if !header_is("Upgrade", "websocket") {
        return HandshakeResult::Rejected("Websocket upgrade failed: bad Upgrade header".to_string());
    }
    if head.header("Sec-WebSocket-Accept") != Some(accept_key(key_b64).as_str()) {
        return HandshakeResult::Rejected("Websocket upgrade failed: bad Sec-WebSocket-Accept".to_string());
    }

    HandshakeResult::Accepted {
        protocol: head
            .header("Sec-WebSocket-Protocol")
            .map(str::to_string),
        consumed: head.body_start,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: u8,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameParse {
    Incomplete,
    Frame { frame: Frame, consumed: usize },
    /// The connection must be closed with `code`.
    Error { code: u16, reason: String },
}

pub fn parse_frame(buf: &[u8]) -> FrameParse {
    if buf.len() < 2 {
        return FrameParse::Incomplete;
    }
    let fin = buf[0] & 0x80 != 0;
    if buf[0] & 0x70 != 0 {
        return FrameParse::Error {
            code: CLOSE_PROTOCOL_ERROR,
            reason: "reserved bits set".to_string(),
        };
    }
    let opcode = buf[0] & 0x0f;
    if !matches!(opcode, OP_CONTINUATION | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG) {
        return FrameParse::Error {
            code: CLOSE_PROTOCOL_ERROR,
            reason: format!("unknown opcode {opcode:#x}"),
        };
    }
    let masked = buf[1] & 0x80 != 0;

    let mut pos = 2;
    let len = match buf[1] & 0x7f {
        127 => {
            return FrameParse::Error {
                code: CLOSE_MESSAGE_TOO_LARGE,
                reason: "message too large".to_string(),
            }
        }
        126 => {
            if buf.len() < 4 {
                return FrameParse::Incomplete;
            }
            pos = 4;
            u16::from_be_bytes([buf[2], buf[3]]) as usize
        }
        n => n as usize,
    };

    let mut mask = [0u8; 4];
    if masked {
        if buf.len() < pos + 4 {
            return FrameParse::Incomplete;
        }
        mask.copy_from_slice(&buf[pos..pos + 4]);
        pos += 4;
    }
    if buf.len() < pos + len {
        return FrameParse::Incomplete;
    }

    let mut payload = buf[pos..pos + len].to_vec();
    if masked {
        apply_mask(&mut payload, mask);
    }
    FrameParse::Frame {
        frame: Frame {
            fin,
            opcode,
            payload,
        },
        consumed: pos + len,
    }
}

pub fn apply_mask(data: &mut [u8], mask: [u8; 4]) {
    for (i, b) in data.iter_mut().enumerate() {
        *b ^= mask[i % 4];
    }
}

/// Encodes a single FIN frame in the client role (always masked).
pub fn encode_frame(opcode: u8, payload: &[u8], mask: [u8; 4]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    out.push(0x80 | (opcode & 0x0f));
    match payload.len() {
        n if n < 126 => out.push(0x80 | n as u8),
        n if n <= u16::MAX as usize => {
            out.push(0x80 | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(0x80 | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    out.extend_from_slice(&mask);
    let start = out.len();
    out.extend_from_slice(payload);
    apply_mask(&mut out[start..], mask);
    out
}

pub fn encode_close(code: u16, reason: &str, mask: [u8; 4]) -> Vec<u8> {
    let mut payload = code.to_be_bytes().to_vec();
    payload.extend_from_slice(reason.as_bytes());
    encode_frame(OP_CLOSE, &payload, mask)
}

/// Extracts the status code and reason from a close payload.
pub fn parse_close_payload(payload: &[u8]) -> (u16, String) {
    if payload.len() < 2 {
        return (CLOSE_NO_STATUS, String::new());
    }
    let code = u16::from_be_bytes([payload[0], payload[1]]);
    (code, String::from_utf8_lossy(&payload[2..]).into_owned())
}

/// Reassembles fragmented data frames.
#[derive(Debug, Default)]
pub struct MessageAssembler {
    opcode: Option<u8>,
    data: Vec<u8>,
}

impl MessageAssembler {
    /// Feeds one data frame (opcode 0, 1 or 2). Returns the complete message
    /// once a FIN frame arrives.
    pub fn push(&mut self, frame: Frame) -> Result<Option<(u8, Vec<u8>)>, String> {
        match (frame.opcode, self.opcode) {
            (OP_CONTINUATION, None) => return Err("continuation without a message".to_string()),
            (OP_CONTINUATION, Some(_)) => {}
            (op, None) => self.opcode = Some(op),
            (_, Some(_)) => return Err("new message before previous finished".to_string()),
        }
        self.data.extend_from_slice(&frame.payload);
        if !frame.fin {
            return Ok(None);
        }
        let opcode = self.opcode.take().unwrap_or(OP_TEXT);
        Ok(Some((opcode, std::mem::take(&mut self.data))))
    }

    pub fn reset(&mut self) {
        self.opcode = None;
        self.data.clear();
    }
}
