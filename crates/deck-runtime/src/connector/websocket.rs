use mlua::{AnyUserData, Lua, Table, Value};

use deck_net::websocket::{
    self as ws, FrameParse, HandshakeResult, MessageAssembler, CLOSE_ABNORMAL, CLOSE_NORMAL,
    CLOSE_PROTOCOL_ERROR, OP_BINARY, OP_CLOSE, OP_PING, OP_PONG, OP_TEXT,
};
use deck_net::{Socket, SocketState, TlsMode};
use deck_util::Url;

use super::{bool_arg, lua_bytes, port_arg, string_arg, Backoff, Connector, ConnectorBase, Events};
use crate::bridge::{self, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};

const READ_CHUNK: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    Disconnected,
    Connecting,
    Handshaking,
    Connected,
}

pub struct WebsocketConnector {
    base: ConnectorBase,
    url: Url,
    insecure: bool,
    protocols: String,
    protocol: Option<String>,
    socket: Socket,
    state: WsState,
    key: String,
    inbuf: Vec<u8>,
    assembler: MessageAssembler,
    close_sent: bool,
    close_code: u16,
    backoff: Backoff,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, WebsocketConnector::new(name))
}

impl WebsocketConnector {
    pub fn new(name: &str) -> Self {
        WebsocketConnector {
            base: ConnectorBase::new(name),
            url: Url::new("ws"),
            insecure: false,
            protocols: String::new(),
            protocol: None,
            socket: Socket::new(),
            state: WsState::Disconnected,
            key: String::new(),
            inbuf: Vec::new(),
            assembler: MessageAssembler::default(),
            close_sent: false,
            close_code: CLOSE_NORMAL,
            backoff: Backoff::default(),
        }
    }

    fn tls_mode(&self) -> TlsMode {
        match (self.url.is_secure(), self.insecure) {
            (false, _) => TlsMode::None,
            (true, false) => TlsMode::Verify,
            (true, true) => TlsMode::NoVerify,
        }
    }

    /// Drops the connection so the next tick reconnects with new settings.
    fn reset_connection(&mut self) {
        self.socket.close();
        self.state = WsState::Disconnected;
        self.inbuf.clear();
        self.assembler.reset();
        self.backoff.reset();
    }

    fn send_frame(&mut self, opcode: u8, payload: &[u8]) -> bool {
        if self.state != WsState::Connected {
            return false;
        }
        let mask = match ws::random_mask() {
            Ok(mask) => mask,
            Err(e) => {
                self.base.set_error(e.to_string());
                return false;
            }
        };
        match self.socket.write(&ws::encode_frame(opcode, payload, mask)) {
            Ok(()) => true,
            Err(e) => {
                self.base.set_error(e.to_string());
                false
            }
        }
    }

    fn send_close(&mut self, code: u16, reason: &str) {
        if self.close_sent || self.state != WsState::Connected {
            return;
        }
        self.close_sent = true;
        let sent = match ws::random_mask() {
            Ok(mask) => self
                .socket
                .write(&ws::encode_close(code, reason, mask))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        if let Err(e) = sent {
            tracing::warn!(connector = %self.base.name, code, error = %e, "websocket close frame not sent");
            self.base.set_error(e);
        }
    }

    fn connect_failed(&mut self, lua: &Lua, clock: i64, reason: String, events: &mut Events) -> LuaResult<()> {
        tracing::info!(connector = %self.base.name, url = self.url.connection_string(), error = %reason, "websocket connect failed");
        self.socket.close();
        self.state = WsState::Disconnected;
        self.base.set_error(reason.clone());
        self.backoff.failed(clock);
        events.push("on_connect_failed", vec![lua_bytes(lua, reason.as_bytes())?]);
        Ok(())
    }

    fn disconnected(&mut self, lua: &Lua, clock: i64, code: u16, reason: &str, events: &mut Events) -> LuaResult<()> {
        tracing::info!(connector = %self.base.name, code, reason, "websocket disconnected");
        self.socket.shutdown();
        self.state = WsState::Disconnected;
        self.inbuf.clear();
        self.assembler.reset();
        self.backoff.disconnected(clock);
        events.push(
            "on_disconnect",
            vec![Value::Integer(code as i64), lua_bytes(lua, reason.as_bytes())?],
        );
        Ok(())
    }

    /// Reads everything available. Returns false when the socket dropped.
    fn fill_inbuf(&mut self) -> bool {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.socket.read_nonblock(&mut chunk) {
                Ok(0) => return true,
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    self.base.set_error(e.to_string());
                    return false;
                }
            }
        }
    }

    fn poll_connecting(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        let state = match self.socket.state() {
            SocketState::TlsHandshaking => self.socket.tls_handshake(),
            other => other,
        };
        match state {
            SocketState::Connecting | SocketState::TlsHandshaking => Ok(()),
            SocketState::Disconnected => {
                let reason = self.socket.last_error();
                self.connect_failed(lua, clock, reason, events)
            }
            SocketState::Connected => {
                self.key = ws::generate_key().map_err(|e| DeckError::Io(e.to_string()))?;
                let protocols = Some(self.protocols.as_str()).filter(|p| !p.is_empty());
                let request = ws::build_handshake(
                    self.url.host(),
                    self.url.port(),
                    self.url.path(),
                    &self.key,
                    protocols,
                );
                if let Err(e) = self.socket.write(request.as_bytes()) {
                    return self.connect_failed(lua, clock, e.to_string(), events);
                }
                self.inbuf.clear();
                self.state = WsState::Handshaking;
                Ok(())
            }
        }
    }

    fn poll_handshake(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        let alive = self.fill_inbuf();
        match ws::verify_handshake_response(&self.inbuf, &self.key) {
            HandshakeResult::Incomplete if alive => Ok(()),
            HandshakeResult::Incomplete => {
                let reason = self.socket.last_error();
                self.connect_failed(lua, clock, reason, events)
            }
            HandshakeResult::Rejected(reason) => self.connect_failed(lua, clock, reason, events),
            HandshakeResult::Accepted { protocol, consumed } => {
                self.inbuf.drain(..consumed);
                self.protocol = protocol;
                self.state = WsState::Connected;
                self.close_sent = false;
                self.close_code = CLOSE_NORMAL;
                self.backoff.succeeded();
                self.base.last_error.clear();
                tracing::info!(connector = %self.base.name, url = self.url.connection_string(), "websocket connected");
                events.push("on_connect", Vec::new());
                self.process_frames(lua, clock, events)
            }
        }
    }

    fn process_frames(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        while self.state == WsState::Connected {
            match ws::parse_frame(&self.inbuf) {
                FrameParse::Incomplete => break,
                FrameParse::Error { code, reason } => {
                    self.send_close(code, &reason);
                    return self.disconnected(lua, clock, code, &reason, events);
                }
                FrameParse::Frame { frame, consumed } => {
                    self.inbuf.drain(..consumed);
                    match frame.opcode {
                        OP_CLOSE => {
                            let (code, reason) = ws::parse_close_payload(&frame.payload);
                            self.send_close(CLOSE_NORMAL, "");
                            return self.disconnected(lua, clock, code, &reason, events);
                        }
                        OP_PING => {
                            self.send_frame(OP_PONG, &frame.payload);
                        }
                        OP_PONG => {}
                        _ => match self.assembler.push(frame) {
                            Ok(Some((opcode, payload))) => events.push(
                                "on_message",
                                vec![lua_bytes(lua, &payload)?, Value::Integer(opcode as i64)],
                            ),
                            Ok(None) => {}
                            Err(reason) => {
                                self.send_close(CLOSE_PROTOCOL_ERROR, &reason);
                                return self.disconnected(lua, clock, CLOSE_PROTOCOL_ERROR, &reason, events);
                            }
                        },
                    }
                }
            }
        }
        Ok(())
    }
}

impl Connector for WebsocketConnector {
    const TYPE_NAME: &'static str = "deck:Websocket";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.state == WsState::Connected
    }

    fn init_methods(lua: &Lua, class: &Table) -> LuaResult<()> {
        for name in ["send", "write"] {
            bridge::method::<WebsocketConnector, _, _, _>(lua, class, name, |_, this, text: mlua::String| {
                Ok(this.send_frame(OP_TEXT, &text.as_bytes()))
            })?;
        }
        bridge::method::<WebsocketConnector, _, _, _>(lua, class, "send_binary", |_, this, data: mlua::String| {
            Ok(this.send_frame(OP_BINARY, &data.as_bytes()))
        })?;
        bridge::method::<WebsocketConnector, _, _, _>(lua, class, "close", |_, this, code: Option<u16>| {
            let code = code.unwrap_or(CLOSE_NORMAL);
            this.send_close(code, "");
            this.close_code = code;
            this.base.enabled = false;
            Ok(())
        })
    }

    fn property(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "connection_string" => lua_bytes(lua, self.url.connection_string().as_bytes())?,
            "host" => lua_bytes(lua, self.url.host().as_bytes())?,
            "port" => Value::Integer(self.url.port() as i64),
            "path" => lua_bytes(lua, self.url.path().as_bytes())?,
            "secure" => Value::Boolean(self.url.is_secure()),
            "insecure" => Value::Boolean(self.insecure),
            "protocols" => lua_bytes(lua, self.protocols.as_bytes())?,
            "protocol" => match &self.protocol {
                Some(p) => lua_bytes(lua, p.as_bytes())?,
                None => Value::Nil,
            },
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        let url_err = |e: deck_util::UrlError| -> mlua::Error { DeckError::arg_value(e.to_string()).into() };
        match key {
            "connection_string" => {
                let s = string_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                self.url.set_connection_string(&s).map_err(url_err)?;
            }
            "host" => {
                let s = string_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                self.url.set_host(&s).map_err(url_err)?;
            }
            "port" => self.url.set_port(port_arg(<Self as Connector>::TYPE_NAME, key, &value)?),
            "path" => self.url.set_path(&string_arg(<Self as Connector>::TYPE_NAME, key, &value)?),
            "secure" => {
                let schema = if bool_arg(<Self as Connector>::TYPE_NAME, key, &value)? { "wss" } else { "ws" };
                self.url.set_schema(schema).map_err(url_err)?;
            }
            "insecure" => self.insecure = bool_arg(<Self as Connector>::TYPE_NAME, key, &value)?,
            "protocols" => self.protocols = string_arg(<Self as Connector>::TYPE_NAME, key, &value)?,
            "protocol" => return Err(DeckError::readonly(<Self as Connector>::TYPE_NAME, key).into()),
            _ => return Ok(NewIndex::Store(value)),
        }
        self.reset_connection();
        Ok(NewIndex::Handled)
    }

    fn tick_inputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        match self.state {
            WsState::Disconnected => Ok(()),
            WsState::Connecting => self.poll_connecting(lua, clock, events),
            WsState::Handshaking => self.poll_handshake(lua, clock, events),
            WsState::Connected => {
                let alive = self.fill_inbuf();
                self.process_frames(lua, clock, events)?;
                if !alive && self.state == WsState::Connected {
                    let reason = self.base.last_error.clone();
                    self.disconnected(lua, clock, CLOSE_ABNORMAL, &reason, events)?;
                }
                Ok(())
            }
        }
    }

    fn tick_outputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled {
            match self.state {
                WsState::Disconnected => {}
                WsState::Connected => {
                    let code = self.close_code;
                    self.send_close(code, "");
                    self.disconnected(lua, clock, code, "Connector disabled", events)?;
                    self.backoff.reset();
                }
                WsState::Connecting | WsState::Handshaking => self.reset_connection(),
            }
            return Ok(());
        }
        if self.state != WsState::Disconnected || self.url.is_empty() || !self.backoff.ready(clock) {
            return Ok(());
        }

        self.socket.set_tls(self.tls_mode());
        match self.socket.start_connect(self.url.host(), self.url.port()) {
            Ok(()) => {
                tracing::debug!(connector = %self.base.name, url = self.url.connection_string(), "websocket connecting");
                self.state = WsState::Connecting;
                Ok(())
            }
            Err(e) => self.connect_failed(lua, clock, e.to_string(), events),
        }
    }

    fn shutdown(&mut self, _lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        if self.state == WsState::Connected {
            self.send_close(CLOSE_NORMAL, "");
        }
        self.socket.shutdown();
        self.socket.close();
        self.state = WsState::Disconnected;
        self.base.enabled = false;
        Ok(())
    }
}

connector_class!(WebsocketConnector);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::lua_with_runtime;

    #[test]
    fn properties_recompose_the_url() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("ws", create(&lua, "ws").unwrap()).unwrap();
        lua.load(
            r#"
            ws.connection_string = "example.com/feed"
            assert(ws.connection_string == "ws://example.com:80/feed", ws.connection_string)
            ws.secure = true
            assert(ws.connection_string == "wss://example.com:80/feed")
            ws.port = 8443
            ws.path = "events"
            assert(ws.connection_string == "wss://example.com:8443/events")
            assert(ws.connected == false and ws.protocol == nil)
            assert(not pcall(function() ws.port = 0 end))
            assert(not pcall(function() ws.protocol = "x" end))
            assert(not pcall(function() ws.connection_string = "" end))
            assert(ws:send("early") == false)
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn failed_close_write_is_recorded() {
        let mut conn = WebsocketConnector::new("ws");
        conn.state = WsState::Connected;
        conn.send_close(CLOSE_PROTOCOL_ERROR, "bad frame");
        assert!(conn.close_sent);
        assert!(!conn.base.last_error.is_empty());

        // Only one close frame is attempted per connection.
        conn.base.last_error.clear();
        conn.send_close(CLOSE_NORMAL, "");
        assert!(conn.base.last_error.is_empty());
    }
}
