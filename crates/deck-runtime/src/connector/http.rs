use std::collections::VecDeque;

use mlua::{AnyUserData, Lua, Table, Value};

use deck_net::http::{self as wire, HttpResponse, RequestBody, ResponseProgress};
use deck_net::{Socket, SocketState, TlsMode};
use deck_util::url::default_port_for;
use deck_util::Url;

use super::{bool_arg, int_arg, string_arg, Backoff, Connector, ConnectorBase, Events};
use crate::bridge::{self, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};
use crate::json;
use crate::promise::{self, DeckPromiseList};

pub const DEFAULT_REQUEST_TIMEOUT_MS: i64 = 2000;
pub const PROMISE_TIMEOUT_MS: i64 = 10000;
pub const FIRST_REQUEST_ID: i64 = 100;

pub const ERR_TIMED_OUT: &str = "Request timed out";
pub const ERR_TOO_MANY_ERRORS: &str = "Too many errors";

const READ_CHUNK: usize = 16 * 1024;

struct Request {
    id: i64,
    payload: Vec<u8>,
}

struct InFlight {
    id: i64,
    payload: Option<Vec<u8>>,
    started_at: i64,
}

pub struct HttpConnector {
    base: ConnectorBase,
    url: Url,
    insecure: bool,
    timeout: i64,
    socket: Socket,
    promises: AnyUserData,
    queue: VecDeque<Request>,
    in_flight: Option<InFlight>,
    next_id: i64,
    inbuf: Vec<u8>,
    backoff: Backoff,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    let promises = DeckPromiseList::create(lua, PROMISE_TIMEOUT_MS)?;
    let connector = HttpConnector {
        base: ConnectorBase::new(name),
        url: Url::new("https"),
        insecure: false,
        timeout: DEFAULT_REQUEST_TIMEOUT_MS,
        socket: Socket::new(),
        promises,
        queue: VecDeque::new(),
        in_flight: None,
        next_id: FIRST_REQUEST_ID,
        inbuf: Vec::new(),
        backoff: Backoff::default(),
    };
    bridge::push_new(lua, connector)
}

fn headers_arg(headers: Option<Table>) -> LuaResult<Vec<(String, String)>> {
    let mut out = Vec::new();
    if let Some(headers) = headers {
        for pair in headers.pairs::<String, mlua::String>() {
            let (name, value) = pair?;
            out.push((name, value.to_str()?.to_string()));
        }
    }
    out.sort();
    Ok(out)
}

fn response_table(lua: &Lua, response: &HttpResponse) -> LuaResult<Table> {
    let t = lua.create_table()?;
    t.raw_set("ok", response.ok())?;
    t.raw_set("code", response.code)?;
    let headers = lua.create_table()?;
    for (name, value) in &response.headers {
        headers.raw_set(name.as_str(), value.as_str())?;
    }
    t.raw_set("headers", headers)?;
    t.raw_set("body", lua.create_string(&response.body)?)?;
    Ok(t)
}

fn failure_table(lua: &Lua, reason: &str) -> LuaResult<Table> {
    let t = lua.create_table()?;
    t.raw_set("ok", false)?;
    t.raw_set("code", 500)?;
    t.raw_set("headers", lua.create_table()?)?;
    t.raw_set("error", reason)?;
    Ok(t)
}

impl HttpConnector {
    fn host_header(&self) -> String {
        let port = self.url.port();
        if default_port_for(self.url.schema()) == Some(port) {
            self.url.host().to_string()
        } else {
            format!("{}:{port}", self.url.host())
        }
    }

    fn tls_mode(&self) -> TlsMode {
        match (self.url.is_secure(), self.insecure) {
            (false, _) => TlsMode::None,
            (true, false) => TlsMode::Verify,
            (true, true) => TlsMode::NoVerify,
        }
    }

    fn enqueue(
        &mut self,
        lua: &Lua,
        method: &str,
        path: &str,
        headers: &[(String, String)],
        body: RequestBody<'_>,
    ) -> LuaResult<AnyUserData> {
        let id = self.next_id;
        self.next_id += 1;
        let payload = wire::compose_request(
            method,
            &self.host_header(),
            self.url.path(),
            path,
            headers,
            body,
        );
        let promise = promise::new_promise(lua, &self.promises, Value::Integer(id), None)?;
        tracing::debug!(connector = %self.base.name, id, method, path, "http request queued");
        self.queue.push_back(Request { id, payload });
        Ok(promise)
    }

    fn deliver(&mut self, lua: &Lua, id: i64, response: &HttpResponse, events: &mut Events) -> LuaResult<()> {
        tracing::debug!(connector = %self.base.name, id, code = response.code, "http response");
        let table = response_table(lua, response)?;
        if promise::fulfill_key(lua, &self.promises, Value::Integer(id), Value::Table(table.clone()))?.is_none() {
            events.push("on_response", vec![Value::Table(table)]);
        }
        Ok(())
    }

    fn fail(&mut self, lua: &Lua, id: i64, reason: &str, events: &mut Events) -> LuaResult<()> {
        tracing::info!(connector = %self.base.name, id, error = reason, "http request failed");
        self.base.set_error(reason);
        let table = failure_table(lua, reason)?;
        promise::fulfill_key(lua, &self.promises, Value::Integer(id), Value::Table(table.clone()))?;
        events.push("on_request_failed", vec![Value::Table(table)]);
        Ok(())
    }

    /// Fails the in-flight request, drops the connection and applies the
    /// failure pacing. Hitting the failure limit abandons the whole queue.
    fn fail_in_flight(&mut self, lua: &Lua, clock: i64, reason: &str, events: &mut Events) -> LuaResult<()> {
        self.socket.close();
        self.inbuf.clear();
        if let Some(req) = self.in_flight.take() {
            self.fail(lua, req.id, reason, events)?;
        }
        if self.backoff.failed(clock) {
            tracing::warn!(connector = %self.base.name, "too many consecutive http errors, pausing");
            self.queue.clear();
            let table = failure_table(lua, ERR_TOO_MANY_ERRORS)?;
            promise::fulfill_all(lua, &self.promises, Value::Table(table))?;
        }
        Ok(())
    }

    fn read_response(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        let mut chunk = vec![0u8; READ_CHUNK];
        let mut eof = false;
        loop {
            match self.socket.read_nonblock(&mut chunk) {
                Ok(0) => break,
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(_) => {
                    eof = true;
                    break;
                }
            }
        }
        match wire::assemble_response(&self.inbuf, eof) {
            ResponseProgress::Incomplete => Ok(()),
            ResponseProgress::Failed(reason) => self.fail_in_flight(lua, clock, &reason, events),
            ResponseProgress::Complete { response, consumed } => {
                self.inbuf.drain(..consumed);
                self.backoff.succeeded();
                let closing = response
                    .header("Connection")
                    .is_some_and(|v| v.eq_ignore_ascii_case("close"));
                if eof || closing {
                    self.socket.close();
                    self.inbuf.clear();
                }
                match self.in_flight.take() {
                    Some(req) => self.deliver(lua, req.id, &response, events),
                    None => Ok(()),
                }
            }
        }
    }
}

impl Connector for HttpConnector {
    const TYPE_NAME: &'static str = "deck:Http";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    fn init_methods(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<HttpConnector, _, _, _>(
            lua,
            class,
            "get",
            |lua, this, (path, headers): (String, Option<Table>)| {
                let headers = headers_arg(headers)?;
                this.enqueue(lua, "GET", &path, &headers, RequestBody::Empty)
            },
        )?;
        bridge::method::<HttpConnector, _, _, _>(
            lua,
            class,
            "post",
            |lua, this, (path, headers, body): (String, Option<Table>, Value)| {
                let headers = headers_arg(headers)?;
                match &body {
                    Value::Nil => this.enqueue(lua, "POST", &path, &headers, RequestBody::Empty),
                    Value::String(s) => {
                        let bytes = s.as_bytes();
                        let promise = this.enqueue(lua, "POST", &path, &headers, RequestBody::Text(&bytes))?;
                        Ok(promise)
                    }
                    Value::Table(_) => {
                        let encoded = json::encode(&body, false)?;
                        this.enqueue(lua, "POST", &path, &headers, RequestBody::Json(encoded.as_bytes()))
                    }
                    other => Err(DeckError::arg_type(format!(
                        "deck:Http.post body must be a string or table, got {}",
                        other.type_name()
                    ))
                    .into()),
                }
            },
        )
    }

    fn property(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "connection_string" | "base_url" => {
                Value::String(lua.create_string(self.url.connection_string())?)
            }
            "insecure" => Value::Boolean(self.insecure),
            "timeout" => Value::Integer(self.timeout),
            "pending" => Value::Integer((self.queue.len() + self.in_flight.iter().count()) as i64),
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "connection_string" | "base_url" => {
                let s = string_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                self.url
                    .set_connection_string(&s)
                    .map_err(|e| DeckError::arg_value(e.to_string()))?;
                self.socket.close();
                self.inbuf.clear();
                self.backoff.reset();
            }
            "insecure" => self.insecure = bool_arg(<Self as Connector>::TYPE_NAME, key, &value)?,
            "timeout" => {
                let ms = int_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                if ms <= 0 {
                    return Err(DeckError::arg_value(format!("deck:Http.timeout must be > 0, got {ms}")).into());
                }
                self.timeout = ms;
            }
            "pending" => return Err(DeckError::readonly(<Self as Connector>::TYPE_NAME, key).into()),
            _ => return Ok(NewIndex::Store(value)),
        }
        Ok(NewIndex::Handled)
    }

    fn tick_inputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        if self.socket.state() == SocketState::TlsHandshaking {
            self.socket.tls_handshake();
        }
        let (started_at, sent) = match &self.in_flight {
            Some(req) => (req.started_at, req.payload.is_none()),
            None => return Ok(()),
        };

        if clock - started_at > self.timeout {
            return self.fail_in_flight(lua, clock, ERR_TIMED_OUT, events);
        }
        match self.socket.state() {
            SocketState::Connecting | SocketState::TlsHandshaking => Ok(()),
            SocketState::Disconnected => {
                let mut reason = self.socket.last_error();
                if reason.is_empty() {
                    reason = wire::ERR_EOF_BEFORE_FINISHED.to_string();
                }
                self.fail_in_flight(lua, clock, &reason, events)
            }
            SocketState::Connected if sent => self.read_response(lua, clock, events),
            SocketState::Connected => Ok(()),
        }
    }

    fn tick_outputs(&mut self, _lua: &Lua, clock: i64, _events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled {
            if self.socket.state() != SocketState::Disconnected {
                self.socket.close();
            }
            return Ok(());
        }
        if self.in_flight.is_none() {
            if self.url.is_empty() || !self.backoff.ready(clock) {
                return Ok(());
            }
            let Some(next) = self.queue.pop_front() else {
                return Ok(());
            };
            self.in_flight = Some(InFlight {
                id: next.id,
                payload: Some(next.payload),
                started_at: clock,
            });
        }

        match self.socket.state() {
            SocketState::Disconnected => {
                self.socket.set_tls(self.tls_mode());
                if let Err(e) = self.socket.start_connect(self.url.host(), self.url.port()) {
                    self.base.set_error(e.to_string());
                }
            }
            SocketState::Connected => {
                let payload = self.in_flight.as_mut().and_then(|req| req.payload.take());
                if let Some(payload) = payload {
                    self.inbuf.clear();
                    if let Err(e) = self.socket.write(&payload) {
                        self.base.set_error(e.to_string());
                    }
                }
            }
            SocketState::Connecting | SocketState::TlsHandshaking => {}
        }
        Ok(())
    }

    fn shutdown(&mut self, _lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        self.socket.close();
        self.queue.clear();
        self.in_flight = None;
        self.base.enabled = false;
        Ok(())
    }
}

connector_class!(HttpConnector);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::lua_with_runtime;

    #[test]
    fn requests_queue_with_sequential_ids() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("http", create(&lua, "api").unwrap()).unwrap();
        lua.load(
            r#"
            http.base_url = "http://127.0.0.1:1/api"
            assert(http.connection_string == "http://127.0.0.1:1/api")
            local a = http:get("/one")
            local b = http:post("two", { ["X-Test"] = "1" }, { k = 1 })
            assert(a.key == 100 and b.key == 101)
            assert(http.pending == 2 and http.timeout == 2000)
            assert(not pcall(function() http.timeout = 0 end))
            assert(not pcall(http.post, http, "/x", nil, true))
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn host_header_omits_default_port() {
        let (lua, _rt) = lua_with_runtime();
        let ud = create(&lua, "api").unwrap();
        let mut this = ud.borrow_mut::<HttpConnector>().unwrap();
        this.url.set_connection_string("https://example.com").unwrap();
        assert_eq!(this.host_header(), "example.com");
        this.url.set_port(8443);
        assert_eq!(this.host_header(), "example.com:8443");
    }
}
