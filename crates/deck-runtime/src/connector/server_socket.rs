use mlua::{AnyUserData, Lua, Table, Value};

use deck_net::{Socket, SocketState};

use super::{lua_bytes, port_arg, Connector, ConnectorBase, Events, RECONNECT_DELAY_MS};
use crate::bridge::{self, LuaClass, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

pub const MAX_CLIENTS: usize = 10;

const READ_CHUNK: usize = 4096;

/// One accepted connection, handed to scripts through `on_accept`.
pub struct ServerSocketClient {
    socket: Socket,
    host: String,
    port: u16,
}

impl ServerSocketClient {
    fn is_connected(&self) -> bool {
        self.socket.is_connected()
    }

    /// Drains readable bytes. `None` means the peer is gone.
    fn read_available(&mut self) -> Option<Vec<u8>> {
        let mut out = Vec::new();
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.socket.read_nonblock(&mut chunk) {
                Ok(0) => return Some(out),
                Ok(n) => out.extend_from_slice(&chunk[..n]),
                Err(_) if out.is_empty() => return None,
                Err(_) => return Some(out),
            }
        }
    }
}

impl LuaClass for ServerSocketClient {
    const TYPE_NAME: &'static str = "deck:ServerSocketClient";
    const PUSH_THIS: bool = true;

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        for name in ["send", "write"] {
            bridge::method::<ServerSocketClient, _, _, _>(lua, class, name, |_, this, data: mlua::String| {
                let bytes = data.as_bytes();
                match this.socket.write(&bytes) {
                    Ok(()) => Ok(bytes.len() as i64),
                    Err(e) => {
                        tracing::debug!(host = %this.host, port = this.port, error = %e, "client write failed");
                        Ok(0)
                    }
                }
            })?;
        }
        bridge::method::<ServerSocketClient, _, _, _>(lua, class, "close", |_, this, ()| {
            this.socket.shutdown();
            Ok(())
        })
    }

    fn index(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "connected" => Value::Boolean(self.is_connected()),
            "host" | "remote_host" => lua_bytes(lua, self.host.as_bytes())?,
            "port" | "remote_port" => Value::Integer(self.port as i64),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "connected" | "host" | "remote_host" | "port" | "remote_port" => {
                Err(DeckError::readonly(Self::TYPE_NAME, key).into())
            }
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn tostring(&self) -> String {
        format!("deck:ServerSocketClient {{ host={}, port={} }}", self.host, self.port)
    }
}

lua_class!(ServerSocketClient);

pub struct ServerSocketConnector {
    base: ConnectorBase,
    port: u16,
    listener: Socket,
    listening: bool,
    clients: Vec<AnyUserData>,
    next_bind: i64,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    let connector = ServerSocketConnector {
        base: ConnectorBase::new(name),
        port: 0,
        listener: Socket::new(),
        listening: false,
        clients: Vec::new(),
        next_bind: 0,
    };
    bridge::push_new(lua, connector)
}

impl ServerSocketConnector {
    fn stop_listening(&mut self) {
        self.listener.close();
        self.listening = false;
    }

    fn accept_clients(&mut self, lua: &Lua, events: &mut Events) -> LuaResult<()> {
        loop {
            let socket = match self.listener.accept_nonblock() {
                Ok(Some(socket)) => socket,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.base.set_error(e.to_string());
                    return Ok(());
                }
            };
            let (host, port) = (socket.remote_host(), socket.remote_port());
            if self.clients.len() >= MAX_CLIENTS {
                tracing::warn!(connector = %self.base.name, host, port, "client refused, server is full");
                drop(socket);
                continue;
            }
            tracing::debug!(connector = %self.base.name, host, port, "client accepted");
            let client = bridge::push_new(lua, ServerSocketClient { socket, host, port })?;
            self.clients.push(client.clone());
            events.push("on_accept", vec![Value::UserData(client)]);
        }
    }

    fn read_clients(&mut self, lua: &Lua, events: &mut Events) -> LuaResult<()> {
        let mut survivors = Vec::with_capacity(self.clients.len());
        for client in std::mem::take(&mut self.clients) {
            let data = client.borrow_mut::<ServerSocketClient>()?.read_available();
            match data {
                Some(bytes) => {
                    if !bytes.is_empty() {
                        events.push("on_receive", vec![Value::UserData(client.clone()), lua_bytes(lua, &bytes)?]);
                    }
                    survivors.push(client);
                }
                None => events.push("on_close", vec![Value::UserData(client)]),
            }
        }
        self.clients = survivors;
        Ok(())
    }

    fn close_clients(&mut self, events: &mut Events) -> LuaResult<()> {
        for client in std::mem::take(&mut self.clients) {
            client.borrow_mut::<ServerSocketClient>()?.socket.shutdown();
            events.push("on_close", vec![Value::UserData(client)]);
        }
        Ok(())
    }
}

impl Connector for ServerSocketConnector {
    const TYPE_NAME: &'static str = "deck:ServerSocket";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.listening
    }

    fn property(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "port" => Value::Integer(self.port as i64),
            "max_clients" => Value::Integer(MAX_CLIENTS as i64),
            "listening" => Value::Boolean(self.listening),
            "clients" => {
                let t = lua.create_table()?;
                for (i, client) in self.clients.iter().enumerate() {
                    t.raw_set(i + 1, client.clone())?;
                }
                Value::Table(t)
            }
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "port" => {
                let port = port_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                if port != self.port {
                    self.port = port;
                    self.stop_listening();
                    self.next_bind = 0;
                }
                Ok(NewIndex::Handled)
            }
            "max_clients" | "listening" | "clients" => Err(DeckError::readonly(<Self as Connector>::TYPE_NAME, key).into()),
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn tick_inputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        match self.listener.state() {
            SocketState::Connected if !self.listening => {
                self.listening = true;
                self.next_bind = 0;
                self.base.last_error.clear();
                tracing::info!(connector = %self.base.name, port = self.port, "listening");
                events.push("on_connect", Vec::new());
            }
            SocketState::Disconnected if self.next_bind < 0 && !self.listening => {
                let reason = self.listener.last_error();
                tracing::info!(connector = %self.base.name, port = self.port, error = %reason, "bind failed");
                self.base.set_error(reason.clone());
                self.next_bind = clock + RECONNECT_DELAY_MS;
                events.push("on_connect_failed", vec![lua_bytes(lua, reason.as_bytes())?]);
            }
            _ => {}
        }
        if self.listening {
            self.accept_clients(lua, events)?;
        }
        self.read_clients(lua, events)
    }

    fn tick_outputs(&mut self, _lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled {
            if self.listening || self.listener.state() != SocketState::Disconnected {
                self.stop_listening();
                self.close_clients(events)?;
                events.push("on_disconnect", Vec::new());
            }
            self.next_bind = 0;
            return Ok(());
        }
        if self.port == 0 || self.listener.state() != SocketState::Disconnected {
            return Ok(());
        }
        if self.listening {
            // Listener dropped underneath us.
            self.listening = false;
            events.push("on_disconnect", Vec::new());
        }
        if self.next_bind >= 0 && clock >= self.next_bind {
            match self.listener.start_listen(self.port) {
                // A negative deadline marks a bind attempt in progress.
                Ok(()) => self.next_bind = -1,
                Err(e) => {
                    self.base.set_error(e.to_string());
                    self.next_bind = clock + RECONNECT_DELAY_MS;
                }
            }
        }
        Ok(())
    }

    fn shutdown(&mut self, _lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        self.stop_listening();
        for client in std::mem::take(&mut self.clients) {
            // Clients may already be gone when the server is collected with them.
            if let Ok(mut client) = client.borrow_mut::<ServerSocketClient>() {
                client.socket.close();
            }
        }
        self.base.enabled = false;
        Ok(())
    }
}

connector_class!(ServerSocketConnector);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::lua_with_runtime;

    #[test]
    fn port_is_validated_and_limits_are_readonly() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("srv", create(&lua, "srv").unwrap()).unwrap();
        lua.load(
            r#"
            assert(srv.port == 0 and srv.max_clients == 10 and #srv.clients == 0)
            srv.port = 8080
            assert(srv.port == 8080)
            assert(not pcall(function() srv.port = 70000 end))
            assert(not pcall(function() srv.max_clients = 3 end))
            assert(srv.connected == false)
            "#,
        )
        .exec()
        .unwrap();
    }
}
