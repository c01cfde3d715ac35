//! Connector framework: the capability set every I/O channel implements,
//! event dispatch into scripts, reconnect pacing and the named container.
//!
//! A connector never calls into the VM while its own userdata is borrowed.
//! Each phase runs against `&mut self` and collects [`Events`]; dispatch
//! happens after the borrow is released, so handlers may freely touch the
//! connector (or wait on promises).

use std::collections::BTreeMap;

use mlua::{AnyUserData, Function, Lua, MultiValue, ObjectLike, Table, UserData, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::logger;
use crate::lua_class;
use crate::runtime::runtime;
use crate::scheduler::yieldable_call;

pub mod hid;
pub mod http;
pub mod server_socket;
pub mod streamdeck;
pub mod vnc;
pub mod websocket;
pub mod window;

pub const RECONNECT_DELAY_MS: i64 = 5000;
pub const FAILURE_PAUSE_MS: i64 = 6000;
pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

pub const CLASS_WEBSOCKET: &str = "Websocket";
pub const CLASS_HTTP: &str = "Http";
pub const CLASS_SERVER_SOCKET: &str = "ServerSocket";
pub const CLASS_STREAMDECK: &str = "StreamDeck";
pub const CLASS_WINDOW: &str = "Window";
pub const CLASS_VNC: &str = "Vnc";

/// Maps accepted aliases onto the registered class name.
pub fn canonical_class(class: &str) -> &str {
    match class {
        "TcpServer" => CLASS_SERVER_SOCKET,
        "ElgatoStreamDeck" => CLASS_STREAMDECK,
        other => other,
    }
}

/// State shared by every connector.
#[derive(Debug, Clone)]
pub struct ConnectorBase {
    pub name: String,
    pub enabled: bool,
    pub last_error: String,
}

impl ConnectorBase {
    pub fn new(name: &str) -> Self {
        ConnectorBase {
            name: name.to_string(),
            enabled: true,
            last_error: String::new(),
        }
    }

    pub fn set_error(&mut self, err: impl Into<String>) {
        self.last_error = err.into();
        tracing::debug!(connector = %self.name, error = %self.last_error, "connector error");
    }
}

/// Script events queued during a connector phase.
#[derive(Default)]
pub struct Events {
    queue: Vec<(&'static str, Vec<Value>)>,
}

impl Events {
    pub fn push(&mut self, name: &'static str, args: Vec<Value>) {
        self.queue.push((name, args));
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Delivers every queued event in order. Handler errors are logged and
    /// never abort the remaining deliveries.
    pub fn dispatch(self, lua: &Lua, ud: &AnyUserData) {
        for (name, args) in self.queue {
            if let Err(err) = emit(lua, ud, name, args) {
                logger::log_error(lua, &err);
            }
        }
    }
}

/// Calls `ud.<name>(ud, args...)` inside a yieldable coroutine if the
/// handler is set.
pub fn emit(lua: &Lua, ud: &AnyUserData, name: &str, args: Vec<Value>) -> LuaResult<()> {
    let Some(handler) = bridge::instance_env(ud)?.raw_get::<Option<Function>>(name)? else {
        return Ok(());
    };
    let mut call_args = MultiValue::new();
    call_args.push_back(Value::UserData(ud.clone()));
    call_args.extend(args);
    yieldable_call(lua, handler, call_args)?;
    Ok(())
}

/// Reconnect pacing shared by the socket-backed connectors.
#[derive(Debug, Default, Clone)]
pub struct Backoff {
    next_attempt: i64,
    failures: u32,
}

impl Backoff {
    pub fn ready(&self, clock: i64) -> bool {
        clock >= self.next_attempt
    }

    pub fn next_attempt(&self) -> i64 {
        self.next_attempt
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn disconnected(&mut self, clock: i64) {
        self.next_attempt = clock + RECONNECT_DELAY_MS;
    }

    /// Records a failed attempt. Returns true when the consecutive failure
    /// limit was reached, in which case the longer pause applies and the
    /// counter starts over.
    pub fn failed(&mut self, clock: i64) -> bool {
        self.failures += 1;
        if self.failures >= MAX_CONSECUTIVE_FAILURES {
            self.failures = 0;
            self.next_attempt = clock + FAILURE_PAUSE_MS;
            true
        } else {
            self.next_attempt = clock + RECONNECT_DELAY_MS;
            false
        }
    }

    pub fn succeeded(&mut self) {
        self.failures = 0;
    }

    pub fn reset(&mut self) {
        self.next_attempt = 0;
        self.failures = 0;
    }
}

pub trait Connector: Sized + 'static {
    const TYPE_NAME: &'static str;

    fn base(&self) -> &ConnectorBase;
    fn base_mut(&mut self) -> &mut ConnectorBase;
    fn is_connected(&self) -> bool;

    /// Adds connector-specific methods to the class table.
    fn init_methods(_lua: &Lua, _class: &Table) -> LuaResult<()> {
        Ok(())
    }

    fn property(&self, _lua: &Lua, _key: &str) -> LuaResult<Value> {
        Ok(Value::Nil)
    }

    fn set_property(&mut self, _lua: &Lua, _key: &str, value: Value) -> LuaResult<NewIndex> {
        Ok(NewIndex::Store(value))
    }

    fn tick_inputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()>;
    fn tick_outputs(&mut self, lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()>;
    /// Releases OS resources. Must be idempotent.
    fn shutdown(&mut self, lua: &Lua, events: &mut Events) -> LuaResult<()>;
}

/// Implements `LuaClass` and `UserData` for a [`Connector`].
#[macro_export]
macro_rules! connector_class {
    ($ty:ty) => {
        impl $crate::bridge::LuaClass for $ty {
            const TYPE_NAME: &'static str = <$ty as $crate::connector::Connector>::TYPE_NAME;
            const PUSH_THIS: bool = true;
            const FINALIZE: bool = true;

            fn init_class_table(lua: &mlua::Lua, class: &mlua::Table) -> $crate::error::LuaResult<()> {
                $crate::connector::init_class::<$ty>(lua, class)
            }

            fn finalize(&mut self, lua: &mlua::Lua) {
                $crate::connector::finalize(self, lua)
            }

            fn index(&self, lua: &mlua::Lua, key: &str) -> $crate::error::LuaResult<mlua::Value> {
                $crate::connector::common_index(self, lua, key)
            }

            fn newindex(
                &mut self,
                lua: &mlua::Lua,
                key: &str,
                value: mlua::Value,
            ) -> $crate::error::LuaResult<$crate::bridge::NewIndex> {
                $crate::connector::common_newindex(self, lua, key, value)
            }

            fn tostring(&self) -> String {
                format!(
                    "{} {{ name={}, connected={} }}",
                    <$ty as $crate::connector::Connector>::TYPE_NAME,
                    $crate::connector::Connector::base(self).name,
                    $crate::connector::Connector::is_connected(self)
                )
            }
        }

        $crate::lua_class!($ty);
    };
}

#[derive(Clone, Copy)]
enum Phase {
    Inputs,
    Outputs,
    Shutdown,
}

pub fn init_class<T: Connector + LuaClass + UserData>(lua: &Lua, class: &Table) -> LuaResult<()> {
    for (name, phase) in [("tick_inputs", Phase::Inputs), ("tick_outputs", Phase::Outputs)] {
        bridge::method_ud::<T, _, _, _>(lua, class, name, move |lua, ud, clock: Option<i64>| {
            let clock = match clock {
                Some(c) => c,
                None => runtime(lua)?.clock(),
            };
            run_phase::<T>(lua, ud, phase, clock)
        })?;
    }
    bridge::method_ud::<T, _, _, _>(lua, class, "shutdown", |lua, ud, ()| {
        run_phase::<T>(lua, ud, Phase::Shutdown, 0)
    })?;
    T::init_methods(lua, class)
}

fn run_phase<T: Connector + LuaClass + UserData>(
    lua: &Lua,
    ud: &AnyUserData,
    phase: Phase,
    clock: i64,
) -> LuaResult<()> {
    let mut events = Events::default();
    let result = {
        let mut this = ud.borrow_mut::<T>()?;
        let result = match phase {
            Phase::Inputs => this.tick_inputs(lua, clock, &mut events),
            Phase::Outputs => this.tick_outputs(lua, clock, &mut events),
            Phase::Shutdown => this.shutdown(lua, &mut events),
        };
        if let Err(err) = &result {
            this.base_mut().set_error(err.to_string());
        }
        result
    };
    events.dispatch(lua, ud);
    if let Err(err) = result {
        logger::log_error(lua, &err);
    }
    Ok(())
}

pub fn common_index<T: Connector>(this: &T, lua: &Lua, key: &str) -> LuaResult<Value> {
    let base = this.base();
    Ok(match key {
        "enabled" => Value::Boolean(base.enabled),
        "name" => Value::String(lua.create_string(&base.name)?),
        "connected" => Value::Boolean(this.is_connected()),
        "error" | "last_error" => {
            if base.last_error.is_empty() {
                Value::Nil
            } else {
                Value::String(lua.create_string(&base.last_error)?)
            }
        }
        _ => this.property(lua, key)?,
    })
}

pub fn common_newindex<T: Connector>(
    this: &mut T,
    lua: &Lua,
    key: &str,
    value: Value,
) -> LuaResult<NewIndex> {
    match key {
        "enabled" => match value {
            Value::Boolean(b) => {
                this.base_mut().enabled = b;
                Ok(NewIndex::Handled)
            }
            other => Err(DeckError::arg_type(format!(
                "{}.enabled must be a boolean, got {}",
                T::TYPE_NAME,
                other.type_name()
            ))
            .into()),
        },
        "name" | "connected" | "error" | "last_error" => {
            Err(DeckError::readonly(T::TYPE_NAME, key).into())
        }
        _ => this.set_property(lua, key, value),
    }
}

/// Reads a string property value.
pub fn string_arg(type_name: &str, key: &str, value: &Value) -> LuaResult<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        other => Err(DeckError::arg_type(format!(
            "{type_name}.{key} must be a string, got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub fn bool_arg(type_name: &str, key: &str, value: &Value) -> LuaResult<bool> {
    match value {
        Value::Boolean(b) => Ok(*b),
        other => Err(DeckError::arg_type(format!(
            "{type_name}.{key} must be a boolean, got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub fn int_arg(type_name: &str, key: &str, value: &Value) -> LuaResult<i64> {
    match value {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) if n.fract() == 0.0 => Ok(*n as i64),
        other => Err(DeckError::arg_type(format!(
            "{type_name}.{key} must be an integer, got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub fn port_arg(type_name: &str, key: &str, value: &Value) -> LuaResult<u16> {
    let port = int_arg(type_name, key, value)?;
    u16::try_from(port)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| DeckError::arg_value(format!("{type_name}.{key} must be in 1..65535, got {port}")).into())
}

pub fn lua_bytes(lua: &Lua, bytes: &[u8]) -> LuaResult<Value> {
    Ok(Value::String(lua.create_string(bytes)?))
}

/// `deck.connectors`: weak-valued name → connector map.
pub struct ConnectorContainer {
    connectors: Table,
    classes: BTreeMap<String, String>,
    order: Vec<String>,
}

impl ConnectorContainer {
    fn live(&mut self) -> LuaResult<Vec<(String, AnyUserData)>> {
        let mut out = Vec::with_capacity(self.order.len());
        let mut keep = Vec::with_capacity(self.order.len());
        for name in self.order.drain(..) {
            match self.connectors.raw_get::<Option<AnyUserData>>(name.as_str())? {
                Some(ud) => {
                    out.push((name.clone(), ud));
                    keep.push(name);
                }
                None => {
                    self.classes.remove(&name);
                }
            }
        }
        self.order = keep;
        Ok(out)
    }
}

/// Returns the VM-wide container, creating it on first use.
pub fn container(lua: &Lua) -> LuaResult<AnyUserData> {
    if let Some(ud) = bridge::global_instance::<ConnectorContainer>(lua)? {
        return Ok(ud);
    }
    let container = ConnectorContainer {
        connectors: bridge::weak_table(lua, "v")?,
        classes: BTreeMap::new(),
        order: Vec::new(),
    };
    bridge::push_new(lua, container)
}

/// `deck.Connector(class, name [, props])`.
pub fn get_or_create(lua: &Lua, class: &str, name: &str, props: Option<Table>) -> LuaResult<AnyUserData> {
    let class = canonical_class(class);
    if name.is_empty() {
        return Err(DeckError::arg_value("connector name must not be empty").into());
    }
    let container = container(lua)?;

    let existing = {
        let mut this = container.borrow_mut::<ConnectorContainer>()?;
        this.live()?;
        match this.connectors.raw_get::<Option<AnyUserData>>(name)? {
            Some(ud) => {
                let current = this.classes.get(name).map(String::as_str).unwrap_or("?");
                if current != class {
                    return Err(DeckError::arg_value(format!(
                        "connector {name:?} already exists as {current}, not {class}"
                    ))
                    .into());
                }
                Some(ud)
            }
            None => None,
        }
    };

    let ud = match existing {
        Some(ud) => ud,
        None => {
            let factory = runtime(lua)?
                .connector_factory(class)
                .ok_or_else(|| DeckError::arg_value(format!("unknown connector class {class:?}")))?;
            let ud = factory(lua, name)?;
            let mut this = container.borrow_mut::<ConnectorContainer>()?;
            this.connectors.raw_set(name, ud.clone())?;
            this.classes.insert(name.to_string(), class.to_string());
            this.order.push(name.to_string());
            tracing::debug!(connector = name, class, "connector created");
            ud
        }
    };

    if let Some(props) = props {
        for pair in props.pairs::<Value, Value>() {
            let (k, v) = pair?;
            ud.set(k, v)?;
        }
    }
    Ok(ud)
}

/// Live connectors in creation order.
pub fn live_connectors(lua: &Lua) -> LuaResult<Vec<AnyUserData>> {
    let container = container(lua)?;
    let mut this = container.borrow_mut::<ConnectorContainer>()?;
    Ok(this.live()?.into_iter().map(|(_, ud)| ud).collect())
}

/// Calls `method(clock)` on every live connector. The set is snapshotted
/// first, so connectors created by handlers join on the next pass.
pub fn tick_all(lua: &Lua, method: &str, clock: i64) -> LuaResult<()> {
    for ud in live_connectors(lua)? {
        if let Err(err) = ud.call_method::<()>(method, clock) {
            logger::log_error(lua, &err);
        }
    }
    Ok(())
}

/// Shutdown for a connector the collector is reclaiming. Events raised here
/// are dropped since no script handler can run any more.
pub fn finalize<T: Connector>(this: &mut T, lua: &Lua) {
    let mut events = Events::default();
    if let Err(err) = this.shutdown(lua, &mut events) {
        tracing::debug!(connector = %this.base().name, error = %err, "shutdown during finalization failed");
    }
}

pub fn shutdown_all(lua: &Lua) -> LuaResult<()> {
    for ud in live_connectors(lua)? {
        if let Err(err) = ud.call_method::<()>("shutdown", ()) {
            logger::log_error(lua, &err);
        }
    }
    Ok(())
}

impl LuaClass for ConnectorContainer {
    const TYPE_NAME: &'static str = "deck:Connectors";
    const SINGLETON: bool = true;

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<ConnectorContainer, _, _, _>(lua, class, "list", |lua, this, ()| {
            let out = lua.create_table()?;
            for (name, ud) in this.live()? {
                out.raw_set(name, ud)?;
            }
            Ok(out)
        })
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        self.connectors.raw_get(key)
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, _value: Value) -> LuaResult<NewIndex> {
        Err(DeckError::readonly(Self::TYPE_NAME, key).into())
    }

    fn len(&self) -> LuaResult<i64> {
        let mut n = 0;
        for name in &self.order {
            if !self.connectors.raw_get::<Value>(name.as_str())?.is_nil() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn tostring(&self) -> String {
        format!("deck:Connectors {{ {} }}", self.order.join(", "))
    }
}

lua_class!(ConnectorContainer);

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use super::*;
    use crate::runtime::test_support::lua_with_runtime;

    struct Recorder {
        base: ConnectorBase,
        ticks: i64,
    }

    impl Connector for Recorder {
        const TYPE_NAME: &'static str = "deck:TestRecorder";

        fn base(&self) -> &ConnectorBase {
            &self.base
        }

        fn base_mut(&mut self) -> &mut ConnectorBase {
            &mut self.base
        }

        fn is_connected(&self) -> bool {
            self.base.enabled
        }

        fn property(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
            Ok(match key {
                "ticks" => Value::Integer(self.ticks),
                _ => Value::Nil,
            })
        }

        fn tick_inputs(&mut self, _lua: &Lua, clock: i64, events: &mut Events) -> LuaResult<()> {
            self.ticks += 1;
            events.push("on_tick", vec![Value::Integer(clock)]);
            Ok(())
        }

        fn tick_outputs(&mut self, _lua: &Lua, _clock: i64, _events: &mut Events) -> LuaResult<()> {
            Err(DeckError::Io("output failed".to_string()).into())
        }

        fn shutdown(&mut self, _lua: &Lua, events: &mut Events) -> LuaResult<()> {
            events.push("on_disconnect", Vec::new());
            Ok(())
        }
    }

    connector_class!(Recorder);

    fn lua_with_recorder() -> Lua {
        let (lua, rt) = lua_with_runtime();
        rt.register_connector(
            "Recorder",
            Rc::new(|lua: &Lua, name: &str| {
                bridge::push_new(
                    lua,
                    Recorder {
                        base: ConnectorBase::new(name),
                        ticks: 0,
                    },
                )
            }),
        );
        lua.globals()
            .set(
                "Connector",
                lua.create_function(|lua, (class, name, props): (String, String, Option<Table>)| {
                    get_or_create(lua, &class, &name, props)
                })
                .unwrap(),
            )
            .unwrap();
        lua
    }

    #[test]
    fn container_creates_and_reuses_by_name() {
        let lua = lua_with_recorder();
        lua.load(
            r#"
            a = Connector("Recorder", "one", { note = "x" })
            assert(Connector("Recorder", "one") == a)
            assert(a.name == "one" and a.note == "x" and a.enabled)
            assert(not pcall(Connector, "Nope", "two"))
            assert(not pcall(Connector, "Recorder", ""))
            assert(not pcall(function() a.name = "other" end))
            assert(not pcall(function() a.enabled = 1 end))
            "#,
        )
        .exec()
        .unwrap();
        let err = lua
            .load("Connector('Websocket', 'one')")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("ArgValueError"), "{err}");
    }

    #[test]
    fn events_dispatch_after_the_phase() {
        let lua = lua_with_recorder();
        lua.load(
            r#"
            p = Connector("Recorder", "p")
            seen = {}
            p.on_tick = function(self, clock)
                seen[#seen + 1] = clock
                assert(self.ticks >= 1)
            end
            p.on_disconnect = function(self) seen.closed = true end
            "#,
        )
        .exec()
        .unwrap();

        tick_all(&lua, "tick_inputs", 10).unwrap();
        tick_all(&lua, "tick_inputs", 20).unwrap();
        tick_all(&lua, "tick_outputs", 20).unwrap();
        shutdown_all(&lua).unwrap();

        lua.load(
            r#"
            assert(#seen == 2 and seen[1] == 10 and seen[2] == 20)
            assert(seen.closed)
            assert(p.error:find("output failed"))
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn dropped_connectors_leave_the_container() {
        let lua = lua_with_recorder();
        lua.load("Connector('Recorder', 'gone')").exec().unwrap();
        lua.gc_collect().unwrap();
        lua.gc_collect().unwrap();
        assert!(live_connectors(&lua).unwrap().is_empty());
    }

    #[test]
    fn backoff_pauses_after_repeated_failures() {
        let mut b = Backoff::default();
        assert!(b.ready(0));
        assert!(!b.failed(100));
        assert_eq!(b.next_attempt(), 100 + RECONNECT_DELAY_MS);
        assert!(!b.failed(200));
        assert!(b.failed(300));
        assert_eq!(b.next_attempt(), 300 + FAILURE_PAUSE_MS);
        assert_eq!(b.failures(), 0);
        b.disconnected(1000);
        assert!(!b.ready(5999));
        assert!(b.ready(6000));
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(canonical_class("TcpServer"), CLASS_SERVER_SOCKET);
        assert_eq!(canonical_class("ElgatoStreamDeck"), CLASS_STREAMDECK);
        assert_eq!(canonical_class("Http"), CLASS_HTTP);
    }
}
