//! One-shot value cells with a timeout, and keyed lists of them.

use mlua::{AnyUserData, Function, Lua, MultiValue, Table, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;
use crate::runtime::runtime;

pub const DEFAULT_TIMEOUT_MS: i64 = 5000;

const KEY_VALUE: &str = "value";
const KEY_KEY: &str = "key";

const WAIT_SRC: &str = r#"
local check, yield = ...
return function(self, timeout)
    local state, value = check(self, timeout)
    if state == "none" then
        return
    elseif state == "ready" then
        return value
    end
    return yield(self)
end
"#;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    NotPromised,
    Pending,
    Fulfilled,
    TimedOut,
}

#[derive(Debug, Clone)]
pub struct DeckPromise {
    state: PromiseState,
    time_promised: Option<i64>,
    time_fulfilled: Option<i64>,
    timeout: i64,
}

pub enum Wake {
    Wait,
    Resume(MultiValue),
}

impl DeckPromise {
    pub fn pending(clock: i64, timeout: i64) -> Self {
        DeckPromise {
            state: PromiseState::Pending,
            time_promised: Some(clock),
            time_fulfilled: None,
            timeout,
        }
    }

    pub fn state(&self) -> PromiseState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        matches!(self.state, PromiseState::Fulfilled | PromiseState::TimedOut)
    }

    pub fn time_taken(&self) -> Option<i64> {
        Some(self.time_fulfilled? - self.time_promised?)
    }

    fn expired(&self, clock: i64) -> bool {
        self.state == PromiseState::Pending
            && self
                .time_promised
                .is_some_and(|t| clock >= t.saturating_add(self.timeout))
    }

    fn time_out(&mut self, clock: i64) {
        self.state = PromiseState::TimedOut;
        self.time_fulfilled = Some(clock);
    }
}

fn check_timeout(ms: i64) -> LuaResult<i64> {
    if ms <= 0 {
        return Err(DeckError::arg_value(format!("timeout must be > 0, got {ms}")).into());
    }
    Ok(ms)
}

fn opt_int(v: Option<i64>) -> Value {
    v.map(Value::Integer).unwrap_or(Value::Nil)
}

/// Creates a pending promise started at the current clock.
pub fn new_pending(lua: &Lua, timeout: i64, key: Value) -> LuaResult<AnyUserData> {
    let clock = runtime(lua)?.clock();
    let ud = bridge::push_new(lua, DeckPromise::pending(clock, check_timeout(timeout)?))?;
    bridge::instance_env(&ud)?.raw_set(KEY_KEY, key)?;
    Ok(ud)
}

/// Stores `value` and marks the promise fulfilled. Returns false when the
/// promise was already fulfilled or timed out.
pub fn fulfill(lua: &Lua, ud: &AnyUserData, value: Value) -> LuaResult<bool> {
    let clock = runtime(lua)?.clock();
    {
        let mut p = ud.borrow_mut::<DeckPromise>()?;
        if p.is_ready() {
            return Ok(false);
        }
        p.state = PromiseState::Fulfilled;
        p.time_promised.get_or_insert(clock);
        p.time_fulfilled = Some(clock);
    }
    bridge::instance_env(ud)?.raw_set(KEY_VALUE, value)?;
    Ok(true)
}

/// Decides whether a coroutine parked on `ud` can resume at `clock`.
pub fn poll_wake(_lua: &Lua, ud: &AnyUserData, clock: i64) -> LuaResult<Wake> {
    let state = {
        let mut p = ud.borrow_mut::<DeckPromise>()?;
        if p.expired(clock) {
            p.time_out(clock);
        }
        p.state
    };
    Ok(match state {
        PromiseState::Pending => Wake::Wait,
        PromiseState::NotPromised => Wake::Resume(MultiValue::new()),
        PromiseState::Fulfilled | PromiseState::TimedOut => {
            let value: Value = bridge::instance_env(ud)?.raw_get(KEY_VALUE)?;
            Wake::Resume(MultiValue::from_iter([value]))
        }
    })
}

fn wait_check(lua: &Lua, (this, timeout): (Value, Option<i64>)) -> LuaResult<(&'static str, Value)> {
    let ud = bridge::check::<DeckPromise>(&this)?;
    let clock = runtime(lua)?.clock();
    let state = {
        let mut p = ud.borrow_mut::<DeckPromise>()?;
        if let Some(ms) = timeout {
            p.timeout = check_timeout(ms)?;
        }
        if p.expired(clock) {
            p.time_out(clock);
        }
        p.state
    };
    match state {
        PromiseState::NotPromised => Ok(("none", Value::Nil)),
        PromiseState::Pending => Ok(("wait", Value::Nil)),
        PromiseState::Fulfilled | PromiseState::TimedOut => {
            Ok(("ready", bridge::instance_env(&ud)?.raw_get(KEY_VALUE)?))
        }
    }
}

impl LuaClass for DeckPromise {
    const TYPE_NAME: &'static str = "deck:Promise";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        let check = lua.create_function(wait_check)?;
        let coroutine: Table = lua.globals().get("coroutine")?;
        let yield_fn: Function = coroutine.get("yield")?;
        let wait: Function = lua
            .load(WAIT_SRC)
            .set_name("=deck:Promise.wait")
            .call((check, yield_fn))?;
        class.raw_set("wait", wait)?;

        bridge::method_ud::<DeckPromise, _, _, _>(lua, class, "fulfill", |lua, ud, value: Value| {
            fulfill(lua, ud, value)
        })?;
        bridge::method_ud::<DeckPromise, _, _, _>(lua, class, "reset", |_, ud, ()| {
            {
                let mut p = ud.borrow_mut::<DeckPromise>()?;
                p.state = PromiseState::NotPromised;
                p.time_promised = None;
                p.time_fulfilled = None;
            }
            bridge::instance_env(ud)?.raw_set(KEY_VALUE, Value::Nil)
        })?;
        bridge::method_ud::<DeckPromise, _, _, _>(
            lua,
            class,
            "restart",
            |lua, ud, timeout: Option<i64>| {
                let clock = runtime(lua)?.clock();
                {
                    let mut p = ud.borrow_mut::<DeckPromise>()?;
                    if let Some(ms) = timeout {
                        p.timeout = check_timeout(ms)?;
                    }
                    *p = DeckPromise::pending(clock, p.timeout);
                }
                bridge::instance_env(ud)?.raw_set(KEY_VALUE, Value::Nil)
            },
        )
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "ready" => Value::Boolean(self.is_ready()),
            "timed_out" => Value::Boolean(self.state == PromiseState::TimedOut),
            "timeout" => Value::Integer(self.timeout),
            "time_promised" => opt_int(self.time_promised),
            "time_fulfilled" => opt_int(self.time_fulfilled),
            "time_taken" | "time_used" | "time" => opt_int(self.time_taken()),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match (key, value) {
            ("timeout", Value::Integer(ms)) => self.timeout = check_timeout(ms)?,
            ("timeout", Value::Number(ms)) => self.timeout = check_timeout(ms as i64)?,
            ("timeout", other) => {
                return Err(DeckError::arg_type(format!(
                    "deck:Promise.timeout must be a number, got {}",
                    other.type_name()
                ))
                .into())
            }
            _ => return Err(DeckError::readonly(Self::TYPE_NAME, key).into()),
        }
        Ok(NewIndex::Handled)
    }

    fn tostring(&self) -> String {
        let show = |v: Option<i64>| v.map_or_else(|| "nil".to_string(), |v| v.to_string());
        format!(
            "deck:Promise {{ ready={}, time_promised={}, time_fulfilled={}, timeout={} }}",
            self.is_ready(),
            show(self.time_promised),
            show(self.time_fulfilled),
            self.timeout
        )
    }
}

lua_class!(DeckPromise);

/// Insertion-ordered key → promise map. Promises are held weakly so a list
/// never keeps a promise alive that every script has dropped.
pub struct DeckPromiseList {
    default_timeout: i64,
    order: Vec<Value>,
    promises: Table,
}

impl DeckPromiseList {
    pub fn create(lua: &Lua, default_timeout: i64) -> LuaResult<AnyUserData> {
        let list = DeckPromiseList {
            default_timeout: check_timeout(default_timeout)?,
            order: Vec::new(),
            promises: bridge::weak_table(lua, "v")?,
        };
        bridge::push_new(lua, list)
    }

    fn live(&self, key: &Value) -> LuaResult<Option<AnyUserData>> {
        self.promises.raw_get(key.clone())
    }

    fn prune(&mut self) -> LuaResult<()> {
        let promises = self.promises.clone();
        let mut keep = Vec::with_capacity(self.order.len());
        for key in self.order.drain(..) {
            if !promises.raw_get::<Value>(key.clone())?.is_nil() {
                keep.push(key);
            }
        }
        self.order = keep;
        Ok(())
    }
}

fn check_key(key: &Value) -> LuaResult<()> {
    match key {
        Value::Nil => Err(DeckError::arg_value("promise key must not be nil").into()),
        Value::Number(n) if n.is_nan() => Err(DeckError::arg_value("promise key must not be NaN").into()),
        _ => Ok(()),
    }
}

/// Creates a pending promise under `key` (see `list:new`).
pub fn new_promise(
    lua: &Lua,
    list: &AnyUserData,
    key: Value,
    timeout: Option<i64>,
) -> LuaResult<AnyUserData> {
    check_key(&key)?;
    let mut this = list.borrow_mut::<DeckPromiseList>()?;
    if let Some(existing) = this.live(&key)? {
        if !existing.borrow::<DeckPromise>()?.is_ready() {
            return Err(DeckError::arg_value("a pending promise already uses this key").into());
        }
    }
    let promise = new_pending(lua, timeout.unwrap_or(this.default_timeout), key.clone())?;
    this.promises.raw_set(key.clone(), promise.clone())?;
    this.prune()?;
    this.order.push(key);
    Ok(promise)
}

/// Fulfills and removes the promise under `key`; `None` if the list has no
/// live promise for it.
pub fn fulfill_key(
    lua: &Lua,
    list: &AnyUserData,
    key: Value,
    value: Value,
) -> LuaResult<Option<AnyUserData>> {
    let promise = {
        let mut this = list.borrow_mut::<DeckPromiseList>()?;
        let Some(promise) = this.live(&key)? else {
            return Ok(None);
        };
        this.promises.raw_set(key, Value::Nil)?;
        this.prune()?;
        promise
    };
    fulfill(lua, &promise, value)?;
    Ok(Some(promise))
}

/// Fulfills every live promise in insertion order and empties the list.
pub fn fulfill_all(lua: &Lua, list: &AnyUserData, value: Value) -> LuaResult<usize> {
    let promises = {
        let mut this = list.borrow_mut::<DeckPromiseList>()?;
        let mut out = Vec::new();
        for key in std::mem::take(&mut this.order) {
            if let Some(p) = this.live(&key)? {
                out.push(p);
            }
            this.promises.raw_set(key, Value::Nil)?;
        }
        out
    };
    let mut n = 0;
    for p in &promises {
        if fulfill(lua, p, value.clone())? {
            n += 1;
        }
    }
    Ok(n)
}

pub fn live_count(list: &AnyUserData) -> LuaResult<usize> {
    list.borrow_mut::<DeckPromiseList>()?.prune()?;
    Ok(list.borrow::<DeckPromiseList>()?.order.len())
}

impl LuaClass for DeckPromiseList {
    const TYPE_NAME: &'static str = "deck:PromiseList";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        for name in ["new", "new_promise"] {
            bridge::method_ud::<DeckPromiseList, _, _, _>(
                lua,
                class,
                name,
                |lua, ud, (key, timeout): (Value, Option<i64>)| new_promise(lua, ud, key, timeout),
            )?;
        }
        for name in ["fulfill", "fulfill_promise"] {
            bridge::method_ud::<DeckPromiseList, _, _, _>(
                lua,
                class,
                name,
                |lua, ud, (key, value): (Value, Value)| fulfill_key(lua, ud, key, value),
            )?;
        }
        bridge::method_ud::<DeckPromiseList, _, _, _>(lua, class, "fulfill_all", |lua, ud, value: Value| {
            fulfill_all(lua, ud, value)
        })?;
        bridge::method::<DeckPromiseList, _, _, _>(lua, class, "get", |_, this, key: Value| {
            this.live(&key)
        })
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "default_timeout" => Value::Integer(self.default_timeout),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match (key, &value) {
            ("default_timeout", Value::Integer(ms)) => {
                self.default_timeout = check_timeout(*ms)?;
                Ok(NewIndex::Handled)
            }
            ("default_timeout", Value::Number(ms)) => {
                self.default_timeout = check_timeout(*ms as i64)?;
                Ok(NewIndex::Handled)
            }
            ("default_timeout", other) => Err(DeckError::arg_type(format!(
                "deck:PromiseList.default_timeout must be a number, got {}",
                other.type_name()
            ))
            .into()),
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn len(&self) -> LuaResult<i64> {
        let mut n = 0;
        for key in &self.order {
            if !self.promises.raw_get::<Value>(key.clone())?.is_nil() {
                n += 1;
            }
        }
        Ok(n)
    }

    fn tostring(&self) -> String {
        format!(
            "deck:PromiseList {{ n={}, default_timeout={} }}",
            self.len().unwrap_or_default(),
            self.default_timeout
        )
    }
}

lua_class!(DeckPromiseList);
