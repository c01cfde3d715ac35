//! `deck.logger`: script-facing logging routed into `tracing`.

use std::ffi::c_void;

use mlua::{AnyUserData, Function, LightUserData, Lua, MultiValue, Table, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, ErrorContext, LuaResult};
use crate::lua_class;
use crate::runtime::runtime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug = 1,
    Info = 2,
    Warning = 3,
    Error = 4,
}

impl LogLevel {
    pub const ALL: [LogLevel; 4] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
        }
    }

    /// Level constants are light userdata so they cannot be confused with
    /// message strings.
    fn to_light(self) -> LightUserData {
        LightUserData(self as usize as *mut c_void)
    }

    fn from_value(v: &Value) -> Option<Self> {
        let Value::LightUserData(LightUserData(p)) = v else {
            return None;
        };
        LogLevel::ALL.into_iter().find(|l| l.to_light().0 == *p)
    }
}

pub struct DeckLogger;

/// Stringifies a value the way the VM's `tostring` does.
pub fn tostring(lua: &Lua, v: &Value) -> LuaResult<String> {
    match v {
        Value::String(s) => Ok(s.to_string_lossy()),
        Value::Nil => Ok("nil".to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        _ => {
            let f: Function = lua.globals().get("tostring")?;
            f.call(v.clone())
        }
    }
}

fn emit_tracing(level: LogLevel, line: &str) {
    match level {
        LogLevel::Debug => tracing::debug!(target: "script", "{line}"),
        LogLevel::Info => tracing::info!(target: "script", "{line}"),
        LogLevel::Warning => tracing::warn!(target: "script", "{line}"),
        LogLevel::Error => tracing::error!(target: "script", "{line}"),
    }
}

/// Logs a script-originated message and hands it to `deck.logger.on_message`.
pub fn log_message(lua: &Lua, level: LogLevel, message: &str) {
    for line in message.lines() {
        emit_tracing(level, line.trim_end());
    }
    if let Err(err) = deliver(lua, level, message) {
        tracing::warn!(error = %err, "deck.logger.on_message failed");
    }
}

fn deliver(lua: &Lua, level: LogLevel, message: &str) -> LuaResult<()> {
    let Ok(rt) = runtime(lua) else {
        return Ok(());
    };
    let Some(logger) = bridge::global_instance::<DeckLogger>(lua)? else {
        return Ok(());
    };
    let Some(handler) = bridge::instance_env(&logger)?.raw_get::<Option<Function>>("on_message")?
    else {
        return Ok(());
    };
    if rt.logger_busy.replace(true) {
        return Ok(());
    }
    let result = handler.call::<()>((Value::LightUserData(level.to_light()), message));
    rt.logger_busy.set(false);
    result
}

pub fn log_error(lua: &Lua, err: &mlua::Error) {
    log_message(lua, LogLevel::Error, &ErrorContext::from_lua_error(err).to_string());
}

fn join_args(lua: &Lua, args: impl IntoIterator<Item = Value>) -> LuaResult<String> {
    let parts = args
        .into_iter()
        .map(|v| tostring(lua, &v))
        .collect::<LuaResult<Vec<_>>>()?;
    Ok(parts.join(" "))
}

/// Replacement for the global `print`.
pub fn print(lua: &Lua, args: MultiValue) -> LuaResult<()> {
    let msg = join_args(lua, args)?;
    log_message(lua, LogLevel::Info, &msg);
    Ok(())
}

pub fn create(lua: &Lua) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, DeckLogger)
}

impl LuaClass for DeckLogger {
    const TYPE_NAME: &'static str = "deck:Logger";
    const SINGLETON: bool = true;

    fn init_class_table(_lua: &Lua, class: &Table) -> LuaResult<()> {
        for level in LogLevel::ALL {
            class.raw_set(level.as_str(), Value::LightUserData(level.to_light()))?;
        }
        Ok(())
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "on_message" => Ok(NewIndex::Store(value)),
            _ => Err(DeckError::readonly(Self::TYPE_NAME, key).into()),
        }
    }

    fn call(lua: &Lua, _this: &AnyUserData, args: MultiValue) -> LuaResult<MultiValue> {
        let mut args = args.into_iter().peekable();
        let level = match args.peek().and_then(LogLevel::from_value) {
            Some(level) => {
                args.next();
                level
            }
            None => LogLevel::Info,
        };
        let msg = join_args(lua, args)?;
        log_message(lua, level, &msg);
        Ok(MultiValue::new())
    }
}

lua_class!(DeckLogger);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::test_support::lua_with_runtime;

    #[test]
    fn levels_and_handler() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("logger", create(&lua).unwrap()).unwrap();
        lua.load(
            r#"
            seen = {}
            logger.on_message = function(level, msg)
                seen[#seen + 1] = { level, msg }
                logger("nested call is suppressed")
            end
            logger(logger.WARNING, "disk", 42, nil, true)
            logger("plain")
            "#,
        )
        .exec()
        .unwrap();
        lua.load(
            r#"
            assert(#seen == 2, #seen)
            assert(seen[1][1] == logger.WARNING)
            assert(seen[1][2] == "disk 42 nil true")
            assert(seen[2][1] == logger.INFO)
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn logger_is_a_singleton_with_readonly_levels() {
        let (lua, _rt) = lua_with_runtime();
        let a = create(&lua).unwrap();
        let b = create(&lua).unwrap();
        assert_eq!(a, b);
        lua.globals().set("logger", a).unwrap();
        assert!(lua.load("logger.DEBUG = 1").exec().is_err());
        assert!(lua.load("logger.other = 1").exec().is_err());
        assert!(lua.load("logger.on_message = 1").exec().is_err());
    }

    #[test]
    fn errors_are_logged_with_context() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("logger", create(&lua).unwrap()).unwrap();
        lua.load("logger.on_message = function(_, m) last = m end")
            .exec()
            .unwrap();
        let err = lua
            .load("error('kaput')")
            .set_name("=main.lua")
            .exec()
            .unwrap_err();
        log_error(&lua, &err);
        let last: String = lua.globals().get("last").unwrap();
        assert_eq!(last, "main.lua:1: kaput");
    }
}
