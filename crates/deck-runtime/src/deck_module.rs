//! The `deck` global: constructors for every script-visible object, the
//! connector container, the logger and `deck.util`.

use mlua::{AnyUserData, Lua, Table, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::connector;
use crate::error::{DeckError, LuaResult};
use crate::graphics::{card, colour, font, rect, text};
use crate::logger;
use crate::lua_class;
use crate::promise::{self, DeckPromiseList, DEFAULT_TIMEOUT_MS};
use crate::runtime::runtime;
use crate::util_api;

pub struct DeckModule;

/// Builds the `deck` singleton together with its sub-modules.
pub fn create(lua: &Lua) -> LuaResult<AnyUserData> {
    if let Some(existing) = bridge::global_instance::<DeckModule>(lua)? {
        return Ok(existing);
    }
    let ud = bridge::push_new(lua, DeckModule)?;
    let env = bridge::instance_env(&ud)?;
    env.raw_set("logger", logger::create(lua)?)?;
    env.raw_set("util", util_api::create(lua)?)?;
    env.raw_set("connectors", connector::container(lua)?)?;
    Ok(ud)
}

fn clock_arg(lua: &Lua, clock: Option<i64>) -> LuaResult<i64> {
    match clock {
        Some(c) => Ok(c),
        None => Ok(runtime(lua)?.clock()),
    }
}

fn exit(lua: &Lua, code: Option<i64>) -> LuaResult<()> {
    let code = code.unwrap_or(0);
    let code = i32::try_from(code)
        .map_err(|_| DeckError::arg_value(format!("exit code {code} is out of range")))?;
    runtime(lua)?.request_exit(code);
    Ok(())
}

impl LuaClass for DeckModule {
    const TYPE_NAME: &'static str = "deck:Module";
    const SINGLETON: bool = true;

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::module_function::<DeckModule, _, _, _>(
            lua,
            class,
            "Connector",
            |lua, (class, name, props): (String, String, Option<Table>)| {
                connector::get_or_create(lua, &class, &name, props)
            },
        )?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Card", card::create_card)?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Image", card::create_image)?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Font", font::create)?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Text", text::create)?;
        for name in ["Colour", "Color"] {
            bridge::module_function::<DeckModule, _, _, _>(lua, class, name, colour::new_from_arg)?;
        }
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Rect", rect::new_from_args)?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "PromiseList", |lua, timeout: Option<i64>| {
            DeckPromiseList::create(lua, timeout.unwrap_or(DEFAULT_TIMEOUT_MS))
        })?;
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "Promise", |lua, timeout: Option<i64>| {
            promise::new_pending(lua, timeout.unwrap_or(DEFAULT_TIMEOUT_MS), Value::Nil)
        })?;
        for name in ["exit", "quit"] {
            bridge::module_function::<DeckModule, _, _, _>(lua, class, name, exit)?;
        }
        for method in ["tick_inputs", "tick_outputs"] {
            bridge::module_function::<DeckModule, _, _, _>(lua, class, method, move |lua, clock: Option<i64>| {
                let clock = clock_arg(lua, clock)?;
                connector::tick_all(lua, method, clock)
            })?;
        }
        bridge::module_function::<DeckModule, _, _, _>(lua, class, "shutdown", |lua, ()| {
            connector::shutdown_all(lua)
        })
    }

    fn index(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "clock" => Value::Integer(runtime(lua)?.clock()),
            "delta" => Value::Integer(runtime(lua)?.delta()),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, _value: Value) -> LuaResult<NewIndex> {
        Err(DeckError::readonly(Self::TYPE_NAME, key).into())
    }
}

lua_class!(DeckModule);
