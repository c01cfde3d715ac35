use mlua::{AnyUserData, Lua, Table, Value};

use deck_util::{blob, Blob, BlobError};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::json;
use crate::lua_class;

/// `deck.util`: encoding and hashing helpers.
pub struct DeckUtil;

pub fn create(lua: &Lua) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, DeckUtil)
}

fn blob_err(err: BlobError) -> mlua::Error {
    DeckError::arg_value(err.to_string()).into()
}

fn digest(lua: &Lua, bytes: &[u8], hex: Option<bool>) -> LuaResult<mlua::String> {
    if hex.unwrap_or(false) {
        lua.create_string(blob::to_hex(bytes))
    } else {
        lua.create_string(bytes)
    }
}

impl LuaClass for DeckUtil {
    const TYPE_NAME: &'static str = "deck:Util";
    const SINGLETON: bool = true;

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::module_function::<DeckUtil, _, _, _>(
            lua,
            class,
            "to_json",
            |_, (value, pretty): (Value, Option<bool>)| json::encode(&value, pretty.unwrap_or(false)),
        )?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "from_json", |lua, s: mlua::String| {
            json::decode(lua, &s.to_str()?)
        })?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "to_base64", |_, s: mlua::String| {
            Ok(Blob::from_slice(&s.as_bytes()).to_base64())
        })?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "from_base64", |lua, s: mlua::String| {
            let blob = Blob::from_base64(&s.to_str()?).map_err(blob_err)?;
            lua.create_string(blob.as_slice())
        })?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "to_hex", |_, s: mlua::String| {
            Ok(blob::to_hex(&s.as_bytes()))
        })?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "from_hex", |lua, s: mlua::String| {
            let bytes = blob::from_hex(&s.to_str()?).map_err(blob_err)?;
            lua.create_string(bytes)
        })?;
        bridge::module_function::<DeckUtil, _, _, _>(
            lua,
            class,
            "sha1",
            |lua, (s, hex): (mlua::String, Option<bool>)| {
                digest(lua, &Blob::from_slice(&s.as_bytes()).sha1(), hex)
            },
        )?;
        bridge::module_function::<DeckUtil, _, _, _>(
            lua,
            class,
            "sha256",
            |lua, (s, hex): (mlua::String, Option<bool>)| {
                digest(lua, &Blob::from_slice(&s.as_bytes()).sha256(), hex)
            },
        )?;
        bridge::module_function::<DeckUtil, _, _, _>(lua, class, "random_bytes", |lua, n: i64| {
            if n <= 0 {
                return Err(DeckError::arg_value(format!("random_bytes: n must be > 0, got {n}")).into());
            }
            let blob = Blob::random(n as usize).map_err(|e| mlua::Error::from(DeckError::Io(e.to_string())))?;
            lua.create_string(blob.as_slice())
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, _value: Value) -> LuaResult<NewIndex> {
        Err(DeckError::readonly(Self::TYPE_NAME, key).into())
    }
}

lua_class!(DeckUtil);

#[cfg(test)]
mod tests {
    use super::*;

    fn lua_with_util() -> Lua {
        let lua = Lua::new();
        lua.globals().set("util", create(&lua).unwrap()).unwrap();
        lua
    }

    #[test]
    fn encodings() {
        let lua = lua_with_util();
        lua.load(
            r#"
            assert(util.to_base64("hello") == "aGVsbG8=")
            assert(util.from_base64("aGVsbG8=") == "hello")
            assert(util.to_hex("\0\255A") == "00ff41")
            assert(util.from_hex("00FF41") == "\0\255A")
            assert(util:to_hex("x") == "78")
            assert(util.sha1("abc", true) == "a9993e364706816aba3e25717850c26c9cd0d89d")
            assert(#util.sha1("abc") == 20)
            assert(util.sha256("abc", true) ==
                "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
            assert(#util.random_bytes(16) == 16)
            local t = util.from_json(util.to_json({ a = { 1, 2 }, b = "c" }))
            assert(t.a[2] == 2 and t.b == "c")
            "#,
        )
        .exec()
        .unwrap();
    }

    #[test]
    fn bad_input_is_an_arg_value_error() {
        let lua = lua_with_util();
        for src in [
            "util.from_base64('***')",
            "util.from_hex('abc')",
            "util.from_hex('zz')",
            "util.random_bytes(0)",
            "util.from_json('[')",
        ] {
            let err = lua.load(src).exec().unwrap_err();
            assert!(err.to_string().contains("ArgValueError"), "{src}: {err}");
        }
        let err = lua.load("util.from_base64('***')").exec().unwrap_err();
        assert!(err.to_string().contains("input is not valid base64"));
    }
}
