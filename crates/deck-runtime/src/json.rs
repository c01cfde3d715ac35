//! Conversion between VM values and JSON documents.

use mlua::{Lua, Table, Value};
use serde_json::{Map, Number, Value as Json};

use crate::error::{DeckError, LuaResult};

const MAX_DEPTH: usize = 128;

/// Converts a VM value into JSON. Functions, threads and userdata are
/// dropped (as null inside arrays).
pub fn to_json(value: &Value) -> LuaResult<Json> {
    convert_out(value, 0)
}

fn convert_out(value: &Value, depth: usize) -> LuaResult<Json> {
    if depth > MAX_DEPTH {
        return Err(DeckError::arg_value("value nests too deeply to encode as JSON").into());
    }
    Ok(match value {
        Value::Nil => Json::Null,
        Value::Boolean(b) => Json::Bool(*b),
        Value::Integer(i) => Json::Number((*i).into()),
        Value::Number(n) => Number::from_f64(*n).map(Json::Number).unwrap_or(Json::Null),
        Value::String(s) => Json::String(s.to_string_lossy()),
        Value::Table(t) => table_out(t, depth)?,
        _ => Json::Null,
    })
}

fn is_dropped(v: &Value) -> bool {
    !matches!(
        v,
        Value::Nil | Value::Boolean(_) | Value::Integer(_) | Value::Number(_) | Value::String(_) | Value::Table(_)
    )
}

fn table_out(t: &Table, depth: usize) -> LuaResult<Json> {
    let mut entries = Vec::new();
    for pair in t.pairs::<Value, Value>() {
        entries.push(pair?);
    }
    let n = entries.len();
    let is_array = n > 0
        && entries.iter().all(|(k, _)| match k {
            Value::Integer(i) => *i >= 1 && (*i as usize) <= n,
            _ => false,
        });

    if is_array {
        let mut out = vec![Json::Null; n];
        for (k, v) in &entries {
            if let Value::Integer(i) = k {
                out[*i as usize - 1] = convert_out(v, depth + 1)?;
            }
        }
        return Ok(Json::Array(out));
    }

    let mut map = Map::new();
    for (k, v) in &entries {
        if is_dropped(v) {
            continue;
        }
        let key = match k {
            Value::String(s) => s.to_string_lossy(),
            Value::Integer(i) => i.to_string(),
            Value::Number(n) => n.to_string(),
            Value::Boolean(b) => b.to_string(),
            _ => continue,
        };
        map.insert(key, convert_out(v, depth + 1)?);
    }
    Ok(Json::Object(map))
}

pub fn encode(value: &Value, pretty: bool) -> LuaResult<String> {
    let json = to_json(value)?;
    let out = if pretty {
        serde_json::to_string_pretty(&json)
    } else {
        serde_json::to_string(&json)
    };
    out.map_err(|e| DeckError::arg_value(format!("cannot encode JSON: {e}")).into())
}

pub fn decode(lua: &Lua, text: &str) -> LuaResult<Value> {
    let json: Json = serde_json::from_str(text)
        .map_err(|e| DeckError::arg_value(format!("invalid JSON: {e}")))?;
    from_json(lua, &json)
}

/// Converts JSON into VM values; null maps to nil.
pub fn from_json(lua: &Lua, json: &Json) -> LuaResult<Value> {
    Ok(match json {
        Json::Null => Value::Nil,
        Json::Bool(b) => Value::Boolean(*b),
        Json::Number(n) => match n.as_i64() {
            Some(i) => Value::Integer(i),
            None => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Json::String(s) => Value::String(lua.create_string(s)?),
        Json::Array(items) => {
            let t = lua.create_table_with_capacity(items.len(), 0)?;
            for (i, item) in items.iter().enumerate() {
                t.raw_set(i + 1, from_json(lua, item)?)?;
            }
            Value::Table(t)
        }
        Json::Object(map) => {
            let t = lua.create_table_with_capacity(0, map.len())?;
            for (k, v) in map {
                t.raw_set(k.as_str(), from_json(lua, v)?)?;
            }
            Value::Table(t)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tables_pick_array_or_object_shape() {
        let lua = Lua::new();
        let v: Value = lua
            .load(r#"return { list = {1, 2, "three"}, empty = {}, nested = { ok = true }, f = print }"#)
            .eval()
            .unwrap();
        let json = to_json(&v).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "list": [1, 2, "three"], "empty": {}, "nested": { "ok": true } })
        );
    }

    #[test]
    fn arrays_keep_dropped_slots_as_null() {
        let lua = Lua::new();
        let v: Value = lua.load("return { 1, print, 3 }").eval().unwrap();
        assert_eq!(encode(&v, false).unwrap(), "[1,null,3]");
    }

    #[test]
    fn decode_round_trips_shapes() {
        let lua = Lua::new();
        let v = decode(&lua, r#"{"a":[1,2.5,null,"x"],"b":{"c":false}}"#).unwrap();
        lua.globals().set("v", v).unwrap();
        lua.load(
            r#"
            assert(v.a[1] == 1 and math.type(v.a[1]) == "integer")
            assert(v.a[2] == 2.5 and v.a[3] == nil and v.a[4] == "x")
            assert(v.b.c == false)
            "#,
        )
        .exec()
        .unwrap();
        let err = decode(&lua, "{nope").unwrap_err();
        assert!(err.to_string().contains("ArgValueError"));
    }

    #[test]
    fn self_referencing_tables_are_rejected() {
        let lua = Lua::new();
        let v: Value = lua.load("local t = {}; t.t = t; return t").eval().unwrap();
        assert!(to_json(&v).is_err());
    }
}
