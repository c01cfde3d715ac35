use mlua::{AnyUserData, Lua, Table, Value};

use super::font::{self, DeckFont};
use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

/// `deck.Text(...)`: a string bound to the Font it is meant to be drawn
/// with. Layout is character based since glyphs are never rasterized.
#[derive(Debug, Clone, Default)]
pub struct DeckText {
    pub text: String,
    pub font: DeckFont,
}

/// Breaks `text` into lines of at most `width` characters. Explicit
/// newlines always break, words longer than a line are split.
pub fn wrap(text: &str, width: usize) -> Vec<String> {
    let width = width.max(1);
    let mut lines = Vec::new();
    for paragraph in text.split('\n') {
        let mut line = String::new();
        let mut len = 0;
        for word in paragraph.split_whitespace() {
            let mut chars: Vec<char> = word.chars().collect();
            if len > 0 && len + 1 + chars.len() > width {
                lines.push(std::mem::take(&mut line));
                len = 0;
            }
            while len == 0 && chars.len() > width {
                let rest = chars.split_off(width);
                lines.push(chars.into_iter().collect());
                chars = rest;
            }
            if len > 0 {
                line.push(' ');
                len += 1;
            }
            line.extend(chars.iter());
            len += chars.len();
        }
        lines.push(line);
    }
    lines
}

fn font_arg(value: &Value) -> LuaResult<DeckFont> {
    match value {
        Value::Nil => Ok(DeckFont::default()),
        Value::UserData(ud) if ud.is::<DeckFont>() => Ok(ud.borrow::<DeckFont>()?.clone()),
        Value::Table(props) => DeckFont::from_props(props),
        other => Err(DeckError::Type {
            expected: "deck:Font or table",
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

fn text_arg(value: &Value) -> LuaResult<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(DeckError::Type {
            expected: "string",
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

pub fn push(lua: &Lua, text: DeckText) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, text)
}

/// Accepts a string, a `{ text=, font= }` table or another Text.
pub fn create(lua: &Lua, (value, font): (Value, Option<Value>)) -> LuaResult<AnyUserData> {
    let mut text = match &value {
        Value::UserData(ud) if ud.is::<DeckText>() => ud.borrow::<DeckText>()?.clone(),
        Value::Table(t) => DeckText {
            text: match t.raw_get::<Value>("text")? {
                Value::Nil => String::new(),
                v => text_arg(&v)?,
            },
            font: font_arg(&t.raw_get::<Value>("font")?)?,
        },
        other => DeckText {
            text: text_arg(other)?,
            font: DeckFont::default(),
        },
    };
    if let Some(font) = font {
        text.font = font_arg(&font)?;
    }
    push(lua, text)
}

impl LuaClass for DeckText {
    const TYPE_NAME: &'static str = "deck:Text";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<DeckText, _, _, _>(lua, class, "wrap", |lua, this, width: i64| {
            if width <= 0 {
                return Err(DeckError::arg_value(format!("deck:Text.wrap width must be > 0, got {width}")).into());
            }
            lua.create_sequence_from(wrap(&this.text, width as usize))
        })?;
        bridge::method::<DeckText, _, _, _>(lua, class, "clone", |lua, this, ()| push(lua, this.clone()))
    }

    fn index(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "text" => Value::String(lua.create_string(&self.text)?),
            "font" => Value::UserData(font::push(lua, self.font.clone())?),
            "length" => Value::Integer(self.text.chars().count() as i64),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "text" => self.text = text_arg(&value)?,
            "font" => self.font = font_arg(&value)?,
            "length" => return Err(DeckError::arg_value("deck:Text.length is read-only").into()),
            _ => return Ok(NewIndex::Store(value)),
        }
        Ok(NewIndex::Handled)
    }

    fn tostring(&self) -> String {
        format!("deck:Text {{ text={:?}, font={} }}", self.text, self.font.name)
    }

    fn equals(&self, other: &Self) -> bool {
        self.text == other.text && self.font.name == other.font.name
    }
}

lua_class!(DeckText);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrapping_breaks_on_words_and_newlines() {
        assert_eq!(wrap("the quick brown fox", 9), vec!["the quick", "brown fox"]);
        assert_eq!(wrap("a\n\nb", 10), vec!["a", "", "b"]);
        assert_eq!(wrap("abcdefgh ij", 3), vec!["abc", "def", "gh", "ij"]);
        assert_eq!(wrap("", 4), vec![""]);
    }

    #[test]
    fn text_objects_carry_their_font() {
        let lua = Lua::new();
        lua.globals()
            .set("Text", lua.create_function(create).unwrap())
            .unwrap();
        lua.globals()
            .set("Font", lua.create_function(font::create).unwrap())
            .unwrap();
        lua.load(
            r##"
            local t = Text("hello world")
            assert(t.text == "hello world" and t.length == 11 and t.font.name == "sans")
            local f = Font{ name = "mono", size = 20 }
            local u = Text({ text = "a b c", font = f })
            assert(u.font.name == "mono" and u.font.size == 20)
            local w = u:wrap(3)
            assert(#w == 2 and w[1] == "a b" and w[2] == "c")
            local r = f:render("tagged")
            assert(r.text == "tagged" and r.font.name == "mono")
            f.size = 8
            assert(r.font.size == 20)
            t.font = { name = "serif" }
            assert(t.font.name == "serif")
            assert(not pcall(function() t.length = 1 end))
            assert(not pcall(Text, {}, 5))
            assert(not pcall(function() return u:wrap(0) end))
            assert(Text(u) == u and tostring(u):find("deck:Text", 1, true))
            "##,
        )
        .exec()
        .unwrap();
    }
}
