use mlua::{AnyUserData, Lua, Table, Value};

use super::colour::{self, colour_arg, Colour};
use super::text::{self, DeckText};
use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alignment {
    Left,
    Center,
    Right,
}

impl Alignment {
    pub fn as_str(self) -> &'static str {
        match self {
            Alignment::Left => "left",
            Alignment::Center => "center",
            Alignment::Right => "right",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Alignment::Left),
            "center" | "centre" => Some(Alignment::Center),
            "right" => Some(Alignment::Right),
            _ => None,
        }
    }
}

/// `deck.Font{...}`: validated text-style properties.
#[derive(Debug, Clone)]
pub struct DeckFont {
    pub name: String,
    pub size: f64,
    pub colour: Colour,
    pub alignment: Alignment,
}

impl Default for DeckFont {
    fn default() -> Self {
        DeckFont {
            name: "sans".to_string(),
            size: 12.0,
            colour: Colour::WHITE,
            alignment: Alignment::Left,
        }
    }
}

impl DeckFont {
    fn set(&mut self, key: &str, value: &Value) -> LuaResult<bool> {
        match key {
            "name" => match value {
                Value::String(s) if !s.as_bytes().is_empty() => self.name = s.to_str()?.to_string(),
                _ => return Err(DeckError::arg_value("deck:Font.name must be a non-empty string").into()),
            },
            "size" => {
                let size = match value {
                    Value::Integer(i) => *i as f64,
                    Value::Number(n) => *n,
                    _ => return Err(DeckError::arg_type("deck:Font.size must be a number").into()),
                };
                if !(size > 0.0) {
                    return Err(DeckError::arg_value(format!("deck:Font.size must be > 0, got {size}")).into());
                }
                self.size = size;
            }
            "colour" | "color" => self.colour = colour_arg(value)?,
            "alignment" => {
                let s = match value {
                    Value::String(s) => s.to_str()?.to_ascii_lowercase(),
                    _ => return Err(DeckError::arg_type("deck:Font.alignment must be a string").into()),
                };
                self.alignment = Alignment::parse(&s).ok_or_else(|| {
                    DeckError::arg_value(format!("deck:Font.alignment must be left, center or right, got {s:?}"))
                })?;
            }
            _ => return Ok(false),
        }
        Ok(true)
    }
}

impl DeckFont {
    /// Builds a font from a property table, ignoring keys it does not own.
    pub fn from_props(props: &Table) -> LuaResult<DeckFont> {
        Ok(Self::split_props(Some(props))?.0)
    }

    fn split_props(props: Option<&Table>) -> LuaResult<(DeckFont, Vec<(String, Value)>)> {
        let mut font = DeckFont::default();
        let mut extra = Vec::new();
        if let Some(props) = props {
            for pair in props.pairs::<String, Value>() {
                let (k, v) = pair?;
                if !font.set(&k, &v)? {
                    extra.push((k, v));
                }
            }
        }
        Ok((font, extra))
    }
}

pub fn push(lua: &Lua, font: DeckFont) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, font)
}

pub fn create(lua: &Lua, props: Option<Table>) -> LuaResult<AnyUserData> {
    let (font, extra) = DeckFont::split_props(props.as_ref())?;
    let ud = push(lua, font)?;
    let env = bridge::instance_env(&ud)?;
    for (k, v) in extra {
        env.raw_set(k, v)?;
    }
    Ok(ud)
}

impl LuaClass for DeckFont {
    const TYPE_NAME: &'static str = "deck:Font";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<DeckFont, _, _, _>(lua, class, "render", |lua, this, s: String| {
            text::push(lua, DeckText { text: s, font: this.clone() })
        })
    }

    fn index(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "name" => Value::String(lua.create_string(&self.name)?),
            "size" => Value::Number(self.size),
            "colour" | "color" => Value::UserData(colour::create(lua, self.colour)?),
            "alignment" => Value::String(lua.create_string(self.alignment.as_str())?),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        if self.set(key, &value)? {
            Ok(NewIndex::Handled)
        } else {
            Ok(NewIndex::Store(value))
        }
    }

    fn tostring(&self) -> String {
        format!(
            "deck:Font {{ name={}, size={}, alignment={} }}",
            self.name,
            self.size,
            self.alignment.as_str()
        )
    }
}

lua_class!(DeckFont);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn properties_are_validated() {
        let lua = Lua::new();
        lua.globals()
            .set("Font", lua.create_function(create).unwrap())
            .unwrap();
        lua.load(
            r##"
            local f = Font{ name = "mono", size = 18, colour = "#ff0000", alignment = "Center", tag = 1 }
            assert(f.name == "mono" and f.size == 18 and f.alignment == "center" and f.tag == 1)
            assert(f.colour.r == 255 and f.color.g == 0)
            f.size = 9.5
            assert(f.size == 9.5)
            assert(not pcall(function() f.size = 0 end))
            assert(not pcall(function() f.alignment = "justify" end))
            assert(not pcall(Font, { colour = "nope" }))
            assert(Font().name == "sans")
            "##,
        )
        .exec()
        .unwrap();
    }
}
