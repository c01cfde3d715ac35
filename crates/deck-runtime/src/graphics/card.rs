use mlua::{AnyUserData, Lua, Table, Value};

use super::colour::{self, colour_arg};
use super::rect::rect_arg;
use super::surface::Surface;
use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

/// `deck.Card(w, h)`: a drawable RGBA surface.
pub struct DeckCard {
    surface: Surface,
    /// Bumped on every mutation so presenters can skip unchanged frames.
    generation: u64,
}

/// `deck.Image(card)`: an immutable snapshot.
pub struct DeckImage {
    surface: Surface,
}

impl DeckCard {
    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    fn touch(&mut self) {
        self.generation = self.generation.wrapping_add(1);
    }
}

impl DeckImage {
    pub fn surface(&self) -> &Surface {
        &self.surface
    }
}

fn check_dim(what: &str, v: i64) -> LuaResult<u32> {
    if v <= 0 || v > 16384 {
        return Err(DeckError::arg_value(format!("{what} must be in 1..16384, got {v}")).into());
    }
    Ok(v as u32)
}

pub fn create_card(lua: &Lua, (w, h): (i64, i64)) -> LuaResult<AnyUserData> {
    let card = DeckCard {
        surface: Surface::new(check_dim("width", w)?, check_dim("height", h)?),
        generation: 0,
    };
    bridge::push_new(lua, card)
}

pub fn create_image(lua: &Lua, src: Value) -> LuaResult<AnyUserData> {
    match &src {
        Value::String(_) => Err(DeckError::arg_value(
            "deck.Image: decoding image files is not supported, pass a deck:Card",
        )
        .into()),
        _ => {
            let surface = surface_of(&src)?;
            bridge::push_new(lua, DeckImage { surface })
        }
    }
}

/// Copies the pixels of a Card or Image value.
pub fn surface_of(v: &Value) -> LuaResult<Surface> {
    match v {
        Value::UserData(ud) if ud.is::<DeckCard>() => Ok(ud.borrow::<DeckCard>()?.surface.clone()),
        Value::UserData(ud) if ud.is::<DeckImage>() => Ok(ud.borrow::<DeckImage>()?.surface.clone()),
        other => Err(DeckError::Type {
            expected: "deck:Card or deck:Image",
            got: other.type_name().to_string(),
        }
        .into()),
    }
}

impl LuaClass for DeckCard {
    const TYPE_NAME: &'static str = "deck:Card";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<DeckCard, _, _, _>(lua, class, "clear", |_, this, c: Value| {
            this.surface.clear(colour_arg(&c)?);
            this.touch();
            Ok(())
        })?;
        bridge::method::<DeckCard, _, _, _>(lua, class, "fill", |_, this, (r, c): (Value, Value)| {
            this.surface.fill(rect_arg(&r)?, colour_arg(&c)?);
            this.touch();
            Ok(())
        })?;
        // Takes the handle so blitting a card onto itself does not double-borrow.
        bridge::method_ud::<DeckCard, _, _, _>(
            lua,
            class,
            "blit",
            |_, ud, (src, x, y): (Value, Option<i32>, Option<i32>)| {
                let pixels = surface_of(&src)?;
                let mut this = ud.borrow_mut::<DeckCard>()?;
                this.surface.blit(&pixels, x.unwrap_or(0), y.unwrap_or(0));
                this.touch();
                Ok(())
            },
        )?;
        bridge::method::<DeckCard, _, _, _>(lua, class, "get_pixel", |lua, this, (x, y): (i32, i32)| {
            match this.surface.get_pixel(x, y) {
                Some(c) => Ok(Some(colour::create(lua, c)?)),
                None => Ok(None),
            }
        })?;
        bridge::method::<DeckCard, _, _, _>(
            lua,
            class,
            "set_pixel",
            |_, this, (x, y, c): (i32, i32, Value)| {
                let ok = this.surface.set_pixel(x, y, colour_arg(&c)?);
                this.touch();
                Ok(ok)
            },
        )
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "width" => Value::Integer(self.surface.width() as i64),
            "height" => Value::Integer(self.surface.height() as i64),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "width" | "height" => Err(DeckError::readonly(Self::TYPE_NAME, key).into()),
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn tostring(&self) -> String {
        format!(
            "deck:Card {{ width={}, height={} }}",
            self.surface.width(),
            self.surface.height()
        )
    }
}

lua_class!(DeckCard);

impl LuaClass for DeckImage {
    const TYPE_NAME: &'static str = "deck:Image";

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "width" => Value::Integer(self.surface.width() as i64),
            "height" => Value::Integer(self.surface.height() as i64),
            _ => Value::Nil,
        })
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "width" | "height" => Err(DeckError::readonly(Self::TYPE_NAME, key).into()),
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn tostring(&self) -> String {
        format!(
            "deck:Image {{ width={}, height={} }}",
            self.surface.width(),
            self.surface.height()
        )
    }
}

lua_class!(DeckImage);
