use mlua::{AnyUserData, Lua, Table, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub w: i32,
    pub h: i32,
}

fn clip_axis(a: i32, a_len: i32, b: i32, b_len: i32) -> (i32, i32) {
    let a_end = a + a_len;
    let origin = a.max(b).clamp(a, a_end);
    let len = (a_end.min(b + b_len) - origin).max(0);
    (origin, len)
}

impl Rect {
    pub fn new(x: i32, y: i32, w: i32, h: i32) -> Self {
        Rect { x, y, w, h }
    }

    pub fn right(&self) -> i32 {
        self.x + self.w
    }

    pub fn bottom(&self) -> i32 {
        self.y + self.h
    }

    pub fn is_empty(&self) -> bool {
        self.w <= 0 || self.h <= 0
    }

    /// Intersection of `self` with `other`, never extending past `self`.
    /// A disjoint axis collapses to zero length.
    pub fn clip(&self, other: &Rect) -> Rect {
        let (x, w) = clip_axis(self.x, self.w, other.x, other.w);
        let (y, h) = clip_axis(self.y, self.h, other.y, other.h);
        Rect { x, y, w, h }
    }

    pub fn contains(&self, x: i32, y: i32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    pub fn centered(&self, w: i32, h: i32) -> Rect {
        Rect {
            x: self.x + (self.w - w) / 2,
            y: self.y + (self.h - h) / 2,
            w,
            h,
        }
    }
}

pub struct DeckRect(pub Rect);

fn check_size(what: &str, v: i32) -> LuaResult<i32> {
    if v < 0 {
        return Err(DeckError::arg_value(format!("deck:Rect.{what} must be >= 0, got {v}")).into());
    }
    Ok(v)
}

fn int_arg(key: &str, v: &Value) -> LuaResult<i32> {
    match v {
        Value::Integer(i) => Ok(*i as i32),
        Value::Number(n) => Ok(n.round() as i32),
        other => Err(DeckError::arg_type(format!(
            "deck:Rect.{key} must be a number, got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub fn create(lua: &Lua, r: Rect) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, DeckRect(r))
}

pub fn new_from_args(lua: &Lua, (x, y, w, h): (Option<i32>, Option<i32>, Option<i32>, Option<i32>)) -> LuaResult<AnyUserData> {
    let r = Rect::new(
        x.unwrap_or(0),
        y.unwrap_or(0),
        check_size("w", w.unwrap_or(0))?,
        check_size("h", h.unwrap_or(0))?,
    );
    create(lua, r)
}

/// Reads a rect from a `deck:Rect` value.
pub fn rect_arg(v: &Value) -> LuaResult<Rect> {
    let ud = bridge::check::<DeckRect>(v)?;
    let r = ud.borrow::<DeckRect>()?.0;
    Ok(r)
}

impl LuaClass for DeckRect {
    const TYPE_NAME: &'static str = "deck:Rect";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<DeckRect, _, _, _>(lua, class, "clip", |lua, this, other: Value| {
            create(lua, this.0.clip(&rect_arg(&other)?))
        })?;
        bridge::method::<DeckRect, _, _, _>(lua, class, "contains", |_, this, (x, y): (i32, i32)| {
            Ok(this.0.contains(x, y))
        })?;
        bridge::method::<DeckRect, _, _, _>(lua, class, "move", |_, this, (dx, dy): (i32, i32)| {
            this.0.x += dx;
            this.0.y += dy;
            Ok(())
        })?;
        bridge::method::<DeckRect, _, _, _>(lua, class, "centered", |lua, this, (w, h): (i32, i32)| {
            create(lua, this.0.centered(check_size("w", w)?, check_size("h", h)?))
        })?;
        bridge::method::<DeckRect, _, _, _>(lua, class, "set_size", |_, this, (w, h): (i32, i32)| {
            this.0.w = check_size("w", w)?;
            this.0.h = check_size("h", h)?;
            Ok(())
        })?;
        bridge::method::<DeckRect, _, _, _>(lua, class, "set_position", |_, this, (x, y): (i32, i32)| {
            this.0.x = x;
            this.0.y = y;
            Ok(())
        })
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        let r = &self.0;
        let v = match key {
            "x" | "left" => r.x,
            "y" | "top" => r.y,
            "w" | "width" => r.w,
            "h" | "height" => r.h,
            "right" => r.right(),
            "bottom" => r.bottom(),
            "mid_x" => r.x + r.w / 2,
            "mid_y" => r.y + r.h / 2,
            _ => return Ok(Value::Nil),
        };
        Ok(Value::Integer(v as i64))
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "x" | "left" => self.0.x = int_arg(key, &value)?,
            "y" | "top" => self.0.y = int_arg(key, &value)?,
            "w" | "width" => self.0.w = check_size(key, int_arg(key, &value)?)?,
            "h" | "height" => self.0.h = check_size(key, int_arg(key, &value)?)?,
            "right" | "bottom" | "mid_x" | "mid_y" => {
                return Err(DeckError::readonly(Self::TYPE_NAME, key).into())
            }
            _ => return Ok(NewIndex::Store(value)),
        }
        Ok(NewIndex::Handled)
    }

    fn tostring(&self) -> String {
        let r = &self.0;
        format!("deck:Rect {{ x={}, y={}, w={}, h={} }}", r.x, r.y, r.w, r.h)
    }

    fn equals(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

lua_class!(DeckRect);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clip_is_bounded_by_the_receiver() {
        let a = Rect::new(0, 0, 10, 10);
        assert_eq!(a.clip(&Rect::new(5, 5, 10, 10)), Rect::new(5, 5, 5, 5));
        assert_eq!(a.clip(&Rect::new(-5, 2, 8, 3)), Rect::new(0, 2, 3, 3));
        assert_eq!(a.clip(&Rect::new(20, 0, 5, 5)), Rect::new(10, 0, 0, 5));
        let c = a.clip(&Rect::new(-20, -20, 5, 5));
        assert!(c.w == 0 && c.h == 0);
    }

    #[test]
    fn script_api() {
        let lua = Lua::new();
        lua.globals()
            .set(
                "Rect",
                lua.create_function(|lua, args: (Option<i32>, Option<i32>, Option<i32>, Option<i32>)| {
                    new_from_args(lua, args)
                })
                .unwrap(),
            )
            .unwrap();
        lua.load(
            r#"
            local r = Rect(1, 2, 10, 20)
            assert(r.right == 11 and r.bottom == 22 and r.mid_x == 6 and r.left == 1)
            assert(r:contains(1, 2) and not r:contains(11, 2))
            r:move(1, 1)
            assert(r == Rect(2, 3, 10, 20))
            assert(tostring(r) == "deck:Rect { x=2, y=3, w=10, h=20 }")
            local c = r:centered(4, 4)
            assert(c.x == 5 and c.y == 11)
            r.width = 4
            assert(r.w == 4)
            assert(not pcall(function() r.w = -1 end))
            assert(not pcall(function() r.right = 1 end))
            assert(not pcall(Rect, 0, 0, -1, 0))
            local k = Rect(0, 0, 10, 10):clip(Rect(20, 0, 5, 5))
            assert(k.x == 10 and k.w == 0)
            "#,
        )
        .exec()
        .unwrap();
    }
}
