use mlua::{AnyUserData, Lua, Table, Value};

use crate::bridge::{self, LuaClass, NewIndex};
use crate::error::{DeckError, LuaResult};
use crate::lua_class;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Colour {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

const NAMED: &[(&str, Colour)] = &[
    ("black", Colour::rgb(0, 0, 0)),
    ("white", Colour::rgb(255, 255, 255)),
    ("red", Colour::rgb(255, 0, 0)),
    ("green", Colour::rgb(0, 255, 0)),
    ("blue", Colour::rgb(0, 0, 255)),
    ("yellow", Colour::rgb(255, 255, 0)),
    ("cyan", Colour::rgb(0, 255, 255)),
    ("magenta", Colour::rgb(255, 0, 255)),
    ("grey", Colour::rgb(128, 128, 128)),
    ("gray", Colour::rgb(128, 128, 128)),
    ("orange", Colour::rgb(255, 165, 0)),
    ("transparent", Colour::rgba(0, 0, 0, 0)),
];

impl Default for Colour {
    fn default() -> Self {
        Colour::BLACK
    }
}

impl Colour {
    pub const BLACK: Colour = Colour::rgb(0, 0, 0);
    pub const WHITE: Colour = Colour::rgb(255, 255, 255);

    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Colour { r, g, b, a: 255 }
    }

    pub const fn rgba(r: u8, g: u8, b: u8, a: u8) -> Self {
        Colour { r, g, b, a }
    }

    pub fn to_rgba(self) -> [u8; 4] {
        [self.r, self.g, self.b, self.a]
    }

    pub fn from_rgba(px: &[u8]) -> Self {
        Colour::rgba(px[0], px[1], px[2], px[3])
    }

    fn channel(self, c: char) -> Option<u8> {
        match c {
            'r' => Some(self.r),
            'g' => Some(self.g),
            'b' => Some(self.b),
            'a' => Some(self.a),
            _ => None,
        }
    }

    /// Parses `#rgb`, `#rgba`, `#rrggbb`, `#rrggbbaa` or a colour name.
    pub fn parse(spec: &str) -> Option<Colour> {
        let spec = spec.trim();
        if let Some(hex) = spec.strip_prefix('#') {
            return parse_hex(hex);
        }
        let lower = spec.to_ascii_lowercase();
        NAMED.iter().find(|(n, _)| *n == lower).map(|(_, c)| *c)
    }

    /// Packs the named channels into one integer, first channel most
    /// significant (`"rgb"` → 0xRRGGBB).
    pub fn swizzle(self, key: &str) -> Option<i64> {
        if !(2..=4).contains(&key.len()) {
            return None;
        }
        key.chars()
            .try_fold(0i64, |acc, c| Some((acc << 8) | self.channel(c)? as i64))
    }

    pub fn to_hex_string(self) -> String {
        let mut s = format!("#{:02x}{:02x}{:02x}", self.r, self.g, self.b);
        if self.a != 255 {
            s.push_str(&format!("{:02x}", self.a));
        }
        s
    }
}

fn parse_hex(hex: &str) -> Option<Colour> {
    if !hex.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    let nibble = |i: usize| u8::from_str_radix(&hex[i..i + 1], 16).ok().map(|v| v * 17);
    let byte = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    match hex.len() {
        3 => Some(Colour::rgb(nibble(0)?, nibble(1)?, nibble(2)?)),
        4 => Some(Colour::rgba(nibble(0)?, nibble(1)?, nibble(2)?, nibble(3)?)),
        6 => Some(Colour::rgb(byte(0)?, byte(2)?, byte(4)?)),
        8 => Some(Colour::rgba(byte(0)?, byte(2)?, byte(4)?, byte(6)?)),
        _ => None,
    }
}

fn clamp_channel(key: &str, v: &Value) -> LuaResult<u8> {
    let n = match v {
        Value::Integer(i) => *i as f64,
        Value::Number(n) => *n,
        other => {
            return Err(DeckError::arg_type(format!(
                "deck:Colour.{key} must be a number, got {}",
                other.type_name()
            ))
            .into())
        }
    };
    Ok(n.round().clamp(0.0, 255.0) as u8)
}

/// Coerces a colour argument: a `deck:Colour`, a spec string or an
/// `{r=, g=, b=, a=}` table.
pub fn colour_arg(v: &Value) -> LuaResult<Colour> {
    match v {
        Value::UserData(ud) if ud.is::<DeckColour>() => Ok(ud.borrow::<DeckColour>()?.0),
        Value::String(s) => {
            let spec = s.to_str()?;
            Colour::parse(&spec)
                .ok_or_else(|| DeckError::arg_value(format!("invalid colour {:?}", &*spec)).into())
        }
        Value::Table(t) => {
            let get = |k: &str| -> LuaResult<Option<u8>> {
                match t.raw_get::<Value>(k)? {
                    Value::Nil => Ok(None),
                    v => Ok(Some(clamp_channel(k, &v)?)),
                }
            };
            Ok(Colour::rgba(
                get("r")?.unwrap_or(0),
                get("g")?.unwrap_or(0),
                get("b")?.unwrap_or(0),
                get("a")?.unwrap_or(255),
            ))
        }
        other => Err(DeckError::arg_type(format!(
            "expected a colour (deck:Colour, string or table), got {}",
            other.type_name()
        ))
        .into()),
    }
}

pub struct DeckColour(pub Colour);

pub fn create(lua: &Lua, c: Colour) -> LuaResult<AnyUserData> {
    bridge::push_new(lua, DeckColour(c))
}

pub fn new_from_arg(lua: &Lua, spec: Value) -> LuaResult<AnyUserData> {
    let c = match spec {
        Value::Nil => Colour::default(),
        v => colour_arg(&v)?,
    };
    create(lua, c)
}

impl LuaClass for DeckColour {
    const TYPE_NAME: &'static str = "deck:Colour";

    fn init_class_table(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<DeckColour, _, _, _>(lua, class, "to_string", |_, this, ()| {
            Ok(this.0.to_hex_string())
        })
    }

    fn index(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        let c = self.0;
        if let [ch] = key.as_bytes() {
            if let Some(v) = c.channel(*ch as char) {
                return Ok(Value::Integer(v as i64));
            }
        }
        Ok(c.swizzle(key).map(Value::Integer).unwrap_or(Value::Nil))
    }

    fn newindex(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "r" => self.0.r = clamp_channel(key, &value)?,
            "g" => self.0.g = clamp_channel(key, &value)?,
            "b" => self.0.b = clamp_channel(key, &value)?,
            "a" => self.0.a = clamp_channel(key, &value)?,
            _ => return Ok(NewIndex::Store(value)),
        }
        Ok(NewIndex::Handled)
    }

    fn tostring(&self) -> String {
        let c = self.0;
        format!("deck:Colour {{ r={}, g={}, b={}, a={} }}", c.r, c.g, c.b, c.a)
    }

    fn equals(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

lua_class!(DeckColour);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_forms() {
        assert_eq!(Colour::parse("#f00"), Some(Colour::rgb(255, 0, 0)));
        assert_eq!(Colour::parse("#f008"), Some(Colour::rgba(255, 0, 0, 136)));
        assert_eq!(Colour::parse("#102030"), Some(Colour::rgb(16, 32, 48)));
        assert_eq!(Colour::parse("#10203040"), Some(Colour::rgba(16, 32, 48, 64)));
        assert_eq!(Colour::parse("Orange"), Some(Colour::rgb(255, 165, 0)));
        assert_eq!(Colour::parse("#12"), None);
        assert_eq!(Colour::parse("#ggg"), None);
        assert_eq!(Colour::parse("mauve"), None);
    }

    #[test]
    fn swizzle_and_hex_string() {
        let c = Colour::rgba(0x11, 0x22, 0x33, 0x44);
        assert_eq!(c.swizzle("rgb"), Some(0x112233));
        assert_eq!(c.swizzle("ar"), Some(0x4411));
        assert_eq!(c.swizzle("rgbar"), None);
        assert_eq!(c.swizzle("rx"), None);
        assert_eq!(c.to_hex_string(), "#11223344");
        assert_eq!(Colour::WHITE.to_hex_string(), "#ffffff");
    }

    #[test]
    fn script_api() {
        let lua = Lua::new();
        lua.globals()
            .set("Colour", lua.create_function(new_from_arg).unwrap())
            .unwrap();
        lua.load(
            r##"
            local c = Colour("#0080ff")
            assert(c.r == 0 and c.g == 128 and c.b == 255 and c.a == 255)
            assert(c.rgb == 0x0080ff)
            c.r = 300
            assert(c.r == 255)
            assert(Colour({ r = 1, g = 2, b = 3 }) == Colour("#010203"))
            assert(Colour(c) == c)
            assert(c:to_string() == "#ff80ff")
            assert(tostring(Colour("black")) == "deck:Colour { r=0, g=0, b=0, a=255 }")
            assert(not pcall(Colour, "nope"))
            assert(not pcall(Colour, 5))
            "##,
        )
        .exec()
        .unwrap();
    }
}
