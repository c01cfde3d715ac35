use mlua::{AnyUserData, Lua, Table, Value};

use super::{bool_arg, int_arg, lua_bytes, string_arg, Connector, ConnectorBase, Events};
use crate::bridge::{self, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};
use crate::graphics::DeckCard;
use crate::platform::{PlatformEvent, WindowId};
use crate::runtime::runtime;

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

/// A desktop window that shows a Card and reports input.
pub struct WindowConnector {
    base: ConnectorBase,
    window: Option<WindowId>,
    title: String,
    width: u32,
    height: u32,
    visible: bool,
    card: Option<AnyUserData>,
    dirty: bool,
    presented_generation: Option<u64>,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    let connector = WindowConnector {
        base: ConnectorBase::new(name),
        window: None,
        title: name.to_string(),
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
        visible: true,
        card: None,
        dirty: true,
        presented_generation: None,
    };
    bridge::push_new(lua, connector)
}

fn dimension(key: &str, value: &Value) -> LuaResult<u32> {
    let v = int_arg(<WindowConnector as Connector>::TYPE_NAME, key, value)?;
    if v <= 0 || v > 16384 {
        return Err(DeckError::arg_value(format!("{}.{key} must be in 1..16384, got {v}", <WindowConnector as Connector>::TYPE_NAME)).into());
    }
    Ok(v as u32)
}

impl WindowConnector {
    fn open(&mut self, lua: &Lua) -> LuaResult<()> {
        let rt = runtime(lua)?;
        let mut platform = rt.platform();
        let id = platform
            .create_window(&self.title, self.width, self.height)
            .map_err(|e| DeckError::Io(format!("{e:#}")))?;
        if !self.visible {
            platform
                .set_visible(id, false)
                .map_err(|e| DeckError::Io(format!("{e:#}")))?;
        }
        tracing::debug!(connector = %self.base.name, window = id, "window created");
        self.window = Some(id);
        self.dirty = true;
        Ok(())
    }

    fn close(&mut self, lua: &Lua) -> LuaResult<()> {
        if let Some(id) = self.window.take() {
            runtime(lua)?.platform().destroy_window(id);
            tracing::debug!(connector = %self.base.name, window = id, "window destroyed");
        }
        Ok(())
    }

    fn with_window<F>(&self, lua: &Lua, f: F) -> LuaResult<()>
    where
        F: FnOnce(&mut dyn crate::platform::Platform, WindowId) -> anyhow::Result<()>,
    {
        let Some(id) = self.window else {
            return Ok(());
        };
        let rt = runtime(lua)?;
        let mut platform = rt.platform();
        f(&mut **platform, id).map_err(|e| DeckError::Io(format!("{e:#}")).into())
    }

    fn route(&mut self, lua: &Lua, event: PlatformEvent, events: &mut Events) -> LuaResult<()> {
        match event {
            PlatformEvent::MouseMotion { x, y, .. } => {
                events.push("on_mouse_motion", vec![Value::Integer(x as i64), Value::Integer(y as i64)]);
            }
            PlatformEvent::MouseButton { x, y, button, pressed, .. } => {
                let name = if pressed { "on_mouse_press" } else { "on_mouse_release" };
                events.push(
                    name,
                    vec![Value::Integer(x as i64), Value::Integer(y as i64), Value::Integer(button as i64)],
                );
            }
            PlatformEvent::Key { key, pressed, .. } => {
                events.push("on_key", vec![lua_bytes(lua, key.as_bytes())?, Value::Boolean(pressed)]);
            }
            PlatformEvent::Resized { width, height, .. } => {
                self.width = width.max(1);
                self.height = height.max(1);
                self.dirty = true;
                events.push(
                    "on_resize",
                    vec![Value::Integer(self.width as i64), Value::Integer(self.height as i64)],
                );
            }
            PlatformEvent::CloseRequested { .. } => events.push("on_close", Vec::new()),
            PlatformEvent::Quit => {}
        }
        Ok(())
    }

    fn present(&mut self, lua: &Lua) -> LuaResult<()> {
        let Some(card) = self.card.as_ref() else {
            return Ok(());
        };
        let card = card.borrow::<DeckCard>()?;
        if !self.dirty && self.presented_generation == Some(card.generation()) {
            return Ok(());
        }
        let frame = card.surface().resized(self.width, self.height);
        let generation = card.generation();
        drop(card);
        let (width, height) = (self.width, self.height);
        self.with_window(lua, |platform, id| platform.present(id, width, height, frame.as_rgba()))?;
        self.dirty = false;
        self.presented_generation = Some(generation);
        Ok(())
    }
}

impl Connector for WindowConnector {
    const TYPE_NAME: &'static str = "deck:Window";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.window.is_some()
    }

    fn init_methods(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<WindowConnector, _, _, _>(lua, class, "redraw", |_, this, ()| {
            this.dirty = true;
            Ok(())
        })
    }

    fn property(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "width" => Value::Integer(self.width as i64),
            "height" => Value::Integer(self.height as i64),
            "title" => lua_bytes(lua, self.title.as_bytes())?,
            "visible" => Value::Boolean(self.visible),
            "card" => self.card.clone().map(Value::UserData).unwrap_or(Value::Nil),
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "width" | "height" => {
                let v = dimension(key, &value)?;
                if key == "width" {
                    self.width = v;
                } else {
                    self.height = v;
                }
                let (w, h) = (self.width, self.height);
                self.with_window(lua, |platform, id| platform.set_size(id, w, h))?;
                self.dirty = true;
            }
            "title" => {
                self.title = string_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                let title = self.title.clone();
                self.with_window(lua, |platform, id| platform.set_title(id, &title))?;
            }
            "visible" => {
                self.visible = bool_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                let visible = self.visible;
                self.with_window(lua, |platform, id| platform.set_visible(id, visible))?;
            }
            "card" => {
                self.card = match value {
                    Value::Nil => None,
                    other => Some(bridge::check::<DeckCard>(&other)?),
                };
                self.dirty = true;
                self.presented_generation = None;
            }
            _ => return Ok(NewIndex::Store(value)),
        }
        Ok(NewIndex::Handled)
    }

    fn tick_inputs(&mut self, lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        let Some(id) = self.window else {
            return Ok(());
        };
        for event in runtime(lua)?.take_window_events(id) {
            self.route(lua, event, events)?;
        }
        Ok(())
    }

    fn tick_outputs(&mut self, lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled {
            if self.window.is_some() {
                self.close(lua)?;
                events.push("on_disconnect", Vec::new());
            }
            return Ok(());
        }
        if self.window.is_none() {
            self.open(lua)?;
            events.push("on_connect", Vec::new());
        }
        self.present(lua)
    }

    fn shutdown(&mut self, lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        self.close(lua)
    }
}

connector_class!(WindowConnector);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graphics::card::create_card;
    use crate::runtime::test_support::lua_with_runtime;

    #[test]
    fn dimensions_are_validated() {
        let (lua, _rt) = lua_with_runtime();
        lua.globals().set("w", create(&lua, "main").unwrap()).unwrap();
        lua.globals().set("card", create_card(&lua, (4, 4)).unwrap()).unwrap();
        lua.load(
            r#"
            assert(w.width == 640 and w.height == 480 and w.title == "main")
            w.width = 320
            assert(w.width == 320)
            assert(not pcall(function() w.height = 0 end))
            assert(not pcall(function() w.card = 5 end))
            w.card = card
            assert(w.card == card)
            assert(w.connected == false)
            "#,
        )
        .exec()
        .unwrap();
    }
}
