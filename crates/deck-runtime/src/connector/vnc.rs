//! Remote framebuffer connector. The server runs on a backend-owned thread
//! and talks to the tick loop only through a channel of [`VncEvent`]s.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};

use mlua::{AnyUserData, Lua, Value};

use super::{int_arg, port_arg, Connector, ConnectorBase, Events};
use crate::bridge::{self, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};
use crate::graphics::DeckCard;

pub const DEFAULT_PORT: u16 = 5900;
pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;

const POINTER_BUTTONS: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VncEvent {
    ClientConnected(u64),
    ClientDisconnected(u64),
    Pointer { x: i32, y: i32, mask: u8 },
    ResizeRequested { width: u32, height: u32 },
}

pub trait VncBackend {
    fn start(&mut self, port: u16, width: u32, height: u32, events: Sender<VncEvent>) -> Result<(), String>;

    /// Publishes a full RGBA frame.
    fn update(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<(), String>;

    fn resize(&mut self, width: u32, height: u32) -> Result<(), String>;

    fn stop(&mut self);
}

#[derive(Debug, Default)]
struct HeadlessState {
    running: Option<u16>,
    sender: Option<Sender<VncEvent>>,
    size: (u32, u32),
    frames: usize,
    last_frame: Vec<u8>,
}

/// A backend with no network side. The paired [`HeadlessVncHandle`] can
/// inject client events and inspect published frames.
#[derive(Debug, Default)]
pub struct HeadlessVnc {
    state: Arc<Mutex<HeadlessState>>,
}

#[derive(Debug, Clone)]
pub struct HeadlessVncHandle {
    state: Arc<Mutex<HeadlessState>>,
}

impl HeadlessVnc {
    pub fn new() -> Self {
        HeadlessVnc::default()
    }

    pub fn handle(&self) -> HeadlessVncHandle {
        HeadlessVncHandle {
            state: self.state.clone(),
        }
    }
}

impl HeadlessVncHandle {
    /// Sends an event as if a remote client produced it. Returns false when
    /// the server is not running.
    pub fn send(&self, event: VncEvent) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match state.sender.as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn running_port(&self) -> Option<u16> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).running
    }

    pub fn size(&self) -> (u32, u32) {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).size
    }

    pub fn frames(&self) -> usize {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).frames
    }

    pub fn last_frame(&self) -> Vec<u8> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last_frame
            .clone()
    }
}

impl VncBackend for HeadlessVnc {
    fn start(&mut self, port: u16, width: u32, height: u32, events: Sender<VncEvent>) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running = Some(port);
        state.sender = Some(events);
        state.size = (width, height);
        Ok(())
    }

    fn update(&mut self, width: u32, height: u32, rgba: &[u8]) -> Result<(), String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.running.is_none() {
            return Err("server is not running".to_string());
        }
        if (width, height) != state.size {
            return Err(format!(
                "frame is {width}x{height}, screen is {}x{}",
                state.size.0, state.size.1
            ));
        }
        state.frames += 1;
        state.last_frame = rgba.to_vec();
        Ok(())
    }

    fn resize(&mut self, width: u32, height: u32) -> Result<(), String> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).size = (width, height);
        Ok(())
    }

    fn stop(&mut self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.running = None;
        state.sender = None;
    }
}

pub struct VncConnector {
    base: ConnectorBase,
    backend: Box<dyn VncBackend>,
    events: Option<Receiver<VncEvent>>,
    port: u16,
    width: u32,
    height: u32,
    card: Option<AnyUserData>,
    dirty: bool,
    presented_generation: Option<u64>,
    buttons: u8,
    pointer: (i32, i32),
    restart: bool,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    with_backend(lua, name, Box::new(HeadlessVnc::new()))
}

pub fn with_backend(lua: &Lua, name: &str, backend: Box<dyn VncBackend>) -> LuaResult<AnyUserData> {
    let connector = VncConnector {
        base: ConnectorBase::new(name),
        backend,
        events: None,
        port: DEFAULT_PORT,
        width: DEFAULT_WIDTH,
        height: DEFAULT_HEIGHT,
        card: None,
        dirty: true,
        presented_generation: None,
        buttons: 0,
        pointer: (0, 0),
        restart: false,
    };
    bridge::push_new(lua, connector)
}

fn dimension(key: &str, value: &Value) -> LuaResult<u32> {
    let v = int_arg(<VncConnector as Connector>::TYPE_NAME, key, value)?;
    if v <= 0 || v > 16384 {
        return Err(DeckError::arg_value(format!("{}.{key} must be in 1..16384, got {v}", <VncConnector as Connector>::TYPE_NAME)).into());
    }
    Ok(v as u32)
}

impl VncConnector {
    fn stop(&mut self, events: &mut Events) {
        if self.events.take().is_some() {
            self.backend.stop();
            self.buttons = 0;
            tracing::info!(connector = %self.base.name, "vnc server stopped");
            events.push("on_disconnect", Vec::new());
        }
    }

    fn pointer(&mut self, x: i32, y: i32, mask: u8, events: &mut Events) {
        if (x, y) != self.pointer {
            self.pointer = (x, y);
            events.push("on_mouse_motion", vec![Value::Integer(x as i64), Value::Integer(y as i64)]);
        }
        let changed = mask ^ self.buttons;
        for bit in 0..POINTER_BUTTONS {
            if changed & (1 << bit) == 0 {
                continue;
            }
            let name = if mask & (1 << bit) != 0 { "on_mouse_press" } else { "on_mouse_release" };
            events.push(
                name,
                vec![Value::Integer(x as i64), Value::Integer(y as i64), Value::Integer(bit as i64 + 1)],
            );
        }
        self.buttons = mask & ((1 << POINTER_BUTTONS) - 1);
    }

    fn publish(&mut self) -> Result<(), String> {
        let Some(card) = self.card.as_ref() else {
            return Ok(());
        };
        let card = card.borrow::<DeckCard>().map_err(|e| e.to_string())?;
        if !self.dirty && self.presented_generation == Some(card.generation()) {
            return Ok(());
        }
        let frame = card.surface().resized(self.width, self.height);
        let generation = card.generation();
        drop(card);
        self.backend.update(self.width, self.height, frame.as_rgba())?;
        self.dirty = false;
        self.presented_generation = Some(generation);
        Ok(())
    }
}

impl Connector for VncConnector {
    const TYPE_NAME: &'static str = "deck:Vnc";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.events.is_some()
    }

    fn property(&self, _lua: &Lua, key: &str) -> LuaResult<Value> {
        Ok(match key {
            "port" => Value::Integer(self.port as i64),
            "width" => Value::Integer(self.width as i64),
            "height" => Value::Integer(self.height as i64),
            "card" => self.card.clone().map(Value::UserData).unwrap_or(Value::Nil),
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "port" => {
                let port = port_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                if port != self.port {
                    self.port = port;
                    self.restart = true;
                }
            }
            "width" | "height" => {
                let v = dimension(key, &value)?;
                if key == "width" {
                    self.width = v;
                } else {
                    self.height = v;
                }
                if self.events.is_some() {
                    self.backend
                        .resize(self.width, self.height)
                        .map_err(DeckError::Io)?;
                }
                self.dirty = true;
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

    fn tick_inputs(&mut self, _lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        loop {
            let Some(rx) = self.events.as_ref() else {
                return Ok(());
            };
            let event = match rx.try_recv() {
                Ok(event) => event,
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    self.base.set_error("vnc backend stopped");
                    self.stop(events);
                    return Ok(());
                }
            };
            match event {
                VncEvent::ClientConnected(id) => {
                    tracing::debug!(connector = %self.base.name, client = id, "vnc client connected");
                    self.dirty = true;
                    events.push("on_client_connect", vec![Value::Integer(id as i64)]);
                }
                VncEvent::ClientDisconnected(id) => {
                    tracing::debug!(connector = %self.base.name, client = id, "vnc client disconnected");
                    events.push("on_client_disconnect", vec![Value::Integer(id as i64)]);
                }
                VncEvent::Pointer { x, y, mask } => self.pointer(x, y, mask, events),
                VncEvent::ResizeRequested { width, height } => {
                    if width == 0 || height == 0 {
                        continue;
                    }
                    self.width = width;
                    self.height = height;
                    if let Err(e) = self.backend.resize(width, height) {
                        self.base.set_error(e);
                    }
                    self.dirty = true;
                    events.push("on_resize", vec![Value::Integer(width as i64), Value::Integer(height as i64)]);
                }
            }
        }
    }

    fn tick_outputs(&mut self, _lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled || self.restart {
            self.restart = false;
            self.stop(events);
            if !self.base.enabled {
                return Ok(());
            }
        }
        if self.events.is_none() {
            let (tx, rx) = mpsc::channel();
            match self.backend.start(self.port, self.width, self.height, tx) {
                Ok(()) => {
                    tracing::info!(connector = %self.base.name, port = self.port, "vnc server started");
                    self.events = Some(rx);
                    self.dirty = true;
                    self.base.last_error.clear();
                    events.push("on_connect", Vec::new());
                }
                Err(e) => {
                    if e != self.base.last_error {
                        self.base.set_error(e);
                    }
                    return Ok(());
                }
            }
        }
        if let Err(e) = self.publish() {
            self.base.set_error(e);
        }
        Ok(())
    }

    fn shutdown(&mut self, _lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        if self.events.take().is_some() {
            self.backend.stop();
        }
        Ok(())
    }
}

connector_class!(VncConnector);
