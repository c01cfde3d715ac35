//! Per-VM host state shared by every native object: clock, exit request,
//! path layout, parked coroutines, connector factories and the platform.

use std::cell::{Cell, Ref, RefCell, RefMut};
use std::collections::BTreeMap;
use std::rc::Rc;

use mlua::{AnyUserData, Lua};

use deck_util::Paths;

use crate::config::RuntimeConfig;
use crate::error::LuaResult;
use crate::platform::{Platform, PlatformEvent, WindowId};
use crate::scheduler::Scheduler;

/// Builds a connector userdata for the given container name.
pub type ConnectorFactory = Rc<dyn Fn(&Lua, &str) -> LuaResult<AnyUserData>>;

pub struct Runtime {
    config: RuntimeConfig,
    paths: RefCell<Paths>,
    clock: Cell<i64>,
    delta: Cell<i64>,
    exit_code: Cell<Option<i32>>,
    pub(crate) scheduler: RefCell<Scheduler>,
    factories: RefCell<BTreeMap<String, ConnectorFactory>>,
    platform: RefCell<Box<dyn Platform>>,
    window_events: RefCell<Vec<PlatformEvent>>,
    pub(crate) logger_busy: Cell<bool>,
}

impl Runtime {
    pub fn new(config: RuntimeConfig, paths: Paths, platform: Box<dyn Platform>) -> Self {
        Runtime {
            config,
            paths: RefCell::new(paths),
            clock: Cell::new(0),
            delta: Cell::new(0),
            exit_code: Cell::new(None),
            scheduler: RefCell::new(Scheduler::default()),
            factories: RefCell::new(BTreeMap::new()),
            platform: RefCell::new(platform),
            window_events: RefCell::new(Vec::new()),
            logger_busy: Cell::new(false),
        }
    }

    /// Stores the runtime in the VM's app data and returns a handle to it.
    pub fn install(self, lua: &Lua) -> Rc<Runtime> {
        let rt = Rc::new(self);
        lua.set_app_data(rt.clone());
        rt
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn paths(&self) -> Ref<'_, Paths> {
        self.paths.borrow()
    }

    pub fn paths_mut(&self) -> RefMut<'_, Paths> {
        self.paths.borrow_mut()
    }

    pub fn clock(&self) -> i64 {
        self.clock.get()
    }

    pub fn delta(&self) -> i64 {
        self.delta.get()
    }

    /// Advances the tick clock; it never moves backwards.
    pub fn set_clock(&self, clock: i64) {
        let prev = self.clock.get();
        let next = clock.max(prev);
        self.delta.set(next - prev);
        self.clock.set(next);
    }

    pub fn request_exit(&self, code: i32) {
        self.exit_code.set(Some(code));
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_code.get().is_some()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code.get()
    }

    pub fn register_connector(&self, class: &str, factory: ConnectorFactory) {
        self.factories.borrow_mut().insert(class.to_string(), factory);
    }

    pub fn connector_factory(&self, class: &str) -> Option<ConnectorFactory> {
        self.factories.borrow().get(class).cloned()
    }

    pub fn connector_classes(&self) -> Vec<String> {
        self.factories.borrow().keys().cloned().collect()
    }

    pub fn platform(&self) -> RefMut<'_, Box<dyn Platform>> {
        self.platform.borrow_mut()
    }

    /// Polls the platform; a quit request sets the exit flag and everything
    /// else is queued for the window it targets.
    pub fn pump_platform_events(&self) {
        let events = self.platform.borrow_mut().poll_events();
        let mut queued = self.window_events.borrow_mut();
        for event in events {
            match event {
                PlatformEvent::Quit => {
                    tracing::info!("quit requested by platform");
                    if self.exit_code.get().is_none() {
                        self.exit_code.set(Some(0));
                    }
                }
                other => queued.push(other),
            }
        }
    }

    pub fn take_window_events(&self, window: WindowId) -> Vec<PlatformEvent> {
        let mut queued = self.window_events.borrow_mut();
        let (mine, rest): (Vec<_>, Vec<_>) = queued
            .drain(..)
            .partition(|e| e.window() == Some(window));
        *queued = rest;
        mine
    }
}

pub fn runtime(lua: &Lua) -> LuaResult<Rc<Runtime>> {
    lua.app_data_ref::<Rc<Runtime>>()
        .map(|rt| Rc::clone(&rt))
        .ok_or_else(|| mlua::Error::runtime("deck runtime is not installed in this VM"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::platform::HeadlessPlatform;

    pub fn lua_with_runtime() -> (Lua, Rc<Runtime>) {
        let lua = Lua::new();
        let rt = Runtime::new(
            RuntimeConfig::default(),
            Paths::default(),
            Box::new(HeadlessPlatform::new()),
        )
        .install(&lua);
        (lua, rt)
    }
}
