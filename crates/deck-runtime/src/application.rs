//! Owns the VM and drives the frame loop.

use std::path::Path;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use mlua::{AnyUserData, Function, Lua, Table};

use deck_trust::TrustLevel;
use deck_util::Paths;

use crate::config::RuntimeConfig;
use crate::connector::{self, http, server_socket, streamdeck, vnc, websocket, window};
use crate::deck_module;
use crate::error::{DeckError, ErrorContext};
use crate::logger;
use crate::platform::{HeadlessPlatform, Platform};
use crate::runtime::{ConnectorFactory, Runtime};
use crate::sandbox;
use crate::scheduler::{self, CallOutcome};

/// Loaded when no script path is given.
pub const BUILTIN_SCRIPT: &str = r#"
main_window = deck.Connector("Window", "main", { title = "Deck Assistant" })
main_window.card = deck.Card(main_window.width, main_window.height)
main_window.on_close = function()
    deck.exit(0)
end
"#;

const BUILTIN_SCRIPT_NAME: &str = "=deck:builtin";

pub struct Application {
    lua: Lua,
    runtime: Rc<Runtime>,
    deck: AnyUserData,
    /// Top-level chunk environment. Holding it keeps script globals (and the
    /// connectors they reference) alive.
    script_env: Option<Table>,
    shut_down: bool,
}

impl Application {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        Application::with_platform(config, Paths::detect(), Box::new(HeadlessPlatform::new()))
    }

    pub fn with_platform(config: RuntimeConfig, paths: Paths, platform: Box<dyn Platform>) -> Result<Self> {
        config.validate()?;
        let lua = sandbox::create_vm(config.memory_limit)
            .map_err(lua_error)
            .context("failed to create the script VM")?;
        let runtime = Runtime::new(config, paths, platform).install(&lua);
        register_builtin_connectors(&runtime);

        let deck = deck_module::create(&lua)
            .map_err(lua_error)
            .context("failed to build the deck module")?;
        sandbox::install(&lua, &deck)
            .map_err(lua_error)
            .context("failed to build the sandbox environments")?;
        tracing::debug!(classes = ?runtime.connector_classes(), "runtime initialized");

        Ok(Application {
            lua,
            runtime,
            deck,
            script_env: None,
            shut_down: false,
        })
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn runtime(&self) -> &Rc<Runtime> {
        &self.runtime
    }

    pub fn deck(&self) -> &AnyUserData {
        &self.deck
    }

    pub fn script_env(&self) -> Option<&Table> {
        self.script_env.as_ref()
    }

    /// Replaces (or adds) the factory behind a connector class name.
    pub fn register_connector(&self, class: &str, factory: ConnectorFactory) {
        self.runtime.register_connector(class, factory);
    }

    /// Loads the top-level script, or the built-in window script when no
    /// path is given. The script's directory becomes the sandbox dir.
    pub fn load_script(&mut self, path: Option<&Path>) -> Result<()> {
        let Some(path) = path else {
            tracing::info!("no script given, loading the built-in window script");
            return self.load_source(BUILTIN_SCRIPT.as_bytes(), BUILTIN_SCRIPT_NAME, TrustLevel::Admin);
        };
        let src = std::fs::read(path).with_context(|| format!("cannot read script {}", path.display()))?;
        let dir = path
            .parent()
            .filter(|d| !d.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dir = std::fs::canonicalize(dir)
            .with_context(|| format!("cannot resolve script directory {}", dir.display()))?;
        tracing::info!(script = %path.display(), sandbox = %dir.display(), "loading script");
        self.runtime.paths_mut().set_sandbox_dir(dir);

        let trust = self.runtime.config().script_trust;
        self.load_source(&src, &format!("@{}", path.display()), trust)
    }

    /// Compiles and runs `src` as the top-level chunk. The chunk may wait on
    /// promises; it then finishes during later ticks.
    pub fn load_source(&mut self, src: &[u8], name: &str, trust: TrustLevel) -> Result<()> {
        let (func, env) = sandbox::load_chunk(&self.lua, src, name, trust)
            .map_err(lua_error)
            .with_context(|| format!("failed to load {}", display_name(name)))?;
        self.script_env = Some(env);
        match scheduler::yieldable_call(&self.lua, func, ()) {
            Ok(CallOutcome::Finished(_)) => Ok(()),
            Ok(CallOutcome::Parked) => {
                tracing::debug!(script = display_name(name), "top-level script is waiting");
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(DeckError::ScriptRuntime(ErrorContext::from_lua_error(&e))))
                .with_context(|| format!("script {} failed", display_name(name))),
        }
    }

    /// Runs one frame at `clock` ms.
    pub fn tick(&mut self, clock: i64) -> Result<()> {
        let lua = &self.lua;
        self.runtime.set_clock(clock);
        self.runtime.pump_platform_events();
        let clock = self.runtime.clock();

        connector::tick_all(lua, "tick_inputs", clock).map_err(lua_error)?;
        scheduler::wake(lua, clock).map_err(lua_error)?;
        self.emit_script_tick(clock).map_err(lua_error)?;
        connector::tick_all(lua, "tick_outputs", clock).map_err(lua_error)?;
        lua.gc_step().map_err(lua_error)?;
        Ok(())
    }

    fn emit_script_tick(&self, clock: i64) -> mlua::Result<()> {
        let Some(env) = self.script_env.as_ref() else {
            return Ok(());
        };
        let handler = match env.raw_get::<Option<Function>>("tick")? {
            Some(f) => Some(f),
            None => env.raw_get::<Option<Function>>("on_tick")?,
        };
        if let Some(handler) = handler {
            if let Err(err) = scheduler::yieldable_call(&self.lua, handler, clock) {
                logger::log_error(&self.lua, &err);
            }
        }
        Ok(())
    }

    /// Ticks every `frame_ms` until exit is requested, then shuts down and
    /// returns the exit code.
    pub fn run(&mut self) -> Result<i32> {
        let frame = self.runtime.config().frame_ms.max(1) as i64;
        let start = Instant::now();
        let mut cursor: i64 = 0;
        while !self.runtime.exit_requested() {
            self.tick(cursor)?;
            if self.runtime.exit_requested() {
                break;
            }
            cursor += frame;
            let now = start.elapsed().as_millis() as i64;
            if now > cursor {
                let skipped = (now - cursor) / frame;
                if skipped > 0 {
                    tracing::trace!(skipped, "frame loop behind, skipping ticks");
                }
                cursor += skipped * frame;
            } else {
                std::thread::sleep(Duration::from_millis((cursor - now) as u64));
            }
        }
        self.shutdown();
        let code = self.runtime.exit_code().unwrap_or(0);
        tracing::info!(code, "exiting");
        Ok(code)
    }

    /// Shuts every connector down. Later calls do nothing.
    pub fn shutdown(&mut self) {
        if std::mem::replace(&mut self.shut_down, true) {
            return;
        }
        if let Err(err) = connector::shutdown_all(&self.lua) {
            logger::log_error(&self.lua, &err);
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.runtime.exit_code()
    }
}

impl Drop for Application {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn register_builtin_connectors(runtime: &Runtime) {
    runtime.register_connector(connector::CLASS_WEBSOCKET, Rc::new(websocket::create));
    runtime.register_connector(connector::CLASS_HTTP, Rc::new(http::create));
    runtime.register_connector(connector::CLASS_SERVER_SOCKET, Rc::new(server_socket::create));
    runtime.register_connector(connector::CLASS_STREAMDECK, Rc::new(streamdeck::create));
    runtime.register_connector(connector::CLASS_WINDOW, Rc::new(window::create));
    runtime.register_connector(connector::CLASS_VNC, Rc::new(vnc::create));
}

/// `mlua::Error` is neither `Send` nor `Sync`, so it enters anyhow as text.
fn lua_error(err: mlua::Error) -> anyhow::Error {
    anyhow::anyhow!("{err}")
}

fn display_name(name: &str) -> &str {
    name.strip_prefix('@')
        .or_else(|| name.strip_prefix('='))
        .unwrap_or(name)
}
