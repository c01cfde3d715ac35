//! Scriptable control-panel runtime: an embedded Lua VM with trust-graded
//! sandboxes, cooperative promises and a set of ticked I/O connectors.

pub mod application;
pub mod bridge;
pub mod config;
pub mod connector;
pub mod deck_module;
pub mod error;
pub mod graphics;
pub mod json;
pub mod logger;
pub mod platform;
pub mod promise;
pub mod runtime;
pub mod sandbox;
pub mod scheduler;
pub mod util_api;

pub use application::Application;
pub use config::RuntimeConfig;
pub use error::{DeckError, ErrorContext, LuaResult};
pub use platform::{HeadlessPlatform, Platform, PlatformEvent, WindowId};
pub use runtime::{ConnectorFactory, Runtime};

pub use deck_trust::TrustLevel;
