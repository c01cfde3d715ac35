//! The three trust-tier global environments and the trust-graded loaders.
//!
//! Untrusted and Trusted tiers see deep copies of the curated library
//! tables so scripts cannot alter what the host or other tiers see. Admin
//! sees the host's live modules. Every chunk gets a fresh environment whose
//! `__index` falls back to its tier's table.

use std::collections::HashMap;
use std::ffi::c_void;

use mlua::{AnyUserData, ChunkMode, Function, Lua, LuaOptions, StdLib, Table, Value};

use deck_trust::{TrustLevel, ALL_TRUST_LEVELS};

use crate::bridge;
use crate::error::{DeckError, LuaResult};
use crate::logger::{self, LogLevel};
use crate::runtime::runtime;

const ENV_REGISTRY_PREFIX: &str = "deck:env:";
const ENV_METATABLE_LOCK: &str = "deck:env";
const MAX_COPY_DEPTH: usize = 16;

const BASIC: &[&str] = &[
    "assert", "error", "ipairs", "next", "pairs", "pcall", "print", "select", "tonumber",
    "tostring", "type", "xpcall", "rawequal", "rawlen", "_VERSION",
];
const COPIED_MODULES: &[&str] = &["string", "table", "math", "coroutine", "utf8"];
const OS_SUBSET: &[&str] = &["clock", "date", "difftime", "exit", "time"];
const REFLECTION: &[&str] = &[
    "getmetatable", "setmetatable", "rawget", "rawset", "collectgarbage", "getfenv", "setfenv",
];

const FENV_SRC: &str = r#"
local debug = ...
local function env_slot(f)
    local i = 1
    while true do
        local name = debug.getupvalue(f, i)
        if name == "_ENV" then
            return i
        elseif name == nil then
            return nil
        end
        i = i + 1
    end
end
local function getfenv(f)
    if type(f) ~= "function" then
        error("getfenv: expected a function", 2)
    end
    local i = env_slot(f)
    if i == nil then
        return nil
    end
    local _, env = debug.getupvalue(f, i)
    return env
end
local function setfenv(f, env)
    if type(f) ~= "function" or type(env) ~= "table" then
        error("setfenv: expected a function and a table", 2)
    end
    local i = env_slot(f)
    if i ~= nil then
        debug.upvaluejoin(f, i, function() return env end, 1)
    end
    return f
end
return getfenv, setfenv
"#;

/// Creates the VM with every standard library opened; the curated tiers
/// decide what scripts actually see.
pub fn create_vm(memory_limit: usize) -> LuaResult<Lua> {
    // SAFETY: `debug` is only reachable from the Admin tier, which is by
    // definition allowed to inspect the VM.
    let lua = unsafe { Lua::unsafe_new_with(StdLib::ALL, LuaOptions::default()) };
    if memory_limit > 0 {
        lua.set_memory_limit(memory_limit)?;
    }
    Ok(lua)
}

fn registry_key(trust: TrustLevel) -> String {
    format!("{ENV_REGISTRY_PREFIX}{}", trust.as_str())
}

pub fn tier_env(lua: &Lua, trust: TrustLevel) -> LuaResult<Table> {
    lua.named_registry_value::<Option<Table>>(&registry_key(trust))?
        .ok_or_else(|| mlua::Error::runtime("sandbox environments are not installed"))
}

/// Installs host overrides (`print`, `os.exit`) and builds the three tier
/// environments, each exposing `deck`.
pub fn install(lua: &Lua, deck: &AnyUserData) -> LuaResult<()> {
    let host = lua.globals();
    host.raw_set("print", lua.create_function(logger::print)?)?;
    let os: Table = host.raw_get("os")?;
    os.raw_set("exit", lua.create_function(os_exit)?)?;
    let raw_getmetatable: Function = host.raw_get("getmetatable")?;
    host.raw_set(
        "getmetatable",
        lua.create_function(move |lua, value: Value| {
            if let Value::UserData(ud) = &value {
                if let Some(name) = bridge::userdata_type_name(ud) {
                    return Ok(Value::String(lua.create_string(name)?));
                }
            }
            raw_getmetatable.call::<Value>(value)
        })?,
    )?;

    let fenv = match host.raw_get::<Option<Table>>("debug")? {
        Some(debug) => {
            let (get, set): (Function, Function) = lua
                .load(FENV_SRC)
                .set_name("=deck:fenv")
                .call(debug)?;
            Some((get, set))
        }
        None => None,
    };

    for trust in ALL_TRUST_LEVELS {
        let env = build_env(lua, &host, trust, deck, fenv.as_ref())?;
        lua.set_named_registry_value(&registry_key(trust), env)?;
    }
    Ok(())
}

fn os_exit(lua: &Lua, code: Value) -> LuaResult<()> {
    let code = match code {
        Value::Nil | Value::Boolean(true) => 0,
        Value::Boolean(false) => 1,
        Value::Integer(i) => i as i32,
        Value::Number(n) => n as i32,
        other => {
            return Err(DeckError::arg_type(format!(
                "os.exit expects a number or boolean, got {}",
                other.type_name()
            ))
            .into())
        }
    };
    runtime(lua)?.request_exit(code);
    Ok(())
}

fn build_env(
    lua: &Lua,
    host: &Table,
    trust: TrustLevel,
    deck: &AnyUserData,
    fenv: Option<&(Function, Function)>,
) -> LuaResult<Table> {
    let caps = trust.caps();
    let env = lua.create_table()?;

    if caps.allow_live_modules {
        for pair in host.pairs::<Value, Value>() {
            let (k, v) = pair?;
            env.raw_set(k, v)?;
        }
    } else {
        for name in BASIC {
            env.raw_set(*name, host.raw_get::<Value>(*name)?)?;
        }
        for name in COPIED_MODULES {
            if let Some(module) = host.raw_get::<Option<Table>>(*name)? {
                env.raw_set(*name, deep_copy(lua, &module)?)?;
            }
        }
        let host_os: Table = host.raw_get("os")?;
        let os = lua.create_table()?;
        for name in OS_SUBSET {
            os.raw_set(*name, host_os.raw_get::<Value>(*name)?)?;
        }
        env.raw_set("os", os)?;
        let table: Table = env.raw_get("table")?;
        env.raw_set("unpack", table.raw_get::<Value>("unpack")?)?;
    }

    if caps.allow_reflection {
        for name in REFLECTION {
            let v: Value = match (*name, fenv) {
                ("getfenv", Some((get, _))) => Value::Function(get.clone()),
                ("setfenv", Some((_, set))) => Value::Function(set.clone()),
                _ => host.raw_get(*name)?,
            };
            env.raw_set(*name, v)?;
        }
    }

    let package = if caps.shares_host_package {
        host.raw_get::<Table>("package")?
    } else {
        let package = lua.create_table()?;
        let loaded = lua.create_table()?;
        for name in COPIED_MODULES.iter().chain(["os"].iter()) {
            loaded.raw_set(*name, env.raw_get::<Value>(*name)?)?;
        }
        package.raw_set("loaded", loaded)?;
        package
    };
    let loaded: Table = package.raw_get("loaded")?;
    env.raw_set("package", package)?;
    loaded.raw_set("deck", deck.clone())?;

    env.raw_set("deck", deck.clone())?;
    install_loaders(lua, &env, trust, loaded)?;
    env.raw_set("_G", env.clone())?;

    let mt = lua.create_table()?;
    mt.raw_set("__metatable", ENV_METATABLE_LOCK)?;
    env.set_metatable(Some(mt));
    Ok(env)
}

fn deep_copy(lua: &Lua, src: &Table) -> LuaResult<Table> {
    let mut seen = HashMap::new();
    copy_table(lua, src, &mut seen, 0)
}

fn copy_table(
    lua: &Lua,
    src: &Table,
    seen: &mut HashMap<*const c_void, Table>,
    depth: usize,
) -> LuaResult<Table> {
    if let Some(done) = seen.get(&src.to_pointer()) {
        return Ok(done.clone());
    }
    let out = lua.create_table()?;
    seen.insert(src.to_pointer(), out.clone());
    for pair in src.pairs::<Value, Value>() {
        let (k, v) = pair?;
        let v = match v {
            Value::Table(t) if depth < MAX_COPY_DEPTH => Value::Table(copy_table(lua, &t, seen, depth + 1)?),
            other => other,
        };
        out.raw_set(k, v)?;
    }
    Ok(out)
}

/// Applies the caller's ceiling to a requested trust, warning when the
/// request had to be lowered.
fn effective_trust(lua: &Lua, loader: &str, wanted: TrustLevel, max: TrustLevel) -> TrustLevel {
    let trust = wanted.clamp_to(max);
    if trust != wanted {
        logger::log_message(
            lua,
            LogLevel::Warning,
            &format!("{loader}: {wanted} trust requested from a {max} chunk, loading as {trust}"),
        );
    }
    trust
}

/// Compiles text source into a function bound to a fresh environment that
/// inherits from the tier environment for `trust`.
pub fn load_chunk(lua: &Lua, src: &[u8], name: &str, trust: TrustLevel) -> LuaResult<(Function, Table)> {
    let tier = tier_env(lua, trust)?;
    let env = lua.create_table()?;
    let mt = lua.create_table()?;
    mt.raw_set("__index", tier)?;
    mt.raw_set("__metatable", ENV_METATABLE_LOCK)?;
    env.set_metatable(Some(mt));

    let func = lua
        .load(src)
        .set_name(name)
        .set_mode(ChunkMode::Text)
        .set_environment(env.clone())
        .into_function()
        .map_err(|e| match e {
            mlua::Error::SyntaxError { message, .. } => DeckError::ScriptLoad(message).into(),
            other => other,
        })?;
    Ok((func, env))
}

fn load_error_message(err: &mlua::Error) -> String {
    match err {
        mlua::Error::ExternalError(e) => e.to_string(),
        other => other.to_string(),
    }
}

type LoadResult = (Option<Function>, Option<String>);

fn install_loaders(lua: &Lua, env: &Table, max: TrustLevel, loaded: Table) -> LuaResult<()> {
    let variants = [
        ("", TrustLevel::Untrusted),
        ("_trusted", TrustLevel::Trusted),
        ("_admin", TrustLevel::Admin),
    ];
    for (suffix, wanted) in variants {
        let loader = format!("loadstring{suffix}");
        let name = loader.clone();
        let f = lua.create_function(
            move |lua, (src, chunkname): (mlua::String, Option<String>)| -> LuaResult<LoadResult> {
                let trust = effective_trust(lua, &name, wanted, max);
                let chunkname = chunkname.unwrap_or_else(|| "=(loadstring)".to_string());
                Ok(match load_chunk(lua, &src.as_bytes(), &chunkname, trust) {
                    Ok((f, _)) => (Some(f), None),
                    Err(e) => (None, Some(load_error_message(&e))),
                })
            },
        )?;
        env.raw_set(loader, f)?;

        let loader = format!("loadfile{suffix}");
        let name = loader.clone();
        let f = lua.create_function(move |lua, path: String| -> LuaResult<LoadResult> {
            let trust = effective_trust(lua, &name, wanted, max);
            Ok(match load_file(lua, &path, max, trust) {
                Ok(f) => (Some(f), None),
                Err(e) => (None, Some(load_error_message(&e))),
            })
        })?;
        env.raw_set(loader, f)?;
    }

    let require = lua.create_function(move |lua, name: String| require(lua, &loaded, &name, max))?;
    env.raw_set("require", require)
}

fn load_file(lua: &Lua, path: &str, max: TrustLevel, trust: TrustLevel) -> LuaResult<Function> {
    let caps = max.caps();
    let resolved = runtime(lua)?
        .paths()
        .resolve_data_file(path, true, caps.allow_home_paths, caps.allow_system_paths)
        .map_err(|e| DeckError::Io(e.to_string()))?;
    let src = std::fs::read(&resolved)
        .map_err(|e| DeckError::Io(format!("cannot read {}: {e}", resolved.display())))?;
    let (f, _) = load_chunk(lua, &src, &format!("@{}", resolved.display()), trust)?;
    Ok(f)
}

/// `require(name)`: the tier's `package.loaded` first, then the sandbox dir
/// (Untrusted), the per-user data dir (Trusted, not for Untrusted callers)
/// and the system data dirs (Admin).
pub fn require(lua: &Lua, loaded: &Table, name: &str, max: TrustLevel) -> LuaResult<Value> {
    let cached: Value = loaded.raw_get(name)?;
    if !cached.is_nil() {
        return Ok(cached);
    }
    if name.is_empty() {
        return Err(DeckError::ModuleNotFound(name.to_string()).into());
    }

    let file = if name.ends_with(".lua") {
        name.to_string()
    } else {
        format!("{name}.lua")
    };
    let rt = runtime(lua)?;
    let phases = [
        (TrustLevel::Untrusted, (true, false, false), true),
        (TrustLevel::Trusted, (false, true, false), max != TrustLevel::Untrusted),
        (TrustLevel::Admin, (false, false, true), rt.config().allow_system_modules),
    ];

    for (trust, (local, home, system), enabled) in phases {
        if !enabled {
            continue;
        }
        let found = rt.paths().find_data_file(&file, local, home, system);
        let Some(path) = found else {
            continue;
        };
        tracing::debug!(module = name, path = %path.display(), trust = %trust, "loading module");
        let src = std::fs::read(&path)
            .map_err(|e| DeckError::Io(format!("cannot read {}: {e}", path.display())))?;
        let (f, _) = load_chunk(lua, &src, &format!("@{}", path.display()), trust)?;
        let module: Value = f.call(name)?;
        if !module.is_table() {
            return Err(DeckError::ModuleInvalid {
                name: name.to_string(),
                got: module.type_name().to_string(),
            }
            .into());
        }
        loaded.raw_set(name, module.clone())?;
        return Ok(module);
    }
    Err(DeckError::ModuleNotFound(name.to_string()).into())
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use deck_util::Paths;
    use mlua::MultiValue;

    use super::*;
    use crate::config::RuntimeConfig;
    use crate::platform::HeadlessPlatform;
    use crate::runtime::Runtime;

    fn sandboxed(paths: Paths) -> (Lua, Rc<Runtime>) {
        let lua = create_vm(0).unwrap();
        let rt = Runtime::new(RuntimeConfig::default(), paths, Box::new(HeadlessPlatform::new()))
            .install(&lua);
        let deck = logger::create(&lua).unwrap();
        install(&lua, &deck).unwrap();
        (lua, rt)
    }

    fn run(lua: &Lua, trust: TrustLevel, src: &str) -> LuaResult<MultiValue> {
        let (f, _) = load_chunk(lua, src.as_bytes(), "=test", trust)?;
        f.call(())
    }

    #[test]
    fn tiers_see_curated_libraries() {
        let (lua, _rt) = sandboxed(Paths::default());
        run(
            &lua,
            TrustLevel::Untrusted,
            r#"
            assert(io == nil and debug == nil and load == nil and dofile == nil)
            assert(getmetatable == nil and rawset == nil and setfenv == nil)
            assert(os.execute == nil and os.time ~= nil)
            assert(string.upper("a") == "A" and unpack ~= nil)
            assert(_G.deck ~= nil and package.loaded.string == string)
            "#,
        )
        .unwrap();
        run(
            &lua,
            TrustLevel::Trusted,
            r#"
            assert(io == nil and debug == nil)
            assert(getmetatable ~= nil and rawget ~= nil and collectgarbage ~= nil)
            local f = function() return x end
            setfenv(f, { x = 5 })
            assert(f() == 5 and getfenv(f).x == 5)
            "#,
        )
        .unwrap();
        run(
            &lua,
            TrustLevel::Admin,
            r#"
            assert(io ~= nil and debug ~= nil and os.getenv ~= nil)
            assert(package.loaded == _G.package.loaded)
            "#,
        )
        .unwrap();
    }

    #[test]
    fn curated_tables_are_copies() {
        let (lua, _rt) = sandboxed(Paths::default());
        run(&lua, TrustLevel::Untrusted, "string.upper = nil; math.pi = 3").unwrap();
        let v: String = lua.load("return string.upper('ok')").eval().unwrap();
        assert_eq!(v, "OK");
        run(&lua, TrustLevel::Trusted, "assert(string.upper ~= nil and math.pi > 3.1)").unwrap();
    }

    #[test]
    fn chunks_get_fresh_environments() {
        let (lua, _rt) = sandboxed(Paths::default());
        run(&lua, TrustLevel::Untrusted, "leaked = 1").unwrap();
        run(&lua, TrustLevel::Untrusted, "assert(leaked == nil)").unwrap();
        let err = run(&lua, TrustLevel::Trusted, "setmetatable(_ENV, {})").unwrap_err();
        assert!(err.to_string().contains("protected metatable"), "{err}");
    }

    #[test]
    fn loaders_clamp_to_caller_trust() {
        let (lua, _rt) = sandboxed(Paths::default());
        run(
            &lua,
            TrustLevel::Admin,
            "assert(loadstring_admin('return io ~= nil')() == true)",
        )
        .unwrap();
        run(
            &lua,
            TrustLevel::Untrusted,
            r#"
            local f = loadstring_admin('return io')
            assert(f() == nil)
            assert(loadstring('return debug')() == nil)
            local bad, msg = loadstring('return +')
            assert(bad == nil and msg:find('ScriptLoadError'))
            assert(loadstring(string.dump(function() end)) == nil)
            "#,
        )
        .unwrap();
        run(
            &lua,
            TrustLevel::Admin,
            "assert(loadstring('return io')() == nil)",
        )
        .unwrap();
    }

    #[test]
    fn os_exit_requests_exit_instead_of_terminating() {
        let (lua, rt) = sandboxed(Paths::default());
        run(&lua, TrustLevel::Untrusted, "os.exit(3)").unwrap();
        assert_eq!(rt.exit_code(), Some(3));
    }

    #[test]
    fn require_resolves_inside_the_sandbox_dir() {
        let dir = tempfile::tempdir().unwrap();
        let sb = dir.path().join("sb");
        std::fs::create_dir_all(&sb).unwrap();
        std::fs::write(sb.join("x.lua"), "return { name = ..., io = io }").unwrap();
        std::fs::write(sb.join("bad.lua"), "return 5").unwrap();
        std::fs::write(dir.path().join("outside.lua"), "return {}").unwrap();

        let (lua, _rt) = sandboxed(Paths::default().with_sandbox_dir(&sb));
        run(
            &lua,
            TrustLevel::Admin,
            r#"
            local x = require("x")
            assert(x.name == "x" and x.io == nil)
            assert(require("x") == x)
            local ok, err = pcall(require, "../outside")
            assert(not ok and tostring(err):find("ModuleNotFound"))
            ok, err = pcall(require, "bad")
            assert(not ok and tostring(err):find("ModuleInvalid"))
            assert(loadfile("x.lua") ~= nil)
            assert(loadfile("../outside.lua") == nil)
            "#,
        )
        .unwrap();
    }

    #[test]
    fn home_modules_need_a_trusted_caller() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        std::fs::create_dir_all(&home).unwrap();
        std::fs::write(home.join("h.lua"), "return { rawget = rawget }").unwrap();

        let mut paths = Paths::default();
        paths.set_data_dirs(Some(home), Vec::new());
        let (lua, _rt) = sandboxed(paths);
        run(
            &lua,
            TrustLevel::Trusted,
            "assert(require('h').rawget ~= nil)",
        )
        .unwrap();
        run(
            &lua,
            TrustLevel::Untrusted,
            "assert(not pcall(require, 'h'))",
        )
        .unwrap();
    }
}
