use std::fs;

use deck_runtime::{Application, HeadlessPlatform, RuntimeConfig, TrustLevel};
use deck_util::Paths;

fn app_with(config: RuntimeConfig) -> Application {
    Application::with_platform(config, Paths::default(), Box::new(HeadlessPlatform::new())).unwrap()
}

fn app() -> Application {
    app_with(RuntimeConfig::default())
}

fn global<T: mlua::FromLua>(app: &Application, name: &str) -> T {
    app.script_env().unwrap().raw_get(name).unwrap()
}

#[test]
fn tiers_expose_different_globals() {
    let mut app = app();
    app.load_source(
        br#"
        untrusted = loadstring("return getmetatable == nil and debug == nil and io == nil")()
        trusted = loadstring_trusted("return getmetatable ~= nil and debug == nil")()
        has_deck = loadstring("return deck ~= nil and deck.clock ~= nil")()
        admin = loadstring_admin("return io ~= nil and debug ~= nil")()
        "#,
        "=tiers",
        TrustLevel::Admin,
    )
    .unwrap();
    assert!(global::<bool>(&app, "untrusted"));
    assert!(global::<bool>(&app, "trusted"));
    assert!(global::<bool>(&app, "has_deck"));
    assert!(global::<bool>(&app, "admin"));
}

#[test]
fn requested_trust_is_clamped_to_the_caller() {
    let mut app = app();
    app.load_source(
        br#"
        local f = loadstring_admin("return debug ~= nil, getmetatable ~= nil, io ~= nil")
        sees_debug, sees_reflection, sees_io = f()
        "#,
        "=clamp",
        TrustLevel::Untrusted,
    )
    .unwrap();
    assert!(!global::<bool>(&app, "sees_debug"));
    assert!(!global::<bool>(&app, "sees_reflection"));
    assert!(!global::<bool>(&app, "sees_io"));
}

#[test]
fn chunk_globals_do_not_leak_between_chunks() {
    let mut app = app();
    app.load_source(
        br#"
        loadstring("leaked = true")()
        math.pi = 3
        other_pi = loadstring("return math.pi")()
        "#,
        "=isolation",
        TrustLevel::Trusted,
    )
    .unwrap();
    assert!(global::<Option<bool>>(&app, "leaked").is_none());
    assert!(global::<f64>(&app, "other_pi") > 3.14);
}

#[test]
fn syntax_errors_come_back_as_nil_and_message() {
    let mut app = app();
    app.load_source(
        br#"f, msg = loadstring("return +", "=bad")"#,
        "=syntax",
        TrustLevel::Trusted,
    )
    .unwrap();
    assert!(global::<Option<mlua::Function>>(&app, "f").is_none());
    assert!(global::<String>(&app, "msg").contains("bad"));
}

#[test]
fn files_resolve_inside_the_script_directory_only() {
    let root = tempfile::tempdir().unwrap();
    let dir = root.path().join("scripts");
    fs::create_dir(&dir).unwrap();
    fs::write(root.path().join("outside.lua"), "return 1").unwrap();
    fs::write(
        dir.join("helper.lua"),
        "return { value = 42, reflective = getmetatable ~= nil }",
    )
    .unwrap();
    fs::write(dir.join("data.lua"), "return ...").unwrap();
    fs::write(
        dir.join("main.lua"),
        r#"
        local helper = require("helper")
        value = helper.value
        reflective = helper.reflective
        same_module = require("helper") == helper

        local f = loadfile("data.lua")
        data = f and f("passed")

        escaped, escape_err = loadfile("../outside.lua")
        absolute = loadfile("/etc/hostname")
        missing_ok = pcall(require, "nope")
        escaped_require = pcall(require, "../outside")
        "#,
    )
    .unwrap();

    let mut app = app();
    app.load_script(Some(&dir.join("main.lua"))).unwrap();

    assert_eq!(global::<i64>(&app, "value"), 42);
    // Modules from the script directory load untrusted.
    assert!(!global::<bool>(&app, "reflective"));
    assert!(global::<bool>(&app, "same_module"));
    assert_eq!(global::<String>(&app, "data"), "passed");
    assert!(global::<Option<mlua::Function>>(&app, "escaped").is_none());
    assert!(!global::<String>(&app, "escape_err").is_empty());
    assert!(global::<Option<mlua::Function>>(&app, "absolute").is_none());
    assert!(!global::<bool>(&app, "missing_ok"));
    assert!(!global::<bool>(&app, "escaped_require"));
}

#[test]
fn script_trust_comes_from_the_config() {
    let dir = tempfile::tempdir().unwrap();
    let main = dir.path().join("main.lua");
    fs::write(&main, "reflective = getmetatable ~= nil").unwrap();

    let mut app = app_with(RuntimeConfig {
        script_trust: TrustLevel::Untrusted,
        ..RuntimeConfig::default()
    });
    app.load_script(Some(&main)).unwrap();
    assert!(!global::<bool>(&app, "reflective"));
}

#[test]
fn environments_are_locked() {
    let mut app = app();
    app.load_source(
        br#"
        ok = pcall(setmetatable, _ENV, {})
        mt = getmetatable(_ENV)
        "#,
        "=locked",
        TrustLevel::Trusted,
    )
    .unwrap();
    assert!(!global::<bool>(&app, "ok"));
    assert_eq!(global::<String>(&app, "mt"), "deck:env");
}

#[test]
fn reflection_reports_type_names_for_native_objects() {
    let mut app = app();
    app.load_source(
        br#"
        colour_mt = getmetatable(deck.Colour("red"))
        deck_mt = getmetatable(deck)
        string_mt = type(getmetatable("text"))
        "#,
        "=reflect",
        TrustLevel::Trusted,
    )
    .unwrap();
    assert_eq!(global::<String>(&app, "colour_mt"), "deck:Colour");
    assert!(global::<String>(&app, "deck_mt").starts_with("deck:"));
    assert_eq!(global::<String>(&app, "string_mt"), "table");
}
