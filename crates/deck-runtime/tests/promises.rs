use deck_runtime::{Application, HeadlessPlatform, RuntimeConfig, TrustLevel};
use deck_util::Paths;

fn app() -> Application {
    Application::with_platform(RuntimeConfig::default(), Paths::default(), Box::new(HeadlessPlatform::new())).unwrap()
}

fn global<T: mlua::FromLua>(app: &Application, name: &str) -> T {
    app.script_env().unwrap().raw_get(name).unwrap()
}

#[test]
fn top_level_wait_resumes_on_the_tick_after_fulfillment() {
    let mut app = app();
    app.load_source(
        br#"
        jobs = deck.PromiseList()
        function tick(clock)
            if clock == 30 then
                jobs:fulfill("job", "payload")
            end
        end
        got = jobs:new("job"):wait()
        resumed_at = deck.clock
        "#,
        "=wait",
        TrustLevel::Trusted,
    )
    .unwrap();
    assert!(global::<Option<String>>(&app, "got").is_none());

    for clock in [0, 10, 20, 30] {
        app.tick(clock).unwrap();
        assert!(global::<Option<String>>(&app, "got").is_none(), "resumed early at {clock}");
    }
    app.tick(40).unwrap();
    assert_eq!(global::<String>(&app, "got"), "payload");
    assert_eq!(global::<i64>(&app, "resumed_at"), 40);
}

#[test]
fn waits_in_handlers_time_out_with_nil() {
    let mut app = app();
    app.load_source(
        br#"
        function tick(clock)
            if started then return end
            started = true
            local p = deck.Promise(50)
            local v = p:wait()
            finished = { value = v, timed_out = p.timed_out, at = deck.clock }
        end
        "#,
        "=timeout",
        TrustLevel::Trusted,
    )
    .unwrap();

    let mut clock = 0;
    while global::<Option<mlua::Table>>(&app, "finished").is_none() {
        assert!(clock <= 100, "wait never timed out");
        app.tick(clock).unwrap();
        clock += 10;
    }
    let finished: mlua::Table = global(&app, "finished");
    assert!(finished.get::<Option<String>>("value").unwrap().is_none());
    assert!(finished.get::<bool>("timed_out").unwrap());
    assert!(finished.get::<i64>("at").unwrap() >= 50);
}

#[test]
fn several_waiters_wake_in_order() {
    let mut app = app();
    app.load_source(
        br#"
        order = {}
        shared = deck.Promise(1000)
        function tick(clock)
            if clock == 0 or clock == 10 then
                local name = clock == 0 and "a" or "b"
                local v = shared:wait()
                order[#order + 1] = name .. "=" .. tostring(v)
            elseif clock == 20 then
                shared:fulfill(7)
            end
        end
        "#,
        "=order",
        TrustLevel::Trusted,
    )
    .unwrap();
    for clock in [0, 10, 20, 30] {
        app.tick(clock).unwrap();
    }
    let order: Vec<String> = global::<mlua::Table>(&app, "order")
        .sequence_values::<String>()
        .collect::<mlua::Result<_>>()
        .unwrap();
    assert_eq!(order, vec!["a=7".to_string(), "b=7".to_string()]);
}

#[test]
fn handler_errors_are_logged_and_ticks_continue() {
    let mut app = app();
    app.load_source(
        br#"
        count = 0
        function tick(clock)
            count = count + 1
            if clock == 10 then error("bad frame") end
        end
        "#,
        "=errors",
        TrustLevel::Trusted,
    )
    .unwrap();
    for clock in [0, 10, 20] {
        app.tick(clock).unwrap();
    }
    assert_eq!(global::<i64>(&app, "count"), 3);
}
