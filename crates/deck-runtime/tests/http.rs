use std::io::{Read, Write};
use std::net::TcpListener;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use deck_runtime::{Application, HeadlessPlatform, RuntimeConfig, TrustLevel};
use deck_util::Paths;
use mlua::Table;

fn app() -> Application {
    Application::with_platform(RuntimeConfig::default(), Paths::default(), Box::new(HeadlessPlatform::new())).unwrap()
}

/// Accepts one connection, forwards the request head and then either
/// answers with `reply` or stays silent until `hold` is dropped.
fn spawn_server(reply: Option<&'static str>) -> (u16, mpsc::Receiver<String>, mpsc::Sender<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let (head_tx, head_rx) = mpsc::channel();
    let (hold_tx, hold_rx) = mpsc::channel::<()>();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            if stream.read_exact(&mut byte).is_err() {
                return;
            }
            head.push(byte[0]);
        }
        let _ = head_tx.send(String::from_utf8_lossy(&head).into_owned());
        if let Some(reply) = reply {
            let _ = stream.write_all(reply.as_bytes());
        }
        let _ = hold_rx.recv_timeout(Duration::from_secs(10));
    });
    (port, head_rx, hold_tx)
}

fn tick_until(app: &mut Application, clock: &mut i64, mut done: impl FnMut() -> bool) {
    while !done() {
        assert!(*clock < 50_000, "condition never reached");
        app.tick(*clock).unwrap();
        *clock += 10;
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn get_resolves_with_the_response_table() {
    let (port, heads, _hold) = spawn_server(Some(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: 5\r\n\r\nhello",
    ));
    let mut app = app();
    let script = format!(
        r#"
        api = deck.Connector("Http", "api", {{ connection_string = "http://127.0.0.1:{port}" }})
        function api:on_response(r) seen = r.code end
        result = api:get("/status", {{ ["X-Trace"] = "1" }}):wait()
        "#
    );
    app.load_source(script.as_bytes(), "=http", TrustLevel::Trusted).unwrap();
    let env = app.script_env().unwrap().clone();

    let mut clock = 0;
    tick_until(&mut app, &mut clock, || env.raw_get::<Option<Table>>("result").unwrap().is_some());

    let head = heads.recv_timeout(Duration::from_secs(1)).unwrap();
    assert!(head.starts_with("GET /status HTTP/1.1\r\n"), "{head}");
    assert!(head.contains("X-Trace: 1\r\n"), "{head}");

    let result: Table = env.raw_get("result").unwrap();
    assert!(result.get::<bool>("ok").unwrap());
    assert_eq!(result.get::<i64>("code").unwrap(), 200);
    assert_eq!(result.get::<String>("body").unwrap(), "hello");
    let headers: Table = result.get("headers").unwrap();
    assert_eq!(headers.get::<String>("Content-Type").unwrap(), "text/plain");
    // Awaited responses go to the promise, not the handler.
    assert!(env.raw_get::<Option<i64>>("seen").unwrap().is_none());
}

#[test]
fn silent_server_times_out_the_request() {
    let (port, heads, _hold) = spawn_server(None);
    let mut app = app();
    let script = format!(
        r#"
        api = deck.Connector("Http", "api", {{ connection_string = "http://127.0.0.1:{port}" }})
        failures = 0
        function api:on_request_failed(r)
            failures = failures + 1
            failed_with = r.error
        end
        result = api:get("/slow"):wait()
        "#
    );
    app.load_source(script.as_bytes(), "=http", TrustLevel::Trusted).unwrap();
    let env = app.script_env().unwrap().clone();

    // Tick at a fixed clock until the request is on the wire.
    let mut sent = false;
    for _ in 0..5000 {
        app.tick(0).unwrap();
        if heads.try_recv().is_ok() {
            sent = true;
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }
    assert!(sent, "request never reached the server");

    app.tick(2000).unwrap();
    assert!(env.raw_get::<Option<Table>>("result").unwrap().is_none());

    app.tick(2010).unwrap();
    app.tick(2020).unwrap();
    let result: Table = env.raw_get("result").unwrap();
    assert!(!result.get::<bool>("ok").unwrap());
    assert_eq!(result.get::<i64>("code").unwrap(), 500);
    assert_eq!(result.get::<String>("error").unwrap(), "Request timed out");
    assert_eq!(env.raw_get::<String>("failed_with").unwrap(), "Request timed out");

    // Reconnect pacing must not report the same request again.
    for clock in (2030..=9000).step_by(500) {
        app.tick(clock).unwrap();
    }
    assert_eq!(env.raw_get::<i64>("failures").unwrap(), 1);
}
