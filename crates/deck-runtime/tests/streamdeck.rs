use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use deck_runtime::connector::hid::{HidBackend, HidDevice, HidDeviceInfo, HidError};
use deck_runtime::connector::streamdeck::{self, REPORT_SIZE};
use deck_runtime::{Application, HeadlessPlatform, RuntimeConfig, TrustLevel};
use deck_util::Paths;

#[derive(Default)]
struct MockState {
    devices: Vec<HidDeviceInfo>,
    inbox: VecDeque<Vec<u8>>,
    writes: Vec<Vec<u8>>,
    features: Vec<Vec<u8>>,
    fail_reads: bool,
}

/// Shared between the test and every connector the factory builds.
#[derive(Clone, Default)]
struct MockHid(Rc<RefCell<MockState>>);

struct MockDevice(Rc<RefCell<MockState>>);

impl HidBackend for MockHid {
    fn enumerate(&mut self) -> Result<Vec<HidDeviceInfo>, HidError> {
        Ok(self.0.borrow().devices.clone())
    }

    fn open(&mut self, _info: &HidDeviceInfo) -> Result<Box<dyn HidDevice>, HidError> {
        Ok(Box::new(MockDevice(self.0.clone())))
    }
}

impl HidDevice for MockDevice {
    fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<usize, HidError> {
        let mut st = self.0.borrow_mut();
        if st.fail_reads {
            return Err(HidError::Io("device unplugged".into()));
        }
        match st.inbox.pop_front() {
            Some(report) => {
                let n = report.len().min(buf.len());
                buf[..n].copy_from_slice(&report[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn write(&mut self, report: &[u8]) -> Result<usize, HidError> {
        self.0.borrow_mut().writes.push(report.to_vec());
        Ok(report.len())
    }

    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), HidError> {
        self.0.borrow_mut().features.push(report.to_vec());
        Ok(())
    }
}

fn original_deck(serial: &str) -> HidDeviceInfo {
    HidDeviceInfo {
        vid: 0x0fd9,
        pid: 0x0060,
        serial: Some(serial.to_string()),
        path: format!("mock:{serial}"),
    }
}

fn button_report(pressed: &[usize]) -> Vec<u8> {
    let mut report = vec![0x01, 0x00, 15, 0x00];
    report.extend(std::iter::repeat(0u8).take(15));
    for i in pressed {
        report[4 + i] = 1;
    }
    report
}

fn app_with(mock: &MockHid) -> Application {
    let app =
        Application::with_platform(RuntimeConfig::default(), Paths::default(), Box::new(HeadlessPlatform::new())).unwrap();
    let backend = mock.clone();
    app.register_connector(
        "StreamDeck",
        Rc::new(move |lua, name| streamdeck::with_backend(lua, name, Box::new(backend.clone()))),
    );
    app
}

const SCRIPT: &[u8] = br#"
sd = deck.Connector("ElgatoStreamDeck", "deck")
events = {}
function sd:on_connect() events[#events + 1] = "connect:" .. self.model end
function sd:on_disconnect() events[#events + 1] = "disconnect" end
function sd:on_press(index, states)
    events[#events + 1] = "press:" .. index .. ":" .. tostring(states[index])
end
function sd:on_release(index, states)
    events[#events + 1] = "release:" .. index .. ":" .. tostring(states[index])
end
"#;

fn load(app: &mut Application) -> mlua::Table {
    app.load_source(SCRIPT, "=deck", TrustLevel::Trusted).unwrap();
    app.script_env().unwrap().clone()
}

/// Runs more code against the script's globals.
fn run(app: &Application, env: &mlua::Table, code: &str) {
    app.lua().load(code).set_environment(env.clone()).exec().unwrap();
}

fn events(env: &mlua::Table) -> Vec<String> {
    let t: mlua::Table = env.raw_get("events").unwrap();
    t.sequence_values::<String>().collect::<mlua::Result<_>>().unwrap()
}

#[test]
fn presses_and_releases_reach_the_script() {
    let mock = MockHid::default();
    mock.0.borrow_mut().devices.push(original_deck("AL01"));
    let mut app = app_with(&mock);
    let env = load(&mut app);

    app.tick(0).unwrap();
    assert_eq!(events(&env), vec!["connect:Original"]);

    mock.0.borrow_mut().inbox.push_back(button_report(&[0, 4]));
    app.tick(10).unwrap();
    mock.0.borrow_mut().inbox.push_back(button_report(&[4]));
    app.tick(20).unwrap();

    assert_eq!(
        events(&env),
        vec![
            "connect:Original",
            "press:1:true",
            "press:5:true",
            "release:1:false",
        ]
    );
}

#[test]
fn images_and_brightness_are_written_as_reports() {
    let mock = MockHid::default();
    mock.0.borrow_mut().devices.push(original_deck("AL01"));
    let mut app = app_with(&mock);
    let env = load(&mut app);
    app.tick(0).unwrap();

    let features = std::mem::take(&mut mock.0.borrow_mut().features);
    assert_eq!(features.len(), 1);
    assert_eq!(&features[0][..3], &[0x03, 0x08, 70]);

    run(
        &app,
        &env,
        r#"
        local card = deck.Card(72, 72)
        card:clear(deck.Colour("red"))
        sd:set_button(3, card)
        sd.brightness = 250
        ok_range = pcall(function() sd:set_button(16, card) end)
        "#,
    );
    assert!(!env.raw_get::<bool>("ok_range").unwrap());
    app.tick(10).unwrap();

    let st = mock.0.borrow();
    assert_eq!(st.features.len(), 1);
    assert_eq!(&st.features[0][..3], &[0x03, 0x08, 100]);
    assert!(!st.writes.is_empty());
    for (page, report) in st.writes.iter().enumerate() {
        assert_eq!(report.len(), REPORT_SIZE);
        assert_eq!(&report[..3], &[0x02, 0x07, 2]);
        assert_eq!(report[6] as usize, page);
    }
    let last = st.writes.last().unwrap();
    assert_eq!(last[3], 1);
    // JPEG start-of-image marker opens the first page payload.
    assert_eq!(&st.writes[0][8..10], &[0xff, 0xd8]);
}

#[test]
fn serial_filter_and_unplug() {
    let mock = MockHid::default();
    mock.0.borrow_mut().devices.push(original_deck("OTHER"));
    let mut app = app_with(&mock);
    let env = load(&mut app);
    run(&app, &env, r#"sd.serialnumber = "WANTED""#);

    app.tick(0).unwrap();
    assert!(events(&env).is_empty());

    mock.0.borrow_mut().devices.push(original_deck("WANTED"));
    app.tick(10).unwrap();
    assert_eq!(events(&env), vec!["connect:Original"]);

    mock.0.borrow_mut().fail_reads = true;
    app.tick(20).unwrap();
    assert_eq!(events(&env), vec!["connect:Original", "disconnect"]);
}

const TABLE_SCRIPT: &[u8] = br#"
sd = deck.Connector("StreamDeck", "deck")
events = {}
local function describe(kind, index, states)
    local parts = {}
    for i = 1, #states do parts[i] = tostring(states[i]) end
    events[#events + 1] = kind .. ":" .. index .. ":n=" .. #states .. ":" .. table.concat(parts, ",")
end
function sd:on_press(index, states) describe("press", index, states) end
function sd:on_release(index, states) describe("release", index, states) end
"#;

fn load_tables(app: &mut Application) -> mlua::Table {
    app.load_source(TABLE_SCRIPT, "=tables", TrustLevel::Trusted).unwrap();
    app.script_env().unwrap().clone()
}

#[test]
fn state_table_follows_the_reported_button_count() {
    let mock = MockHid::default();
    mock.0.borrow_mut().devices.push(original_deck("AL01"));
    let mut app = app_with(&mock);
    let env = load_tables(&mut app);
    app.tick(0).unwrap();

    mock.0.borrow_mut().inbox.push_back(vec![0x01, 0x00, 0x02, 0x00, 0x01, 0x00]);
    app.tick(10).unwrap();
    assert_eq!(events(&env), vec!["press:1:n=2:true,false"]);

    mock.0.borrow_mut().inbox.push_back(vec![0x01, 0x00, 0x02, 0x00, 0x00, 0x01]);
    app.tick(20).unwrap();
    assert_eq!(
        events(&env),
        vec![
            "press:1:n=2:true,false",
            "release:1:n=2:false,true",
            "press:2:n=2:false,true",
        ]
    );
}

#[test]
fn truncated_button_reports_are_ignored() {
    let mock = MockHid::default();
    mock.0.borrow_mut().devices.push(original_deck("AL01"));
    let mut app = app_with(&mock);
    let env = load_tables(&mut app);
    app.tick(0).unwrap();

    // Announces three buttons but carries two states.
    mock.0.borrow_mut().inbox.push_back(vec![0x01, 0x00, 0x03, 0x00, 0x01, 0x01]);
    app.tick(10).unwrap();
    assert!(events(&env).is_empty());

    mock.0.borrow_mut().inbox.push_back(vec![0x01, 0x00, 0x03, 0x00, 0x00, 0x01, 0x00]);
    app.tick(20).unwrap();
    assert_eq!(events(&env), vec!["press:2:n=3:false,true,false"]);
}
