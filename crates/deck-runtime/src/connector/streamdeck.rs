//! Elgato Stream Deck surfaces over HID: button state reports in, JPEG key
//! images and brightness out.

use std::collections::BTreeMap;

use jpeg_encoder::{ColorType, Encoder};
use mlua::{AnyUserData, Lua, Table, Value};

use super::hid::{self, HidBackend, HidDevice, HidDeviceInfo};
use super::{int_arg, lua_bytes, string_arg, Connector, ConnectorBase, Events};
use crate::bridge::{self, NewIndex};
use crate::connector_class;
use crate::error::{DeckError, LuaResult};
use crate::graphics::card::surface_of;
use crate::graphics::{Colour, Surface};

pub const VENDOR_ELGATO: u16 = 0x0fd9;

pub const REPORT_SIZE: usize = 1024;
const REPORT_HEADER_SIZE: usize = 8;
pub const CHUNK_SIZE: usize = REPORT_SIZE - REPORT_HEADER_SIZE;

const INPUT_REPORT_SIZE: usize = 512;
const FEATURE_REPORT_SIZE: usize = 32;
const BUTTON_STATES_OFFSET: usize = 4;
const JPEG_QUALITY: u8 = 90;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Model {
    Original,
    V2,
    Mini,
    Xl,
}

impl Model {
    pub fn from_pid(pid: u16) -> Option<Model> {
        match pid {
            0x0060 => Some(Model::Original),
            0x006d => Some(Model::V2),
            0x0063 => Some(Model::Mini),
            0x006c => Some(Model::Xl),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Model::Original => "Original",
            Model::V2 => "V2",
            Model::Mini => "Mini",
            Model::Xl => "XL",
        }
    }

    pub fn columns(self) -> usize {
        match self {
            Model::Original | Model::V2 => 5,
            Model::Mini => 3,
            Model::Xl => 8,
        }
    }

    pub fn rows(self) -> usize {
        match self {
            Model::Original | Model::V2 => 3,
            Model::Mini => 2,
            Model::Xl => 4,
        }
    }

    pub fn button_count(self) -> usize {
        self.columns() * self.rows()
    }

    pub fn button_size(self) -> u32 {
        match self {
            Model::Xl => 96,
            _ => 72,
        }
    }
}

/// Feature report that sets the backlight, `value` in percent.
pub fn brightness_report(value: u8) -> Vec<u8> {
    let mut report = vec![0u8; FEATURE_REPORT_SIZE];
    report[..3].copy_from_slice(&[0x03, 0x08, value.min(100)]);
    report
}

/// Splits an encoded key image into fixed-size output reports.
pub fn image_reports(button: u8, jpeg: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if jpeg.is_empty() {
        vec![&[][..]]
    } else {
        jpeg.chunks(CHUNK_SIZE).collect()
    };
    let last_page = chunks.len() - 1;
    chunks
        .into_iter()
        .enumerate()
        .map(|(page, chunk)| {
            let len = chunk.len() as u16;
            let page16 = page as u16;
            let mut report = Vec::with_capacity(REPORT_SIZE);
            report.extend_from_slice(&[
                0x02,
                0x07,
                button,
                u8::from(page == last_page),
                len.to_le_bytes()[0],
                len.to_le_bytes()[1],
                page16.to_le_bytes()[0],
                page16.to_le_bytes()[1],
            ]);
            report.extend_from_slice(chunk);
            report.resize(REPORT_SIZE, 0);
            report
        })
        .collect()
}

/// Decodes a button state input report into exactly as many states as the
/// report announces. Returns `None` for other report types and for reports
/// too short to hold every announced state.
pub fn parse_button_report(report: &[u8]) -> Option<Vec<bool>> {
    if report.len() < BUTTON_STATES_OFFSET || report[0] != 0x01 {
        return None;
    }
    let count = u16::from_le_bytes([report[2], report[3]]) as usize;
    let states = report.get(BUTTON_STATES_OFFSET..BUTTON_STATES_OFFSET + count)?;
    Some(states.iter().map(|b| *b != 0).collect())
}

/// Prepares a key image the way the hardware expects it: scaled to the key
/// size, rotated half a turn and JPEG encoded.
pub fn encode_button_image(surface: &Surface, size: u32) -> Result<Vec<u8>, String> {
    let frame = surface.resized(size, size).rotated_180();
    let mut jpeg = Vec::new();
    Encoder::new(&mut jpeg, JPEG_QUALITY)
        .encode(&frame.to_rgb(), size as u16, size as u16, ColorType::Rgb)
        .map_err(|e| format!("JPEG encoding failed: {e}"))?;
    Ok(jpeg)
}

pub struct StreamDeckConnector {
    base: ConnectorBase,
    backend: Box<dyn HidBackend>,
    device: Option<Box<dyn HidDevice>>,
    info: Option<HidDeviceInfo>,
    model: Option<Model>,
    serial_filter: String,
    brightness: u8,
    brightness_dirty: bool,
    states: Vec<bool>,
    pending: BTreeMap<u8, Surface>,
    write_failure: Option<String>,
    last_scan_error: String,
}

pub fn create(lua: &Lua, name: &str) -> LuaResult<AnyUserData> {
    with_backend(lua, name, hid::default_backend())
}

pub fn with_backend(lua: &Lua, name: &str, backend: Box<dyn HidBackend>) -> LuaResult<AnyUserData> {
    let connector = StreamDeckConnector {
        base: ConnectorBase::new(name),
        backend,
        device: None,
        info: None,
        model: None,
        serial_filter: String::new(),
        brightness: 70,
        brightness_dirty: true,
        states: Vec::new(),
        pending: BTreeMap::new(),
        write_failure: None,
        last_scan_error: String::new(),
    };
    bridge::push_new(lua, connector)
}

impl StreamDeckConnector {
    fn scan(&mut self) -> Result<Option<(HidDeviceInfo, Model, Box<dyn HidDevice>)>, String> {
        let devices = self.backend.enumerate().map_err(|e| e.to_string())?;
        let candidate = devices.into_iter().find_map(|info| {
            if info.vid != VENDOR_ELGATO {
                return None;
            }
            let model = Model::from_pid(info.pid)?;
            if !self.serial_filter.is_empty() && info.serial.as_deref() != Some(self.serial_filter.as_str()) {
                return None;
            }
            Some((info, model))
        });
        let Some((info, model)) = candidate else {
            return Ok(None);
        };
        let device = self.backend.open(&info).map_err(|e| e.to_string())?;
        Ok(Some((info, model, device)))
    }

    fn try_connect(&mut self, lua: &Lua, events: &mut Events) -> LuaResult<()> {
        match self.scan() {
            Ok(Some((info, model, device))) => {
                tracing::info!(
                    connector = %self.base.name,
                    model = model.name(),
                    serial = info.serial.as_deref().unwrap_or(""),
                    "stream deck connected"
                );
                self.states = vec![false; model.button_count()];
                self.device = Some(device);
                self.info = Some(info);
                self.model = Some(model);
                self.brightness_dirty = true;
                self.last_scan_error.clear();
                self.base.last_error.clear();
                events.push("on_connect", Vec::new());
            }
            Ok(None) => {}
            Err(reason) => {
                if reason != self.last_scan_error {
                    self.base.set_error(reason.clone());
                    events.push("on_connect_failed", vec![lua_bytes(lua, reason.as_bytes())?]);
                    self.last_scan_error = reason;
                }
            }
        }
        Ok(())
    }

    fn disconnect(&mut self, events: &mut Events) {
        if self.device.take().is_some() {
            tracing::info!(connector = %self.base.name, "stream deck disconnected");
            events.push("on_disconnect", Vec::new());
        }
        self.info = None;
        self.states.clear();
        self.pending.clear();
    }

    fn read_reports(&mut self, lua: &Lua, events: &mut Events) -> LuaResult<()> {
        let mut buf = [0u8; INPUT_REPORT_SIZE];
        loop {
            let Some(device) = self.device.as_mut() else {
                return Ok(());
            };
            let n = match device.read_nonblock(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) => {
                    self.base.set_error(e.to_string());
                    self.disconnect(events);
                    return Ok(());
                }
            };
            match parse_button_report(&buf[..n]) {
                Some(states) => self.apply_states(lua, states, events)?,
                None => tracing::trace!(connector = %self.base.name, len = n, "ignoring input report"),
            }
        }
    }

    /// Replaces the state table with the reported one. Buttons the previous
    /// report did not cover start out released.
    fn apply_states(&mut self, lua: &Lua, states: Vec<bool>, events: &mut Events) -> LuaResult<()> {
        self.states.resize(states.len(), false);
        let flipped: Vec<usize> = states
            .iter()
            .zip(&self.states)
            .enumerate()
            .filter(|(_, (new, old))| new != old)
            .map(|(i, _)| i)
            .collect();
        self.states = states;
        if flipped.is_empty() {
            return Ok(());
        }

        let table = lua.create_table_with_capacity(self.states.len(), 0)?;
        for (i, pressed) in self.states.iter().enumerate() {
            table.raw_set(i + 1, *pressed)?;
        }
        for i in flipped {
            let name = if self.states[i] { "on_press" } else { "on_release" };
            events.push(name, vec![Value::Integer(i as i64 + 1), Value::Table(table.clone())]);
        }
        Ok(())
    }

    fn flush_outputs(&mut self) -> Result<(), String> {
        let Some(model) = self.model else {
            return Ok(());
        };
        let Some(device) = self.device.as_mut() else {
            return Ok(());
        };
        if self.brightness_dirty {
            device
                .send_feature_report(&brightness_report(self.brightness))
                .map_err(|e| e.to_string())?;
            self.brightness_dirty = false;
        }
        for (button, surface) in std::mem::take(&mut self.pending) {
            let jpeg = encode_button_image(&surface, model.button_size())?;
            for report in image_reports(button, &jpeg) {
                device.write(&report).map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }

    fn button_index(&self, index: i64) -> LuaResult<u8> {
        let max = self.model.map(Model::button_count).unwrap_or(Model::Xl.button_count());
        if index < 1 || index as usize > max {
            return Err(DeckError::arg_value(format!("button index must be in 1..{max}, got {index}")).into());
        }
        Ok((index - 1) as u8)
    }
}

impl Connector for StreamDeckConnector {
    const TYPE_NAME: &'static str = "deck:StreamDeck";

    fn base(&self) -> &ConnectorBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ConnectorBase {
        &mut self.base
    }

    fn is_connected(&self) -> bool {
        self.device.is_some()
    }

    fn init_methods(lua: &Lua, class: &Table) -> LuaResult<()> {
        bridge::method::<StreamDeckConnector, _, _, _>(
            lua,
            class,
            "set_button",
            |_, this, (index, card): (i64, Value)| {
                let button = this.button_index(index)?;
                this.pending.insert(button, surface_of(&card)?);
                Ok(())
            },
        )?;
        bridge::method::<StreamDeckConnector, _, _, _>(lua, class, "clear_button", |_, this, index: i64| {
            let button = this.button_index(index)?;
            this.pending.insert(button, Surface::filled(1, 1, Colour::BLACK));
            Ok(())
        })
    }

    fn property(&self, lua: &Lua, key: &str) -> LuaResult<Value> {
        let model = self.model;
        let model_int = |f: fn(Model) -> usize| model.map(|m| Value::Integer(f(m) as i64)).unwrap_or(Value::Nil);
        Ok(match key {
            "vid" => Value::Integer(VENDOR_ELGATO as i64),
            "pid" => self
                .info
                .as_ref()
                .map(|i| Value::Integer(i.pid as i64))
                .unwrap_or(Value::Nil),
            "model" => match model {
                Some(m) => lua_bytes(lua, m.name().as_bytes())?,
                None => Value::Nil,
            },
            "button_count" => model_int(Model::button_count),
            "columns" => model_int(Model::columns),
            "rows" => model_int(Model::rows),
            "button_size" => model
                .map(|m| Value::Integer(m.button_size() as i64))
                .unwrap_or(Value::Nil),
            "serialnumber" => {
                let serial = self
                    .info
                    .as_ref()
                    .and_then(|i| i.serial.clone())
                    .unwrap_or_else(|| self.serial_filter.clone());
                if serial.is_empty() {
                    Value::Nil
                } else {
                    lua_bytes(lua, serial.as_bytes())?
                }
            }
            "brightness" => Value::Integer(self.brightness as i64),
            _ => Value::Nil,
        })
    }

    fn set_property(&mut self, _lua: &Lua, key: &str, value: Value) -> LuaResult<NewIndex> {
        match key {
            "serialnumber" => {
                self.serial_filter = match value {
                    Value::Nil => String::new(),
                    other => string_arg(<Self as Connector>::TYPE_NAME, key, &other)?,
                };
                self.last_scan_error.clear();
                Ok(NewIndex::Handled)
            }
            "brightness" => {
                let v = int_arg(<Self as Connector>::TYPE_NAME, key, &value)?;
                self.brightness = v.clamp(0, 100) as u8;
                self.brightness_dirty = true;
                Ok(NewIndex::Handled)
            }
            "vid" | "pid" | "model" | "button_count" | "columns" | "rows" | "button_size" => {
                Err(DeckError::readonly(<Self as Connector>::TYPE_NAME, key).into())
            }
            _ => Ok(NewIndex::Store(value)),
        }
    }

    fn tick_inputs(&mut self, lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        if let Some(reason) = self.write_failure.take() {
            self.base.set_error(reason);
            self.disconnect(events);
            return Ok(());
        }
        if self.device.is_none() {
            if self.base.enabled {
                self.try_connect(lua, events)?;
            }
            return Ok(());
        }
        self.read_reports(lua, events)
    }

    fn tick_outputs(&mut self, _lua: &Lua, _clock: i64, events: &mut Events) -> LuaResult<()> {
        if !self.base.enabled {
            self.disconnect(events);
            return Ok(());
        }
        if let Err(reason) = self.flush_outputs() {
            tracing::warn!(connector = %self.base.name, error = %reason, "stream deck write failed");
            self.write_failure = Some(reason);
        }
        Ok(())
    }

    fn shutdown(&mut self, _lua: &Lua, _events: &mut Events) -> LuaResult<()> {
        self.device = None;
        self.info = None;
        self.pending.clear();
        self.states.clear();
        Ok(())
    }
}

connector_class!(StreamDeckConnector);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_follow_product_ids() {
        assert_eq!(Model::from_pid(0x0060), Some(Model::Original));
        assert_eq!(Model::from_pid(0x006c).map(Model::button_count), Some(32));
        assert_eq!(Model::from_pid(0x0063).map(|m| (m.columns(), m.rows())), Some((3, 2)));
        assert_eq!(Model::Xl.button_size(), 96);
        assert_eq!(Model::from_pid(0x1234), None);
    }

    #[test]
    fn brightness_report_is_clamped_and_padded() {
        let report = brightness_report(250);
        assert_eq!(report.len(), FEATURE_REPORT_SIZE);
        assert_eq!(&report[..3], &[0x03, 0x08, 100]);
        assert!(report[3..].iter().all(|b| *b == 0));
    }

    #[test]
    fn image_is_split_into_padded_pages() {
        let jpeg: Vec<u8> = (0..2100u32).map(|i| i as u8).collect();
        let reports = image_reports(4, &jpeg);
        assert_eq!(reports.len(), 3);
        assert!(reports.iter().all(|r| r.len() == REPORT_SIZE));

        assert_eq!(&reports[0][..8], &[0x02, 0x07, 4, 0, 0xf8, 0x03, 0, 0]);
        assert_eq!(&reports[0][8..12], &jpeg[..4]);
        // 2100 - 2 * 1016 = 68 bytes on the last page.
        assert_eq!(&reports[2][..8], &[0x02, 0x07, 4, 1, 68, 0, 2, 0]);
        assert_eq!(&reports[2][8..8 + 68], &jpeg[2032..]);
        assert!(reports[2][8 + 68..].iter().all(|b| *b == 0));
    }

    #[test]
    fn button_reports_are_parsed_from_offset_four() {
        let mut report = vec![0x01, 0x00, 15, 0x00];
        report.extend_from_slice(&[0, 1, 0, 0, 1]);
        report.resize(64, 0);
        let states = parse_button_report(&report).unwrap();
        assert_eq!(states.len(), 15);
        assert!(states[1] && states[4]);
        assert_eq!(states.iter().filter(|s| **s).count(), 2);

        assert!(parse_button_report(&[0x02, 0, 0, 0]).is_none());
        assert!(parse_button_report(&[0x01, 0]).is_none());
    }

    #[test]
    fn button_reports_are_sized_by_their_own_count() {
        assert_eq!(
            parse_button_report(&[0x01, 0x00, 0x02, 0x00, 0x01, 0x00]),
            Some(vec![true, false])
        );
        // Extra trailing bytes beyond the announced count are not states.
        assert_eq!(
            parse_button_report(&[0x01, 0x00, 0x02, 0x00, 0x00, 0x01, 0x01, 0x01]),
            Some(vec![false, true])
        );
        // Three states announced, two present.
        assert_eq!(parse_button_report(&[0x01, 0x00, 0x03, 0x00, 0x01, 0x01]), None);
        assert_eq!(parse_button_report(&[0x01, 0x00, 0x00, 0x00]), Some(Vec::new()));
    }

    #[test]
    fn key_images_encode_as_jpeg() {
        let surface = Surface::filled(10, 10, Colour::WHITE);
        let jpeg = encode_button_image(&surface, 72).unwrap();
        assert_eq!(&jpeg[..2], &[0xff, 0xd8]);
    }
}
