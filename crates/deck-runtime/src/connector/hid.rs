//! Minimal HID seam used by the StreamDeck connector. The real backend sits
//! behind the `hidapi` feature; tests plug in their own.

#[derive(Debug, thiserror::Error)]
pub enum HidError {
    #[error("HID backend unavailable: {0}")]
    Unavailable(String),
    #[error("HID device not found: {0}")]
    NotFound(String),
    #[error("HID I/O failed: {0}")]
    Io(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HidDeviceInfo {
    pub vid: u16,
    pub pid: u16,
    pub serial: Option<String>,
    pub path: String,
}

pub trait HidDevice {
    /// Reads one input report if available. `Ok(0)` means nothing pending.
    fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<usize, HidError>;

    fn write(&mut self, report: &[u8]) -> Result<usize, HidError>;

    fn send_feature_report(&mut self, report: &[u8]) -> Result<(), HidError>;
}

pub trait HidBackend {
    fn enumerate(&mut self) -> Result<Vec<HidDeviceInfo>, HidError>;

    fn open(&mut self, info: &HidDeviceInfo) -> Result<Box<dyn HidDevice>, HidError>;
}

/// Backend used when no HID library is compiled in; it never finds devices.
#[derive(Debug, Default)]
pub struct NullHid;

impl HidBackend for NullHid {
    fn enumerate(&mut self) -> Result<Vec<HidDeviceInfo>, HidError> {
        Ok(Vec::new())
    }

    fn open(&mut self, info: &HidDeviceInfo) -> Result<Box<dyn HidDevice>, HidError> {
        Err(HidError::NotFound(info.path.clone()))
    }
}

#[cfg(feature = "hidapi")]
mod native {
    use std::ffi::CString;

    use super::{HidBackend, HidDevice, HidDeviceInfo, HidError};

    pub struct HidApiBackend {
        api: hidapi::HidApi,
    }

    impl HidApiBackend {
        pub fn new() -> Result<Self, HidError> {
            let api = hidapi::HidApi::new().map_err(|e| HidError::Unavailable(e.to_string()))?;
            Ok(HidApiBackend { api })
        }
    }

    impl HidBackend for HidApiBackend {
        fn enumerate(&mut self) -> Result<Vec<HidDeviceInfo>, HidError> {
            self.api
                .refresh_devices()
                .map_err(|e| HidError::Io(e.to_string()))?;
            Ok(self
                .api
                .device_list()
                .map(|d| HidDeviceInfo {
                    vid: d.vendor_id(),
                    pid: d.product_id(),
                    serial: d.serial_number().map(str::to_string),
                    path: d.path().to_string_lossy().into_owned(),
                })
                .collect())
        }

        fn open(&mut self, info: &HidDeviceInfo) -> Result<Box<dyn HidDevice>, HidError> {
            let path = CString::new(info.path.as_bytes()).map_err(|e| HidError::NotFound(e.to_string()))?;
            let device = self
                .api
                .open_path(&path)
                .map_err(|e| HidError::Io(e.to_string()))?;
            device
                .set_blocking_mode(false)
                .map_err(|e| HidError::Io(e.to_string()))?;
            Ok(Box::new(NativeDevice { device }))
        }
    }

    struct NativeDevice {
        device: hidapi::HidDevice,
    }

    impl HidDevice for NativeDevice {
        fn read_nonblock(&mut self, buf: &mut [u8]) -> Result<usize, HidError> {
            self.device.read(buf).map_err(|e| HidError::Io(e.to_string()))
        }

        fn write(&mut self, report: &[u8]) -> Result<usize, HidError> {
            self.device.write(report).map_err(|e| HidError::Io(e.to_string()))
        }

        fn send_feature_report(&mut self, report: &[u8]) -> Result<(), HidError> {
            self.device
                .send_feature_report(report)
                .map_err(|e| HidError::Io(e.to_string()))
        }
    }
}

#[cfg(feature = "hidapi")]
pub use native::HidApiBackend;

/// The backend a freshly created StreamDeck connector uses.
pub fn default_backend() -> Box<dyn HidBackend> {
    #[cfg(feature = "hidapi")]
    {
        match HidApiBackend::new() {
            Ok(backend) => return Box::new(backend),
            Err(err) => tracing::warn!(error = %err, "falling back to the null HID backend"),
        }
    }
    Box::new(NullHid)
}
