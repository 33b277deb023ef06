//! Real USB HID backend built on `hidapi`.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use hidapi::{DeviceInfo, HidApi};
use panelbridge_types::BridgeError;

use super::device::{HidBackend, HidDevice, TeensyConfig};
use super::frame::REPORT_SIZE;

fn hid_error(e: hidapi::HidError) -> BridgeError {
    BridgeError::Transport(format!("hid: {e}"))
}

fn matches(info: &DeviceInfo, config: &TeensyConfig) -> bool {
    info.vendor_id() == config.vendor_id
        && info.product_id() == config.product_id
        && info.usage() == config.usage
        && info.usage_page() == config.usage_page
}

/// Host USB stack accessed through hidapi.
pub struct HidApiBackend {
    api: Mutex<HidApi>,
}

impl HidApiBackend {
    pub fn new() -> Result<Self, BridgeError> {
        let api = HidApi::new().map_err(hid_error)?;
        Ok(Self {
            api: Mutex::new(api),
        })
    }

    fn refreshed(&self) -> Result<MutexGuard<'_, HidApi>, BridgeError> {
        let mut api = self.api.lock().unwrap_or_else(PoisonError::into_inner);
        api.refresh_devices().map_err(hid_error)?;
        Ok(api)
    }
}

impl HidBackend for HidApiBackend {
    fn probe(&self, config: &TeensyConfig) -> Result<(), BridgeError> {
        let api = self.refreshed()?;
        if api.device_list().any(|info| matches(info, config)) {
            Ok(())
        } else {
            Err(BridgeError::DeviceNotFound(config.to_string()))
        }
    }

    fn open(&self, config: &TeensyConfig) -> Result<Box<dyn HidDevice>, BridgeError> {
        let api = self.refreshed()?;
        let info = api
            .device_list()
            .find(|info| matches(info, config))
            .ok_or_else(|| BridgeError::DeviceNotFound(config.to_string()))?;
        let device = info.open_device(&api).map_err(hid_error)?;
        Ok(Box::new(HidApiDevice { device }))
    }
}

struct HidApiDevice {
    device: hidapi::HidDevice,
}

impl HidDevice for HidApiDevice {
    fn read(&mut self, timeout: Duration) -> Result<Vec<u8>, BridgeError> {
        let mut buf = [0u8; REPORT_SIZE];
        let millis = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
        let n = self.device.read_timeout(&mut buf, millis).map_err(hid_error)?;
        Ok(buf[..n].to_vec())
    }

    fn write(&mut self, report: &[u8; REPORT_SIZE]) -> Result<(), BridgeError> {
        // Report id 0 precedes the payload.
        let mut out = [0u8; REPORT_SIZE + 1];
        out[1..].copy_from_slice(report);
        self.device.write(&out).map_err(hid_error)?;
        Ok(())
    }
}
