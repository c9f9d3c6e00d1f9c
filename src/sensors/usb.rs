// Copyright (c) 2026 bad-antics
// Licensed under the MIT License. See LICENSE file in the project root.
// https://github.com/bad-antics/noisebuster-rs

//! USB sound level meters read through a vendor control transfer

use std::path::Path;
#[cfg(feature = "usb")]
use std::time::Duration;
use tracing::warn;
#[cfg(feature = "usb")]
use tracing::info;

use async_trait::async_trait;

use super::{MeterKind, MeterStatus, SoundMeter};
use crate::error::DeviceError;

/// Known meter entry from the `usb_ids` file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbId {
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: String,
}

/// Parse `vendor,product # model` lines; blank and comment-only lines are skipped
pub fn parse_usb_ids(content: &str) -> Vec<UsbId> {
    let mut ids = Vec::new();

    for line in content.lines() {
        let (body, comment) = match line.split_once('#') {
            Some((body, comment)) => (body.trim(), Some(comment.trim())),
            None => (line.trim(), None),
        };
        if body.is_empty() {
            continue;
        }

        let mut parts = body.split(',').map(str::trim);
        match (parts.next().and_then(parse_hex), parts.next().and_then(parse_hex)) {
            (Some(vendor_id), Some(product_id)) => ids.push(UsbId {
                vendor_id,
                product_id,
                model: comment
                    .filter(|c| !c.is_empty())
                    .unwrap_or("Unknown model")
                    .to_string(),
            }),
            _ => warn!("Incorrect format in USB IDs file: {}", line.trim()),
        }
    }

    ids
}

/// Load the known-meter list, empty if the file is missing
pub fn load_usb_ids(path: &Path) -> Vec<UsbId> {
    match std::fs::read_to_string(path) {
        Ok(content) => parse_usb_ids(&content),
        Err(_) => {
            warn!(
                "USB IDs file {:?} not found. Automatic detection may fail for unknown devices.",
                path
            );
            Vec::new()
        }
    }
}

pub fn parse_hex(s: &str) -> Option<u16> {
    let s = s.trim();
    let s = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")).unwrap_or(s);
    u16::from_str_radix(s, 16).ok()
}

/// Decode the two-byte control-transfer response into dB
pub fn decode_level(bytes: &[u8]) -> Result<f64, DeviceError> {
    if bytes.len() < 2 {
        return Err(DeviceError::Transient(format!("short read: {} bytes", bytes.len())));
    }
    let raw = bytes[0] as u32 + ((bytes[1] & 3) as u32) * 256;
    Ok(raw as f64 * 0.1 + 30.0)
}

/// Pick the device to use: explicit ids win, otherwise the first known meter
pub fn select_device<'a>(
    present: &[(u16, u16)],
    explicit: Option<(u16, u16)>,
    known: &'a [UsbId],
) -> Option<(u16, u16, Option<&'a UsbId>)> {
    let lookup = |v: u16, p: u16| known.iter().find(|id| id.vendor_id == v && id.product_id == p);

    if let Some((v, p)) = explicit {
        return present
            .iter()
            .find(|&&(dv, dp)| dv == v && dp == p)
            .map(|&(dv, dp)| (dv, dp, lookup(dv, dp)));
    }

    present
        .iter()
        .find_map(|&(dv, dp)| lookup(dv, dp).map(|id| (dv, dp, Some(id))))
}

/// USB meter (Wensn WS1361 and compatibles)
pub struct UsbSoundMeter {
    name: String,
    status: MeterStatus,
    explicit: Option<(u16, u16)>,
    known: Vec<UsbId>,
    #[cfg(feature = "usb")]
    handle: Option<std::sync::Arc<rusb::DeviceHandle<rusb::GlobalContext>>>,
}

impl UsbSoundMeter {
    pub fn new(explicit: Option<(u16, u16)>, known: Vec<UsbId>) -> Self {
        Self {
            name: "usb-sound-meter".to_string(),
            status: MeterStatus::Disconnected,
            explicit,
            known,
            #[cfg(feature = "usb")]
            handle: None,
        }
    }
}

#[cfg(feature = "usb")]
fn classify(e: rusb::Error) -> DeviceError {
    match e {
        rusb::Error::Access | rusb::Error::NotSupported | rusb::Error::InvalidParam => {
            DeviceError::Fatal(e.to_string())
        }
        _ => DeviceError::Transient(e.to_string()),
    }
}

#[async_trait]
impl SoundMeter for UsbSoundMeter {
    fn name(&self) -> &str { &self.name }
    fn kind(&self) -> MeterKind { MeterKind::Usb }
    fn status(&self) -> MeterStatus { self.status }

    #[cfg(feature = "usb")]
    async fn open(&mut self) -> Result<(), DeviceError> {
        let devices = rusb::devices().map_err(classify)?;
        let mut present = Vec::new();
        for device in devices.iter() {
            if let Ok(desc) = device.device_descriptor() {
                present.push((desc.vendor_id(), desc.product_id()));
            }
        }

        let Some((vid, pid, known)) = select_device(&present, self.explicit, &self.known) else {
            self.status = MeterStatus::Disconnected;
            return Err(DeviceError::Transient(match self.explicit {
                Some(_) => "configured USB device not found".to_string(),
                None => "no known sound meter attached".to_string(),
            }));
        };

        let handle = rusb::open_device_with_vid_pid(vid, pid)
            .ok_or_else(|| DeviceError::Transient(format!("could not open {:04x}:{:04x}", vid, pid)))?;

        self.name = known
            .map(|id| id.model.clone())
            .unwrap_or_else(|| format!("usb {:04x}:{:04x}", vid, pid));
        info!("Sound meter connected: {} (vendor {:#06x}, product {:#06x})", self.name, vid, pid);
        if known.is_none() {
            info!("User defined USB sound device detected; consider adding it to the usb_ids list");
        }

        self.handle = Some(std::sync::Arc::new(handle));
        self.status = MeterStatus::Connected;
        Ok(())
    }

    #[cfg(not(feature = "usb"))]
    async fn open(&mut self) -> Result<(), DeviceError> {
        self.status = MeterStatus::Error;
        Err(DeviceError::Fatal("built without the `usb` feature".to_string()))
    }

    #[cfg(feature = "usb")]
    async fn read(&mut self) -> Result<f64, DeviceError> {
        let handle = self
            .handle
            .clone()
            .ok_or_else(|| DeviceError::Transient("device not open".to_string()))?;

        let bytes = tokio::task::spawn_blocking(move || {
            let mut buf = [0u8; 2];
            handle
                .read_control(0xC0, 4, 0, 0, &mut buf, Duration::from_millis(200))
                .map(|n| buf[..n].to_vec())
        })
        .await
        .map_err(|e| DeviceError::Transient(e.to_string()))?
        .map_err(|e| {
            self.status = MeterStatus::Error;
            classify(e)
        })?;

        decode_level(&bytes)
    }

    #[cfg(not(feature = "usb"))]
    async fn read(&mut self) -> Result<f64, DeviceError> {
        Err(DeviceError::Fatal("built without the `usb` feature".to_string()))
    }

    async fn close(&mut self) {
        #[cfg(feature = "usb")]
        {
            self.handle = None;
        }
        self.status = MeterStatus::Disconnected;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_usb_ids() {
        let ids = parse_usb_ids(
            "# vendor,product # model\n\
             16c0,05dc # Wensn WS1361\n\
             \n\
             0x1234, 0xABCD\n\
             garbage\n",
        );
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], UsbId { vendor_id: 0x16c0, product_id: 0x05dc, model: "Wensn WS1361".into() });
        assert_eq!(ids[1].product_id, 0xabcd);
        assert_eq!(ids[1].model, "Unknown model");
    }

    #[test]
    fn test_decode_level() {
        // 0x2c + (0x02 & 3) * 256 = 556 -> 55.6 + 30
        let db = decode_level(&[0x2c, 0x02]).unwrap();
        assert!((db - 85.6).abs() < 1e-9);
        // Upper bits of the second byte are ignored
        assert_eq!(decode_level(&[0x2c, 0xFE]).unwrap(), db);
        assert!(matches!(decode_level(&[1]), Err(DeviceError::Transient(_))));
    }

    #[test]
    fn test_select_device_prefers_explicit_ids() {
        let known = parse_usb_ids("16c0,05dc # Wensn");
        let present = [(0x046d, 0xc52b), (0x16c0, 0x05dc), (0xdead, 0xbeef)];

        let (v, p, model) = select_device(&present, None, &known).unwrap();
        assert_eq!((v, p), (0x16c0, 0x05dc));
        assert_eq!(model.unwrap().model, "Wensn");

        let (v, _, model) = select_device(&present, Some((0xdead, 0xbeef)), &known).unwrap();
        assert_eq!(v, 0xdead);
        assert!(model.is_none());

        assert!(select_device(&present, Some((1, 2)), &known).is_none());
        assert!(select_device(&[(1, 2)], None, &known).is_none());
    }
}
