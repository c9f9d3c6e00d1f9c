//! Sensor module - sound level meter transports and the sampler

mod traits;
mod usb;
mod serial;
mod simulator;
mod sampler;

pub use traits::{MeterKind, MeterStatus, Sample, SoundMeter};
pub use usb::{decode_level, load_usb_ids, parse_usb_ids, UsbId, UsbSoundMeter};
pub use serial::SerialBridgeMeter;
pub use simulator::SimulatedMeter;
pub use sampler::{Sampler, SamplerItem};

#[cfg(test)]
pub(crate) use simulator::ScriptedMeter;
