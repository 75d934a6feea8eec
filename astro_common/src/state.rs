//! Peer status bitmask.
//!
//! A peer reports its coarse system status as one 32-bit word. The low
//! twelve bits hold a device-specific status value, the upper bits are
//! generic flags (errors, weather, block operations).

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

// ─── Masks ──────────────────────────────────────────────────────────

/// Device-specific status bits.
pub const DEVICE_STATUS_MASK: u32 = 0x0000_0fff;
/// Device-specific status value meaning "idle".
pub const DEVICE_IDLE: u32 = 0;
/// Command is held until the BOP bits it names are *set* instead of cleared.
pub const BOP_WHILE_STATE: u32 = 0x0000_1000;
/// Generic device error bits.
pub const DEVICE_ERROR_MASK: u32 = 0x000f_0000;
/// Weather reason bits.
pub const WR_MASK: u32 = 0x00f0_0000;
/// Block-operation bits.
pub const BOP_MASK: u32 = 0x3f00_0000;
/// Bad weather bit.
pub const WEATHER_MASK: u32 = 0x8000_0000;

bitflags! {
    /// Named generic status bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StateFlags: u32 {
        const ERROR_KILL      = 0x0001_0000;
        const ERROR_HW        = 0x0002_0000;
        const NOT_READY       = 0x0004_0000;
        const WR_RAIN         = 0x0010_0000;
        const WR_WIND         = 0x0020_0000;
        const WR_HUMIDITY     = 0x0040_0000;
        const WR_CLOUD        = 0x0080_0000;
        const BOP_EXPOSURE    = 0x0100_0000;
        const BOP_READOUT     = 0x0200_0000;
        const BOP_TEL_MOVE    = 0x0400_0000;
        const BOP_WILL_EXPOSE = 0x0800_0000;
        const BOP_TRIG_EXPOSE = 0x1000_0000;
        const STOP_EVERYTHING = 0x4000_0000;
        const BAD_WEATHER     = 0x8000_0000;
    }
}

/// Coarse status of a peer, remembering the previous value so callers can
/// detect which sub-mask changed with the last update.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerState {
    value: u32,
    #[serde(skip)]
    old_value: u32,
}

impl ServerState {
    pub fn new(value: u32) -> Self {
        Self {
            value,
            old_value: value,
        }
    }

    pub fn value(&self) -> u32 {
        self.value
    }

    pub fn old_value(&self) -> u32 {
        self.old_value
    }

    pub fn set_value(&mut self, value: u32) {
        self.old_value = self.value;
        self.value = value;
    }

    /// True if bits under `mask` differ between the last two values.
    pub fn mask_value_changed(&self, mask: u32) -> bool {
        (self.value & mask) != (self.old_value & mask)
    }

    pub fn intersects(&self, mask: u32) -> bool {
        self.value & mask != 0
    }

    pub fn device_status(&self) -> u32 {
        self.value & DEVICE_STATUS_MASK
    }

    pub fn error_bits(&self) -> u32 {
        self.value & DEVICE_ERROR_MASK
    }

    pub fn weather_bits(&self) -> u32 {
        self.value & (WR_MASK | WEATHER_MASK)
    }

    pub fn bop_bits(&self) -> u32 {
        self.value & BOP_MASK
    }

    pub fn flags(&self) -> StateFlags {
        StateFlags::from_bits_truncate(self.value)
    }

    pub fn is_idle(&self) -> bool {
        self.device_status() == DEVICE_IDLE
    }

    /// Human readable description of the generic bits.
    pub fn describe(&self) -> String {
        let flags = self.flags();
        let mut parts: Vec<&str> = Vec::new();
        if flags.contains(StateFlags::ERROR_KILL) {
            parts.push("killed");
        }
        if flags.contains(StateFlags::ERROR_HW) {
            parts.push("hardware error");
        }
        if flags.contains(StateFlags::NOT_READY) {
            parts.push("not ready");
        }
        if flags.contains(StateFlags::BAD_WEATHER) {
            parts.push("bad weather");
        }
        for (flag, name) in [
            (StateFlags::WR_RAIN, "rain"),
            (StateFlags::WR_WIND, "wind"),
            (StateFlags::WR_HUMIDITY, "humidity"),
            (StateFlags::WR_CLOUD, "cloud"),
        ] {
            if flags.contains(flag) {
                parts.push(name);
            }
        }
        if flags.contains(StateFlags::STOP_EVERYTHING) {
            parts.push("stop");
        }
        for (flag, name) in [
            (StateFlags::BOP_EXPOSURE, "block exposure"),
            (StateFlags::BOP_READOUT, "block readout"),
            (StateFlags::BOP_TEL_MOVE, "block telescope move"),
            (StateFlags::BOP_WILL_EXPOSE, "will expose"),
            (StateFlags::BOP_TRIG_EXPOSE, "trigger exposure"),
        ] {
            if flags.contains(flag) {
                parts.push(name);
            }
        }
        if parts.is_empty() {
            if self.is_idle() {
                return "idle".to_string();
            }
            return format!("status {:#x}", self.device_status());
        }
        parts.join(" | ")
    }
}

impl From<u32> for ServerState {
    fn from(value: u32) -> Self {
        Self::new(value)
    }
}
