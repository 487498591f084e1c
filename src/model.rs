//! Host model detection.
//!
//! The SoC is identified once per process, from the device tree if available and from the
//! board revision code in `/proc/cpuinfo` otherwise.

use std::fs;
use std::sync::OnceLock;

use crate::def::*;
use crate::error::AccessError;
use crate::pubdef::PeripheralLayout;


static DETECTED_SOC: OnceLock<Option<Soc>> = OnceLock::new();


/// Broadcom SoC families found on Raspberry Pi boards.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Soc {
    Bcm2835,
    Bcm2836,
    Bcm2837,
    Bcm2711,
    /// Pi 5; its GPIOs sit behind the RP1 and are out of reach of the legacy DMA engine.
    Bcm2712,
}

impl Soc {
    /// Peripheral layout of the SoC, if supported.
    pub fn layout(&self) -> Option<PeripheralLayout> {
        match *self {
            Soc::Bcm2835 => Some(PeripheralLayout::PreGen4 { phys_base: BCM2835_PERI_BASE }),
            Soc::Bcm2836 | Soc::Bcm2837 => {
                Some(PeripheralLayout::PreGen4 { phys_base: BCM2836_PERI_BASE })
            }
            Soc::Bcm2711 => Some(PeripheralLayout::Gen4),
            Soc::Bcm2712 => None,
        }
    }
}


/// Identifies the SoC from the NUL-separated `compatible` property of the device tree root.
pub fn soc_from_compatible(compatible: &str) -> Option<Soc> {
    compatible
        .split('\0')
        .filter_map(|entry| match entry.trim() {
            "brcm,bcm2712" => Some(Soc::Bcm2712),
            "brcm,bcm2711" | "brcm,bcm2838" => Some(Soc::Bcm2711),
            "brcm,bcm2837" | "brcm,bcm2710" => Some(Soc::Bcm2837),
            "brcm,bcm2836" | "brcm,bcm2709" => Some(Soc::Bcm2836),
            "brcm,bcm2835" | "brcm,bcm2708" => Some(Soc::Bcm2835),
            _ => None,
        })
        .next()
}

/// Extracts the board revision code from the content of `/proc/cpuinfo`.
pub fn parse_revision(cpuinfo: &str) -> Option<u32> {
    cpuinfo
        .lines()
        .filter(|line| line.starts_with("Revision"))
        .filter_map(|line| line.splitn(2, ':').nth(1))
        .filter_map(|value| u32::from_str_radix(value.trim(), 16).ok())
        .next()
}

/// Identifies the SoC from a board revision code.
///
/// New-style codes (bit 23 set) carry the processor in bits 12-15; old-style codes were
/// only ever used on BCM2835 boards.
pub fn soc_from_revision(revision: u32) -> Option<Soc> {
    if revision & (1 << 23) == 0 {
        return Some(Soc::Bcm2835);
    }
    match (revision >> 12) & 0xf {
        0 => Some(Soc::Bcm2835),
        1 => Some(Soc::Bcm2836),
        2 => Some(Soc::Bcm2837),
        3 => Some(Soc::Bcm2711),
        4 => Some(Soc::Bcm2712),
        _ => None,
    }
}

fn probe_soc() -> Option<Soc> {
    let soc = fs::read(DT_COMPATIBLE_PATH)
        .ok()
        .and_then(|raw| soc_from_compatible(&String::from_utf8_lossy(&raw)))
        .or_else(|| {
            fs::read_to_string(CPUINFO_PATH)
                .ok()
                .and_then(|info| parse_revision(&info))
                .and_then(soc_from_revision)
        });
    debug!("detected SoC: {:?}", soc);
    soc
}

/// The SoC of this host, probed on first use.
pub fn host_soc() -> Option<Soc> {
    *DETECTED_SOC.get_or_init(probe_soc)
}

/// Returns true when running on a BCM2711 (Pi 4 generation) host.
///
/// Never fails: an unidentified host is reported as not being a Pi 4.
pub fn is_model_pi4() -> bool {
    host_soc() == Some(Soc::Bcm2711)
}

/// Peripheral layout of this host.
pub fn detect_layout() -> Result<PeripheralLayout, AccessError> {
    host_soc()
        .and_then(|soc| soc.layout())
        .ok_or(AccessError::UnsupportedPlatform)
}
