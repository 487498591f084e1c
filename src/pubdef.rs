
use std::ops::RangeInclusive;

use crate::def::*;
use crate::error::Error;


/// Longest supported ring, in slots.
pub const MAX_SLOT_COUNT: u32 = 10_000;

/// Shortest supported step; the DMA engine cannot keep up below this.
pub const MIN_STEP_TIME_US: u32 = 2;

/// Highest GPIO that may carry a pulse (BCM numbering, 40-pin header).
pub const MAX_GPIO: u8 = 27;

/// Default cycle time, suitable for hobby servos.
pub const DEFAULT_CYCLE_TIME_US: u32 = 20_000;

/// Default step time.
pub const DEFAULT_STEP_TIME_US: u32 = 10;


/// Peripheral used to pace the DMA engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PacingSource {
    Pwm,
    Pcm,
}

impl PacingSource {
    /// DREQ line raised by the peripheral when its FIFO wants data.
    pub fn dreq(&self) -> u32 {
        match *self {
            PacingSource::Pwm => DREQ_PWM,
            PacingSource::Pcm => DREQ_PCM_TX,
        }
    }

    /// FIFO register the pacing descriptors write into.
    pub fn fifo(&self) -> Register {
        match *self {
            PacingSource::Pwm => Register::new(Block::Pwm, PWM_FIFO),
            PacingSource::Pcm => Register::new(Block::Pcm, PCM_FIFO_A),
        }
    }

    /// Largest number of clock ticks one step may last.
    pub(crate) fn max_ticks(&self) -> u64 {
        match *self {
            PacingSource::Pwm => u32::max_value() as u64,
            // The PCM frame length field is 10 bits wide.
            PacingSource::Pcm => 1024,
        }
    }
}

impl Default for PacingSource {
    fn default() -> Self {
        PacingSource::Pwm
    }
}


/// Peripheral address layout of the host SoC.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PeripheralLayout {
    /// BCM2835, BCM2836 and BCM2837 (Pi 1, 2, 3 and Zero).
    PreGen4 { phys_base: u32 },
    /// BCM2711 (Pi 4, Pi 400, CM4).
    Gen4,
}

impl PeripheralLayout {
    /// Physical address at which the peripherals are mapped for the ARM core.
    pub fn phys_base(&self) -> u32 {
        match *self {
            PeripheralLayout::PreGen4 { phys_base } => phys_base,
            PeripheralLayout::Gen4 => BCM2711_PERI_BASE,
        }
    }

    /// Frequency of the PLLD clock source in MHz.
    pub fn plld_mhz(&self) -> u32 {
        match *self {
            PeripheralLayout::PreGen4 { .. } => BCM2835_PLLD_MHZ,
            PeripheralLayout::Gen4 => BCM2711_PLLD_MHZ,
        }
    }

    /// DMA channels whose control-block format this crate writes.
    ///
    /// Channel 15 lives at a separate base and is never used. On the BCM2711, channels 11
    /// to 14 are DMA4 engines with a different control-block layout.
    pub fn dma_channels(&self) -> RangeInclusive<u8> {
        match *self {
            PeripheralLayout::PreGen4 { .. } => 0..=14,
            PeripheralLayout::Gen4 => 0..=10,
        }
    }

    pub fn is_dma_channel_usable(&self, channel: u8) -> bool {
        self.dma_channels().contains(&channel)
    }

    /// VideoCore allocation flags for uncached DMA memory.
    pub fn mem_flags(&self) -> u32 {
        match *self {
            PeripheralLayout::PreGen4 { .. } => MEM_FLAG_L1_NONALLOCATING,
            PeripheralLayout::Gen4 => MEM_FLAG_DIRECT,
        }
    }

    /// Address of a register as seen by the DMA engine.
    pub fn bus_address(&self, reg: Register) -> u32 {
        PERI_BUS_BASE + reg.block.offset() + reg.offset as u32
    }

    /// Physical address of a register window as seen by the ARM core.
    pub fn phys_address(&self, block: Block) -> u32 {
        self.phys_base() + block.offset()
    }
}


/// A peripheral register window.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Block {
    Gpio,
    Dma,
    Pwm,
    Pcm,
    Clock,
}

impl Block {
    /// Offset of the window relative to the peripheral base.
    pub fn offset(&self) -> u32 {
        match *self {
            Block::Gpio => GPIO_OFFSET,
            Block::Dma => DMA_OFFSET,
            Block::Pwm => PWM_OFFSET,
            Block::Pcm => PCM_OFFSET,
            Block::Clock => CLK_OFFSET,
        }
    }

    /// Size of the window in bytes.
    pub fn len(&self) -> usize {
        match *self {
            Block::Gpio => GPIO_LEN,
            Block::Dma => DMA_LEN,
            Block::Pwm => PWM_LEN,
            Block::Pcm => PCM_LEN,
            Block::Clock => CLK_LEN,
        }
    }
}


/// A 32-bit register: a window and a byte offset within it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Register {
    pub block: Block,
    pub offset: usize,
}

impl Register {
    pub fn new(block: Block, offset: usize) -> Register {
        Register {
            block: block,
            offset: offset,
        }
    }

    /// A register of the given DMA channel.
    pub fn dma(channel: u8, offset: usize) -> Register {
        Register::new(Block::Dma, channel as usize * DMA_CHAN_SIZE + offset)
    }
}


/// Timing and polarity of a DMA channel.
///
/// ```
/// use rpio_pwm::{ChannelConfig, PacingSource};
///
/// let config = ChannelConfig::new(3000, 10).pacing(PacingSource::Pcm).invert(true);
/// assert_eq!(config.slot_count(), 300);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    pub cycle_time_us: u32,
    pub step_time_us: u32,
    pub pacing: PacingSource,
    pub invert: bool,
}

impl ChannelConfig {
    pub fn new(cycle_time_us: u32, step_time_us: u32) -> ChannelConfig {
        ChannelConfig {
            cycle_time_us: cycle_time_us,
            step_time_us: step_time_us,
            pacing: PacingSource::Pwm,
            invert: false,
        }
    }

    pub fn pacing(mut self, pacing: PacingSource) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn invert(mut self, invert: bool) -> Self {
        self.invert = invert;
        self
    }

    /// Number of slots in one cycle.
    ///
    /// Only meaningful once the configuration has been validated.
    pub fn slot_count(&self) -> u32 {
        if self.step_time_us == 0 {
            0
        } else {
            self.cycle_time_us / self.step_time_us
        }
    }

    /// Checks the timing invariants.
    pub fn validate(&self) -> Result<(), Error> {
        let err = Error::InvalidTiming {
            cycle_time_us: self.cycle_time_us,
            step_time_us: self.step_time_us,
        };
        if self.step_time_us < MIN_STEP_TIME_US || self.cycle_time_us % self.step_time_us != 0 {
            return Err(err);
        }
        let slots = self.slot_count();
        if slots < 2 || slots > MAX_SLOT_COUNT {
            return Err(err);
        }
        Ok(())
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig::new(DEFAULT_CYCLE_TIME_US, DEFAULT_STEP_TIME_US)
    }
}


/// Checks that a GPIO may carry a pulse.
pub fn is_valid_gpio(pin: u8) -> bool {
    pin <= MAX_GPIO
}
