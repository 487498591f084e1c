//! DMA-driven software PWM on the GPIO pins of the Raspberry Pi, with roughly the same
//! functionality as the C engine of [RPIO](https://github.com/metachris/RPIO) but with a
//! safer, rustic API.
//!
//! Each DMA channel repeatedly executes a ring of control blocks which writes the GPIO set and
//! clear registers at the right slot of a cycle, paced by the PWM or PCM peripheral. Once a
//! waveform is installed the CPU is not involved any more.
//!
//!
//! # Design rationale
//!
//! All channel state lives in an `Engine`, which owns the register file. Only one
//! `MappedPeripherals` instance may exist at a time, and the borrowing rules then _statically_
//! ensure, inter alia:
//!
//! * that pulse tables are never modified concurrently,
//!
//! * that DMA memory is not freed while a DMA channel may still execute it, since a channel is
//! stopped before its memory is dropped.
//!
//! The register file is a trait, `Peripherals`. Besides the memory-mapped implementation, an
//! in-memory one (`sim::SimPeripherals`) records register writes and keeps DMA memory on the
//! heap, so that the compiled control blocks can be inspected off the target.
//!
//! A new ring is never written into the memory the DMA engine is executing: it is built in a
//! second region and chained after the running ring by patching a single word. The new waveform
//! thus starts at the next cycle boundary.
//!
//!
//! # Servo example
//!
//! ```no_run
//! use rpio_pwm::{Engine, PacingSource};
//!
//! // Map the peripherals (requires root privileges).
//! let mut engine = Engine::open().unwrap();
//!
//! // A 20 ms cycle with a 10 us resolution, paced by the PWM peripheral.
//! engine.init_channel(5, 20_000, 10, PacingSource::Pwm, false).unwrap();
//!
//! // Center a servo on GPIO 17, then move it.
//! engine.add_gpio(5, 17, 1500).unwrap();
//! engine.set_width(17, 1000).unwrap();
//!
//! // Stop the pulses; dropping the engine would do it as well.
//! engine.shutdown_channel(5).unwrap();
//! ```

#[macro_use]
extern crate log;

mod channel;
mod def;
mod error;
mod mailbox;
mod model;
mod pacing;
mod periph;
mod pubdef;
mod ring;
pub mod sim;
mod table;
pub mod util;

pub use channel::{Channel, ChannelState, Registry};
pub use error::{AccessError, Error};
pub use mailbox::MailboxMemory;
pub use model::Soc;
pub use pacing::{ClockPlan, Pacing};
pub use periph::{DmaMemory, MappedPeripherals, Peripherals};
pub use pubdef::*;
pub use ring::{Descriptor, Op, Ring, Target};
pub use table::PulseTable;
pub use util::PinMask;

use std::mem;
use std::result;

use log::LevelFilter;



/// Result type for the PWM engine.
pub type Result<T> = result::Result<T, Error>;



/// A snapshot of a channel holding DMA memory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: u8,
    pub config: ChannelConfig,
    pub state: ChannelState,
    /// Registered pins and their rounded widths, in ascending pin order.
    pub widths: Vec<(u8, u32)>,
    /// Length of the installed ring.
    pub descriptors: usize,
}



/// Main interface to the PWM engine.
pub struct Engine<P: Peripherals> {
    registry: Registry<P::Memory>,
    pacing: Pacing,
    regs: P,
}

impl Engine<MappedPeripherals> {
    /// Creates an engine driving the peripherals of this host.
    pub fn open() -> Result<Engine<MappedPeripherals>> {
        Ok(Engine::new(MappedPeripherals::open()?))
    }
}

impl<P: Peripherals> Engine<P> {
    /// Creates an engine with no active channel.
    pub fn new(regs: P) -> Engine<P> {
        debug!("PWM engine created for {:?}", regs.layout());
        Engine {
            registry: Registry::new(),
            pacing: Pacing::new(),
            regs: regs,
        }
    }

    pub fn peripherals(&self) -> &P {
        &self.regs
    }

    pub fn layout(&self) -> PeripheralLayout {
        self.regs.layout()
    }

    pub fn pacing(&self) -> &Pacing {
        &self.pacing
    }

    /// Starts a DMA channel with an empty pulse table.
    pub fn init_channel(
        &mut self,
        channel: u8,
        cycle_time_us: u32,
        step_time_us: u32,
        pacing: PacingSource,
        invert: bool,
    ) -> Result<()> {
        let config = ChannelConfig::new(cycle_time_us, step_time_us)
            .pacing(pacing)
            .invert(invert);
        self.init_channel_with(channel, config)
    }

    /// Starts a DMA channel with an empty pulse table.
    ///
    /// Nothing is left allocated or programmed if this fails.
    pub fn init_channel_with(&mut self, channel: u8, config: ChannelConfig) -> Result<()> {
        config.validate()?;
        if !self.regs.layout().is_dma_channel_usable(channel) {
            return Err(Error::InvalidChannel(channel));
        }
        if self.registry.is_claimed(channel) {
            return Err(Error::ChannelBusy(channel));
        }

        self.pacing.acquire(&self.regs, &config, channel)?;
        match Channel::start(&self.regs, channel, config) {
            Ok(ch) => {
                self.registry.insert(ch);
                debug!(
                    "DMA channel {} active: {} us cycle, {} us step, {:?} pacing{}",
                    channel,
                    config.cycle_time_us,
                    config.step_time_us,
                    config.pacing,
                    if config.invert { ", inverted" } else { "" }
                );
                Ok(())
            }
            Err(e) => {
                self.pacing.release(&self.regs, config.pacing, channel);
                Err(e)
            }
        }
    }

    /// Stops a DMA channel, leaves its pins inactive and frees its memory.
    ///
    /// If the DMA engine does not acknowledge the reset, the channel stays `ShuttingDown`:
    /// its memory is kept and the index cannot be initialized again.
    pub fn shutdown_channel(&mut self, channel: u8) -> Result<()> {
        let mut ch = self
            .registry
            .remove(channel)
            .ok_or(Error::ChannelNotActive(channel))?;
        ch.stop(&self.regs);
        self.pacing.release(&self.regs, ch.config().pacing, channel);
        self.registry.retire(ch);
        Ok(())
    }

    /// Registers a pin on a channel or changes its width.
    ///
    /// A pin registered on another channel is released there first.
    pub fn add_gpio(&mut self, channel: u8, pin: u8, width_us: u32) -> Result<()> {
        match self.registry.get(channel) {
            Some(ch) => ch.table().check(pin, width_us)?,
            None => return Err(Error::ChannelNotActive(channel)),
        };

        if let Some(owner) = self.registry.owner_of(pin) {
            if owner != channel {
                warn!("GPIO {} moves from DMA channel {} to {}", pin, owner, channel);
                if let Some(ch) = self.registry.get_mut(owner) {
                    ch.release_gpio(&self.regs, pin);
                }
            }
        }

        match self.registry.get_mut(channel) {
            Some(ch) => ch.add_gpio(&self.regs, pin, width_us).map(|_| ()),
            None => Err(Error::ChannelNotActive(channel)),
        }
    }

    /// Changes the width of a registered pin, whatever its channel.
    pub fn set_width(&mut self, pin: u8, width_us: u32) -> Result<()> {
        let owner = self
            .registry
            .owner_of(pin)
            .ok_or(Error::PinNotRegistered(pin))?;
        match self.registry.get_mut(owner) {
            Some(ch) => ch.set_width(&self.regs, pin, width_us).map(|_| ()),
            None => Err(Error::PinNotRegistered(pin)),
        }
    }

    /// Unregisters a pin and leaves it at its inactive level.
    ///
    /// Releasing a pin that is not registered does nothing.
    pub fn release_gpio(&mut self, pin: u8) {
        if let Some(owner) = self.registry.owner_of(pin) {
            if let Some(ch) = self.registry.get_mut(owner) {
                ch.release_gpio(&self.regs, pin);
            }
        }
    }

    /// Lifecycle state of a DMA channel index.
    pub fn channel_state(&self, channel: u8) -> ChannelState {
        self.registry.state(channel)
    }

    /// Describes an active channel, or one that failed to stop.
    pub fn channel_info(&self, channel: u8) -> Option<ChannelInfo> {
        self.registry.find(channel).map(|ch| ChannelInfo {
            id: ch.id(),
            config: *ch.config(),
            state: ch.state(),
            widths: ch.table().iter().collect(),
            descriptors: ch.ring().len(),
        })
    }

    /// Installed ring of an active channel.
    pub fn ring(&self, channel: u8) -> Option<&Ring> {
        self.registry.get(channel).map(|ch| ch.ring())
    }

    /// Indices of the active channels, in ascending order.
    pub fn active_channels(&self) -> Vec<u8> {
        self.registry.ids()
    }

    /// Channel on which a pin is registered.
    pub fn owner_of(&self, pin: u8) -> Option<u8> {
        self.registry.owner_of(pin)
    }
}

impl<P: Peripherals> Drop for Engine<P> {
    fn drop(&mut self) {
        // Stop the DMA engines before their memory goes away.
        for id in self.registry.ids() {
            warn!("DMA channel {} still active at teardown", id);
            if let Some(mut ch) = self.registry.remove(id) {
                ch.stop(&self.regs);
                self.pacing.release(&self.regs, ch.config().pacing, id);
                self.registry.retire(ch);
            }
        }
        for mut ch in self.registry.take_stalled() {
            if ch.stop(&self.regs) != ChannelState::Released {
                // The engine may still fetch control blocks from this memory.
                error!("DMA channel {} still running, its ring memory is leaked", ch.id());
                mem::forget(ch);
            }
        }
    }
}



/// Returns true when running on a Raspberry Pi 4 generation host.
///
/// The host is identified once per process; this never fails.
pub fn host_is_model_pi4() -> bool {
    model::is_model_pi4()
}

/// Peripheral layout of this host.
pub fn host_layout() -> Result<PeripheralLayout> {
    Ok(model::detect_layout()?)
}

/// Sets the maximum level of the log records emitted by this crate.
///
/// Levels go from 0 (off) through error, warn, info and debug to 5 (trace).
pub fn set_log_level(level: i32) -> Result<()> {
    let filter = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Warn,
        3 => LevelFilter::Info,
        4 => LevelFilter::Debug,
        5 => LevelFilter::Trace,
        _ => return Err(Error::InvalidLevel(level)),
    };
    log::set_max_level(filter);
    Ok(())
}
