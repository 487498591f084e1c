//! Pacing of the DMA engine by the PWM or PCM peripheral.
//!
//! The peripheral is clocked from PLLD and set up so that its FIFO raises one DMA request
//! per step. A pacing source is shared by every channel running at the same step time.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use crate::def::*;
use crate::error::Error;
use crate::periph::Peripherals;
use crate::pubdef::{Block, ChannelConfig, PacingSource, PeripheralLayout, Register};
use crate::Result;



/// Clock divisor and FIFO period that yield one DMA request per step.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ClockPlan {
    pub divisor: u32,
    pub ticks_per_step: u32,
}

/// Finds the smallest integer PLLD divisor, starting from a 10 MHz tick, whose tick count
/// per step is an integer that the pacing peripheral can count.
pub fn plan(layout: PeripheralLayout, config: &ChannelConfig) -> Result<ClockPlan> {
    let plld = layout.plld_mhz() as u64;
    let total = plld * config.step_time_us as u64;
    let max_ticks = config.pacing.max_ticks();

    (plld / 10..=CM_DIVI_MAX as u64)
        .filter(|&d| d >= 2 && total % d == 0)
        .map(|d| (d, total / d))
        .find(|&(_, ticks)| ticks >= 2 && ticks <= max_ticks)
        .map(|(d, ticks)| ClockPlan {
            divisor: d as u32,
            ticks_per_step: ticks as u32,
        })
        .ok_or(Error::InvalidTiming {
            cycle_time_us: config.cycle_time_us,
            step_time_us: config.step_time_us,
        })
}



struct Claim {
    step_time_us: u32,
    users: BTreeSet<u8>,
}


/// Book-keeping of the pacing peripherals shared between channels.
pub struct Pacing {
    claims: Mutex<BTreeMap<PacingSource, Claim>>,
}

impl Pacing {
    pub fn new() -> Pacing {
        Pacing {
            claims: Mutex::new(BTreeMap::new()),
        }
    }

    fn claims(&self) -> MutexGuard<BTreeMap<PacingSource, Claim>> {
        // The map stays consistent even if a holder panicked.
        self.claims.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a channel as a user of the pacing source of its configuration.
    ///
    /// The peripheral is programmed by its first user. Further users must run at the same step
    /// time, except for a channel that is the sole user, which may reprogram it.
    pub fn acquire<P: Peripherals + ?Sized>(
        &self,
        regs: &P,
        config: &ChannelConfig,
        channel: u8,
    ) -> Result<()> {
        let plan = plan(regs.layout(), config)?;
        let source = config.pacing;

        let mut claims = self.claims();
        if let Some(claim) = claims.get_mut(&source) {
            if claim.step_time_us == config.step_time_us {
                claim.users.insert(channel);
                debug!(
                    "DMA channel {} shares {:?} pacing at {} us",
                    channel, source, claim.step_time_us
                );
                return Ok(());
            }
            if let Some(&owner) = claim.users.iter().find(|&&user| user != channel) {
                return Err(Error::PacingInUse {
                    step_time_us: claim.step_time_us,
                    owner: owner,
                });
            }
        }

        program(regs, source, plan);
        debug!(
            "{:?} pacing set to {} us for DMA channel {} (divisor {}, {} ticks)",
            source, config.step_time_us, channel, plan.divisor, plan.ticks_per_step
        );
        let mut users = BTreeSet::new();
        users.insert(channel);
        claims.insert(
            source,
            Claim {
                step_time_us: config.step_time_us,
                users: users,
            },
        );
        Ok(())
    }

    /// Unregisters a channel; the peripheral is stopped when its last user leaves.
    pub fn release<P: Peripherals + ?Sized>(&self, regs: &P, source: PacingSource, channel: u8) {
        let mut claims = self.claims();
        let idle = match claims.get_mut(&source) {
            Some(claim) => claim.users.remove(&channel) && claim.users.is_empty(),
            None => false,
        };
        if idle {
            claims.remove(&source);
            disable(regs, source);
            debug!("{:?} pacing stopped", source);
        }
    }

    /// Channels currently paced by a source.
    pub fn users(&self, source: PacingSource) -> Vec<u8> {
        self.claims()
            .get(&source)
            .map(|claim| claim.users.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Step time a source currently runs at.
    pub fn step_time(&self, source: PacingSource) -> Option<u32> {
        self.claims().get(&source).map(|claim| claim.step_time_us)
    }
}

impl Default for Pacing {
    fn default() -> Self {
        Pacing::new()
    }
}



fn clock_registers(source: PacingSource) -> (Register, Register) {
    match source {
        PacingSource::Pwm => (
            Register::new(Block::Clock, CM_PWM_CTL),
            Register::new(Block::Clock, CM_PWM_DIV),
        ),
        PacingSource::Pcm => (
            Register::new(Block::Clock, CM_PCM_CTL),
            Register::new(Block::Clock, CM_PCM_DIV),
        ),
    }
}

fn start_clock<P: Peripherals + ?Sized>(regs: &P, source: PacingSource, divisor: u32) {
    let (ctl, div) = clock_registers(source);
    regs.write(ctl, CM_PASSWORD | CM_SRC_PLLD);
    regs.delay_us(100);
    regs.write(div, CM_PASSWORD | (divisor << CM_DIVI_SHIFT));
    regs.delay_us(100);
    regs.write(ctl, CM_PASSWORD | CM_SRC_PLLD | CM_ENAB);
    regs.delay_us(100);
}

fn program<P: Peripherals + ?Sized>(regs: &P, source: PacingSource, plan: ClockPlan) {
    match source {
        PacingSource::Pwm => {
            let reg = |offset| Register::new(Block::Pwm, offset);
            regs.write(reg(PWM_CTL), 0);
            regs.delay_us(10);
            start_clock(regs, source, plan.divisor);
            regs.write(reg(PWM_RNG1), plan.ticks_per_step);
            regs.delay_us(10);
            regs.write(reg(PWM_DMAC), PWM_DMAC_ENAB | PWM_DMAC_THRESHOLDS);
            regs.delay_us(10);
            regs.write(reg(PWM_CTL), PWM_CTL_CLRF);
            regs.delay_us(10);
            regs.write(reg(PWM_CTL), PWM_CTL_USEF1 | PWM_CTL_PWEN1);
            regs.delay_us(10);
        }
        PacingSource::Pcm => {
            let reg = |offset| Register::new(Block::Pcm, offset);
            regs.write(reg(PCM_CS_A), PCM_CS_EN);
            regs.delay_us(100);
            start_clock(regs, source, plan.divisor);
            regs.write(reg(PCM_TXC_A), PCM_TXC_CH1_ENABLE_8BIT);
            regs.delay_us(100);
            regs.write(
                reg(PCM_MODE_A),
                (plan.ticks_per_step - 1) << PCM_MODE_FLEN_SHIFT,
            );
            regs.delay_us(100);
            regs.modify(reg(PCM_CS_A), |cs| cs | PCM_CS_TXCLR | PCM_CS_RXCLR);
            regs.delay_us(100);
            regs.write(reg(PCM_DREQ_A), PCM_DREQ_THRESHOLDS);
            regs.delay_us(100);
            regs.modify(reg(PCM_CS_A), |cs| cs | PCM_CS_DMAEN);
            regs.delay_us(100);
            regs.modify(reg(PCM_CS_A), |cs| cs | PCM_CS_TXON);
        }
    }
}

fn disable<P: Peripherals + ?Sized>(regs: &P, source: PacingSource) {
    match source {
        PacingSource::Pwm => regs.write(Register::new(Block::Pwm, PWM_CTL), 0),
        PacingSource::Pcm => regs.write(Register::new(Block::Pcm, PCM_CS_A), 0),
    }
    let (ctl, _) = clock_registers(source);
    regs.write(ctl, CM_PASSWORD | CM_SRC_PLLD);
}
