//! DMA channels and their registry.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{fence, Ordering};
use std::time::{Duration, Instant};

use crate::def::*;
use crate::periph::{DmaMemory, Peripherals};
use crate::pubdef::{Block, ChannelConfig, Register};
use crate::ring::Ring;
use crate::table::PulseTable;
use crate::Result;



// Bounds the wait for a DMA channel to acknowledge a reset.
const STOP_POLL_COUNT: u32 = 100;
const STOP_POLL_INTERVAL_US: u64 = 10;

// Period at which `CONBLK_AD` is sampled while waiting for a ring swap.
const SWAP_POLL_INTERVAL_US: u64 = 10;


/// Lifecycle of a DMA channel.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Never started, or the last start failed.
    Uninitialized,
    Active,
    /// The DMA engine was reset but did not confirm it stopped; its memory is kept.
    ShuttingDown,
    /// Stopped and its memory freed.
    Released,
}



/// A DMA channel running a control-block ring.
///
/// The channel owns two DMA memory regions. The ring being executed lives in one of them
/// while the other receives the next ring, which is then chained after the running one.
pub struct Channel<M: DmaMemory> {
    id: u8,
    config: ChannelConfig,
    state: ChannelState,
    table: PulseTable,
    ring: Ring,
    regions: [M; 2],
    active: usize,
    last_swap: Option<Instant>,
}

impl<M: DmaMemory> Channel<M> {
    /// Allocates the ring memory, installs an empty ring and starts the DMA engine.
    ///
    /// The pacing source is expected to be running already.
    pub(crate) fn start<P>(regs: &P, id: u8, config: ChannelConfig) -> Result<Channel<M>>
    where
        P: Peripherals<Memory = M>,
    {
        let bytes = 4 * Ring::capacity_words(config.slot_count());
        let regions = [regs.alloc(bytes)?, regs.alloc(bytes)?];
        let table = PulseTable::new(config.cycle_time_us, config.step_time_us);
        let ring = Ring::compile(&table, config.invert);

        let mut channel = Channel {
            id: id,
            config: config,
            state: ChannelState::Uninitialized,
            table: table,
            ring: ring,
            regions: regions,
            active: 0,
            last_swap: None,
        };
        channel
            .ring
            .lower(&mut channel.regions[0], regs.layout(), config.pacing);
        fence(Ordering::SeqCst);

        let head = channel.regions[0].bus_address();
        let reg = |offset| Register::dma(id, offset);
        regs.write(reg(DMA_CS), DMA_CS_RESET);
        regs.delay_us(10);
        regs.write(reg(DMA_CS), DMA_CS_INT | DMA_CS_END);
        regs.write(reg(DMA_CONBLK_AD), head);
        regs.write(reg(DMA_DEBUG), DMA_DEBUG_CLEAR_ERRORS);
        regs.write(
            reg(DMA_CS),
            DMA_CS_WAIT_FOR_OUTSTANDING_WRITES
                | DMA_CS_PANIC_PRIORITY_8
                | DMA_CS_PRIORITY_8
                | DMA_CS_ACTIVE,
        );
        channel.state = ChannelState::Active;
        trace!(
            "DMA channel {} started at {:#010x} ({} slots)",
            id,
            head,
            channel.ring.slot_count()
        );

        Ok(channel)
    }

    pub fn id(&self) -> u8 {
        self.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn table(&self) -> &PulseTable {
        &self.table
    }

    /// The ring installed last.
    pub fn ring(&self) -> &Ring {
        &self.ring
    }

    /// Bus address of the head of the ring installed last.
    pub fn ring_address(&self) -> u32 {
        self.regions[self.active].bus_address()
    }

    /// Registers or updates a pin and installs the resulting ring.
    pub(crate) fn add_gpio<P>(&mut self, regs: &P, pin: u8, width_us: u32) -> Result<u32>
    where
        P: Peripherals<Memory = M>,
    {
        let width = self.table.check(pin, width_us)?;
        if !self.table.contains(pin) {
            self.claim_pin(regs, pin);
        }
        self.table.add_or_update(pin, width)?;
        self.update(regs);
        Ok(width)
    }

    /// Changes the width of a registered pin and installs the resulting ring.
    pub(crate) fn set_width<P>(&mut self, regs: &P, pin: u8, width_us: u32) -> Result<u32>
    where
        P: Peripherals<Memory = M>,
    {
        let width = self.table.set_width(pin, width_us)?;
        self.update(regs);
        Ok(width)
    }

    /// Unregisters a pin and leaves it at its inactive level once the new ring runs.
    ///
    /// Returns false if the pin was not registered.
    pub(crate) fn release_gpio<P>(&mut self, regs: &P, pin: u8) -> bool
    where
        P: Peripherals<Memory = M>,
    {
        if self.table.remove(pin).is_none() {
            return false;
        }
        self.update(regs);
        self.settle(regs);
        self.drive_inactive(regs, pin);
        true
    }

    /// Recompiles the pulse table and chains the new ring after the running one.
    fn update<P>(&mut self, regs: &P)
    where
        P: Peripherals<Memory = M>,
    {
        if !self.table.take_dirty() {
            return;
        }
        let ring = Ring::compile(&self.table, self.config.invert);
        if ring == self.ring {
            return;
        }
        let changed = ring.diff(&self.ring).len();

        // The standby region may only be rewritten once the engine has left it.
        self.settle(regs);
        let standby = 1 - self.active;
        ring.lower(&mut self.regions[standby], regs.layout(), self.config.pacing);
        fence(Ordering::SeqCst);

        let head = self.regions[standby].bus_address();
        let tail = self.ring.tail_next_word();
        self.regions[self.active].words_mut()[tail].set(head);
        fence(Ordering::SeqCst);

        self.active = standby;
        self.ring = ring;
        self.last_swap = Some(Instant::now());
        debug!(
            "DMA channel {}: installed ring of {} descriptors at {:#010x}",
            self.id,
            self.ring.len(),
            head
        );
        trace!(
            "DMA channel {}: {} descriptors changed, {} pins",
            self.id,
            changed,
            self.table.len()
        );
    }

    /// Waits until the engine runs the ring installed last.
    ///
    /// `CONBLK_AD` is polled and the wait ends as soon as it points into the new region.
    /// The engine enters it at the next cycle boundary, so the wait is normally shorter than
    /// one cycle. It is bounded by two cycles and one step after the swap, a bound which
    /// grows with the cycle time.
    pub(crate) fn settle<P>(&self, regs: &P)
    where
        P: Peripherals<Memory = M>,
    {
        let swapped = match self.last_swap {
            Some(instant) => instant,
            None => return,
        };
        let budget = Duration::from_micros(
            2 * self.config.cycle_time_us as u64 + self.config.step_time_us as u64,
        );
        let mut rest = match budget.checked_sub(swapped.elapsed()) {
            Some(rest) => rest.as_micros() as u64,
            None => return,
        };

        let conblk = Register::dma(self.id, DMA_CONBLK_AD);
        while !self.regions[self.active].contains(regs.read(conblk)) {
            if rest == 0 || swapped.elapsed() >= budget {
                trace!("DMA channel {}: swap not observed, wait bound reached", self.id);
                return;
            }
            let pause = rest.min(SWAP_POLL_INTERVAL_US);
            regs.delay_us(pause);
            rest -= pause;
        }
    }

    /// Stops the DMA engine and drives all registered pins to their inactive level.
    ///
    /// The channel ends up `Released`, or stays `ShuttingDown` if the engine did not
    /// acknowledge the reset. Stopping a `ShuttingDown` channel retries the reset.
    pub(crate) fn stop<P>(&mut self, regs: &P) -> ChannelState
    where
        P: Peripherals<Memory = M>,
    {
        self.state = ChannelState::ShuttingDown;
        let cs = Register::dma(self.id, DMA_CS);
        regs.write(cs, DMA_CS_RESET);

        let mut polls = 0;
        let mut stopped = true;
        while regs.read(cs) & DMA_CS_ACTIVE != 0 {
            if polls == STOP_POLL_COUNT {
                error!("DMA channel {} did not stop after reset", self.id);
                stopped = false;
                break;
            }
            regs.delay_us(STOP_POLL_INTERVAL_US);
            polls += 1;
        }

        for (pin, _) in self.table.iter() {
            self.drive_inactive(regs, pin);
        }
        self.table.clear();
        if stopped {
            self.state = ChannelState::Released;
            debug!("DMA channel {} stopped", self.id);
        }
        self.state
    }

    // Drives a pin inactive, then makes it an output.
    fn claim_pin<P>(&self, regs: &P, pin: u8)
    where
        P: Peripherals<Memory = M>,
    {
        self.drive_inactive(regs, pin);
        let fsel = Register::new(Block::Gpio, GPIO_FSEL0 + 4 * (pin as usize / 10));
        let shift = 3 * (pin as u32 % 10);
        regs.modify(fsel, |v| (v & !(GPIO_FSEL_MASK << shift)) | (GPIO_FSEL_OUTPUT << shift));
    }

    fn drive_inactive<P>(&self, regs: &P, pin: u8)
    where
        P: Peripherals<Memory = M>,
    {
        let offset = if self.config.invert { GPIO_SET0 } else { GPIO_CLR0 };
        regs.write(Register::new(Block::Gpio, offset), 1 << pin);
    }
}



/// Channels by DMA channel index.
///
/// Besides the active channels, the registry keeps the channels whose engine did not stop,
/// together with their memory, and remembers which indices were released.
pub struct Registry<M: DmaMemory> {
    channels: BTreeMap<u8, Channel<M>>,
    stalled: BTreeMap<u8, Channel<M>>,
    released: BTreeSet<u8>,
}

impl<M: DmaMemory> Registry<M> {
    pub fn new() -> Registry<M> {
        Registry {
            channels: BTreeMap::new(),
            stalled: BTreeMap::new(),
            released: BTreeSet::new(),
        }
    }

    /// Checks whether a channel is active.
    pub fn contains(&self, id: u8) -> bool {
        self.channels.contains_key(&id)
    }

    /// Checks whether the DMA channel is in use, active or stalled.
    pub fn is_claimed(&self, id: u8) -> bool {
        self.channels.contains_key(&id) || self.stalled.contains_key(&id)
    }

    pub fn state(&self, id: u8) -> ChannelState {
        if let Some(channel) = self.find(id) {
            channel.state()
        } else if self.released.contains(&id) {
            ChannelState::Released
        } else {
            ChannelState::Uninitialized
        }
    }

    /// An active or stalled channel.
    pub fn find(&self, id: u8) -> Option<&Channel<M>> {
        self.channels.get(&id).or_else(|| self.stalled.get(&id))
    }

    pub fn get(&self, id: u8) -> Option<&Channel<M>> {
        self.channels.get(&id)
    }

    pub fn get_mut(&mut self, id: u8) -> Option<&mut Channel<M>> {
        self.channels.get_mut(&id)
    }

    pub(crate) fn insert(&mut self, channel: Channel<M>) {
        self.released.remove(&channel.id());
        self.channels.insert(channel.id(), channel);
    }

    /// Takes an active channel out of the registry.
    pub(crate) fn remove(&mut self, id: u8) -> Option<Channel<M>> {
        self.channels.remove(&id)
    }

    /// Files a stopped channel: its memory is freed once released, kept otherwise.
    pub(crate) fn retire(&mut self, channel: Channel<M>) {
        let id = channel.id();
        match channel.state() {
            ChannelState::Released => {
                self.released.insert(id);
            }
            _ => {
                self.stalled.insert(id, channel);
            }
        }
    }

    pub(crate) fn take_stalled(&mut self) -> Vec<Channel<M>> {
        let stalled = std::mem::replace(&mut self.stalled, BTreeMap::new());
        stalled.into_iter().map(|(_, channel)| channel).collect()
    }

    /// Channel on which a pin is registered.
    pub fn owner_of(&self, pin: u8) -> Option<u8> {
        self.channels
            .values()
            .find(|channel| channel.table().contains(pin))
            .map(|channel| channel.id())
    }

    /// Indices of the active channels, in ascending order.
    pub fn ids(&self) -> Vec<u8> {
        self.channels.keys().cloned().collect()
    }
}

impl<M: DmaMemory> Default for Registry<M> {
    fn default() -> Self {
        Registry::new()
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubdef::{PacingSource, PeripheralLayout};
    use crate::sim::{SimMemory, SimPeripherals};

    fn start(regs: &SimPeripherals, id: u8, config: ChannelConfig) -> Channel<SimMemory> {
        Channel::start(regs, id, config).unwrap()
    }

    #[test]
    fn start_sequence() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let channel = start(&regs, 5, ChannelConfig::new(3000, 10));
        assert_eq!(channel.state(), ChannelState::Active);
        assert_eq!(
            regs.writes_to(Register::dma(5, DMA_CS)),
            vec![
                DMA_CS_RESET,
                DMA_CS_INT | DMA_CS_END,
                DMA_CS_WAIT_FOR_OUTSTANDING_WRITES
                    | DMA_CS_PANIC_PRIORITY_8
                    | DMA_CS_PRIORITY_8
                    | DMA_CS_ACTIVE,
            ]
        );
        assert_eq!(
            regs.register(Register::dma(5, DMA_CONBLK_AD)),
            channel.ring_address()
        );
        assert_eq!(channel.ring().len(), 300);
        assert_eq!(regs.live_allocations(), 2);
    }

    #[test]
    fn swap_chains_rings() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 0, ChannelConfig::new(1000, 100));
        let first = channel.ring_address();
        let old_tail = channel.ring().tail_next_word();

        channel.add_gpio(&regs, 17, 300).unwrap();
        let second = channel.ring_address();
        assert_ne!(first, second);
        // The running ring now leads into the new one, which loops on itself.
        assert_eq!(channel.regions[0].words()[old_tail].get(), second);
        let tail = channel.ring().tail_next_word();
        assert_eq!(channel.regions[1].words()[tail].get(), second);

        // Back to the first region.
        channel.set_width(&regs, 17, 500).unwrap();
        assert_eq!(channel.ring_address(), first);
        assert_eq!(channel.regions[1].words()[tail].get(), first);
    }

    #[test]
    fn identical_rings_are_not_reinstalled() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 0, ChannelConfig::new(1000, 100));
        channel.add_gpio(&regs, 17, 300).unwrap();
        let address = channel.ring_address();
        channel.add_gpio(&regs, 17, 300).unwrap();
        channel.set_width(&regs, 17, 310).unwrap();
        assert_eq!(channel.ring_address(), address);
    }

    #[test]
    fn pins_become_outputs_at_inactive_level() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let config = ChannelConfig::new(1000, 100).pacing(PacingSource::Pcm).invert(true);
        let mut channel = start(&regs, 1, config);
        regs.set_register(Register::new(Block::Gpio, GPIO_FSEL0), 0o7777);
        channel.add_gpio(&regs, 4, 300).unwrap();

        assert_eq!(regs.register(Register::new(Block::Gpio, GPIO_FSEL0)), 0o17777);
        assert_eq!(regs.writes_to(Register::new(Block::Gpio, GPIO_SET0)), vec![1 << 4]);
    }

    #[test]
    fn stop_sequence() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 2, ChannelConfig::new(1000, 100));
        channel.add_gpio(&regs, 22, 300).unwrap();
        channel.add_gpio(&regs, 23, 300).unwrap();
        regs.clear_writes();

        assert_eq!(channel.stop(&regs), ChannelState::Released);
        assert_eq!(channel.state(), ChannelState::Released);
        assert_eq!(regs.register(Register::dma(2, DMA_CS)) & DMA_CS_ACTIVE, 0);
        assert_eq!(
            regs.writes_to(Register::new(Block::Gpio, GPIO_CLR0)),
            vec![1 << 22, 1 << 23]
        );
        assert!(channel.table().is_empty());
        drop(channel);
        assert_eq!(regs.live_allocations(), 0);
    }

    // Heads of both ring regions of a channel.
    fn heads(channel: &Channel<SimMemory>) -> [u32; 2] {
        [channel.regions[0].bus_address(), channel.regions[1].bus_address()]
    }

    // Moves the DMA engine of one channel to the other ring region whenever the caller waits.
    struct Follower<'a> {
        sim: &'a SimPeripherals,
        channel: u8,
        heads: [u32; 2],
    }

    impl<'a> Peripherals for Follower<'a> {
        type Memory = SimMemory;

        fn layout(&self) -> PeripheralLayout {
            self.sim.layout()
        }

        fn read(&self, reg: Register) -> u32 {
            self.sim.read(reg)
        }

        fn write(&self, reg: Register, value: u32) {
            self.sim.write(reg, value)
        }

        fn alloc(&self, bytes: usize) -> Result<SimMemory> {
            self.sim.alloc(bytes)
        }

        fn delay_us(&self, us: u64) {
            self.sim.delay_us(us);
            let conblk = Register::dma(self.channel, DMA_CONBLK_AD);
            let next = if self.sim.read(conblk) == self.heads[0] {
                self.heads[1]
            } else {
                self.heads[0]
            };
            self.sim.set_register(conblk, next);
        }
    }

    #[test]
    fn swap_needs_no_wait_once_engine_runs_new_ring() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 0, ChannelConfig::new(100_000, 100));
        channel.add_gpio(&regs, 17, 300).unwrap();
        regs.set_register(Register::dma(0, DMA_CONBLK_AD), channel.ring_address() + 32);

        let before = regs.delayed_us();
        channel.set_width(&regs, 17, 600).unwrap();
        assert_eq!(regs.delayed_us(), before);
    }

    #[test]
    fn swap_wait_is_bounded() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 0, ChannelConfig::new(100_000, 100));
        channel.add_gpio(&regs, 17, 300).unwrap();

        // The engine never leaves the first region.
        let before = regs.delayed_us();
        channel.set_width(&regs, 17, 600).unwrap();
        let waited = regs.delayed_us() - before;
        assert!(waited > 100_000, "waited {} us", waited);
        assert!(waited <= 2 * 100_000 + 100, "waited {} us", waited);
        assert_eq!(regs.read(Register::dma(0, DMA_CONBLK_AD)), heads(&channel)[0]);
    }

    #[test]
    fn swap_wait_ends_when_engine_moves() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 0, ChannelConfig::new(10_000_000, 1000));
        channel.add_gpio(&regs, 17, 3000).unwrap();
        let follower = Follower {
            sim: &regs,
            channel: 0,
            heads: heads(&channel),
        };

        let before = regs.delayed_us();
        channel.set_width(&follower, 17, 5000).unwrap();
        assert_eq!(regs.delayed_us() - before, SWAP_POLL_INTERVAL_US);

        // One wait before reusing a region, one before driving the pin.
        let before = regs.delayed_us();
        assert!(channel.release_gpio(&follower, 17));
        assert_eq!(regs.delayed_us() - before, 2 * SWAP_POLL_INTERVAL_US);
    }

    #[test]
    fn unacknowledged_reset_keeps_channel_shutting_down() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut channel = start(&regs, 6, ChannelConfig::new(1000, 100));
        let cs = Register::dma(6, DMA_CS);

        let before = regs.delayed_us();
        assert_eq!(channel.stop(&Stuck(&regs, cs)), ChannelState::ShuttingDown);
        assert_eq!(channel.state(), ChannelState::ShuttingDown);
        assert_eq!(
            regs.delayed_us() - before,
            STOP_POLL_COUNT as u64 * STOP_POLL_INTERVAL_US
        );

        // A later attempt succeeds.
        assert_eq!(channel.stop(&regs), ChannelState::Released);
    }

    // Keeps a status register active after every write.
    struct Stuck<'a, P: Peripherals>(&'a P, Register);

    impl<'a, P: Peripherals> Peripherals for Stuck<'a, P> {
        type Memory = P::Memory;

        fn layout(&self) -> PeripheralLayout {
            self.0.layout()
        }

        fn read(&self, reg: Register) -> u32 {
            self.0.read(reg)
        }

        fn write(&self, reg: Register, value: u32) {
            self.0.write(reg, value);
            if reg == self.1 {
                self.0.write(reg, DMA_CS_ACTIVE);
            }
        }

        fn alloc(&self, bytes: usize) -> Result<P::Memory> {
            self.0.alloc(bytes)
        }

        fn delay_us(&self, us: u64) {
            self.0.delay_us(us)
        }
    }

    #[test]
    fn registry_states() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut registry = Registry::new();
        assert_eq!(registry.state(1), ChannelState::Uninitialized);

        registry.insert(start(&regs, 1, ChannelConfig::new(1000, 100)));
        registry.insert(start(&regs, 2, ChannelConfig::new(1000, 100)));
        assert_eq!(registry.state(1), ChannelState::Active);

        let mut one = registry.remove(1).unwrap();
        one.stop(&regs);
        registry.retire(one);
        assert_eq!(registry.state(1), ChannelState::Released);
        assert!(!registry.is_claimed(1));
        assert_eq!(regs.live_allocations(), 2);

        let mut two = registry.remove(2).unwrap();
        let cs = Register::dma(2, DMA_CS);
        two.stop(&Stuck(&regs, cs));
        registry.retire(two);
        assert_eq!(registry.state(2), ChannelState::ShuttingDown);
        assert!(registry.is_claimed(2) && !registry.contains(2));
        assert_eq!(registry.find(2).map(|ch| ch.id()), Some(2));
        assert_eq!(regs.live_allocations(), 2);

        let stalled = registry.take_stalled();
        assert_eq!(stalled.len(), 1);
        assert_eq!(registry.state(2), ChannelState::Uninitialized);
        drop(stalled);
        assert_eq!(regs.live_allocations(), 0);

        registry.insert(start(&regs, 1, ChannelConfig::new(1000, 100)));
        assert_eq!(registry.state(1), ChannelState::Active);
    }

    #[test]
    fn registry_lookup() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut registry = Registry::new();
        registry.insert(start(&regs, 3, ChannelConfig::new(1000, 100)));
        registry.insert(start(&regs, 0, ChannelConfig::new(1000, 100)));
        registry
            .get_mut(3)
            .unwrap()
            .add_gpio(&regs, 18, 100)
            .unwrap();
        assert_eq!(registry.owner_of(18), Some(3));
        assert_eq!(registry.owner_of(19), None);
        assert_eq!(registry.ids(), vec![0, 3]);
        assert!(registry.remove(3).is_some());
        assert_eq!(registry.owner_of(18), None);
    }
}
