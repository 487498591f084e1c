//! Peripherals held in process memory.
//!
//! The register file records every write and the DMA memory lives on the heap, so that the
//! whole engine can run and be inspected without the target hardware. Nothing executes the
//! control blocks: a DMA channel stays wherever its `CONBLK_AD` register was last set. Delays
//! return at once and are only added up.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::def::*;
use crate::periph::{DmaMemory, Peripherals};
use crate::pubdef::{Block, PeripheralLayout, Register};
use crate::util::VolatileCell;
use crate::Result;



// Start of the synthetic bus addresses, in the uncached alias like real allocations.
const SIM_BUS_BASE: u32 = 0xc100_0000;


/// An in-memory register file.
pub struct SimPeripherals {
    layout: PeripheralLayout,
    registers: Mutex<BTreeMap<Register, u32>>,
    writes: Mutex<Vec<(Register, u32)>>,
    next_bus_address: Mutex<u32>,
    live: Arc<AtomicUsize>,
    delayed: AtomicU64,
}

impl SimPeripherals {
    pub fn new(layout: PeripheralLayout) -> SimPeripherals {
        SimPeripherals {
            layout: layout,
            registers: Mutex::new(BTreeMap::new()),
            writes: Mutex::new(Vec::new()),
            next_bus_address: Mutex::new(SIM_BUS_BASE),
            live: Arc::new(AtomicUsize::new(0)),
            delayed: AtomicU64::new(0),
        }
    }

    /// Current value of a register; never-written registers read as 0.
    pub fn register(&self, reg: Register) -> u32 {
        lock(&self.registers).get(&reg).cloned().unwrap_or(0)
    }

    /// Changes a register as the hardware would, without recording a write.
    pub fn set_register(&self, reg: Register, value: u32) {
        lock(&self.registers).insert(reg, value);
    }

    /// All writes since creation or the last call to `clear_writes`, oldest first.
    pub fn writes(&self) -> Vec<(Register, u32)> {
        lock(&self.writes).clone()
    }

    /// Values written to one register, oldest first.
    pub fn writes_to(&self, reg: Register) -> Vec<u32> {
        lock(&self.writes)
            .iter()
            .filter(|&&(r, _)| r == reg)
            .map(|&(_, value)| value)
            .collect()
    }

    pub fn clear_writes(&self) {
        lock(&self.writes).clear();
    }

    /// Number of DMA memory regions not yet dropped.
    pub fn live_allocations(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Total of the delays requested since creation, in microseconds.
    pub fn delayed_us(&self) -> u64 {
        self.delayed.load(Ordering::SeqCst)
    }
}

impl Peripherals for SimPeripherals {
    type Memory = SimMemory;

    fn layout(&self) -> PeripheralLayout {
        self.layout
    }

    fn read(&self, reg: Register) -> u32 {
        self.register(reg)
    }

    fn write(&self, reg: Register, value: u32) {
        // A reset stops the channel at once.
        let stored = if reg.block == Block::Dma
            && reg.offset % DMA_CHAN_SIZE == DMA_CS
            && value & DMA_CS_RESET != 0
        {
            0
        } else {
            value
        };
        lock(&self.registers).insert(reg, stored);
        lock(&self.writes).push((reg, value));
    }

    fn alloc(&self, bytes: usize) -> Result<SimMemory> {
        let size = (bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let mut next = lock(&self.next_bus_address);
        let bus_address = *next;
        *next += size as u32 + PAGE_SIZE as u32;
        self.live.fetch_add(1, Ordering::SeqCst);

        Ok(SimMemory {
            bus_address: bus_address,
            words: vec![VolatileCell::new(0); size / 4],
            live: self.live.clone(),
        })
    }

    fn delay_us(&self, us: u64) {
        self.delayed.fetch_add(us, Ordering::SeqCst);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}



/// Heap-backed DMA memory with a synthetic bus address.
pub struct SimMemory {
    bus_address: u32,
    words: Vec<VolatileCell<u32>>,
    live: Arc<AtomicUsize>,
}

impl DmaMemory for SimMemory {
    fn bus_address(&self) -> u32 {
        self.bus_address
    }

    fn words(&self) -> &[VolatileCell<u32>] {
        &self.words
    }

    fn words_mut(&mut self) -> &mut [VolatileCell<u32>] {
        &mut self.words
    }
}

impl Drop for SimMemory {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_file() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let ctl = Register::new(Block::Pwm, PWM_CTL);
        regs.write(ctl, 1);
        regs.modify(ctl, |v| v | 4);
        assert_eq!(regs.read(ctl), 5);
        assert_eq!(regs.writes_to(ctl), vec![1, 5]);

        let cs = Register::dma(3, DMA_CS);
        regs.write(cs, DMA_CS_ACTIVE);
        regs.write(cs, DMA_CS_RESET);
        assert_eq!(regs.read(cs), 0);
        assert_eq!(regs.writes().len(), 4);
        regs.clear_writes();
        assert!(regs.writes().is_empty());

        regs.delay_us(10);
        regs.delay_us(250);
        assert_eq!(regs.delayed_us(), 260);
    }

    #[test]
    fn allocations() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let a = regs.alloc(100).unwrap();
        let b = regs.alloc(PAGE_SIZE + 1).unwrap();
        assert_eq!(a.words().len(), PAGE_SIZE / 4);
        assert_eq!(b.words().len(), PAGE_SIZE / 2);
        assert!(a.contains(a.bus_address() + 4));
        assert!(!a.contains(b.bus_address()));
        assert_eq!(regs.live_allocations(), 2);
        drop(a);
        assert_eq!(regs.live_allocations(), 1);
    }
}
