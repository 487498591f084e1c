//! Control-block rings: compilation of a pulse table and lowering into DMA memory.
//!
//! A ring is an arena of descriptors linked by index. Each slot of the cycle holds the GPIO
//! writes that take effect at its start followed by exactly one pacing wait, so that every
//! slot lasts exactly one step whatever the pulse content.

use std::collections::BTreeMap;

use crate::def::*;
use crate::periph::DmaMemory;
use crate::pubdef::{Block, PacingSource, PeripheralLayout, Register, MAX_GPIO};
use crate::table::PulseTable;
use crate::util::PinMask;



// Upper bound on the write descriptors of a ring: one activation write plus at most one
// deactivation write per distinct pin.
const MAX_WRITES: usize = MAX_GPIO as usize + 2;


/// GPIO register targeted by a write descriptor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Target {
    GpioSet,
    GpioClear,
}

impl Target {
    pub fn register(&self) -> Register {
        match *self {
            Target::GpioSet => Register::new(Block::Gpio, GPIO_SET0),
            Target::GpioClear => Register::new(Block::Gpio, GPIO_CLR0),
        }
    }
}


#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Op {
    /// Writes a pin mask to a GPIO set or clear register.
    Write { target: Target, mask: PinMask },
    /// Waits for one pacing request.
    Wait,
}


/// One transfer of the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Descriptor {
    pub slot: u32,
    pub op: Op,
    /// Index of the next descriptor in the arena.
    pub next: usize,
}



/// A compiled control-block ring.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ring {
    descriptors: Vec<Descriptor>,
    slot_count: u32,
    invert: bool,
}

impl Ring {
    /// Compiles a pulse table into a ring.
    ///
    /// Pins go active at the start of slot 0 if their width is non-zero and inactive at slot
    /// `width / step` unless they span the whole cycle. When both happen in the same slot,
    /// the activation write comes first.
    pub fn compile(table: &PulseTable, invert: bool) -> Ring {
        let slot_count = table.slot_count();
        let step = table.step_time_us();

        let mut activate = PinMask::empty();
        let mut deactivate: BTreeMap<u32, PinMask> = BTreeMap::new();
        for (pin, width) in table.iter() {
            if width > 0 {
                activate.insert(pin);
            }
            if width < table.cycle_time_us() {
                deactivate.entry(width / step).or_default().insert(pin);
            }
        }

        let (on, off) = if invert {
            (Target::GpioClear, Target::GpioSet)
        } else {
            (Target::GpioSet, Target::GpioClear)
        };

        let mut descriptors = Vec::with_capacity(slot_count as usize + 1 + deactivate.len());
        let mut push = |slot: u32, op: Op| {
            let next = descriptors.len() + 1;
            descriptors.push(Descriptor { slot: slot, op: op, next: next });
        };
        for slot in 0..slot_count {
            if slot == 0 && !activate.is_empty() {
                push(slot, Op::Write { target: on, mask: activate });
            }
            if let Some(&mask) = deactivate.get(&slot) {
                push(slot, Op::Write { target: off, mask: mask });
            }
            push(slot, Op::Wait);
        }
        if let Some(last) = descriptors.last_mut() {
            last.next = 0;
        }

        Ring {
            descriptors: descriptors,
            slot_count: slot_count,
            invert: invert,
        }
    }

    pub fn descriptors(&self) -> &[Descriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    /// Number of write descriptors.
    pub fn write_count(&self) -> usize {
        self.descriptors
            .iter()
            .filter(|d| d.op != Op::Wait)
            .count()
    }

    /// Pins written by each descriptor; empty for waits.
    pub fn population(&self) -> Vec<PinMask> {
        self.descriptors
            .iter()
            .map(|d| match d.op {
                Op::Write { mask, .. } => mask,
                Op::Wait => PinMask::empty(),
            })
            .collect()
    }

    /// All pins written by the ring.
    pub fn pins(&self) -> PinMask {
        PinMask::from_bits(self.population().iter().fold(0, |acc, m| acc | m.bits()))
    }

    /// Indices of the descriptors that differ from those of another ring.
    pub fn diff(&self, other: &Ring) -> Vec<usize> {
        let len = self.descriptors.len().max(other.descriptors.len());
        (0..len)
            .filter(|&i| self.descriptors.get(i) != other.descriptors.get(i))
            .collect()
    }

    /// Checks that the chain is a single cycle through every descriptor starting at index 0,
    /// and that every slot ends with exactly one wait.
    pub fn is_valid(&self) -> bool {
        let len = self.descriptors.len();
        if len == 0 {
            return false;
        }

        let mut visited = vec![false; len];
        let mut index = 0;
        for _ in 0..len {
            if index >= len || visited[index] {
                return false;
            }
            visited[index] = true;
            index = self.descriptors[index].next;
        }
        if index != 0 {
            return false;
        }

        let mut expected_slot = 0;
        let mut waits = 0;
        for d in &self.descriptors {
            if d.slot != expected_slot {
                return false;
            }
            if d.op == Op::Wait {
                waits += 1;
                expected_slot += 1;
            }
        }
        waits == self.slot_count && self.descriptors[len - 1].op == Op::Wait
    }

    /// Steady-state physical level of the written pins during each slot.
    pub fn output_levels(&self) -> Vec<PinMask> {
        let mut level = 0u32;
        let mut levels = vec![PinMask::empty(); self.slot_count as usize];
        // The first pass only brings the pins to their steady state.
        for pass in 0..2 {
            for d in &self.descriptors {
                match d.op {
                    Op::Write { target: Target::GpioSet, mask } => level |= mask.bits(),
                    Op::Write { target: Target::GpioClear, mask } => level &= !mask.bits(),
                    Op::Wait => {
                        if pass == 1 {
                            levels[d.slot as usize] = PinMask::from_bits(level);
                        }
                    }
                }
            }
        }
        levels
    }

    /// Slots during which a pin is logically active, whatever the polarity.
    pub fn active_slots(&self, pin: u8) -> Vec<u32> {
        if !self.pins().contains(pin) {
            return Vec::new();
        }
        self.output_levels()
            .iter()
            .enumerate()
            .filter(|&(_, level)| level.contains(pin) != self.invert)
            .map(|(slot, _)| slot as u32)
            .collect()
    }

    /// Number of DMA memory words needed to lower any ring of the given slot count.
    pub fn capacity_words(slot_count: u32) -> usize {
        (slot_count as usize + MAX_WRITES) * CB_WORDS + MAX_WRITES + 1
    }

    /// Index of the memory word holding the `NEXTCONBK` field of the last control block.
    pub fn tail_next_word(&self) -> usize {
        (self.descriptors.len() - 1) * CB_WORDS + CB_NEXTCONBK
    }

    /// Writes the ring as BCM283x control blocks at the start of a DMA memory region.
    ///
    /// Control blocks come first, followed by one source word per write descriptor and a
    /// dummy source word for the waits. The ring is closed on itself.
    ///
    /// # Panics
    ///
    /// This will panic if the memory is too small.
    pub fn lower<M: DmaMemory + ?Sized>(
        &self,
        mem: &mut M,
        layout: PeripheralLayout,
        pacing: PacingSource,
    ) {
        let bus = mem.bus_address();
        let count = self.descriptors.len();
        let data_start = count * CB_WORDS;
        let dummy = data_start + self.write_count();
        let words = mem.words_mut();
        assert!(dummy < words.len(), "ring of {} descriptors does not fit", count);

        let base_ti = DMA_TI_NO_WIDE_BURSTS | DMA_TI_WAIT_RESP;
        let wait_ti = base_ti | DMA_TI_DEST_DREQ | (pacing.dreq() << DMA_TI_PERMAP_SHIFT);
        let fifo = layout.bus_address(pacing.fifo());

        let mut data = data_start;
        for (i, d) in self.descriptors.iter().enumerate() {
            let (ti, source, dest) = match d.op {
                Op::Write { target, mask } => {
                    words[data].set(mask.bits());
                    let source = bus + 4 * data as u32;
                    data += 1;
                    (base_ti, source, layout.bus_address(target.register()))
                }
                Op::Wait => (wait_ti, bus + 4 * dummy as u32, fifo),
            };
            let cb = &mut words[i * CB_WORDS..(i + 1) * CB_WORDS];
            cb[CB_TI].set(ti);
            cb[CB_SOURCE_AD].set(source);
            cb[CB_DEST_AD].set(dest);
            cb[CB_TXFR_LEN].set(4);
            cb[CB_STRIDE].set(0);
            cb[CB_NEXTCONBK].set(bus + (d.next * CB_WORDS * 4) as u32);
            cb[6].set(0);
            cb[7].set(0);
        }
        words[dummy].set(0);
    }
}



#[cfg(test)]
mod tests {
    use super::*;
    use crate::periph::Peripherals;
    use crate::sim::SimPeripherals;

    fn table(cycle: u32, step: u32, entries: &[(u8, u32)]) -> PulseTable {
        let mut table = PulseTable::new(cycle, step);
        for &(pin, width) in entries {
            table.add_or_update(pin, width).unwrap();
        }
        table
    }

    fn slots(range: std::ops::Range<u32>) -> Vec<u32> {
        range.collect()
    }

    #[test]
    fn empty_ring_is_all_waits() {
        let ring = Ring::compile(&PulseTable::new(1000, 100), false);
        assert_eq!(ring.len(), 10);
        assert_eq!(ring.write_count(), 0);
        assert!(ring.is_valid());
        assert!(ring.pins().is_empty());
    }

    #[test]
    fn single_pulse() {
        let ring = Ring::compile(&table(3000, 10, &[(17, 50)]), false);
        assert!(ring.is_valid());
        assert_eq!(ring.len(), 302);
        assert_eq!(ring.active_slots(17), slots(0..5));
        assert_eq!(
            ring.descriptors()[0].op,
            Op::Write { target: Target::GpioSet, mask: PinMask::from_bits(1 << 17) }
        );
    }

    #[test]
    fn transitions_are_coalesced() {
        let ring = Ring::compile(&table(1000, 100, &[(4, 300), (5, 300), (6, 700)]), false);
        assert!(ring.is_valid());
        // One activation, one deactivation at slot 3, one at slot 7.
        assert_eq!(ring.write_count(), 3);
        let masks: Vec<_> = ring.population().into_iter().filter(|m| !m.is_empty()).collect();
        assert_eq!(
            masks,
            vec![
                PinMask::from_bits(0b111 << 4),
                PinMask::from_bits(0b11 << 4),
                PinMask::from_bits(1 << 6),
            ]
        );
    }

    #[test]
    fn opposite_transitions_in_one_slot() {
        let ring = Ring::compile(&table(1000, 100, &[(4, 0), (5, 500)]), false);
        assert!(ring.is_valid());
        let first: Vec<_> = ring.descriptors().iter().take(3).map(|d| (d.slot, d.op)).collect();
        assert_eq!(
            first,
            vec![
                (0, Op::Write { target: Target::GpioSet, mask: PinMask::from_bits(1 << 5) }),
                (0, Op::Write { target: Target::GpioClear, mask: PinMask::from_bits(1 << 4) }),
                (0, Op::Wait),
            ]
        );
    }

    #[test]
    fn boundary_widths() {
        let ring = Ring::compile(&table(1000, 100, &[(4, 0), (5, 1000)]), false);
        assert!(ring.active_slots(4).is_empty());
        assert_eq!(ring.active_slots(5), slots(0..10));
        for d in ring.descriptors() {
            match d.op {
                Op::Write { target: Target::GpioSet, mask } => assert!(!mask.contains(4)),
                Op::Write { target: Target::GpioClear, mask } => assert!(!mask.contains(5)),
                Op::Wait => {}
            }
        }
    }

    #[test]
    fn inverted_levels_are_complement() {
        let t = table(1000, 100, &[(4, 300), (9, 0), (10, 1000), (22, 800)]);
        let normal = Ring::compile(&t, false);
        let inverted = Ring::compile(&t, true);
        let pins = t.pins().bits();
        for (a, b) in normal.output_levels().iter().zip(inverted.output_levels().iter()) {
            assert_eq!(a.bits() ^ b.bits(), pins);
        }
        assert_eq!(normal.active_slots(4), inverted.active_slots(4));
    }

    #[test]
    fn deterministic_compilation() {
        let t = table(20_000, 10, &[(18, 1500), (23, 1000), (24, 2000)]);
        let a = Ring::compile(&t, false);
        let b = Ring::compile(&t.clone(), false);
        assert_eq!(a, b);
        assert!(a.diff(&b).is_empty());

        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let mut m1 = regs.alloc(4 * Ring::capacity_words(2000)).unwrap();
        let mut m2 = regs.alloc(4 * Ring::capacity_words(2000)).unwrap();
        a.lower(&mut m1, regs.layout(), PacingSource::Pwm);
        b.lower(&mut m2, regs.layout(), PacingSource::Pwm);
        // Only the bus addresses differ between the regions.
        let rebase = |mem: &crate::sim::SimMemory| -> Vec<u32> {
            mem.words()
                .iter()
                .map(|w| w.get())
                .map(|w| if mem.contains(w) { w - mem.bus_address() } else { w })
                .collect()
        };
        assert_eq!(rebase(&m1), rebase(&m2));
    }

    #[test]
    fn diff_locates_changes() {
        let a = Ring::compile(&table(1000, 100, &[(4, 300)]), false);
        let b = Ring::compile(&table(1000, 100, &[(4, 600)]), false);
        // Same length, only the deactivation moved.
        assert_eq!(a.len(), b.len());
        assert_eq!(a.diff(&b), vec![4, 5, 6, 7]);
    }

    #[test]
    fn lowering() {
        let regs = SimPeripherals::new(PeripheralLayout::Gen4);
        let ring = Ring::compile(&table(1000, 100, &[(17, 200)]), false);
        let mut mem = regs.alloc(4 * Ring::capacity_words(10)).unwrap();
        ring.lower(&mut mem, regs.layout(), PacingSource::Pcm);
        let bus = mem.bus_address();
        let w = |i: usize| mem.words()[i].get();

        // Activation write.
        assert_eq!(w(CB_TI), DMA_TI_NO_WIDE_BURSTS | DMA_TI_WAIT_RESP);
        assert_eq!(w(CB_DEST_AD), 0x7e20_001c);
        assert_eq!(w(CB_TXFR_LEN), 4);
        assert_eq!(w(CB_NEXTCONBK), bus + 32);
        let data = (w(CB_SOURCE_AD) - bus) as usize / 4;
        assert_eq!(data, ring.len() * CB_WORDS);
        assert_eq!(w(data), 1 << 17);

        // First wait, paced by the PCM.
        let wait = CB_WORDS;
        assert_eq!(w(wait + CB_TI) & DMA_TI_DEST_DREQ, DMA_TI_DEST_DREQ);
        assert_eq!((w(wait + CB_TI) >> DMA_TI_PERMAP_SHIFT) & 0x1f, DREQ_PCM_TX);
        assert_eq!(w(wait + CB_DEST_AD), 0x7e20_3004);

        // The ring is closed.
        assert_eq!(w(ring.tail_next_word()), bus);
    }

    #[test]
    fn capacity_covers_worst_case() {
        let mut entries = Vec::new();
        for pin in 0..=MAX_GPIO {
            entries.push((pin, pin as u32 * 10 + 10));
        }
        let ring = Ring::compile(&table(1000, 10, &entries), true);
        assert!(ring.is_valid());
        let needed = ring.len() * CB_WORDS + ring.write_count() + 1;
        assert!(needed <= Ring::capacity_words(100));
    }
}
