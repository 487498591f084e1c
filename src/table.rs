//! Per-channel pulse widths on the step grid.

use std::collections::btree_map::{self, BTreeMap};

use crate::error::Error;
use crate::pubdef::is_valid_gpio;
use crate::util::PinMask;
use crate::Result;



/// Mapping from GPIO pin to pulse width.
///
/// Widths are stored rounded to the nearest multiple of the step time, ties rounding up.
#[derive(Clone, Debug)]
pub struct PulseTable {
    cycle_time_us: u32,
    step_time_us: u32,
    widths: BTreeMap<u8, u32>,
    dirty: bool,
}

impl PulseTable {
    /// Creates an empty table.
    ///
    /// The timing is expected to have been validated.
    pub fn new(cycle_time_us: u32, step_time_us: u32) -> PulseTable {
        PulseTable {
            cycle_time_us: cycle_time_us,
            step_time_us: step_time_us,
            widths: BTreeMap::new(),
            dirty: false,
        }
    }

    pub fn cycle_time_us(&self) -> u32 {
        self.cycle_time_us
    }

    pub fn step_time_us(&self) -> u32 {
        self.step_time_us
    }

    pub fn slot_count(&self) -> u32 {
        self.cycle_time_us / self.step_time_us
    }

    /// Checks a pin and width and returns the width as it would be stored.
    pub fn check(&self, pin: u8, width_us: u32) -> Result<u32> {
        if !is_valid_gpio(pin) {
            return Err(Error::InvalidPin(pin));
        }
        self.round(width_us)
    }

    fn round(&self, width_us: u32) -> Result<u32> {
        if width_us > self.cycle_time_us {
            return Err(Error::InvalidWidth {
                width_us: width_us,
                cycle_time_us: self.cycle_time_us,
            });
        }
        let step = self.step_time_us as u64;
        let rounded = (width_us as u64 + step / 2) / step * step;
        // Rounding up never crosses the cycle since the cycle is a step multiple.
        Ok(rounded.min(self.cycle_time_us as u64) as u32)
    }

    /// Inserts or replaces the width of a pin and returns the stored width.
    pub fn add_or_update(&mut self, pin: u8, width_us: u32) -> Result<u32> {
        let width = self.check(pin, width_us)?;
        if self.widths.insert(pin, width) != Some(width) {
            self.dirty = true;
        }
        Ok(width)
    }

    /// Changes the width of a registered pin.
    pub fn set_width(&mut self, pin: u8, width_us: u32) -> Result<u32> {
        let width = self.round(width_us)?;
        match self.widths.get_mut(&pin) {
            Some(w) => {
                if *w != width {
                    *w = width;
                    self.dirty = true;
                }
                Ok(width)
            }
            None => Err(Error::PinNotRegistered(pin)),
        }
    }

    /// Removes a pin and returns its width; an absent pin is not an error.
    pub fn remove(&mut self, pin: u8) -> Option<u32> {
        let width = self.widths.remove(&pin);
        if width.is_some() {
            self.dirty = true;
        }
        width
    }

    pub fn clear(&mut self) {
        if !self.widths.is_empty() {
            self.widths.clear();
            self.dirty = true;
        }
    }

    pub fn width(&self, pin: u8) -> Option<u32> {
        self.widths.get(&pin).cloned()
    }

    pub fn contains(&self, pin: u8) -> bool {
        self.widths.contains_key(&pin)
    }

    pub fn pins(&self) -> PinMask {
        self.widths.keys().cloned().collect()
    }

    /// Entries in ascending pin order.
    pub fn iter(&self) -> Iter {
        Iter {
            inner: self.widths.iter(),
        }
    }

    pub fn len(&self) -> usize {
        self.widths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widths.is_empty()
    }

    /// Returns whether the table changed since the last call.
    pub fn take_dirty(&mut self) -> bool {
        let dirty = self.dirty;
        self.dirty = false;
        dirty
    }
}


/// Iterator over `(pin, width_us)` entries of a pulse table.
pub struct Iter<'a> {
    inner: btree_map::Iter<'a, u8, u32>,
}

impl<'a> Iterator for Iter<'a> {
    type Item = (u8, u32);

    fn next(&mut self) -> Option<(u8, u32)> {
        self.inner.next().map(|(&pin, &width)| (pin, width))
    }
}



#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rounding_to_step_grid() {
        let mut table = PulseTable::new(3000, 10);
        assert_eq!(table.add_or_update(17, 54), Ok(50));
        assert_eq!(table.add_or_update(17, 55), Ok(60));
        assert_eq!(table.add_or_update(17, 2996), Ok(3000));
        assert_eq!(table.add_or_update(17, 0), Ok(0));
        assert_eq!(table.width(17), Some(0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn rejected_entries() {
        let mut table = PulseTable::new(1000, 100);
        assert_eq!(table.add_or_update(28, 100), Err(Error::InvalidPin(28)));
        assert_eq!(
            table.add_or_update(4, 1001),
            Err(Error::InvalidWidth { width_us: 1001, cycle_time_us: 1000 })
        );
        assert_eq!(table.set_width(4, 200), Err(Error::PinNotRegistered(4)));
        assert!(table.is_empty());
        assert!(!table.take_dirty());
    }

    #[test]
    fn dirty_tracking() {
        let mut table = PulseTable::new(1000, 100);
        table.add_or_update(4, 300).unwrap();
        assert!(table.take_dirty());
        table.add_or_update(4, 320).unwrap();
        assert!(!table.take_dirty());
        table.set_width(4, 600).unwrap();
        assert!(table.take_dirty());
        assert_eq!(table.remove(5), None);
        assert!(!table.take_dirty());
        assert_eq!(table.remove(4), Some(600));
        assert!(table.take_dirty());
    }

    #[test]
    fn ordered_iteration() {
        let mut table = PulseTable::new(1000, 100);
        for &(pin, width) in [(22, 100), (4, 300), (17, 0)].iter() {
            table.add_or_update(pin, width).unwrap();
        }
        assert_eq!(
            table.iter().collect::<Vec<_>>(),
            vec![(4, 300), (17, 0), (22, 100)]
        );
        assert_eq!(table.pins().bits(), (1 << 4) | (1 << 17) | (1 << 22));
    }
}
