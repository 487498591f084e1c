//! Useful objects and functions.

use std::fmt;
use std::ptr::{read_volatile, write_volatile};



/// A zero-overhead wrapper for volatile words shared with the DMA engine.
///
/// This allows writing and reading DMA memory without resorting to `unsafe` at each access.
///
/// Interior mutability is not offered: volatile accesses order nothing between threads, and a
/// `&mut` borrow of the DMA memory serializes the control path.
#[derive(Copy, Clone)]
#[repr(C)]
pub struct VolatileCell<T> {
    value: T,
}

impl<T> VolatileCell<T> {
    /// Creates a new `VolatileCell` containing the given value.
    pub fn new(value: T) -> VolatileCell<T> {
        VolatileCell {
            value: value,
        }
    }

    /// Returns a copy of the contained value.
    #[inline]
    pub fn get(&self) -> T {
        unsafe {
            read_volatile(&self.value as *const T)
        }
    }

    /// Sets the contained value.
    #[inline]
    pub fn set(&mut self, value: T) {
        unsafe {
            write_volatile(&mut self.value as *mut T, value);
        }
    }
}

impl<T: Copy + fmt::Debug> fmt::Debug for VolatileCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "VolatileCell({:?})", self.get())
    }
}



/// A set of GPIO pins, laid out as in the GPSET0/GPCLR0 registers.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct PinMask {
    bits: u32,
}

impl PinMask {
    pub fn empty() -> PinMask {
        PinMask { bits: 0 }
    }

    pub fn from_bits(bits: u32) -> PinMask {
        PinMask { bits: bits }
    }

    /// Adds a pin and returns true if it was not already in the set.
    ///
    /// # Panics
    ///
    /// This will panic if the pin does not fit in a GPIO bank.
    pub fn insert(&mut self, pin: u8) -> bool {
        assert!(pin < 32);
        let old = self.bits;
        self.bits |= 1u32 << pin;
        old != self.bits
    }

    pub fn contains(&self, pin: u8) -> bool {
        pin < 32 && self.bits & (1u32 << pin) != 0
    }

    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn is_empty(&self) -> bool {
        self.bits == 0
    }

    pub fn len(&self) -> usize {
        self.bits.count_ones() as usize
    }

    /// Pins in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u8> {
        let bits = self.bits;
        (0u8..32).filter(move |&pin| bits & (1u32 << pin) != 0)
    }
}

impl fmt::Debug for PinMask {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl std::iter::FromIterator<u8> for PinMask {
    fn from_iter<I: IntoIterator<Item = u8>>(iter: I) -> Self {
        let mut mask = PinMask::empty();
        for pin in iter {
            mask.insert(pin);
        }
        mask
    }
}
