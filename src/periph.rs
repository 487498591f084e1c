//! Access to the peripheral registers and to DMA-visible memory.

use std::ffi::CString;
use std::io;
use std::ptr;
use std::slice;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::def::*;
use crate::error::AccessError;
use crate::mailbox::{Mailbox, MailboxMemory};
use crate::model;
use crate::pubdef::{Block, PeripheralLayout, Register};
use crate::util::VolatileCell;
use crate::Result;



// A flag making sure that the peripherals are mapped only once at a time.
static PERIPHERALS_ARE_MAPPED: AtomicBool = AtomicBool::new(false);



/// Memory that the DMA engine can read.
pub trait DmaMemory {
    /// Bus address of the first word, as written into control blocks.
    fn bus_address(&self) -> u32;

    fn words(&self) -> &[VolatileCell<u32>];

    fn words_mut(&mut self) -> &mut [VolatileCell<u32>];

    /// Checks whether a bus address points into this memory.
    fn contains(&self, bus_address: u32) -> bool {
        let start = self.bus_address() as u64;
        let end = start + 4 * self.words().len() as u64;
        (bus_address as u64) >= start && (bus_address as u64) < end
    }
}


/// A register file: the capability to read and write peripheral registers and to allocate
/// DMA memory.
///
/// Every access is a single 32-bit volatile read or write.
pub trait Peripherals {
    type Memory: DmaMemory;

    fn layout(&self) -> PeripheralLayout;

    fn read(&self, reg: Register) -> u32;

    fn write(&self, reg: Register, value: u32);

    /// Allocates zeroed, uncached DMA memory of at least `bytes` bytes.
    fn alloc(&self, bytes: usize) -> Result<Self::Memory>;

    fn modify<F: FnOnce(u32) -> u32>(&self, reg: Register, f: F) {
        let value = self.read(reg);
        self.write(reg, f(value));
    }

    /// Waits for the hardware to settle.
    fn delay_us(&self, us: u64) {
        thread::sleep(Duration::from_micros(us));
    }
}

impl<'a, T: Peripherals> Peripherals for &'a T {
    type Memory = T::Memory;

    fn layout(&self) -> PeripheralLayout {
        (**self).layout()
    }

    fn read(&self, reg: Register) -> u32 {
        (**self).read(reg)
    }

    fn write(&self, reg: Register, value: u32) {
        (**self).write(reg, value)
    }

    fn alloc(&self, bytes: usize) -> Result<T::Memory> {
        (**self).alloc(bytes)
    }

    fn delay_us(&self, us: u64) {
        (**self).delay_us(us)
    }
}



/// Peripherals of the host, mapped from `/dev/mem`.
///
/// Only one instance may exist at a time; the windows stay mapped until it is dropped.
pub struct MappedPeripherals {
    layout: PeripheralLayout,
    gpio: MemMap,
    dma: MemMap,
    pwm: MemMap,
    pcm: MemMap,
    clock: MemMap,
    mailbox: Arc<Mailbox>,
}

impl MappedPeripherals {
    /// Detects the host layout and maps all register windows.
    pub fn open() -> Result<MappedPeripherals> {
        let layout = model::detect_layout()?;
        MappedPeripherals::open_with_layout(layout)
    }

    /// Maps all register windows of the given layout.
    pub fn open_with_layout(layout: PeripheralLayout) -> Result<MappedPeripherals> {
        // Enforce singleton instantiation.
        if PERIPHERALS_ARE_MAPPED.swap(true, Ordering::Acquire) {
            return Err(AccessError::AlreadyMapped.into());
        }

        match MappedPeripherals::map(layout) {
            Ok(p) => Ok(p),
            Err(e) => {
                PERIPHERALS_ARE_MAPPED.store(false, Ordering::Release);
                Err(e)
            }
        }
    }

    fn map(layout: PeripheralLayout) -> Result<MappedPeripherals> {
        let file = SyncFile::new(DEV_MEM_PATH)?;
        let window = |block: Block| -> io::Result<MemMap> {
            let map = MemMap::new(file.fd, block.len(), layout.phys_address(block) as u64)?;
            debug!("mapped {:?} registers at {:#010x}", block, layout.phys_address(block));
            Ok(map)
        };

        Ok(MappedPeripherals {
            layout: layout,
            gpio: window(Block::Gpio)?,
            dma: window(Block::Dma)?,
            pwm: window(Block::Pwm)?,
            pcm: window(Block::Pcm)?,
            clock: window(Block::Clock)?,
            mailbox: Arc::new(Mailbox::open()?),
        })
    }

    fn register_ptr(&self, reg: Register) -> *mut u32 {
        let map = match reg.block {
            Block::Gpio => &self.gpio,
            Block::Dma => &self.dma,
            Block::Pwm => &self.pwm,
            Block::Pcm => &self.pcm,
            Block::Clock => &self.clock,
        };
        assert!(reg.offset % 4 == 0 && reg.offset + 4 <= reg.block.len());
        unsafe { map.base.add(reg.offset) as *mut u32 }
    }
}

impl Peripherals for MappedPeripherals {
    type Memory = MailboxMemory;

    fn layout(&self) -> PeripheralLayout {
        self.layout
    }

    fn read(&self, reg: Register) -> u32 {
        unsafe { ptr::read_volatile(self.register_ptr(reg)) }
    }

    fn write(&self, reg: Register, value: u32) {
        unsafe { ptr::write_volatile(self.register_ptr(reg), value) }
    }

    fn alloc(&self, bytes: usize) -> Result<MailboxMemory> {
        MailboxMemory::new(self.mailbox.clone(), bytes, self.layout.mem_flags())
    }
}

impl Drop for MappedPeripherals {
    fn drop(&mut self) {
        // Allow the peripherals to be mapped again.
        PERIPHERALS_ARE_MAPPED.store(false, Ordering::Release);
    }
}

unsafe impl Send for MappedPeripherals {}

unsafe impl Sync for MappedPeripherals {}



/// A read-write file with synchronized I/O.
pub(crate) struct SyncFile {
    pub(crate) fd: libc::c_int,
}

impl SyncFile {
    pub(crate) fn new(path: &str) -> io::Result<SyncFile> {
        let path = CString::new(path).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;
        let fd = unsafe { libc::open(path.as_ptr(), libc::O_RDWR | libc::O_SYNC) };
        match fd {
            err if err < 0 => Err(io::Error::last_os_error()),
            _ => Ok(SyncFile { fd: fd }),
        }
    }
}

impl Drop for SyncFile {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}



/// Memory-mapped physical memory.
///
/// The mapping outlives the file descriptor it was created from.
pub(crate) struct MemMap {
    pub(crate) base: *mut u8,
    size: usize,
}

impl MemMap {
    pub(crate) fn new(fd: libc::c_int, size: usize, phys_addr: u64) -> io::Result<MemMap> {
        let size = (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
        let base = unsafe { map_shared(fd, size, phys_addr) };
        if base == libc::MAP_FAILED {
            Err(io::Error::last_os_error())
        } else {
            Ok(MemMap {
                base: base as *mut u8,
                size: size,
            })
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }
}

impl Drop for MemMap {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.size as libc::size_t);
        }
    }
}

// Peripheral addresses above 2 GiB do not fit a 32-bit `off_t`.
#[cfg(all(target_os = "linux", target_env = "gnu"))]
unsafe fn map_shared(fd: libc::c_int, size: usize, offset: u64) -> *mut libc::c_void {
    libc::mmap64(
        ptr::null_mut(),
        size as libc::size_t,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        offset as libc::off64_t,
    )
}

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
unsafe fn map_shared(fd: libc::c_int, size: usize, offset: u64) -> *mut libc::c_void {
    libc::mmap(
        ptr::null_mut(),
        size as libc::size_t,
        libc::PROT_READ | libc::PROT_WRITE,
        libc::MAP_SHARED,
        fd,
        offset as libc::off_t,
    )
}



/// Views mapped memory as DMA words.
pub(crate) fn words_of(map: &MemMap, words: usize) -> &[VolatileCell<u32>] {
    assert!(words * 4 <= map.size());
    unsafe { slice::from_raw_parts(map.base as *const VolatileCell<u32>, words) }
}

pub(crate) fn words_of_mut(map: &mut MemMap, words: usize) -> &mut [VolatileCell<u32>] {
    assert!(words * 4 <= map.size());
    unsafe { slice::from_raw_parts_mut(map.base as *mut VolatileCell<u32>, words) }
}
