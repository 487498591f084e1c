//! VideoCore mailbox property interface, used to obtain DMA-visible memory.
//!
//! Memory handed out by the VideoCore is physically contiguous and can be locked at a fixed
//! bus address, which is what the DMA engine needs to follow a control-block chain.

use std::io;
use std::mem;
use std::sync::Arc;

use crate::def::*;
use crate::error::AccessError;
use crate::periph::{self, DmaMemory, MemMap, SyncFile};
use crate::util::VolatileCell;
use crate::Result;



/// An open `/dev/vcio` handle.
pub struct Mailbox {
    file: SyncFile,
}

impl Mailbox {
    pub fn open() -> io::Result<Mailbox> {
        Ok(Mailbox {
            file: SyncFile::new(VCIO_DEVICE_PATH)?,
        })
    }

    /// Sends a single-tag property request and returns the response values.
    fn property(&self, tag: u32, request: &[u32], response_len: usize) -> io::Result<Vec<u32>> {
        let value_len = request.len().max(response_len);
        let mut buf = Vec::with_capacity(value_len + 6);
        buf.push(0); // total size, patched below
        buf.push(MBOX_REQUEST);
        buf.push(tag);
        buf.push((value_len * 4) as u32);
        buf.push((request.len() * 4) as u32);
        buf.extend_from_slice(request);
        buf.resize(5 + value_len, 0);
        buf.push(0); // end tag
        buf[0] = (buf.len() * 4) as u32;

        let ret = unsafe { libc::ioctl(self.file.fd, property_request() as _, buf.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        if buf[1] != MBOX_RESPONSE_OK {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("mailbox tag {:#x} rejected with status {:#x}", tag, buf[1]),
            ));
        }
        Ok(buf[5..5 + response_len].to_vec())
    }

    /// Allocates GPU memory and returns its handle, or 0 on failure.
    pub fn mem_alloc(&self, size: u32, align: u32, flags: u32) -> io::Result<u32> {
        self.property(MBOX_TAG_MEM_ALLOC, &[size, align, flags], 1)
            .map(|r| r[0])
    }

    /// Locks GPU memory in place and returns its bus address, or 0 on failure.
    pub fn mem_lock(&self, handle: u32) -> io::Result<u32> {
        self.property(MBOX_TAG_MEM_LOCK, &[handle], 1).map(|r| r[0])
    }

    pub fn mem_unlock(&self, handle: u32) -> io::Result<()> {
        self.property(MBOX_TAG_MEM_UNLOCK, &[handle], 1).map(|_| ())
    }

    pub fn mem_free(&self, handle: u32) -> io::Result<()> {
        self.property(MBOX_TAG_MEM_FREE, &[handle], 1).map(|_| ())
    }
}

// _IOWR(100, 0, char *)
fn property_request() -> libc::c_ulong {
    let size = mem::size_of::<*mut libc::c_char>() as libc::c_ulong;
    (3 << 30) | (size << 16) | ((MBOX_IOCTL_MAGIC as libc::c_ulong) << 8)
}



/// Uncached, physically contiguous memory obtained from the VideoCore.
///
/// The memory is unlocked and released on drop.
pub struct MailboxMemory {
    mailbox: Arc<Mailbox>,
    handle: u32,
    bus_address: u32,
    words: usize,
    map: Option<MemMap>,
}

impl MailboxMemory {
    pub(crate) fn new(mailbox: Arc<Mailbox>, bytes: usize, flags: u32) -> Result<MailboxMemory> {
        let size = ((bytes + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as u32;

        let handle = mailbox.mem_alloc(size, PAGE_SIZE as u32, flags)?;
        if handle == 0 {
            return Err(AccessError::OutOfMemory.into());
        }
        let bus_address = match mailbox.mem_lock(handle) {
            Ok(addr) if addr != 0 => addr,
            _ => {
                let _ = mailbox.mem_free(handle);
                return Err(AccessError::OutOfMemory.into());
            }
        };

        let map = SyncFile::new(DEV_MEM_PATH)
            .and_then(|file| MemMap::new(file.fd, size as usize, (bus_address & !BUS_ALIAS_MASK) as u64));
        let map = match map {
            Ok(map) => map,
            Err(e) => {
                let _ = mailbox.mem_unlock(handle);
                let _ = mailbox.mem_free(handle);
                return Err(e.into());
            }
        };
        trace!(
            "allocated {} bytes of DMA memory at bus address {:#010x}",
            size, bus_address
        );

        let mut memory = MailboxMemory {
            mailbox: mailbox,
            handle: handle,
            bus_address: bus_address,
            words: size as usize / 4,
            map: Some(map),
        };
        for word in memory.words_mut() {
            word.set(0);
        }
        Ok(memory)
    }
}

impl DmaMemory for MailboxMemory {
    fn bus_address(&self) -> u32 {
        self.bus_address
    }

    fn words(&self) -> &[VolatileCell<u32>] {
        match self.map {
            Some(ref map) => periph::words_of(map, self.words),
            None => &[],
        }
    }

    fn words_mut(&mut self) -> &mut [VolatileCell<u32>] {
        let words = self.words;
        match self.map {
            Some(ref mut map) => periph::words_of_mut(map, words),
            None => &mut [],
        }
    }
}

impl Drop for MailboxMemory {
    fn drop(&mut self) {
        // Unmap before handing the memory back.
        self.map.take();
        if let Err(e) = self
            .mailbox
            .mem_unlock(self.handle)
            .and_then(|_| self.mailbox.mem_free(self.handle))
        {
            error!("failed to release DMA memory {:#010x}: {}", self.bus_address, e);
        }
    }
}

unsafe impl Send for MailboxMemory {}
