/*!
Sparse in-memory backend for tests and synthetic images.
*/

use crate::error::Result;
use crate::mem::phys::{PhysicalMemory, PhysicalReadData};
use crate::types::{Address, PAGE_SIZE};

use hashbrown::HashMap;

/// A sparse, page-granular memory backend.
///
/// Pages that were never written do not exist; reads touching them fail
/// the affected scatter element. This mirrors the behavior of real
/// acquisition devices where parts of the physical address space are
/// simply not readable.
pub struct DummyMemory {
    pages: HashMap<u64, Box<[u8]>>,
}

impl Default for DummyMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl DummyMemory {
    pub fn new() -> Self {
        Self {
            pages: HashMap::new(),
        }
    }

    /// Maps (zero-filled) pages covering `[addr, addr + len)`.
    pub fn map(&mut self, addr: Address, len: usize) {
        let mut page = addr.as_page_aligned(PAGE_SIZE).as_u64();
        let end = addr.as_u64() + len as u64;
        while page < end {
            self.pages
                .entry(page)
                .or_insert_with(|| vec![0u8; PAGE_SIZE].into_boxed_slice());
            page += PAGE_SIZE as u64;
        }
    }

    /// Writes bytes at `addr`, mapping pages as needed.
    pub fn write(&mut self, addr: Address, data: &[u8]) {
        self.map(addr, data.len());
        let mut ofs = 0;
        while ofs < data.len() {
            let cur = addr + ofs;
            let page = cur.as_page_aligned(PAGE_SIZE).as_u64();
            let page_ofs = cur.page_offset();
            let chunk = std::cmp::min(PAGE_SIZE - page_ofs, data.len() - ofs);
            let pb = self.pages.get_mut(&page).unwrap();
            pb[page_ofs..page_ofs + chunk].copy_from_slice(&data[ofs..ofs + chunk]);
            ofs += chunk;
        }
    }

    pub fn write_u16(&mut self, addr: Address, value: u16) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u32(&mut self, addr: Address, value: u32) {
        self.write(addr, &value.to_le_bytes());
    }

    pub fn write_u64(&mut self, addr: Address, value: u64) {
        self.write(addr, &value.to_le_bytes());
    }

    /// Writes a UTF-16LE encoded string without terminator.
    pub fn write_utf16(&mut self, addr: Address, s: &str) {
        let units = s.encode_utf16().collect::<Vec<_>>();
        let mut bytes = Vec::with_capacity(units.len() * 2);
        for u in units {
            bytes.extend_from_slice(&u.to_le_bytes());
        }
        self.write(addr, &bytes);
    }
}

impl PhysicalMemory for DummyMemory {
    fn phys_read_raw_list(&mut self, data: &mut [PhysicalReadData]) -> Result<()> {
        'outer: for read in data.iter_mut() {
            let len = read.out.len();
            let mut ofs = 0;
            while ofs < len {
                let cur = read.addr + ofs;
                let page = cur.as_page_aligned(PAGE_SIZE).as_u64();
                let page_ofs = cur.page_offset();
                let chunk = std::cmp::min(PAGE_SIZE - page_ofs, len - ofs);
                match self.pages.get(&page) {
                    Some(pb) => {
                        read.out[ofs..ofs + chunk].copy_from_slice(&pb[page_ofs..page_ofs + chunk])
                    }
                    None => continue 'outer,
                }
                ofs += chunk;
            }
            read.ok = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sparse_read() {
        let mut mem = DummyMemory::new();
        mem.write(Address::from(0x1ff8u64), &[1, 2, 3, 4, 5, 6, 7, 8]);

        let mut buf = [0u8; 8];
        assert!(mem
            .phys_read_raw_into(Address::from(0x1ff8u64), &mut buf)
            .is_ok());
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);

        // unmapped page fails the read
        assert!(mem
            .phys_read_raw_into(Address::from(0x10_0000u64), &mut buf)
            .is_err());
    }

    #[test]
    fn test_cross_page_write() {
        let mut mem = DummyMemory::new();
        mem.write(Address::from(0x0ffeu64), &[0xAA; 4]);
        let v: u32 = mem.phys_read(Address::from(0x0ffeu64)).unwrap();
        assert_eq!(v, 0xAAAA_AAAA);
    }
}
