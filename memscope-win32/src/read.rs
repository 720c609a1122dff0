/*!
Virtual memory reads over the physical backend, the page cache and the
address translator.

All reads are page-chunked and routed through the epoch-tagged page
cache. `FORCECACHE_READ` restricts a read to pages already present in
the cache — the second pass of a bulk prefetch resolves against it
without further device round-trips.
*/

use crate::vmm::Vmm;
use crate::win32::process::Win32Process;

use std::collections::BTreeSet;

use dataview::Pod;

use memscope_core::error::{Error as CoreError, Result as CoreResult};
use memscope_core::mem::{PhysicalMemory, PhysicalReadData, ReadFlags};
use memscope_core::types::{Address, PAGE_SIZE};
use memscope_core::Translator;

use smallvec::SmallVec;

/// A single element of a virtual scatter read.
pub struct VirtualReadData<'a> {
    pub va: Address,
    pub out: &'a mut [u8],
    pub ok: bool,
}

impl<'a> VirtualReadData<'a> {
    pub fn new(va: Address, out: &'a mut [u8]) -> Self {
        Self {
            va,
            out,
            ok: false,
        }
    }
}

/// Physical memory view that reads page-wise through the page cache.
pub(crate) struct CachedPhys<'a, P: PhysicalMemory> {
    pub phys: &'a mut P,
    pub cache: &'a memscope_core::mem::PageCache,
    pub epoch: u64,
}

impl<'a, P: PhysicalMemory> CachedPhys<'a, P> {
    /// Copies `out.len()` bytes starting at `pa`, faulting whole pages
    /// into the cache as needed. Returns false if any page could not be
    /// read.
    fn read_through(&mut self, pa: Address, out: &mut [u8]) -> bool {
        let len = out.len();
        let mut ofs = 0;
        while ofs < len {
            let cur = pa + ofs;
            let page = cur.as_page_aligned(PAGE_SIZE);
            let page_ofs = cur.page_offset();
            let chunk = std::cmp::min(PAGE_SIZE - page_ofs, len - ofs);
            let hit = self
                .cache
                .with_page(self.epoch, page, |pb| {
                    out[ofs..ofs + chunk].copy_from_slice(&pb[page_ofs..page_ofs + chunk])
                })
                .is_some();
            if !hit {
                let mut pb = vec![0u8; PAGE_SIZE];
                if self.phys.phys_read_raw_into(page, &mut pb).is_err() {
                    return false;
                }
                self.cache.put(self.epoch, page, &pb);
                out[ofs..ofs + chunk].copy_from_slice(&pb[page_ofs..page_ofs + chunk]);
            }
            ofs += chunk;
        }
        true
    }

    /// Cache-only variant; never touches the device.
    fn read_cached(&mut self, pa: Address, out: &mut [u8]) -> bool {
        let len = out.len();
        let mut ofs = 0;
        while ofs < len {
            let cur = pa + ofs;
            let page = cur.as_page_aligned(PAGE_SIZE);
            let page_ofs = cur.page_offset();
            let chunk = std::cmp::min(PAGE_SIZE - page_ofs, len - ofs);
            let hit = self
                .cache
                .with_page(self.epoch, page, |pb| {
                    out[ofs..ofs + chunk].copy_from_slice(&pb[page_ofs..page_ofs + chunk])
                })
                .is_some();
            if !hit {
                return false;
            }
            ofs += chunk;
        }
        true
    }
}

impl<'a, P: PhysicalMemory> PhysicalMemory for CachedPhys<'a, P> {
    fn phys_read_raw_list(&mut self, data: &mut [PhysicalReadData]) -> CoreResult<()> {
        for read in data.iter_mut() {
            read.ok = self.read_through(read.addr, read.out);
        }
        Ok(())
    }
}

impl<P: PhysicalMemory> Vmm<P> {
    /// Reads virtual memory; returns the number of bytes actually read.
    ///
    /// Reads are page-chunked: a page that fails translation or device
    /// access only fails its own chunk. With `ZEROPAD_ON_FAIL` failed
    /// chunks are zero-filled, with `FORCECACHE_READ` only cached pages
    /// are served.
    pub fn read_ex(
        &self,
        proc: &Win32Process,
        va: Address,
        out: &mut [u8],
        flags: ReadFlags,
    ) -> usize {
        self.read_ex_translator(self.translator(proc), va, out, flags)
    }

    pub(crate) fn read_ex_translator(
        &self,
        translator: Translator,
        va: Address,
        out: &mut [u8],
        flags: ReadFlags,
    ) -> usize {
        let epoch = self.epoch();
        let mut phys = self.phys_lock();
        let mut cphys = CachedPhys {
            phys: &mut *phys,
            cache: &self.cache,
            epoch,
        };

        let len = out.len();
        let mut ofs = 0;
        let mut read_total = 0;
        while ofs < len {
            let cur = va + ofs;
            let chunk = std::cmp::min(PAGE_SIZE - cur.page_offset(), len - ofs);
            let ok = match translator.virt_to_phys(&mut cphys, cur) {
                Ok(pa) => {
                    if flags.contains(ReadFlags::FORCECACHE_READ) {
                        cphys.read_cached(pa, &mut out[ofs..ofs + chunk])
                    } else {
                        cphys.read_through(pa, &mut out[ofs..ofs + chunk])
                    }
                }
                Err(_) => false,
            };
            if ok {
                read_total += chunk;
            } else if flags.contains(ReadFlags::ZEROPAD_ON_FAIL) {
                for b in &mut out[ofs..ofs + chunk] {
                    *b = 0;
                }
            }
            ofs += chunk;
        }
        read_total
    }

    /// Strict read: the whole buffer or an error.
    pub fn read(&self, proc: &Win32Process, va: Address, out: &mut [u8]) -> crate::Result<()> {
        if self.read_ex(proc, va, out, ReadFlags::empty()) == out.len() {
            Ok(())
        } else {
            Err(CoreError::VirtualMemory("unable to read virtual memory").into())
        }
    }

    /// Strict typed read into a Pod value.
    pub fn read_into<T: Pod + ?Sized>(
        &self,
        proc: &Win32Process,
        va: Address,
        out: &mut T,
    ) -> crate::Result<()> {
        self.read(proc, va, out.as_bytes_mut())
    }

    /// Strict typed read returning a Pod value.
    pub fn read_pod<T: Pod + Sized>(&self, proc: &Win32Process, va: Address) -> crate::Result<T> {
        // zeroed memory is a valid bit pattern for any Pod type
        let mut obj: T = unsafe { std::mem::MaybeUninit::zeroed().assume_init() };
        self.read_into(proc, va, &mut obj)?;
        Ok(obj)
    }

    pub fn read_u32(&self, proc: &Win32Process, va: Address) -> crate::Result<u32> {
        self.read_pod::<u32>(proc, va)
    }

    pub fn read_u64(&self, proc: &Win32Process, va: Address) -> crate::Result<u64> {
        self.read_pod::<u64>(proc, va)
    }

    /// Reads a pointer-sized value for the given bitness.
    pub fn read_ptr(&self, proc: &Win32Process, f32: bool, va: Address) -> crate::Result<u64> {
        if f32 {
            Ok(u64::from(self.read_u32(proc, va)?))
        } else {
            self.read_u64(proc, va)
        }
    }

    /// Reads with flags into a freshly allocated buffer; returns the
    /// buffer and the number of bytes read.
    pub fn read_vec(
        &self,
        proc: &Win32Process,
        va: Address,
        len: usize,
        flags: ReadFlags,
    ) -> (Vec<u8>, usize) {
        let mut buf = vec![0u8; len];
        let cb = self.read_ex(proc, va, &mut buf, flags);
        (buf, cb)
    }

    /// Reads a NUL-terminated string of at most `len` bytes.
    pub fn read_cstr(&self, proc: &Win32Process, va: Address, len: usize) -> crate::Result<String> {
        let mut buf = vec![0u8; len];
        self.read_ex(proc, va, &mut buf, ReadFlags::ZEROPAD_ON_FAIL);
        if let Some(n) = buf.iter().position(|&c| c == 0) {
            buf.truncate(n);
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// Reads one page of physical memory through the cache.
    pub fn read_phys_page(&self, pa: Address) -> crate::Result<Vec<u8>> {
        let epoch = self.epoch();
        let mut phys = self.phys_lock();
        let mut cphys = CachedPhys {
            phys: &mut *phys,
            cache: &self.cache,
            epoch,
        };
        let mut pb = vec![0u8; PAGE_SIZE];
        if cphys.read_through(pa.as_page_aligned(PAGE_SIZE), &mut pb) {
            Ok(pb)
        } else {
            Err(CoreError::PhysicalMemory("unable to read physical page").into())
        }
    }

    /// Translates a virtual address through an arbitrary directory
    /// table base.
    pub fn virt2phys(&self, dtb: Address, va: Address) -> crate::Result<Address> {
        let translator = self.translator_dtb(dtb);
        let epoch = self.epoch();
        let mut phys = self.phys_lock();
        let mut cphys = CachedPhys {
            phys: &mut *phys,
            cache: &self.cache,
            epoch,
        };
        translator
            .virt_to_phys(&mut cphys, va)
            .map_err(crate::Error::from)
    }

    /// Advisory bulk prefetch: faults the pages covering `cb` bytes at
    /// each address into the page cache with as few device round-trips
    /// as possible. Failures are ignored.
    pub fn prefetch(
        &self,
        proc: &Win32Process,
        addrs: impl IntoIterator<Item = Address>,
        cb: usize,
    ) {
        let translator = self.translator(proc);
        self.prefetch_translator(translator, addrs, cb)
    }

    pub(crate) fn prefetch_translator(
        &self,
        translator: Translator,
        addrs: impl IntoIterator<Item = Address>,
        cb: usize,
    ) {
        let cb = std::cmp::max(cb, 1);
        let epoch = self.epoch();

        // page-dedup the virtual ranges first
        let mut va_pages = BTreeSet::new();
        for va in addrs {
            if va.is_null() {
                continue;
            }
            let mut page = va.as_page_aligned(PAGE_SIZE);
            let end = va + cb;
            while page < end {
                va_pages.insert(page);
                page += PAGE_SIZE;
            }
        }
        if va_pages.is_empty() {
            return;
        }

        let mut phys = self.phys_lock();
        let mut cphys = CachedPhys {
            phys: &mut *phys,
            cache: &self.cache,
            epoch,
        };

        // resolve to missing physical pages
        let mut pa_pages: Vec<Address> = Vec::with_capacity(va_pages.len());
        for va in va_pages {
            if let Ok(pa) = translator.virt_to_phys(&mut cphys, va) {
                let page = pa.as_page_aligned(PAGE_SIZE);
                if !self.cache.contains(epoch, page) {
                    pa_pages.push(page);
                }
            }
        }
        pa_pages.sort_unstable();
        pa_pages.dedup();
        if pa_pages.is_empty() {
            return;
        }

        // one scatter round-trip for everything that is missing
        let mut bufs = vec![0u8; pa_pages.len() * PAGE_SIZE];
        let mut reads: SmallVec<[PhysicalReadData; 32]> = bufs
            .chunks_mut(PAGE_SIZE)
            .zip(pa_pages.iter())
            .map(|(out, &pa)| PhysicalReadData::new(pa, out))
            .collect();
        if cphys.phys.phys_read_raw_list(&mut reads).is_err() {
            return;
        }
        for read in reads.iter() {
            if read.ok {
                self.cache.put(epoch, read.addr, read.out);
            }
        }
    }

    /// Prefetches physical pages directly into the page cache.
    pub fn prefetch_phys(&self, pages: impl IntoIterator<Item = Address>) {
        let epoch = self.epoch();
        let mut pa_pages: Vec<Address> = pages
            .into_iter()
            .filter(|pa| !pa.is_null())
            .map(|pa| pa.as_page_aligned(PAGE_SIZE))
            .filter(|&pa| !self.cache.contains(epoch, pa))
            .collect();
        pa_pages.sort_unstable();
        pa_pages.dedup();
        if pa_pages.is_empty() {
            return;
        }
        let mut phys = self.phys_lock();
        let mut bufs = vec![0u8; pa_pages.len() * PAGE_SIZE];
        let mut reads: SmallVec<[PhysicalReadData; 32]> = bufs
            .chunks_mut(PAGE_SIZE)
            .zip(pa_pages.iter())
            .map(|(out, &pa)| PhysicalReadData::new(pa, out))
            .collect();
        if phys.phys_read_raw_list(&mut reads).is_err() {
            return;
        }
        for read in reads.iter() {
            if read.ok {
                self.cache.put(epoch, read.addr, read.out);
            }
        }
    }

    /// Scatter read: prefetches all pages touched by the elements in
    /// one batch, then resolves each element from the cache.
    pub fn read_scatter(&self, proc: &Win32Process, data: &mut [VirtualReadData]) {
        let translator = self.translator(proc);

        // batch-fault everything that is missing
        let mut max_cb = 0;
        let addrs: Vec<Address> = data
            .iter()
            .inspect(|r| max_cb = std::cmp::max(max_cb, r.out.len()))
            .map(|r| r.va)
            .collect();
        self.prefetch_translator(translator, addrs, max_cb);

        for read in data.iter_mut() {
            let cb = self.read_ex_translator(
                translator,
                read.va,
                read.out,
                ReadFlags::FORCECACHE_READ,
            );
            read.ok = cb == read.out.len();
        }
    }
}
