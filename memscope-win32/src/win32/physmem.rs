/*!
Physical memory run map: preferably parsed from the kernel's
`MmPhysicalMemoryBlock`, else recovered from the registry resource map.
*/

use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::maps::{PhysMemEntry, PhysMemMap};

use log::{debug, trace};

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

const PHYSICAL_MEMORY_MAX_RUNS: u32 = 0x80;

const REGISTRY_PHYSMEM_PATH: &str =
    "HKLM\\HARDWARE\\RESOURCEMAP\\System Resources\\Physical Memory\\.Translated";

/// Parses `_PHYSICAL_MEMORY_DESCRIPTOR` from the kernel. Runs must be
/// monotonic, non-overlapping and consistent with the page count.
fn initialize_from_kernel<P: PhysicalMemory>(vmm: &Vmm<P>) -> Option<PhysMemMap> {
    let f32 = vmm.sysinfo.f32();
    let sys = vmm.system_process().ok()?;
    let sym = vmm.symbols.as_deref()?;
    let va_block_ptr = sym.symbol_address("nt", "MmPhysicalMemoryBlock")?;
    let va_block = vmm.read_ptr(&sys, f32, va_block_ptr).ok()?;
    if !va::kaddr_ptr(f32, va_block) {
        return None;
    }

    // header: NumberOfRuns, NumberOfPages, then the run array
    let (cb_hdr, cb_run) = if f32 { (8, 8) } else { (16, 16) };
    let cb_max = cb_hdr + PHYSICAL_MEMORY_MAX_RUNS as usize * cb_run;
    let (pb, _) = vmm.read_vec(&sys, Address::from(va_block), cb_max, ReadFlags::ZEROPAD_ON_FAIL);

    let c_runs = va::dw(&pb, 0);
    if c_runs == 0 || c_runs > PHYSICAL_MEMORY_MAX_RUNS {
        return None;
    }
    let c_pages_total = if f32 {
        u64::from(va::dw(&pb, 4))
    } else {
        va::qw(&pb, 8)
    };

    let mut entries: Vec<PhysMemEntry> = Vec::with_capacity(c_runs as usize);
    let mut c_pages = 0u64;
    for i in 0..c_runs as usize {
        let o = cb_hdr + i * cb_run;
        let (base_page, page_count) = if f32 {
            (u64::from(va::dw(&pb, o)), u64::from(va::dw(&pb, o + 4)))
        } else {
            (va::qw(&pb, o), va::qw(&pb, o + 8))
        };
        let e = PhysMemEntry {
            pa: Address::from(base_page << 12),
            cb: page_count << 12,
        };
        c_pages += page_count;
        if let Some(prev) = entries.last() {
            if prev.pa.as_u64() + prev.cb > e.pa.as_u64() {
                return None; // overlapping runs
            }
        }
        entries.push(e);
    }
    if c_pages != c_pages_total {
        return None;
    }
    debug!("physmem map from kernel: {} runs", entries.len());
    Some(PhysMemMap { entries })
}

/// Fallback parsing of the registry resource map blob. The layout is a
/// 16 byte header, a DWORD record count and packed
/// (Type, ShareDisposition, Flags, pa, cb) records; a Flags value with
/// any bit in 0xff00 set scales `cb` by 256.
fn initialize_from_registry<P: PhysicalMemory>(vmm: &Vmm<P>) -> Option<PhysMemMap> {
    let f32 = vmm.sysinfo.f32();
    let registry = vmm.registry.as_deref()?;
    let pb = registry.value_query(REGISTRY_PHYSMEM_PATH)?;
    if pb.len() < if f32 { 0x18 } else { 0x28 } {
        return None;
    }

    // number of outer region groups; only the first group is parsed
    let c_groups = va::qw(&pb, 0);
    if c_groups == 0 {
        return None;
    }
    let c_map = va::dw(&pb, 0x10) as usize;
    let cb_record = if f32 { 16 } else { 20 };
    if c_map == 0 || pb.len() < 0x14 + c_map * cb_record {
        return None;
    }

    let mut entries = Vec::with_capacity(c_map);
    for i in 0..c_map {
        let o = 0x14 + i * cb_record;
        let flags = va::w(&pb, o + 2);
        let pa = va::qw(&pb, o + 4);
        let mut cb = if f32 {
            u64::from(va::dw(&pb, o + 12))
        } else {
            va::qw(&pb, o + 12)
        };
        if flags & 0xff00 != 0 {
            cb <<= 8;
        }
        if pa & 0xfff != 0 || cb & 0xfff != 0 {
            return None; // not page aligned
        }
        entries.push(PhysMemEntry {
            pa: Address::from(pa),
            cb,
        });
    }
    debug!("physmem map from registry: {} runs", entries.len());
    Some(PhysMemMap { entries })
}

/// Builds the physical memory map; empty on failure of both sources.
pub(crate) fn initialize<P: PhysicalMemory>(vmm: &Vmm<P>) -> PhysMemMap {
    if let Some(map) = initialize_from_kernel(vmm) {
        return map;
    }
    if let Some(map) = initialize_from_registry(vmm) {
        return map;
    }
    trace!("physmem map unavailable");
    PhysMemMap::default()
}
