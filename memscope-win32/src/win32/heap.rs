/*!
Heap segment discovery through the PEB heap array and the segment
linked lists (XP uses a plain array walk, Vista+ a list walk).
*/

use crate::listwalk::{list_traverse_prefetch, ListWalkLinks};
use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::defs::{ListEntry32, ListEntry64, Peb32, Peb64};
use crate::win32::maps::{HeapEntry, HeapMap};
use crate::win32::process::Win32Process;

use std::cell::RefCell;

use dataview::Pod;
use hashbrown::HashMap;
use log::trace;

use memscope_core::arch::Architecture;
use memscope_core::mem::PhysicalMemory;
use memscope_core::types::Address;

const MAX_HEAPS: usize = 0x80;

const SEGMENT_SIGNATURE_NT: u32 = 0xffee_ffee;
const SEGMENT_SIGNATURE_XP: u32 = 0xeeff_eeff;

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
struct HeapSegment64 {
    heap_entry: [u64; 2],
    segment_signature: u32,
    segment_flags: u32,
    list_entry: ListEntry64,
    heap: u64,
    base_address: u64,
    number_of_pages: u64,
    first_entry: u64,
    last_valid_entry: u64,
    number_of_uncommitted_pages: u32,
    number_of_uncommitted_ranges: u32,
    segment_allocator_back_trace_index: u32,
    reserved: u32,
    ucr_segment_list: ListEntry64,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
struct HeapSegment32 {
    heap_entry: [u32; 2],
    segment_signature: u32,
    segment_flags: u32,
    list_entry: ListEntry32,
    heap: u32,
    base_address: u32,
    number_of_pages: u32,
    first_entry: u32,
    last_valid_entry: u32,
    number_of_uncommitted_pages: u32,
    number_of_uncommitted_ranges: u32,
    segment_allocator_back_trace_index: u32,
    reserved: u32,
    ucr_segment_list: ListEntry32,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
struct HeapSegment32Xp {
    heap_entry: [u32; 2],
    segment_signature: u32,
    segment_flags: u32,
    heap: u32,
    largest_uncommitted_range: u32,
    base_address: u32,
    number_of_pages: u32,
    first_entry: u32,
    last_valid_entry: u32,
    number_of_uncommitted_pages: u32,
    number_of_uncommitted_ranges: u32,
    uncommitted_ranges: u32,
    allocator_back_trace_index: u16,
    reserved: u16,
    last_entry_in_segment: u32,
}

/// Insertion-ordered segment accumulator; the heap id of a secondary
/// segment is resolved through the primary segment located at its
/// owning heap's address.
#[derive(Default)]
struct HeapCtx {
    entries: Vec<HeapEntry>,
    index: HashMap<u64, usize>,
}

impl HeapCtx {
    fn push(&mut self, va_segment: Address, va_heap: u64, pages: u32, pages_uncommitted: u32) {
        if self.index.contains_key(&va_segment.as_u64()) {
            return;
        }
        let (heap_id, primary) = match self.index.get(&va_heap) {
            Some(&i) => (self.entries[i].heap_id, false),
            None => (self.index.len() as u32, true),
        };
        self.index.insert(va_segment.as_u64(), self.entries.len());
        self.entries.push(HeapEntry {
            va_segment,
            heap_id,
            primary,
            pages,
            pages_uncommitted,
        });
    }
}

/// Direct segment-array walk for XP era heaps.
fn initialize32_xp<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    ctx: &mut HeapCtx,
    va_heaps: &[Address],
) {
    vmm.prefetch(
        proc,
        va_heaps.iter().copied(),
        std::mem::size_of::<HeapSegment32Xp>(),
    );
    for &va in va_heaps {
        let h: HeapSegment32Xp = match vmm.read_pod(proc, va) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if h.segment_signature != SEGMENT_SIGNATURE_XP || h.number_of_pages >= 0x00f0_0000 {
            continue;
        }
        ctx.push(
            va,
            u64::from(h.heap),
            h.number_of_pages,
            h.number_of_uncommitted_pages,
        );
    }
}

fn initialize32<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process, wow64: bool) -> HeapMap {
    // 1: read the PEB and its heap array
    let va_peb = if wow64 {
        Address::from(proc.va_peb32)
    } else {
        proc.va_peb
    };
    if va_peb.is_null() {
        return HeapMap::default();
    }
    let peb: Peb32 = match vmm.read_pod(proc, va_peb) {
        Ok(p) => p,
        Err(_) => return HeapMap::default(),
    };
    let c_heaps = peb.number_of_heaps as usize;
    if c_heaps > MAX_HEAPS {
        return HeapMap::default(); // probably not valid
    }
    let mut raw = vec![0u32; c_heaps];
    if vmm
        .read_into(proc, Address::from(peb.process_heaps), &mut raw[..])
        .is_err()
    {
        return HeapMap::default();
    }
    if raw.first().copied().unwrap_or(0) != peb.process_heap {
        return HeapMap::default();
    }
    let va_heaps: Vec<Address> = raw.iter().map(|&v| Address::from(v)).collect();

    // 2: walk the segments
    let ctx = RefCell::new(HeapCtx::default());
    if vmm.sysinfo.version_build <= 2600 {
        // WINXP
        initialize32_xp(vmm, proc, &mut ctx.borrow_mut(), &va_heaps);
    } else {
        // VISTA+
        let mut pre = |va: Address,
                       pb: &[u8],
                       va_flink: Address,
                       va_blink: Address,
                       _extra: &mut Vec<Address>|
         -> ListWalkLinks {
            let h = Pod::as_data_view(pb).copy::<HeapSegment32>(0);
            if h.segment_signature != SEGMENT_SIGNATURE_NT || h.number_of_pages >= 0x00f0_0000 {
                return ListWalkLinks::default();
            }
            let vf = va::uaddr32_4(va_flink.as_u64());
            let vb = va::uaddr32_4(va_blink.as_u64());
            ctx.borrow_mut().push(
                va,
                u64::from(h.heap),
                h.number_of_pages,
                h.number_of_uncommitted_pages,
            );
            ListWalkLinks {
                valid_entry: vf || vb,
                valid_flink: vf,
                valid_blink: vb,
            }
        };
        list_traverse_prefetch(
            vmm,
            proc,
            true,
            &va_heaps,
            0x0c,
            std::mem::size_of::<HeapSegment32>(),
            usize::MAX,
            Some(&mut pre),
            None,
            None,
        );
    }

    finalize(ctx.into_inner())
}

fn initialize64<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process) -> HeapMap {
    // 1: read the PEB and its heap array
    if proc.va_peb.is_null() {
        return HeapMap::default();
    }
    let peb: Peb64 = match vmm.read_pod(proc, proc.va_peb) {
        Ok(p) => p,
        Err(_) => return HeapMap::default(),
    };
    let c_heaps = peb.number_of_heaps as usize;
    if c_heaps > MAX_HEAPS {
        return HeapMap::default();
    }
    let mut raw = vec![0u64; c_heaps];
    if vmm
        .read_into(proc, Address::from(peb.process_heaps), &mut raw[..])
        .is_err()
    {
        return HeapMap::default();
    }
    if raw.first().copied().unwrap_or(0) != peb.process_heap {
        return HeapMap::default();
    }
    let va_heaps: Vec<Address> = raw.iter().map(|&v| Address::from(v)).collect();

    // 2: walk the segment linked lists
    let ctx = RefCell::new(HeapCtx::default());
    let mut pre = |va: Address,
                   pb: &[u8],
                   va_flink: Address,
                   va_blink: Address,
                   _extra: &mut Vec<Address>|
     -> ListWalkLinks {
        let h = Pod::as_data_view(pb).copy::<HeapSegment64>(0);
        if h.segment_signature != SEGMENT_SIGNATURE_NT || h.number_of_pages >= 0x00f0_0000 {
            return ListWalkLinks::default();
        }
        let vf = va::uaddr64_8(va_flink.as_u64());
        let vb = va::uaddr64_8(va_blink.as_u64());
        ctx.borrow_mut().push(
            va,
            h.heap,
            h.number_of_pages as u32,
            h.number_of_uncommitted_pages,
        );
        ListWalkLinks {
            valid_entry: vf || vb,
            valid_flink: vf,
            valid_blink: vb,
        }
    };
    list_traverse_prefetch(
        vmm,
        proc,
        false,
        &va_heaps,
        0x18,
        std::mem::size_of::<HeapSegment64>(),
        usize::MAX,
        Some(&mut pre),
        None,
        None,
    );

    finalize(ctx.into_inner())
}

fn finalize(ctx: HeapCtx) -> HeapMap {
    let mut entries = ctx.entries;
    entries.sort_unstable_by_key(|e| e.va_segment);
    trace!("{} heap segments", entries.len());
    HeapMap { entries }
}

/// Builds the heap map of a process by walking the PEB heap structures.
/// This may be unreliable if a process is obfuscated or tampered.
pub(crate) fn initialize<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process) -> HeapMap {
    if vmm.sysinfo.arch == Architecture::X86
        || (vmm.sysinfo.arch == Architecture::X64 && proc.wow64)
    {
        initialize32(vmm, proc, proc.wow64)
    } else {
        initialize64(vmm, proc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use memscope_core::mem::DummyMemory;

    const VA_PEB: u64 = 0x0000_7ff7_3000_0000;
    const VA_HEAP_ARRAY: u64 = 0x0000_7ff7_3000_1000;
    const VA_HEAP_A: u64 = 0x0000_0210_0000_0000;
    const VA_HEAP_B: u64 = 0x0000_0220_0000_0000;
    const VA_SEG_C: u64 = 0x0000_0210_0010_0000;

    fn write_segment64(mem: &mut DummyMemory, va: u64, heap: u64, pages: u64, flink: u64) {
        mem.map(Address::from(va), 0x70);
        mem.write_u32(Address::from(va + 0x10), SEGMENT_SIGNATURE_NT);
        mem.write_u64(Address::from(va + 0x18), flink); // list entry
        mem.write_u64(Address::from(va + 0x20), flink);
        mem.write_u64(Address::from(va + 0x28), heap);
        mem.write_u64(Address::from(va + 0x30), va);
        mem.write_u64(Address::from(va + 0x38), pages);
        mem.write_u32(Address::from(va + 0x50), 3); // uncommitted pages
    }

    #[test]
    fn test_heap_segments_64() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();

        mem.map(Address::from(VA_PEB), 0x1000);
        mem.write_u64(Address::from(VA_PEB + 0x30), VA_HEAP_A); // ProcessHeap
        mem.write_u32(Address::from(VA_PEB + 0xe8), 2); // NumberOfHeaps
        mem.write_u64(Address::from(VA_PEB + 0xf0), VA_HEAP_ARRAY);
        mem.write_u64(Address::from(VA_HEAP_ARRAY), VA_HEAP_A);
        mem.write_u64(Address::from(VA_HEAP_ARRAY + 8), VA_HEAP_B);

        // heap A has a secondary segment linked behind it
        write_segment64(&mut mem, VA_HEAP_A, VA_HEAP_A, 0x100, VA_SEG_C + 0x18);
        write_segment64(&mut mem, VA_SEG_C, VA_HEAP_A, 0x40, VA_HEAP_A + 0x18);
        write_segment64(&mut mem, VA_HEAP_B, VA_HEAP_B, 0x80, VA_HEAP_B + 0x18);

        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, VA_PEB, 0, false, vec![]),
            ],
        );

        let map = vmm.heap_map(&procs[1]);
        assert_eq!(map.entries.len(), 3);
        // sorted by segment address
        for w in map.entries.windows(2) {
            assert!(w[0].va_segment < w[1].va_segment);
        }
        let a = map
            .entries
            .iter()
            .find(|e| e.va_segment == Address::from(VA_HEAP_A))
            .unwrap();
        let b = map
            .entries
            .iter()
            .find(|e| e.va_segment == Address::from(VA_HEAP_B))
            .unwrap();
        let c = map
            .entries
            .iter()
            .find(|e| e.va_segment == Address::from(VA_SEG_C))
            .unwrap();
        assert!(a.primary && b.primary);
        assert!(!c.primary);
        // the secondary segment belongs to heap A
        assert_eq!(c.heap_id, a.heap_id);
        assert_ne!(a.heap_id, b.heap_id);
        assert_eq!(a.pages, 0x100);
        assert_eq!(c.pages, 0x40);
        assert_eq!(a.pages_uncommitted, 3);
    }

    #[test]
    fn test_heap_count_sanity() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        mem.map(Address::from(VA_PEB), 0x1000);
        mem.write_u32(Address::from(VA_PEB + 0xe8), 0x81); // too many heaps
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, VA_PEB, 0, false, vec![]),
            ],
        );
        assert!(vmm.heap_map(&procs[1]).entries.is_empty());
    }
}
