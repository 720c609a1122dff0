/*!
Annotates the hardware page map of a process with module and driver
names, then scans still-unnamed ranges for orphaned PE headers.
*/

use crate::read::VirtualReadData;
use crate::strmap::{StrMapBuilder, StrRef};
use crate::vmm::Vmm;
use crate::win32::maps::{PteMap, PteMapEntry};
use crate::win32::pe;
use crate::win32::process::Win32Process;

use log::trace;

use memscope_core::arch::Architecture;
use memscope_core::mem::PhysicalMemory;
use memscope_core::types::{Address, PAGE_SIZE};

/// PE header candidates scanned per pass.
const MAX_SCAN_CANDIDATES: usize = 0x400;

/// Tags all entries overlapping `[va_base, va_limit]` that do not carry
/// a name yet. The entry array is sorted by base, located in O(log n).
fn map_tag(
    entries: &mut [PteMapEntry],
    pool: &mut StrMapBuilder,
    va_base: Address,
    va_limit: Address,
    tag: &str,
    wow64: bool,
) {
    if tag.is_empty() || entries.is_empty() {
        return;
    }
    let mut i = entries
        .partition_point(|e| e.va_base <= va_base)
        .saturating_sub(1);
    let r = pool.push(tag);
    while i < entries.len() {
        let e = &mut entries[i];
        i += 1;
        if e.va_base > va_limit {
            break; // outside scope
        }
        if e.va_base + (e.pages as usize) * PAGE_SIZE <= va_base {
            continue; // outside scope
        }
        if !e.text.is_empty() {
            continue;
        }
        e.wow64 = wow64;
        e.text = r;
    }
}

/// Tags the kernel image and the driver ranges; kernel process only.
fn tag_drivers<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    entries: &mut [PteMapEntry],
    pool: &mut StrMapBuilder,
) {
    if proc.pid != 4 {
        return;
    }
    map_tag(
        entries,
        pool,
        vmm.sysinfo.kernel_base,
        vmm.sysinfo.kernel_base + vmm.sysinfo.kernel_size,
        "nt",
        false,
    );
    // the kernel module map carries the loaded driver ranges
    let modules = vmm.module_map(proc);
    for m in modules.entries.iter() {
        if !m.va_base.is_null() && m.cb_image != 0 && m.cb_image < 0x1000_0000 {
            map_tag(
                entries,
                pool,
                m.va_base,
                m.va_base + m.cb_image as usize - 1,
                modules.name(m),
                false,
            );
        }
    }
}

/// Tags the ranges of the per-process module map.
fn tag_modules<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    entries: &mut [PteMapEntry],
    pool: &mut StrMapBuilder,
) {
    let modules = vmm.module_map(proc);
    for m in modules.entries.iter() {
        if m.cb_image == 0 {
            continue;
        }
        map_tag(
            entries,
            pool,
            m.va_base,
            m.va_base + m.cb_image as usize - 1,
            modules.name(m),
            m.wow64,
        );
    }
}

/// Scans still-unnamed ranges for PE header candidates and tags hits.
fn scan_header_pe<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    entries: &mut Vec<PteMapEntry>,
    pool: &mut StrMapBuilder,
) {
    // 1: select candidates: page-aligned at 64k, unnamed; on 64-bit the
    // header page must be a single non-executable page followed by an
    // executable one
    let mut candidates: Vec<(usize, Address)> = Vec::new();
    for i in 0..entries.len().saturating_sub(1) {
        let e = &entries[i];
        let hit = if vmm.sysinfo.arch == Architecture::X86 {
            e.va_base.as_u64() & 0xffff == 0 && e.text.is_empty()
        } else {
            e.pages == 1
                && e.va_base.as_u64() & 0xffff == 0
                && e.text.is_empty()
                && e.nx
                && !entries[i + 1].nx
        };
        if hit {
            candidates.push((i, e.va_base));
            if candidates.len() == MAX_SCAN_CANDIDATES {
                break;
            }
        }
    }
    if candidates.is_empty() {
        return;
    }

    // 2: read all candidate header pages in one scatter
    let mut bufs = vec![0u8; candidates.len() * PAGE_SIZE];
    let mut reads: Vec<VirtualReadData> = bufs
        .chunks_mut(PAGE_SIZE)
        .zip(candidates.iter())
        .map(|(out, &(_, va))| VirtualReadData::new(va, out))
        .collect();
    vmm.read_scatter(proc, &mut reads);

    // 3: validate and tag
    let mut hits: Vec<(Address, u32, String)> = Vec::new();
    for read in reads.iter() {
        if !read.ok {
            continue;
        }
        let pb = &read.out[..];
        let hdr = match pe::PeHeader::verify(pb) {
            Some(h) => h,
            None => continue,
        };
        let cb_image = hdr.size_of_image();
        if cb_image == 0 || cb_image >= 0x0100_0000 {
            continue;
        }
        if let Some(name) = pe::module_name(vmm, proc, read.va, Some(pb)) {
            hits.push((read.va, cb_image, name));
        }
    }
    for (va_base, cb_image, name) in hits {
        trace!("pe header scan hit: {} at {:x}", name, va_base);
        map_tag(
            entries,
            pool,
            va_base,
            va_base + cb_image as usize - 1,
            &name,
            false,
        );
    }
}

/// Builds the tagged page map of a process from the PTE provider.
pub(crate) fn initialize<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process) -> PteMap {
    let ranges = match vmm.pte.as_ref().and_then(|p| p.pte_map(proc.pid)) {
        Some(r) => r,
        None => {
            return PteMap {
                tag_scan: true,
                ..Default::default()
            }
        }
    };

    let mut entries: Vec<PteMapEntry> = ranges
        .iter()
        .map(|r| PteMapEntry {
            va_base: r.va_base,
            pages: r.pages,
            nx: r.nx,
            wow64: false,
            text: StrRef::EMPTY,
        })
        .collect();
    entries.sort_unstable_by_key(|e| e.va_base);

    let mut pool = StrMapBuilder::new();
    tag_drivers(vmm, proc, &mut entries, &mut pool);
    tag_modules(vmm, proc, &mut entries, &mut pool);
    scan_header_pe(vmm, proc, &mut entries, &mut pool);

    PteMap {
        entries,
        pool: pool.finish(),
        tag_scan: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{PteProvider, PteRange};
    use crate::testutil::*;
    use crate::vmm::VmmBuilder;

    use memscope_core::mem::DummyMemory;

    struct FixedPtes(Vec<PteRange>);

    impl PteProvider for FixedPtes {
        fn pte_map(&self, _pid: u32) -> Option<Vec<PteRange>> {
            Some(self.0.clone())
        }
    }

    const VA_IMAGE: u64 = 0x0000_7ff7_6001_0000;

    #[test]
    fn test_pe_header_scan_tags_ranges() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        // orphaned PE at a 64k-aligned base: header page NX, code page X
        write_pe64(
            &mut mem,
            VA_IMAGE,
            0x3000,
            Some(ExportSpec {
                ordinal_base: 1,
                functions: vec![0x1000],
                names: vec![],
                dll_name: Some("ghost.dll".to_string()),
            }),
        );

        let ranges = vec![
            PteRange {
                va_base: Address::from(VA_IMAGE),
                pages: 1,
                nx: true,
            },
            PteRange {
                va_base: Address::from(VA_IMAGE + 0x1000),
                pages: 2,
                nx: false,
            },
            PteRange {
                va_base: Address::from(VA_IMAGE + 0x10_0000),
                pages: 4,
                nx: true,
            },
        ];
        let vmm = VmmBuilder::new(mem, si.clone())
            .identity_translation()
            .pte_provider(Box::new(FixedPtes(ranges)))
            .build();
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, 0, 0, false, vec![]),
            ],
        );

        let map = vmm.pte_map(&procs[1]);
        assert!(map.tag_scan);
        assert_eq!(map.entries.len(), 3);
        // both pages of the image range carry the scanned name
        assert_eq!(map.text(&map.entries[0]), "ghost.dll");
        assert_eq!(map.text(&map.entries[1]), "ghost.dll");
        // the unrelated range stays untagged
        assert_eq!(map.text(&map.entries[2]), "");
    }

    #[test]
    fn test_without_provider_yields_empty_tagged_map() {
        let si = sysinfo_x64(10, 19041);
        let vmm = vmm_with(DummyMemory::new(), si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, 0, 0, false, vec![]),
            ],
        );
        let map = vmm.pte_map(&procs[1]);
        assert!(map.tag_scan);
        assert!(map.entries.is_empty());
    }
}
