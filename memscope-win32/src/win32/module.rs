/*!
Module map construction: PEB/LDR walk for user processes,
PsLoadedModuleList for the kernel, augmented with image VADs not on the
loader lists and with caller-supplied injected module bases.
*/

use crate::strmap::StrMapBuilder;
use crate::util::{self, va, MAX_PATH};
use crate::vmm::Vmm;
use crate::win32::defs::{LdrModule32, LdrModule64, Peb32, Peb64, PebLdrData32, PebLdrData64};
use crate::win32::maps::{ModuleEntry, ModuleMap, ModuleType};
use crate::win32::process::Win32Process;
use crate::win32::{pe, unicode};

use std::sync::Arc;

use dataview::Pod;
use hashbrown::{HashMap, HashSet};
use log::trace;

use memscope_core::arch::Architecture;
use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::{Address, PAGE_SIZE};

/// Hard cap of modules tracked per process.
const MAX_MODULES: usize = 512;
/// Upper bound on image sizes accepted from VAD/injected discovery.
const MAX_IMAGE_SIZE_VAD: u32 = 0x0400_0000;

const LOOP_PROTECT_MAX: usize = 0x1000;

struct ModuleStage {
    va_base: Address,
    va_entry: Address,
    cb_image: u32,
    tp: ModuleType,
    wow64: bool,
    name_buf: Address,
    name_len: u16,
    full_buf: Address,
    full_len: u16,
}

/// Insertion-ordered staging map keyed by module base.
#[derive(Default)]
struct StageMap {
    entries: Vec<ModuleStage>,
    index: HashMap<u64, usize>,
}

impl StageMap {
    fn contains(&self, va_base: Address) -> bool {
        self.index.contains_key(&va_base.as_u64())
    }

    fn push(&mut self, st: ModuleStage) -> bool {
        if self.contains(st.va_base) {
            return false;
        }
        self.index.insert(st.va_base.as_u64(), self.entries.len());
        self.entries.push(st);
        true
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

fn vset_put(all: &mut Vec<Address>, all_set: &mut HashSet<u64>, try1: &mut Vec<Address>, va: Address) {
    if all_set.insert(va.as_u64()) {
        all.push(va);
        try1.push(va);
    }
}

/// Walks the three 64-bit loader lists (or PsLoadedModuleList for the
/// kernel) into the staging map. The kernel process additionally walks
/// its user-mode side afterwards.
fn initialize64<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &mut StageMap,
    user_only: bool,
) {
    walk_lists64(vmm, proc, stage, user_only);
    if !user_only && !proc.va_peb.is_null() {
        walk_lists64(vmm, proc, stage, true);
    }
}

fn walk_lists64<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &mut StageMap,
    user_only: bool,
) {
    let cb_record = std::mem::size_of::<LdrModule64>();

    // prefetch previously learned addresses
    if let Some(addrs) = proc.persistent.ldr_prefetch64.get() {
        vmm.prefetch(proc, addrs.iter().copied(), cb_record);
    }

    let mut all: Vec<Address> = Vec::new();
    let mut all_set: HashSet<u64> = HashSet::new();
    let mut try1: Vec<Address> = Vec::new();
    let mut try2: Vec<Address> = Vec::new();

    // seed from all six list heads so a single broken list does not
    // prevent discovery
    if user_only {
        if proc.va_peb.is_null() {
            return;
        }
        let peb: Peb64 = match vmm.read_pod(proc, proc.va_peb) {
            Ok(p) => p,
            Err(_) => return,
        };
        let ldr: PebLdrData64 = match vmm.read_pod(proc, Address::from(peb.ldr)) {
            Ok(l) => l,
            Err(_) => return,
        };
        let heads = [
            ldr.in_load_order_module_list.flink,
            ldr.in_load_order_module_list.blink,
            ldr.in_memory_order_module_list.flink,
            ldr.in_memory_order_module_list.blink,
            ldr.in_initialization_order_module_list.flink,
            ldr.in_initialization_order_module_list.blink,
        ];
        for &head in heads.iter() {
            if va::uaddr64_8(head) {
                vset_put(&mut all, &mut all_set, &mut try1, Address::from(head));
            }
        }
    } else {
        let va_list = vmm.sysinfo.va_ps_loaded_module_list;
        if va_list.is_null() {
            return;
        }
        match vmm.read_u64(proc, va_list) {
            Ok(first) if first != 0 => {
                vset_put(&mut all, &mut all_set, &mut try1, Address::from(first))
            }
            _ => return,
        }
    }

    // iterate over modules using all available linked lists
    let mut pb = vec![0u8; cb_record];
    let mut f_try1 = true;
    let mut c_loop = 0;
    while stage.len() < MAX_MODULES && c_loop < LOOP_PROTECT_MAX {
        let _va = if f_try1 {
            match try1.pop() {
                Some(va) => {
                    if vmm.read_ex(proc, va, &mut pb, ReadFlags::FORCECACHE_READ) != cb_record {
                        try2.push(va);
                        continue;
                    }
                    va
                }
                None => {
                    if try2.is_empty() {
                        break;
                    }
                    vmm.prefetch(proc, all.iter().copied(), cb_record);
                    f_try1 = false;
                    continue;
                }
            }
        } else {
            match try2.pop() {
                Some(va) => {
                    if vmm.read(proc, va, &mut pb).is_err() {
                        continue;
                    }
                    va
                }
                None => {
                    if try1.is_empty() {
                        break;
                    }
                    f_try1 = true;
                    continue;
                }
            }
        };
        c_loop += 1;

        let m = Pod::as_data_view(&pb[..]).copy::<LdrModule64>(0);
        if m.base_address != 0 && m.base_address & 0xfff == 0 {
            if m.size_of_image != 0 && m.size_of_image < 0x4000_0000 {
                if m.base_dll_name.length != 0 && m.base_dll_name.length < 0x1000 {
                    stage.push(ModuleStage {
                        va_base: Address::from(m.base_address),
                        va_entry: Address::from(m.entry_point),
                        cb_image: m.size_of_image,
                        tp: ModuleType::Linked,
                        wow64: false,
                        name_buf: Address::from(m.base_dll_name.buffer),
                        name_len: m.base_dll_name.length,
                        full_buf: Address::from(m.full_dll_name.buffer),
                        full_len: m.full_dll_name.length,
                    });
                }
            }
        }

        // follow flink/blink of every list the record is on
        let lists: &[(u64, u64, usize)] = &[
            (
                m.in_load_order_module_list.flink,
                m.in_load_order_module_list.blink,
                0x00,
            ),
            (
                m.in_memory_order_module_list.flink,
                m.in_memory_order_module_list.blink,
                0x10,
            ),
            (
                m.in_initialization_order_module_list.flink,
                m.in_initialization_order_module_list.blink,
                0x20,
            ),
        ];
        let c_lists = if proc.user_only { 3 } else { 1 };
        for &(flink, blink, o_list) in lists.iter().take(c_lists) {
            if flink != 0 && flink & 0x7 == 0 {
                vset_put(
                    &mut all,
                    &mut all_set,
                    &mut try1,
                    Address::from(flink) - o_list,
                );
            }
            if blink != 0 && blink & 0x7 == 0 {
                vset_put(
                    &mut all,
                    &mut all_set,
                    &mut try1,
                    Address::from(blink) - o_list,
                );
            }
        }
    }

    // save prefetch addresses for the next refresh
    if vmm.cfg.volatile_mem && vmm.cfg.process_cache {
        proc.persistent.ldr_prefetch64.set(Arc::new(all));
    }
}

/// 32-bit variant of the loader list walk.
fn initialize32<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &mut StageMap,
    user_only: bool,
) {
    walk_lists32(vmm, proc, stage, user_only);
    if !user_only && !proc.va_peb.is_null() {
        walk_lists32(vmm, proc, stage, true);
    }
}

fn walk_lists32<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &mut StageMap,
    user_only: bool,
) {
    let cb_record = std::mem::size_of::<LdrModule32>();

    if let Some(addrs) = proc.persistent.ldr_prefetch32.get() {
        vmm.prefetch(proc, addrs.iter().copied(), cb_record);
    }

    let mut all: Vec<Address> = Vec::new();
    let mut all_set: HashSet<u64> = HashSet::new();
    let mut try1: Vec<Address> = Vec::new();
    let mut try2: Vec<Address> = Vec::new();

    if user_only {
        if proc.va_peb32 == 0 {
            return;
        }
        let peb: Peb32 = match vmm.read_pod(proc, Address::from(proc.va_peb32)) {
            Ok(p) => p,
            Err(_) => return,
        };
        let ldr: PebLdrData32 = match vmm.read_pod(proc, Address::from(peb.ldr)) {
            Ok(l) => l,
            Err(_) => return,
        };
        let heads = [
            ldr.in_load_order_module_list.flink,
            ldr.in_load_order_module_list.blink,
            ldr.in_memory_order_module_list.flink,
            ldr.in_memory_order_module_list.blink,
            ldr.in_initialization_order_module_list.flink,
            ldr.in_initialization_order_module_list.blink,
        ];
        for &head in heads.iter() {
            if va::uaddr32_4(u64::from(head)) {
                vset_put(&mut all, &mut all_set, &mut try1, Address::from(head));
            }
        }
    } else if vmm.sysinfo.arch == Architecture::X86 {
        let va_list = vmm.sysinfo.va_ps_loaded_module_list;
        if va_list.is_null() {
            return;
        }
        match vmm.read_u32(proc, va_list) {
            Ok(first) if first != 0 => {
                vset_put(&mut all, &mut all_set, &mut try1, Address::from(first))
            }
            _ => return,
        }
    } else {
        return;
    }

    let mut pb = vec![0u8; cb_record];
    let mut f_try1 = true;
    let mut c_loop = 0;
    while stage.len() < MAX_MODULES && c_loop < LOOP_PROTECT_MAX {
        let _va = if f_try1 {
            match try1.pop() {
                Some(va) => {
                    // short reads compare against the declared record
                    // size of the current bitness
                    if vmm.read_ex(proc, va, &mut pb, ReadFlags::FORCECACHE_READ) != cb_record {
                        try2.push(va);
                        continue;
                    }
                    va
                }
                None => {
                    if try2.is_empty() {
                        break;
                    }
                    vmm.prefetch(proc, all.iter().copied(), cb_record);
                    f_try1 = false;
                    continue;
                }
            }
        } else {
            match try2.pop() {
                Some(va) => {
                    if vmm.read(proc, va, &mut pb).is_err() {
                        continue;
                    }
                    va
                }
                None => {
                    if try1.is_empty() {
                        break;
                    }
                    f_try1 = true;
                    continue;
                }
            }
        };
        c_loop += 1;

        let m = Pod::as_data_view(&pb[..]).copy::<LdrModule32>(0);
        if m.base_address != 0 && m.base_address & 0xfff == 0 {
            if m.size_of_image != 0 && m.size_of_image < 0x1000_0000 {
                if m.base_dll_name.length != 0 && m.base_dll_name.length < 0x1000 {
                    stage.push(ModuleStage {
                        va_base: Address::from(m.base_address),
                        va_entry: Address::from(m.entry_point),
                        cb_image: m.size_of_image,
                        tp: ModuleType::Linked,
                        wow64: proc.wow64,
                        name_buf: Address::from(m.base_dll_name.buffer),
                        name_len: m.base_dll_name.length,
                        full_buf: Address::from(m.full_dll_name.buffer),
                        full_len: m.full_dll_name.length,
                    });
                }
            }
        }

        let lists: &[(u32, u32, usize)] = &[
            (
                m.in_load_order_module_list.flink,
                m.in_load_order_module_list.blink,
                0x00,
            ),
            (
                m.in_memory_order_module_list.flink,
                m.in_memory_order_module_list.blink,
                0x08,
            ),
            (
                m.in_initialization_order_module_list.flink,
                m.in_initialization_order_module_list.blink,
                0x10,
            ),
        ];
        let c_lists = if proc.user_only { 3 } else { 1 };
        for &(flink, blink, o_list) in lists.iter().take(c_lists) {
            if flink != 0 && flink & 0x3 == 0 {
                vset_put(
                    &mut all,
                    &mut all_set,
                    &mut try1,
                    Address::from(flink) - o_list,
                );
            }
            if blink != 0 && blink & 0x3 == 0 {
                vset_put(
                    &mut all,
                    &mut all_set,
                    &mut try1,
                    Address::from(blink) - o_list,
                );
            }
        }
    }

    if vmm.cfg.volatile_mem && vmm.cfg.process_cache {
        proc.persistent.ldr_prefetch32.set(Arc::new(all));
    }
}

/// Adds image VADs that are not on the loader lists. A range containing
/// at least one hardware-executable page is assumed to be an unlinked
/// module, otherwise plain mapped image data.
fn initialize_vad<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process, stage: &mut StageMap) {
    if !proc.user_only {
        return;
    }
    let vads = match vmm.vad.as_ref().and_then(|p| p.vad_map(proc.pid)) {
        Some(v) => v,
        None => return,
    };
    let ptes = vmm.pte.as_ref().and_then(|p| p.pte_map(proc.pid));

    let mut i_pte = 0usize;
    for vad in vads.iter().filter(|v| v.image) {
        if stage.contains(vad.va_start) {
            continue;
        }
        let cb_image = match pe::size(vmm, proc, vad.va_start) {
            Some(cb) if cb <= MAX_IMAGE_SIZE_VAD => cb,
            _ => continue,
        };
        // check whether the vad contains a hardware-executable page
        let mut f_x = false;
        if let Some(ptes) = ptes.as_ref() {
            while i_pte < ptes.len()
                && ptes[i_pte].va_base + (ptes[i_pte].pages as usize) * PAGE_SIZE <= vad.va_start
            {
                i_pte += 1;
            }
            let mut j = i_pte;
            while !f_x && j < ptes.len() && ptes[j].va_base < vad.va_end {
                f_x = !ptes[j].nx;
                j += 1;
            }
        }
        stage.push(ModuleStage {
            va_base: vad.va_start,
            va_entry: Address::NULL,
            cb_image,
            tp: if f_x {
                ModuleType::NotLinked
            } else {
                ModuleType::Data
            },
            wow64: proc.wow64 && vad.va_start.as_u64() <= 0xffff_ffff,
            name_buf: Address::NULL,
            name_len: 0,
            full_buf: Address::NULL,
            full_len: 0,
        });
    }
}

/// Merges the persisted injected set with caller supplied bases,
/// validates each via the PE header and re-persists the survivors.
fn initialize_injected<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &mut StageMap,
    injected: Option<&[Address]>,
) {
    let mut candidates: Vec<Address> = proc
        .persistent
        .injected
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
        .clone();
    if let Some(extra) = injected {
        for &va in extra {
            if !candidates.contains(&va) {
                candidates.push(va);
            }
        }
    }
    if candidates.is_empty() {
        return;
    }

    let mut survivors = Vec::new();
    for va_base in candidates {
        if stage.contains(va_base) {
            continue;
        }
        let cb_image = match pe::size(vmm, proc, va_base) {
            Some(cb) if cb <= MAX_IMAGE_SIZE_VAD => cb,
            _ => continue,
        };
        stage.push(ModuleStage {
            va_base,
            va_entry: Address::NULL,
            cb_image,
            tp: ModuleType::Injected,
            wow64: proc.wow64 && va_base.as_u64() <= 0xffff_ffff,
            name_buf: Address::NULL,
            name_len: 0,
            full_buf: Address::NULL,
            full_len: 0,
        });
        survivors.push(va_base);
    }
    if !survivors.is_empty() {
        *proc
            .persistent
            .injected
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = survivors;
    }
}

/// Resolves module names: loader list UNICODE buffers in bulk, export
/// directory name as fallback, synthesized `0x<base>.dll` as last
/// resort. Collision-avoidance prefixes keep display names unique.
fn initialize_name<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    stage: &StageMap,
    pool: &mut StrMapBuilder,
) -> Vec<ModuleEntry> {
    // 1: prefetch header pages and name buffers
    vmm.prefetch(
        proc,
        stage.entries.iter().map(|e| e.va_base),
        PAGE_SIZE,
    );
    vmm.prefetch(
        proc,
        stage
            .entries
            .iter()
            .flat_map(|e| vec![e.name_buf, e.full_buf].into_iter())
            .filter(|va| !va.is_null()),
        MAX_PATH * 2,
    );

    // 2: iterate over entries
    let mut seen: HashMap<String, u32> = HashMap::new();
    let mut out = Vec::with_capacity(stage.entries.len());
    for st in stage.entries.iter() {
        let mut name = String::new();
        let mut full_name = String::new();
        let mut prefix = "";

        // name from ldr list
        if !st.name_buf.is_null() {
            if let Some(s) = unicode::read_wstr(
                vmm,
                proc,
                st.name_buf,
                (st.name_len as usize).min(2 * MAX_PATH),
                ReadFlags::FORCECACHE_READ,
            ) {
                name = util::fix_fs_name(&s);
            }
        }
        // fullname from ldr list
        if !st.full_buf.is_null() {
            if let Some(s) = unicode::read_wstr(
                vmm,
                proc,
                st.full_buf,
                (st.full_len as usize).min(2 * MAX_PATH),
                ReadFlags::FORCECACHE_READ,
            ) {
                full_name = s;
            }
        }
        // name from pe embedded
        if name.is_empty() {
            if let Some(s) = pe::module_name(vmm, proc, st.va_base, None) {
                name = util::fix_fs_name(&s);
            }
        }
        if name.is_empty() {
            name = format!("0x{:x}.dll", st.va_base.as_u64());
            prefix = "_NA-";
        }
        // ntdll.dll rename on wow64 processes to avoid name collisions
        if proc.wow64 && st.va_base.as_u64() > 0xffff_ffff && name == "ntdll.dll" {
            prefix = "_64-";
        }
        match st.tp {
            ModuleType::Data => prefix = "_DATA-",
            ModuleType::NotLinked => prefix = "_NOTLINKED-",
            ModuleType::Injected => prefix = "_INJECTED-",
            ModuleType::Linked => {}
        }

        let mut display = format!("{}{}", prefix, name);
        let key = display.to_ascii_lowercase();
        let n = seen.entry(key).or_insert(0);
        *n += 1;
        if *n > 1 {
            display = format!("{}-{}", display, *n);
        }

        if full_name.is_empty() {
            full_name = name;
        }

        out.push(ModuleEntry {
            va_base: st.va_base,
            va_entry: st.va_entry,
            cb_image: st.cb_image,
            tp: st.tp,
            wow64: st.wow64,
            name: pool.push(&display),
            full_name: pool.push(&full_name),
            cb_file_raw: 0,
            c_sections: 0,
            c_iat: 0,
            c_eat: 0,
        });
    }
    out
}

/// Derives raw file size, section count and import/export counts from
/// the PE headers in two batched prefetch rounds.
fn initialize_size<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    entries: &mut [ModuleEntry],
) {
    // prefetch MZ headers
    vmm.prefetch(proc, entries.iter().map(|e| e.va_base), PAGE_SIZE);

    let mut exp_dirs: Vec<Address> = Vec::new();
    let mut pb = vec![0u8; PAGE_SIZE];
    for e in entries.iter_mut() {
        if vmm.read_ex(proc, e.va_base, &mut pb, ReadFlags::FORCECACHE_READ) != PAGE_SIZE {
            continue;
        }
        let hdr = match pe::PeHeader::verify(&pb) {
            Some(h) => h,
            None => continue,
        };
        e.cb_file_raw = hdr.file_raw_size();
        e.c_sections = u32::from(hdr.number_of_sections());
        e.c_iat = hdr.iat_count();
        if let Some(rva) = pe::directory_rva(&pb, pe::IMAGE_DIRECTORY_ENTRY_EXPORT) {
            exp_dirs.push(e.va_base + rva as usize);
        }
    }

    // fetch number of exports (EAT)
    vmm.prefetch(
        proc,
        exp_dirs.into_iter(),
        std::mem::size_of::<pelite::image::IMAGE_EXPORT_DIRECTORY>(),
    );
    for e in entries.iter_mut() {
        if vmm.read_ex(proc, e.va_base, &mut pb, ReadFlags::FORCECACHE_READ) != PAGE_SIZE {
            continue;
        }
        e.c_eat = pe::eat_count(vmm, proc, e.va_base, &pb, ReadFlags::FORCECACHE_READ);
    }
}

fn initialize_hash(entries: &[ModuleEntry], pool: &StrMapBuilder) -> Vec<u64> {
    let mut hash: Vec<u64> = entries
        .iter()
        .enumerate()
        .map(|(i, e)| ((i as u64) << 32) | u64::from(util::hash32_name_fs(pool.peek(e.name))))
        .collect();
    hash.sort_unstable_by_key(|&h| (h & 0xffff_ffff, h));
    hash
}

/// Builds the module map of a process. Returns an empty map when
/// nothing could be discovered.
pub(crate) fn initialize<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    injected: Option<&[Address]>,
) -> ModuleMap {
    let mut stage = StageMap::default();

    // fetch modules: "ordinary" linked lists
    let f32_side = vmm.sysinfo.arch == Architecture::X86
        || (vmm.sysinfo.arch == Architecture::X64 && proc.wow64);
    if f32_side {
        initialize32(vmm, proc, &mut stage, proc.user_only);
    }
    if vmm.sysinfo.arch == Architecture::X64 {
        initialize64(vmm, proc, &mut stage, proc.user_only);
    }

    // fetch modules: VADs and injected bases
    initialize_vad(vmm, proc, &mut stage);
    initialize_injected(vmm, proc, &mut stage, injected);

    trace!("pid {}: {} modules staged", proc.pid, stage.len());

    let mut pool = StrMapBuilder::new();
    let mut entries = initialize_name(vmm, proc, &stage, &mut pool);
    initialize_size(vmm, proc, &mut entries);
    let hash = initialize_hash(&entries, &pool);

    ModuleMap {
        entries,
        pool: pool.finish(),
        hash,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use memscope_core::mem::DummyMemory;

    const VA_PEB64: u64 = 0x0000_7ff7_1000_0000;
    const VA_LDR64: u64 = 0x0000_7ff7_1000_2000;
    const VA_ENTRY64: u64 = 0x0000_7ff7_1000_3000;
    const VA_PEB32: u32 = 0x7f10_0000;
    const VA_LDR32: u64 = 0x7f10_2000;
    const VA_ENTRY32: u64 = 0x7f10_3000;
    const NTDLL64_BASE: u64 = 0x1_8000_0000;
    const NTDLL32_BASE: u64 = 0x7700_0000;

    /// WoW64 process image: a 64-bit and a 32-bit ntdll on their
    /// respective loader lists.
    fn wow64_image() -> DummyMemory {
        let mut mem = DummyMemory::new();

        // 64-bit side
        mem.map(Address::from(VA_PEB64), 0x1000);
        mem.write_u64(Address::from(VA_PEB64 + 0x18), VA_LDR64);
        mem.map(Address::from(VA_LDR64), 0x1000);
        // all three lists point at the entry (with the in-record shift)
        mem.write_u64(Address::from(VA_LDR64 + 0x10), VA_ENTRY64);
        mem.write_u64(Address::from(VA_LDR64 + 0x18), VA_ENTRY64);
        mem.write_u64(Address::from(VA_LDR64 + 0x20), VA_ENTRY64 + 0x10);
        mem.write_u64(Address::from(VA_LDR64 + 0x28), VA_ENTRY64 + 0x10);
        mem.write_u64(Address::from(VA_LDR64 + 0x30), VA_ENTRY64 + 0x20);
        mem.write_u64(Address::from(VA_LDR64 + 0x38), VA_ENTRY64 + 0x20);
        let name64 = 0x0000_7ff7_1000_4000u64;
        let full64 = 0x0000_7ff7_1000_4100u64;
        mem.map(Address::from(VA_ENTRY64), 0x100);
        mem.write_u64(Address::from(VA_ENTRY64), VA_LDR64 + 0x10); // flink back to head
        mem.write_u64(Address::from(VA_ENTRY64 + 8), VA_LDR64 + 0x10);
        mem.write_u64(Address::from(VA_ENTRY64 + 0x30), NTDLL64_BASE);
        mem.write_u64(Address::from(VA_ENTRY64 + 0x38), NTDLL64_BASE + 0x1000);
        mem.write_u32(Address::from(VA_ENTRY64 + 0x40), 0x001f_0000); // SizeOfImage
        mem.write_u16(Address::from(VA_ENTRY64 + 0x48), 36); // FullDllName
        mem.write_u16(Address::from(VA_ENTRY64 + 0x4a), 38);
        mem.write_u64(Address::from(VA_ENTRY64 + 0x50), full64);
        mem.write_u16(Address::from(VA_ENTRY64 + 0x58), 18); // BaseDllName
        mem.write_u16(Address::from(VA_ENTRY64 + 0x5a), 20);
        mem.write_u64(Address::from(VA_ENTRY64 + 0x60), name64);
        mem.write_utf16(Address::from(name64), "ntdll.dll");
        mem.write_utf16(Address::from(full64), "C:\\Windows\\System32\\ntdll.dll");

        // 32-bit side
        mem.map(Address::from(u64::from(VA_PEB32)), 0x1000);
        mem.write_u32(Address::from(u64::from(VA_PEB32) + 0x0c), VA_LDR32 as u32);
        mem.map(Address::from(VA_LDR32), 0x1000);
        mem.write_u32(Address::from(VA_LDR32 + 0x0c), VA_ENTRY32 as u32);
        mem.write_u32(Address::from(VA_LDR32 + 0x10), VA_ENTRY32 as u32);
        let name32 = 0x7f10_4000u64;
        mem.map(Address::from(VA_ENTRY32), 0x100);
        mem.write_u32(Address::from(VA_ENTRY32), (VA_LDR32 + 0x0c) as u32);
        mem.write_u32(Address::from(VA_ENTRY32 + 4), (VA_LDR32 + 0x0c) as u32);
        mem.write_u32(Address::from(VA_ENTRY32 + 0x18), NTDLL32_BASE as u32);
        mem.write_u32(Address::from(VA_ENTRY32 + 0x1c), (NTDLL32_BASE + 0x1000) as u32);
        mem.write_u32(Address::from(VA_ENTRY32 + 0x20), 0x0018_0000);
        mem.write_u16(Address::from(VA_ENTRY32 + 0x2c), 18); // BaseDllName
        mem.write_u16(Address::from(VA_ENTRY32 + 0x2e), 20);
        mem.write_u32(Address::from(VA_ENTRY32 + 0x30), name32 as u32);
        mem.write_utf16(Address::from(name32), "ntdll.dll");
        mem
    }

    fn wow64_vmm() -> (crate::vmm::Vmm<DummyMemory>, std::sync::Arc<Win32Process>) {
        let si = sysinfo_x64(10, 19041);
        let vmm = vmm_with(wow64_image(), si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, VA_PEB64, VA_PEB32, true, vec![]),
            ],
        );
        (vmm, procs[1].clone())
    }

    #[test]
    fn test_wow64_ntdll_naming() {
        let (vmm, proc) = wow64_vmm();
        let map = vmm.module_map(&proc);

        assert_eq!(map.len(), 2);
        // the 32-bit ntdll keeps its name, the 64-bit side is prefixed
        let m32 = map.by_name("ntdll.dll").expect("32-bit ntdll");
        assert_eq!(m32.va_base, Address::from(NTDLL32_BASE));
        assert!(m32.wow64);
        let m64 = map.by_name("_64-ntdll.dll").expect("64-bit ntdll");
        assert_eq!(m64.va_base, Address::from(NTDLL64_BASE));
        assert!(!m64.wow64);
        assert_eq!(map.full_name(m64), "C:\\Windows\\System32\\ntdll.dll");

        // no duplicate display names, and base/size invariants hold
        let mut names: Vec<&str> = map.entries.iter().map(|e| map.name(e)).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), map.len());
        for e in map.entries.iter() {
            assert_eq!(e.va_base.as_u64() & 0xfff, 0);
            assert!(e.cb_image > 0);
        }
    }

    #[test]
    fn test_discovery_is_idempotent() {
        let (vmm, proc) = wow64_vmm();
        let a = initialize(&vmm, &proc, None);
        let b = initialize(&vmm, &proc, None);
        assert_eq!(a.len(), b.len());
        for (ea, eb) in a.entries.iter().zip(b.entries.iter()) {
            assert_eq!(ea.va_base, eb.va_base);
            assert_eq!(ea.cb_image, eb.cb_image);
            assert_eq!(a.name(ea), b.name(eb));
            assert_eq!(ea.tp, eb.tp);
        }
    }

    #[test]
    fn test_hash_lookup_sorted() {
        let (vmm, proc) = wow64_vmm();
        let map = vmm.module_map(&proc);
        for w in map.hash.windows(2) {
            assert!(w[0] & 0xffff_ffff <= w[1] & 0xffff_ffff);
        }
        assert!(map.by_name("NTDLL.DLL").is_some()); // case insensitive
        assert!(map.by_name("missing.dll").is_none());
    }

    #[test]
    fn test_injected_module_persists() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = wow64_image();
        let injected_base = 0x0000_7ff7_2000_0000u64;
        write_pe64(&mut mem, injected_base, 0x5000, None);
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", 0xffff_8000_0011_0000, VA_PEB64, VA_PEB32, true, vec![]),
            ],
        );
        let proc = &procs[1];

        let map = vmm.module_map_with_injected(proc, Some(&[Address::from(injected_base)]));
        let inj = map
            .entries
            .iter()
            .find(|e| e.tp == ModuleType::Injected)
            .expect("injected module");
        assert_eq!(inj.va_base, Address::from(injected_base));
        assert!(map.name(inj).starts_with("_INJECTED-"));

        // the injected base survives in the sidecar and reappears on a
        // rebuild without the caller supplying it again
        let rebuilt = initialize(&vmm, proc, None);
        assert!(rebuilt
            .entries
            .iter()
            .any(|e| e.tp == ModuleType::Injected && e.va_base == Address::from(injected_base)));
    }
}
