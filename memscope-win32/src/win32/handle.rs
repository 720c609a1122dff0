/*!
Handle table reconstruction.

The core pass spiders the 0-2 level handle table pages and records
object addresses, access masks and handle values. The text pass peeks
into each object: it decodes the type index, scans backwards for the
pool tag and resolves type-specific details (registry key paths,
referenced PIDs/TIDs, file names and sizes) with batched prefetches —
worst case close to one page per handle otherwise.
*/

use crate::util::{self, va, MAX_PATH};
use crate::vmm::Vmm;
use crate::win32::maps::{HandleEntry, HandleInfo, HandleMap};
use crate::win32::objects;
use crate::win32::process::Win32Process;
use crate::strmap::StrMapBuilder;

use std::sync::Arc;

use hashbrown::HashMap;
use log::trace;

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::{Address, PAGE_SIZE};

/// Handle map allocation cap.
const MAX_HANDLES: usize = 256 * 1024;

/// Spiders one level of the table hierarchy.
fn spider_tables<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Win32Process,
    va_table: Address,
    level2: bool,
    tables: &mut Vec<Address>,
    max_tables: usize,
) {
    let f32 = vmm.sysinfo.f32();
    let mut pb = vec![0u8; PAGE_SIZE];
    if vmm.read(sys, va_table, &mut pb).is_err() {
        return;
    }
    let c_entries = if f32 { 0x400 } else { 0x200 };
    for i in 0..c_entries {
        let p = va::ptr(f32, &pb, i * if f32 { 4 } else { 8 });
        if !va::kaddr_page(f32, p) {
            return;
        }
        if level2 {
            spider_tables(vmm, sys, Address::from(p), false, tables, max_tables);
        } else {
            tables.push(Address::from(p));
        }
        if tables.len() >= max_tables {
            return;
        }
    }
}

/// Decodes one 64-bit table slot into the object address, honoring the
/// Win8/Win8.1 packed layouts.
#[inline]
fn slot_to_va64(build: u32, raw: u64) -> u64 {
    if build >= 9600 {
        // Win8.1 or later
        0xffff_0000_0000_0000 | (raw >> 16)
    } else if build >= 9200 {
        // Win8
        0xffff_f800_0000_0000 | (raw >> 19)
    } else {
        raw
    }
}

/// Counts valid handle slots across all leaf pages.
fn count_handles<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Win32Process,
    tables: &[Address],
) -> usize {
    let f32 = vmm.sysinfo.f32();
    let build = vmm.sysinfo.version_build;
    vmm.prefetch(sys, tables.iter().copied(), PAGE_SIZE);
    let mut pb = vec![0u8; PAGE_SIZE];
    let mut c_handles = 0;
    for &va_table in tables {
        if vmm.read(sys, va_table, &mut pb).is_err() {
            continue;
        }
        if f32 {
            for i in 1..512 {
                if va::kaddr32(u64::from(va::dw(&pb, i * 8))) {
                    c_handles += 1;
                }
            }
        } else {
            for i in 1..256 {
                let mut v = va::qw(&pb, i * 16);
                if build >= 9200 {
                    v = 0xffff_0000_0000_0000 | (v >> 16);
                }
                if va::kaddr64(v) {
                    c_handles += 1;
                }
            }
        }
    }
    c_handles
}

/// Reads one leaf page into handle entries.
fn read_handle_table<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Win32Process,
    proc: &Win32Process,
    va_table: Address,
    base_handle_id: u32,
    entries: &mut Vec<HandleEntry>,
) {
    let f32 = vmm.sysinfo.f32();
    let build = vmm.sysinfo.version_build;
    let mut pb = vec![0u8; PAGE_SIZE];
    if vmm.read(sys, va_table, &mut pb).is_err() {
        return;
    }
    if f32 {
        for i in 1..512usize {
            if entries.len() >= MAX_HANDLES {
                break;
            }
            let v = u64::from(va::dw(&pb, i * 8)) & !3;
            if !va::kaddr32(v) {
                continue;
            }
            entries.push(HandleEntry {
                va_object: Address::from((v & !7) + 0x18),
                granted_access: va::dw(&pb, i * 8 + 4) & 0x00ff_ffff,
                handle: base_handle_id + ((i as u32) << 2),
                pid: proc.pid,
                ..Default::default()
            });
        }
    } else {
        for i in 1..256usize {
            if entries.len() >= MAX_HANDLES {
                break;
            }
            let v = slot_to_va64(build, va::qw(&pb, i * 16));
            if !va::kaddr64(v) {
                continue;
            }
            if v & 0x0000_07ff_ffff_ff00 == 0 {
                continue; // free handle
            }
            entries.push(HandleEntry {
                va_object: Address::from((v & !7) + 0x30),
                granted_access: (va::qw(&pb, i * 16 + 8) & 0x00ff_ffff) as u32,
                handle: base_handle_id + ((i as u32) << 2),
                pid: proc.pid,
                ..Default::default()
            });
        }
    }
}

/// Builds the core handle map: object addresses, access masks and
/// handle values. On failure an empty snapshot is returned.
pub(crate) fn initialize_core<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process) -> HandleMap {
    initialize_core_work(vmm, proc).unwrap_or_default()
}

fn initialize_core_work<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
) -> Option<HandleMap> {
    let f32 = vmm.sysinfo.f32();
    let build = vmm.sysinfo.version_build;
    let sys = vmm.system_process().ok()?;
    let po = vmm.eprocess_offsets();

    let va_table = va::ptr(f32, &proc.eprocess_bytes, po.object_table as usize);
    if !va::kaddr(f32, va_table) {
        return None;
    }
    let va_table = Address::from(va_table);

    // read the pool header in front of the table and accept on a
    // prepended 'Obtb' tag or a page-aligned table
    let mut pb = [0u8; 0x20];
    vmm.read(&sys, va_table - 0x10, &mut pb).ok()?;
    if !util::pool_tag_prepended(f32, &pb[..0x10], b"Obtb") && !va::kaddr_page(f32, va_table.as_u64())
    {
        return None;
    }

    // decode TableCode: low 3 bits are the level count, the rest the
    // root page
    let o_table_code = if build < 9200 { 0 } else { 8 };
    let code = va::ptr(f32, &pb[0x10..], o_table_code);
    let level = (code & 7) as u8;
    let va_root = code & !7;
    if level > 2 || !va::kaddr_page(f32, va_root) {
        return None;
    }

    let max_tables = if f32 { 2048 } else { 1024 };
    let mut tables: Vec<Address> = Vec::new();
    if level == 0 {
        tables.push(Address::from(va_root));
    } else {
        spider_tables(
            vmm,
            &sys,
            Address::from(va_root),
            level == 2,
            &mut tables,
            max_tables,
        );
    }

    // count handles, allocate and fill
    let c_handles = count_handles(vmm, &sys, &tables);
    if c_handles == 0 {
        return None;
    }
    let c_handles = c_handles.min(MAX_HANDLES);
    let mut entries = Vec::with_capacity(c_handles);
    let ids_per_table = if f32 { 2048 } else { 1024 };
    for (i, &va_table) in tables.iter().enumerate() {
        if entries.len() >= c_handles {
            break;
        }
        read_handle_table(vmm, &sys, proc, va_table, (i * ids_per_table) as u32, &mut entries);
    }

    trace!("pid {}: {} handles", proc.pid, entries.len());
    Some(HandleMap {
        entries,
        pool: None,
    })
}

#[inline]
fn pool_header_candidate(build: u32, dw: u32) -> u32 {
    let mut i = 0;
    while i < 32 {
        let ch = (dw >> i) as u8;
        let ok = ch.is_ascii_lowercase() || ch.is_ascii_uppercase() || ch == b' ';
        if !ok {
            if i == 24 && build <= 9601 {
                // last char usually A-Z in win7
                return 0x2000_0000 | (dw & 0x00ff_ffff);
            }
            return 0;
        }
        i += 8;
    }
    dw
}

/// Scans backwards for a plausible pool tag in front of an object
/// header. Returns the tag and its offset within the window.
fn pool_header_scan(build: u32, f32: bool, pb: &[u8]) -> (u32, usize) {
    let (mut i, stride) = if f32 { (0x40, 8) } else { (0x60, 0x10) };
    while i > 0 {
        i -= stride;
        let tag = pool_header_candidate(build, va::dw(pb, i + 4));
        if tag != 0 {
            return (tag, i + 4);
        }
    }
    (0, 0)
}

#[derive(Default, Clone, Copy)]
struct TextStage {
    /// UNICODE_STRING length and buffer captured from the object body.
    str_len: u32,
    str_buf: u64,
    /// `_SECTION_OBJECT_POINTERS`, then `_SHARED_CACHE_MAP`/`_CONTROL_AREA`.
    va_section: u64,
    file_stage: u8,
}

const FILE_STAGE_SECTION_PTRS: u8 = 1;
const FILE_STAGE_SIZE: u8 = 2;

#[derive(Default)]
struct RegHelper {
    va_kcb: u64,
    va_hive: u64,
    ra_cell: u32,
    name: Option<String>,
}

/// Builds the enriched handle map with object names and type specific
/// information. `core` supplies the core entries.
pub(crate) fn initialize_text<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    core: &Arc<HandleMap>,
) -> HandleMap {
    let f32 = vmm.sysinfo.f32();
    let build = vmm.sysinfo.version_build;
    let po = vmm.eprocess_offsets();
    let ot = vmm.ethread_offsets();
    let sys = match vmm.system_process() {
        Ok(sys) => sys,
        Err(_) => return HandleMap::default(),
    };

    let mut entries: Vec<HandleEntry> = core.entries.clone();
    let mut stage: Vec<TextStage> = vec![TextStage::default(); entries.len()];
    let mut reg_helpers: HashMap<u64, RegHelper> = HashMap::new();

    let cid_off = ot.map(|o| o.cid as usize).unwrap_or(0);
    let tp_thread = objects::thread_type_index(vmm);
    let cb_object_read = {
        let cb = std::cmp::max(po.pid as usize + 8, cid_off + 0x20);
        0x90 + std::cmp::max(0x70, cb)
    };
    // window in front of the object: name info, pool headers, header
    let o_body = if f32 { 0x60 } else { 0x90 };
    let o_header = if f32 { 0x48 } else { 0x60 };
    let o_string = if f32 { 0x3c } else { 0x48 };

    // 1: cache prefetch object data
    vmm.prefetch(
        &sys,
        entries.iter().map(|e| e.va_object - 0x90),
        cb_object_read,
    );

    let mut prefetch: Vec<Address> = Vec::new();
    let mut reg_prefetch: Vec<Address> = Vec::new();

    // 2: read and interpret the object headers
    let mut pb = vec![0u8; cb_object_read];
    for (i, e) in entries.iter_mut().enumerate() {
        let cb_read = vmm.read_ex(
            &sys,
            e.va_object - o_body,
            &mut pb,
            ReadFlags::ZEROPAD_ON_FAIL | ReadFlags::FORCECACHE_READ,
        );
        if cb_read < o_body {
            continue;
        }

        // type index (decoded), pool tag and remaining header values
        let hdr_size = if f32 { 0x18 } else { 0x30 };
        let o_type_index = o_header + if f32 { 0x0c } else { 0x18 };
        e.type_index =
            objects::type_index_decode(vmm, e.va_object - hdr_size, pb[o_type_index]);
        let (pool_tag, o_pool_hdr) = pool_header_scan(build, f32, &pb);
        e.pool_tag = pool_tag;
        e.handle_count = va::ptr_dual(f32, &pb, o_header + 4, o_header + 8);
        e.pointer_count = va::ptr_dual(f32, &pb, o_header, o_header);
        e.va_create_info = Address::from(va::ptr_dual(
            f32,
            &pb,
            o_header + 0x10,
            o_header + 0x20,
        ));
        e.va_security_descriptor = Address::from(va::ptr_dual(
            f32,
            &pb,
            o_header + 0x14,
            o_header + 0x28,
        ));
        if pool_tag == 0 {
            continue;
        }

        let mut us: Option<(u32, u64, u32)> = None; // length, buffer, maxlength
        if util::pool_tag3(pool_tag, b"Key") {
            // registry key: stash the _CM_KEY_CONTROL_BLOCK pointer
            let va_kcb = va::ptr_dual(f32, &pb, o_body + 4, o_body + 8);
            if !va::kaddr(f32, va_kcb) {
                continue;
            }
            reg_helpers.entry(e.va_object.as_u64()).or_insert_with(|| {
                reg_prefetch.push(Address::from(va_kcb));
                RegHelper {
                    va_kcb,
                    ..Default::default()
                }
            });
        } else if util::pool_tag3(pool_tag, b"Pro") {
            // process: PID at the known EPROCESS offset
            e.info = HandleInfo::Process {
                pid: va::dw(&pb, o_body + po.pid as usize),
            };
        } else if util::pool_tag3(pool_tag, b"Thr") {
            // thread: TID from the client id; when the type table knows
            // the Thread index, the decoded type must agree
            let type_ok = tp_thread
                .map(|tp| tp == e.type_index)
                .unwrap_or(true);
            if cid_off != 0 && type_ok {
                let tid = va::dw(&pb, o_body + cid_off + if f32 { 4 } else { 8 });
                if tid != 0 {
                    e.info = HandleInfo::Thread { tid };
                }
            }
        } else if util::pool_tag3(pool_tag, b"Fil") {
            // file object: FileName string plus the section object
            // pointers for the later file size probe
            let o_file_name = o_body + if f32 { 0x30 } else { 0x58 };
            us = Some((
                u32::from(va::w(&pb, o_file_name)),
                va::ptr_dual(f32, &pb, o_file_name + 4, o_file_name + 8),
                u32::from(va::w(&pb, o_file_name + 2)),
            ));
            let va_sect = va::ptr_dual(f32, &pb, o_body + 0x14, o_body + 0x28);
            if va::kaddr_ptr(f32, va_sect) {
                stage[i].va_section = va_sect;
                stage[i].file_stage = FILE_STAGE_SECTION_PTRS;
                prefetch.push(Address::from(va_sect));
            }
        } else if o_pool_hdr <= if f32 { 0x34 } else { 0x38 } {
            // other types carry an OBJECT_HEADER_NAME_INFO string close
            // in front of the object header
            us = Some((
                u32::from(va::w(&pb, o_string)),
                va::ptr_dual(f32, &pb, o_string + 4, o_string + 8),
                u32::from(va::w(&pb, o_string + 2)),
            ));
        }

        if let Some((len, buf, max_len)) = us {
            let ok = len > 2
                && len & 1 == 0
                && (len as usize) < 2 * MAX_PATH
                && len <= max_len
                && va::kaddr(f32, buf);
            if ok {
                stage[i].str_len = len;
                stage[i].str_buf = buf;
                prefetch.push(Address::from(buf));
            }
        }
    }

    // 3: resolve registry key names through the registry engine
    vmm.prefetch(&sys, reg_prefetch.into_iter(), 0x30);
    resolve_registry_keys(vmm, &sys, f32, build, &mut reg_helpers);

    // 4: create the text descriptions
    let mut pool = StrMapBuilder::new();
    vmm.prefetch(&sys, prefetch.into_iter(), 2 * MAX_PATH);
    let mut prefetch_size: Vec<Address> = Vec::new();
    for (i, e) in entries.iter_mut().enumerate() {
        if util::pool_tag3(e.pool_tag, b"Key") {
            if let Some(helper) = reg_helpers.get(&e.va_object.as_u64()) {
                if helper.va_hive != 0 {
                    e.info = HandleInfo::Registry {
                        va_hive: Address::from(helper.va_hive),
                        cell: helper.ra_cell,
                    };
                    let text = match helper.name.as_deref() {
                        Some(name) => {
                            format!("[{:x}:{:08x}] {}", helper.va_hive, helper.ra_cell, name)
                        }
                        None => format!("[{:x}:{:08x}]", helper.va_hive, helper.ra_cell),
                    };
                    e.text = pool.push(&text);
                }
            }
        } else if let HandleInfo::Process { pid } = e.info {
            if pid < 99999 {
                if let Some(p) = vmm.process_get(pid) {
                    e.text = pool.push(&format!("PID {} - {}", pid, p.name));
                }
            }
        } else if let HandleInfo::Thread { tid } = e.info {
            if tid != 0 && tid < 99999 {
                e.text = pool.push(&format!("TID {}", tid));
            }
        } else if stage[i].str_buf != 0 {
            if let Some(s) = crate::win32::unicode::read_wstr(
                vmm,
                &sys,
                Address::from(stage[i].str_buf),
                stage[i].str_len as usize,
                ReadFlags::FORCECACHE_READ,
            ) {
                e.text = pool.push(&s);
            }
        }

        // resolve _SECTION_OBJECT_POINTERS into the shared cache map or
        // the control area
        if stage[i].file_stage == FILE_STAGE_SECTION_PTRS {
            let mut pb18 = [0u8; 0x18];
            if vmm.read_ex(
                &sys,
                Address::from(stage[i].va_section),
                &mut pb18,
                ReadFlags::FORCECACHE_READ,
            ) == 0x18
            {
                let shared = va::ptr_dual(f32, &pb18, 4, 8);
                let data = va::ptr_dual(f32, &pb18, 0, 0);
                let va = if va::kaddr_ptr(f32, shared) {
                    shared
                } else if va::kaddr_ptr(f32, data) {
                    data
                } else {
                    0
                };
                if va != 0 {
                    stage[i].va_section = va;
                    stage[i].file_stage = FILE_STAGE_SIZE;
                    e.info = HandleInfo::File { cb: 0 };
                    prefetch_size.push(Address::from(va) - 0x10);
                }
            }
        }
    }

    // 5: two-stage file size probe
    file_size_helper(vmm, &sys, f32, &mut entries, &mut stage, prefetch_size);

    let pool = pool.finish();
    HandleMap {
        entries,
        pool: Some(pool),
    }
}

/// Resolves hive address and cell index from the prefetched
/// `_CM_KEY_CONTROL_BLOCK`s, then queries the registry engine for key
/// names.
fn resolve_registry_keys<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Win32Process,
    f32: bool,
    build: u32,
    helpers: &mut HashMap<u64, RegHelper>,
) {
    for helper in helpers.values_mut() {
        let mut pb = [0u8; 0x30];
        if vmm.read_ex(
            sys,
            Address::from(helper.va_kcb),
            &mut pb,
            ReadFlags::FORCECACHE_READ,
        ) != 0x30
        {
            continue;
        }
        let (va_hive, ra_cell) = if f32 {
            if (7600..=10586).contains(&build) {
                (u64::from(va::dw(&pb, 0x14)), va::dw(&pb, 0x18))
            } else {
                (u64::from(va::dw(&pb, 0x10)), va::dw(&pb, 0x14))
            }
        } else if build <= 6002 || (14393..=17763).contains(&build) {
            (va::qw(&pb, 0x18), va::dw(&pb, 0x20))
        } else {
            (va::qw(&pb, 0x20), va::dw(&pb, 0x28))
        };
        if !va::kaddr(f32, va_hive) {
            continue;
        }
        if ra_cell == 0 || ra_cell & 0x7fff_ffff > 0x2000_0000 {
            continue;
        }
        helper.va_hive = va_hive;
        helper.ra_cell = ra_cell;
    }

    if let Some(registry) = vmm.registry.as_deref() {
        for helper in helpers.values_mut() {
            if helper.va_hive == 0 {
                continue;
            }
            if let Some(hive) = registry.hive_by_address(Address::from(helper.va_hive)) {
                if let Some(key) = registry.key_by_cell(hive.va, helper.ra_cell) {
                    helper.name = Some(key.name);
                }
            }
        }
    }
}

/// Fetches file sizes: `_SHARED_CACHE_MAP.FileSize` via pool tag `CcSc`,
/// else `_CONTROL_AREA` -> `_SEGMENT.SizeOfSegment` via `MmCa`/`MmSm`.
fn file_size_helper<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Win32Process,
    f32: bool,
    entries: &mut [HandleEntry],
    stage: &mut [TextStage],
    prefetch: Vec<Address>,
) {
    const O_SHARED_CACHE_MAP_FILE_SIZE: usize = 0x08;
    const O_CONTROL_AREA_SEGMENT: usize = 0;
    let o_segment_size = if f32 { 0x10 } else { 0x18 };

    if prefetch.is_empty() {
        return;
    }
    // 1: fetch, if required, _SHARED_CACHE_MAP / _CONTROL_AREA
    vmm.prefetch(sys, prefetch.into_iter(), 0x20);
    let mut prefetch_segment: Vec<Address> = Vec::new();
    for (i, e) in entries.iter_mut().enumerate() {
        if stage[i].file_stage != FILE_STAGE_SIZE {
            continue;
        }
        let mut pb = [0u8; 0x20];
        if vmm.read_ex(
            sys,
            Address::from(stage[i].va_section) - 0x10,
            &mut pb,
            ReadFlags::FORCECACHE_READ,
        ) != 0x20
        {
            continue;
        }
        if util::pool_tag_prepended(f32, &pb[..0x10], b"CcSc") {
            let cb = va::qw(&pb, 0x10 + O_SHARED_CACHE_MAP_FILE_SIZE);
            e.info = HandleInfo::File {
                cb: std::cmp::min(cb, 0xffff_ffff) as u32,
            };
            stage[i].file_stage = 0;
            continue;
        }
        if util::pool_tag_prepended(f32, &pb[..0x10], b"MmCa") {
            let va_segment = va::ptr(f32, &pb, 0x10 + O_CONTROL_AREA_SEGMENT);
            if va::kaddr_pool(f32, va_segment) {
                stage[i].va_section = va_segment;
                prefetch_segment.push(Address::from(va_segment) - 0x10);
                continue;
            }
        }
        stage[i].file_stage = 0;
    }

    // 2: fetch, if required, _SEGMENT
    if prefetch_segment.is_empty() {
        return;
    }
    vmm.prefetch(sys, prefetch_segment.into_iter(), 0x30);
    for (i, e) in entries.iter_mut().enumerate() {
        if stage[i].file_stage != FILE_STAGE_SIZE {
            continue;
        }
        let mut pb = [0u8; 0x30];
        if vmm.read_ex(
            sys,
            Address::from(stage[i].va_section) - 0x10,
            &mut pb,
            ReadFlags::FORCECACHE_READ,
        ) != 0x30
        {
            continue;
        }
        if util::pool_tag_prepended(f32, &pb[..0x10], b"MmSm") {
            let cb = std::cmp::min(va::qw(&pb, 0x10 + o_segment_size), 0xffff_ffff) as u32;
            let prev = match e.info {
                HandleInfo::File { cb } => cb,
                _ => 0,
            };
            e.info = HandleInfo::File {
                cb: if prev != 0 { std::cmp::min(prev, cb) } else { cb },
            };
        }
    }
}
