/*!
EPROCESS list enumeration and the process table rebuild.

The walk runs in the SYSTEM process context. The pre callback collects
the DTB physical pages of all records for one global prefetch before
the post callbacks materialize processes; afterwards no-link processes
found through the SYSTEM handle table are re-run through the same post
path and the SeAuditProcessCreationInfo long paths are resolved in one
batch.
*/

use crate::error::{Error, Result};
use crate::listwalk::{list_traverse_prefetch, ListWalkLinks};
use crate::offsets::{locator32, locator64, EprocessOffsets};
use crate::util::{path_split_last, va};
use crate::vmm::Vmm;
use crate::win32::maps::HandleMap;
use crate::win32::process::{NewProcess, ProcessParameters, Win32Process};
use crate::win32::{objects, unicode};

use std::cell::RefCell;
use std::sync::{Arc, PoisonError};

use hashbrown::HashSet;
use log::{debug, error, info, trace};

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

/// Enumeration is aborted once this many PID collisions are seen.
const MAX_PROCESS_COLLISIONS: u32 = 8;

struct EnumCtx {
    c_proc: u32,
    c_collisions: u32,
    f_no_link: bool,
    f_abort: bool,
    prefetch_dtb: Option<Vec<Address>>,
    created: Vec<Arc<Win32Process>>,
}

/// Walks the EPROCESS list, publishes the process table and returns
/// the quality gate (more than 10 processes enumerated).
pub(crate) fn enumerate<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Arc<Win32Process>,
    total_refresh: bool,
    no_link: Option<Vec<Address>>,
) -> Result<bool> {
    let f32 = vmm.sysinfo.f32();

    // retrieve offsets: pattern locator first, debug symbols second
    let mut po = vmm.eprocess_offsets();
    if !po.valid {
        po = if f32 {
            locator32::locate(vmm, sys)
        } else {
            locator64::locate(vmm, sys)
        };
        po.log_print();
        if !po.valid {
            info!("unable to fuzz eprocess offsets - trying debug symbols");
            if let Some(sym) = vmm.symbols.as_deref() {
                po = EprocessOffsets::from_symbols(sym, f32);
            }
        }
        if !po.valid {
            error!("unable to locate eprocess offsets");
            return Err(Error::Offsets("locator and symbol fallback both failed"));
        }
        vmm.set_eprocess_offsets(po);
    }

    debug!(
        "system dtb: {:x} eprocess: {:x}",
        sys.dtb, sys.va_eprocess
    );

    let ctx = RefCell::new(EnumCtx {
        c_proc: 0,
        c_collisions: 0,
        f_no_link: false,
        f_abort: false,
        prefetch_dtb: Some(Vec::new()),
        created: Vec::new(),
    });

    let mut pre = |va: Address,
                   pb: &[u8],
                   va_flink: Address,
                   va_blink: Address,
                   _extra: &mut Vec<Address>|
     -> ListWalkLinks {
        if va::kaddr_pool(f32, va.as_u64()) {
            let mut c = ctx.borrow_mut();
            if let Some(set) = c.prefetch_dtb.as_mut() {
                set.push(Address::from(va::ptr(f32, pb, po.dtb as usize) & !0xfff));
            }
            let vf = va::kaddr_ptr(f32, va_flink.as_u64());
            let vb = va::kaddr_ptr(f32, va_blink.as_u64());
            ListWalkLinks {
                valid_entry: vf || vb,
                valid_flink: vf,
                valid_blink: vb,
            }
        } else {
            ListWalkLinks::default()
        }
    };
    let mut post =
        |va: Address, pb: &[u8]| enumerate_post(vmm, &ctx, total_refresh, f32, &po, va, pb);

    list_traverse_prefetch(
        vmm,
        sys,
        f32,
        &[sys.va_eprocess],
        po.flink as usize,
        po.cb_max as usize,
        usize::MAX,
        Some(&mut pre),
        Some(&mut post),
        Some(&vmm.eproc_prefetch),
    );

    // process no-link eprocess entries through the same post path
    if let Some(vas) = no_link {
        ctx.borrow_mut().f_no_link = true;
        let mut pb = vec![0u8; po.cb_max as usize];
        for va in vas {
            if vmm.read(sys, va, &mut pb).is_ok() {
                enumerate_post(vmm, &ctx, total_refresh, f32, &po, va, &pb);
            }
        }
    }

    let ctx = ctx.into_inner();
    post_processing(vmm, sys, f32, &po, &ctx.created);
    vmm.process_create_finish();
    Ok(ctx.c_proc > 10)
}

#[allow(clippy::too_many_arguments)]
fn enumerate_post<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    ctx: &RefCell<EnumCtx>,
    total_refresh: bool,
    f32: bool,
    po: &EprocessOffsets,
    va: Address,
    pb: &[u8],
) {
    if !va::kaddr_pool(f32, va.as_u64()) {
        return;
    }
    let mut c = ctx.borrow_mut();
    if c.f_abort {
        return;
    }

    let state = va::dw(pb, po.state as usize);
    let pid = va::dw(pb, po.pid as usize);
    let ppid = va::dw(pb, po.ppid as usize);
    let dtb_raw = va::ptr(f32, pb, po.dtb as usize);
    let dtb_user_raw = if po.dtb_user != 0 {
        va::ptr(f32, pb, po.dtb_user as usize)
    } else {
        0
    };
    let peb = va::ptr(f32, pb, po.peb as usize);
    let wow64_ptr = if !f32 && po.wow64 != 0 {
        va::qw(pb, po.wow64 as usize)
    } else {
        0
    };
    let name_bytes = pb
        .get(po.name as usize..(po.name as usize + 15).min(pb.len()))
        .unwrap_or(&[]);

    // fail if the target claims more than 16 TiB of memory
    if !f32 && dtb_raw & 0xffff_f000_0000_0000 != 0 {
        return;
    }

    // prefetch the gathered DTB physical pages on the first commit only
    if let Some(set) = c.prefetch_dtb.take() {
        vmm.prefetch_phys(set);
    }

    let name_end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..name_end]).into_owned();

    let mut committed = None;
    if pid != 0 && dtb_raw != 0 && !name.is_empty() {
        // treat csrss.exe as kernel due to the win32k mapping missing
        // in the System process, but force MemCompression back to user
        let user = !(pid == 4 || (state == 0 && peb == 0) || name == "csrss.exe")
            || name == "MemCompression";

        let dtb = if f32 {
            dtb_raw & 0xffff_ffe0
        } else {
            dtb_raw & !0xfff
        };

        let mut np = NewProcess {
            pid,
            ppid,
            state,
            dtb: Address::from(dtb),
            dtb_user: Address::from(dtb_user_raw & !0xfff),
            name: name.clone(),
            user_only: user,
            va_eprocess: va,
            va_peb: Address::NULL,
            va_peb32: 0,
            wow64: false,
            no_link: c.f_no_link,
            eprocess_bytes: pb.to_vec(),
        };

        if peb & 0xfff != 0 {
            trace!("bad peb alignment for pid {} ({:x})", pid, peb);
        } else {
            np.va_peb = Address::from(peb);
            if f32 {
                np.va_peb32 = peb as u32;
            }
        }
        if wow64_ptr != 0 {
            np.wow64 = true;
            if wow64_ptr & 0xffff_ffff_0000_0fff != 0 {
                let delta: i64 = if po.vista_or_7 { -0x1000 } else { 0x1000 };
                np.va_peb32 = (peb as u32).wrapping_add(delta as u32);
            } else {
                np.va_peb32 = wow64_ptr as u32;
            }
        }

        match vmm.process_create_entry(total_refresh, np) {
            Some(proc) => committed = Some(proc),
            None => {
                trace!("pid {} already exists or bad dtb", pid);
                c.c_collisions += 1;
                if c.c_collisions >= MAX_PROCESS_COLLISIONS {
                    c.f_abort = true;
                    return;
                }
            }
        }
    }

    debug!(
        "{:04} ({}) {:08x} {:012x} {:016x} {}",
        c.c_proc,
        match committed.as_ref() {
            None => "skip",
            Some(p) if p.state != 0 => "exit",
            Some(_) => "list",
        },
        pid,
        dtb_raw & !0xfff,
        va.as_u64(),
        name
    );
    if let Some(proc) = committed {
        c.created.push(proc);
    }
    c.c_proc += 1;
}

/// Resolves the canonical long path and name for freshly created
/// processes from `SeAuditProcessCreationInfo` in one batch.
fn post_processing<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    sys: &Arc<Win32Process>,
    f32: bool,
    po: &EprocessOffsets,
    created: &[Arc<Win32Process>],
) {
    // 1: gather memory locations of the kernel path unicode strings
    let mut prefetch = Vec::new();
    for proc in created {
        if proc.persistent.path_kernel().is_none() {
            let ptr = va::ptr(f32, &proc.eprocess_bytes, po.se_audit as usize);
            if ptr != 0 {
                prefetch.push(Address::from(ptr));
            }
        }
    }
    if prefetch.is_empty() {
        return;
    }
    vmm.prefetch(sys, prefetch.into_iter(), 540);

    // 2: fetch the kernel path, falling back to the short name
    for proc in created {
        if proc.persistent.path_kernel().is_some() {
            continue;
        }
        let ptr = va::ptr(f32, &proc.eprocess_bytes, po.se_audit as usize);
        let path = if ptr != 0 {
            unicode::read_unicode_string(
                vmm,
                sys,
                f32,
                Address::from(ptr),
                0x400,
                ReadFlags::FORCECACHE_READ,
            )
            .filter(|s| s.starts_with("\\Device\\"))
        } else {
            None
        };
        let path = path.unwrap_or_else(|| proc.name.clone());
        let name_long = path_split_last(&path).to_string();
        *proc
            .persistent
            .path_kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(path);
        *proc
            .persistent
            .name_long
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(name_long);
    }
}

/// Locates EPROCESS objects held through the SYSTEM handle table that
/// are not linked into the EPROCESS list.
pub(crate) fn find_no_link_processes<P: PhysicalMemory>(vmm: &Vmm<P>) -> Option<Vec<Address>> {
    let f32 = vmm.sysinfo.f32();
    let sys = vmm.process_get(4)?;
    let tp_process = objects::process_type_index(vmm)?;
    let handles: Arc<HandleMap> = vmm.handle_map(&sys, false);
    if handles.is_empty() {
        return None;
    }
    let cb_hdr = if f32 { 0x18usize } else { 0x30 };

    // prefetch object headers
    vmm.prefetch(
        &sys,
        handles.entries.iter().map(|e| e.va_object - cb_hdr),
        cb_hdr,
    );

    // index known processes by EPROCESS va
    let mut known: HashSet<u64> = vmm
        .process_list()
        .iter()
        .map(|p| p.va_eprocess.as_u64())
        .collect();

    let mut out = Vec::new();
    let mut pb = [0u8; 0x30];
    let o_type_index = if f32 { 0x0c } else { 0x18 };
    for e in handles.entries.iter() {
        let cb = vmm.read_ex(
            &sys,
            e.va_object - cb_hdr,
            &mut pb[..cb_hdr],
            ReadFlags::FORCECACHE_READ | ReadFlags::NOPAGING,
        );
        if cb != cb_hdr {
            continue;
        }
        let encoded = pb[o_type_index];
        if objects::type_index_decode(vmm, e.va_object - cb_hdr, encoded) != tp_process {
            continue;
        }
        if known.insert(e.va_object.as_u64()) {
            debug!("no-link eprocess: {:x}", e.va_object);
            out.push(e.va_object);
        }
    }
    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

/// Image path and command line from `RTL_USER_PROCESS_PARAMETERS`,
/// cached in the persistent sidecar.
pub(crate) fn user_process_parameters<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
) -> ProcessParameters {
    if let Some(p) = proc
        .persistent
        .proc_params
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    {
        return p;
    }
    if proc.state != 0 || proc.va_peb.is_null() {
        return ProcessParameters::default();
    }

    let _guard = proc.lock_update();
    if let Some(p) = proc
        .persistent
        .proc_params
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
    {
        return p;
    }

    let f32 = vmm.sysinfo.f32();
    let mut params = ProcessParameters::default();
    let va_params = vmm
        .read_ptr(proc, f32, proc.va_peb + if f32 { 0x10 } else { 0x20 })
        .unwrap_or(0);
    let valid = if f32 {
        va_params & 0x8000_0003 == 0 && va_params != 0
    } else {
        va_params & 0xffff_8000_0000_0007 == 0 && va_params != 0
    };
    if valid {
        let va_params = Address::from(va_params);
        // ImagePathName, with DllPath as fallback
        params.image_path_name = unicode::read_unicode_string(
            vmm,
            proc,
            f32,
            va_params + if f32 { 0x38 } else { 0x60 },
            0x400,
            ReadFlags::empty(),
        )
        .or_else(|| {
            unicode::read_unicode_string(
                vmm,
                proc,
                f32,
                va_params + if f32 { 0x30 } else { 0x50 },
                0x400,
                ReadFlags::empty(),
            )
        })
        .unwrap_or_default();
        params.command_line = unicode::read_unicode_string(
            vmm,
            proc,
            f32,
            va_params + if f32 { 0x40 } else { 0x70 },
            0x800,
            ReadFlags::empty(),
        )
        .unwrap_or_default();
    }

    *proc
        .persistent
        .proc_params
        .lock()
        .unwrap_or_else(PoisonError::into_inner) = Some(params.clone());
    params
}
