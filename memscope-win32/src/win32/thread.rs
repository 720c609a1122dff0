/*!
Thread enumeration via the ETHREAD list anchored in EPROCESS, enriched
from the TEB (user stack bounds) and the kernel trap frame (RIP/RSP).

The threading subsystem depends on ETHREAD offsets resolved from debug
symbols; without a symbol provider the map stays empty.
*/

use crate::listwalk::{list_traverse_prefetch, ListWalkLinks};
use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::maps::{ThreadEntry, ThreadMap};
use crate::win32::process::Win32Process;

use std::cell::RefCell;

use log::trace;

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

struct ThreadCtx {
    entries: Vec<ThreadEntry>,
    tebs: Vec<Address>,
    trap_frames: Vec<Address>,
}

/// Builds the thread map of a process.
pub(crate) fn initialize<P: PhysicalMemory>(vmm: &Vmm<P>, proc: &Win32Process) -> ThreadMap {
    let f32 = vmm.sysinfo.f32();
    let ot = match vmm.ethread_offsets() {
        Some(ot) if ot.valid => ot,
        _ => return ThreadMap::default(),
    };
    let sys = match vmm.system_process() {
        Ok(sys) => sys,
        Err(_) => return ThreadMap::default(),
    };

    // 1: set up and perform the list traversal in the system (kernel)
    // address space
    let va_list_entry = va::ptr(
        f32,
        &proc.eprocess_bytes,
        ot.thread_list_head_kp as usize,
    );
    if !va::kaddr_ptr(f32, va_list_entry) {
        return ThreadMap::default();
    }
    let head = Address::from(va_list_entry) - ot.thread_list_entry as usize;

    let ctx = RefCell::new(ThreadCtx {
        entries: Vec::new(),
        tebs: Vec::new(),
        trap_frames: Vec::new(),
    });

    let mut pre = |va: Address,
                   pb: &[u8],
                   va_flink: Address,
                   va_blink: Address,
                   _extra: &mut Vec<Address>|
     -> ListWalkLinks {
        // sanity check the record: valid links, matching process
        // back-pointer and a nonzero thread id
        let valid_links =
            va::kaddr_ptr(f32, va_flink.as_u64()) && va::kaddr_ptr(f32, va_blink.as_u64());
        if !valid_links {
            return ListWalkLinks::default();
        }
        if ot.process_opt != 0
            && va::ptr(f32, pb, ot.process_opt as usize) != proc.va_eprocess.as_u64()
        {
            return ListWalkLinks::default();
        }
        let tid = va::ptr(f32, pb, ot.cid as usize + if f32 { 4 } else { 8 }) as u32;
        if tid == 0 {
            return ListWalkLinks::default();
        }

        let mut e = ThreadEntry {
            va_ethread: va,
            tid,
            pid: va::ptr(f32, pb, ot.cid as usize) as u32,
            exit_status: va::dw(pb, ot.exit_status as usize),
            state: pb.get(ot.state as usize).copied().unwrap_or(0),
            suspend_count: pb.get(ot.suspend_count as usize).copied().unwrap_or(0),
            running: 0,
            priority: pb.get(ot.priority as usize).copied().unwrap_or(0),
            base_priority: pb.get(ot.base_priority as usize).copied().unwrap_or(0),
            va_teb: Address::from(va::ptr(f32, pb, ot.teb as usize)),
            ft_create_time: va::qw(pb, ot.create_time as usize),
            ft_exit_time: va::qw(pb, ot.exit_time as usize),
            va_start_address: Address::from(va::ptr(f32, pb, ot.start_address as usize)),
            va_stack_base_kernel: Address::from(va::ptr(f32, pb, ot.stack_base as usize)),
            va_stack_limit_kernel: Address::from(va::ptr(f32, pb, ot.stack_limit as usize)),
            va_stack_base_user: Address::NULL,
            va_stack_limit_user: Address::NULL,
            va_trap_frame: Address::from(va::ptr(f32, pb, ot.trap_frame as usize)),
            va_rip: Address::NULL,
            va_rsp: Address::NULL,
            affinity: va::ptr(f32, pb, ot.affinity as usize),
            kernel_time: va::dw(pb, ot.kernel_time as usize),
            user_time: va::dw(pb, ot.user_time as usize),
        };
        if ot.running != 0 {
            e.running = pb.get(ot.running as usize).copied().unwrap_or(0);
        }
        if e.ft_exit_time > 0x0200_0000_0000_0000 {
            e.ft_exit_time = 0;
        }

        let mut c = ctx.borrow_mut();
        // duplicate TIDs are dropped
        if !c.entries.iter().any(|x| x.tid == e.tid) {
            c.tebs.push(e.va_teb);
            c.trap_frames.push(e.va_trap_frame);
            c.entries.push(e);
        }
        ListWalkLinks {
            valid_entry: true,
            valid_flink: true,
            valid_blink: true,
        }
    };

    list_traverse_prefetch(
        vmm,
        &sys,
        f32,
        &[head],
        ot.thread_list_entry as usize,
        ot.cb_max as usize,
        usize::MAX,
        Some(&mut pre),
        None,
        Some(&proc.persistent.thread_prefetch),
    );

    let ThreadCtx {
        mut entries,
        tebs,
        trap_frames,
    } = ctx.into_inner();
    if entries.is_empty() {
        return ThreadMap::default();
    }

    // 2: enrich from the TEB (process space) and the trap frame
    // (kernel space) after one prefetch round for each
    let cb_trap_frame = if (ot.trap_rsp as usize) < 0x200 - 8 && (ot.trap_rip as usize) < 0x200 - 8
    {
        8 + ot.trap_rsp.max(ot.trap_rip) as usize
    } else {
        0
    };
    vmm.prefetch(&sys, trap_frames.into_iter(), cb_trap_frame);
    vmm.prefetch(proc, tebs.into_iter(), 0x20);

    let mut pb = [0u8; 0x200];
    for e in entries.iter_mut() {
        // fetch the user stack bounds from the TEB
        if vmm.read_ex(proc, e.va_teb, &mut pb[..0x20], ReadFlags::FORCECACHE_READ) == 0x20 {
            e.va_stack_base_user = Address::from(va::ptr_dual(f32, &pb, 4, 8));
            e.va_stack_limit_user = Address::from(va::ptr_dual(f32, &pb, 8, 16));
        }
        // fetch RIP/RSP from the trap frame; values outside both stacks
        // are considered stale and dropped
        if cb_trap_frame > 0
            && vmm.read_ex(
                &sys,
                e.va_trap_frame,
                &mut pb[..cb_trap_frame],
                ReadFlags::FORCECACHE_READ,
            ) == cb_trap_frame
        {
            e.va_rip = Address::from(va::ptr(f32, &pb, ot.trap_rip as usize));
            e.va_rsp = Address::from(va::ptr(f32, &pb, ot.trap_rsp as usize));
            let in_user = e.va_stack_base_user > e.va_rsp && e.va_stack_limit_user < e.va_rsp;
            let in_kernel =
                e.va_stack_base_kernel > e.va_rsp && e.va_stack_limit_kernel < e.va_rsp;
            if !in_user && !in_kernel {
                e.va_rip = Address::NULL;
                e.va_rsp = Address::NULL;
            }
        }
    }

    // 3: sort by thread id
    entries.sort_unstable_by_key(|e| e.tid);
    trace!("pid {}: {} threads", proc.pid, entries.len());
    ThreadMap { entries }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use memscope_core::mem::DummyMemory;

    const VA_ETHREAD_1: u64 = 0xffff_8000_0090_0000;
    const VA_ETHREAD_2: u64 = 0xffff_8000_0091_0000;
    const VA_TEB_1: u64 = 0x0000_7ff7_4000_0000;
    const VA_TEB_2: u64 = 0x0000_7ff7_4100_0000;
    const VA_TRAP_1: u64 = 0xffff_8000_0092_0000;
    const VA_TRAP_2: u64 = 0xffff_8000_0093_0000;
    const VA_EPROC: u64 = 0xffff_8000_0011_0000;

    const STACK_BASE_K: u64 = 0xffff_8000_00a1_0000;
    const STACK_LIMIT_K: u64 = 0xffff_8000_00a0_0000;

    #[allow(clippy::too_many_arguments)]
    fn write_ethread(
        mem: &mut DummyMemory,
        ot: &crate::offsets::EthreadOffsets,
        va: u64,
        tid: u32,
        va_teb: u64,
        va_trap: u64,
        flink: u64,
    ) {
        mem.map(Address::from(va), ot.cb_max as usize);
        mem.write_u64(Address::from(va + ot.cid as u64), 8); // owning pid
        mem.write_u64(Address::from(va + ot.cid as u64 + 8), u64::from(tid));
        mem.write_u64(Address::from(va + ot.teb as u64), va_teb);
        mem.write_u64(Address::from(va + ot.trap_frame as u64), va_trap);
        mem.write_u64(Address::from(va + ot.stack_base as u64), STACK_BASE_K);
        mem.write_u64(Address::from(va + ot.stack_limit as u64), STACK_LIMIT_K);
        mem.write_u64(Address::from(va + ot.process_opt as u64), VA_EPROC);
        mem.write_u64(Address::from(va + ot.create_time as u64), 0x01d0_0000);
        mem.write_u32(Address::from(va + ot.kernel_time as u64), 100);
        mem.write_u32(Address::from(va + ot.user_time as u64), 50);
        mem.write(Address::from(va + ot.priority as u64), &[8]);
        mem.write_u64(
            Address::from(va + ot.thread_list_entry as u64),
            flink,
        );
        mem.write_u64(
            Address::from(va + ot.thread_list_entry as u64 + 8),
            flink,
        );
    }

    #[test]
    fn test_thread_walk_with_trap_frames() {
        let si = sysinfo_x64(10, 19041);
        let ot = ethread_offsets_x64();
        let mut mem = DummyMemory::new();

        // two threads on a circular list
        write_ethread(
            &mut mem,
            &ot,
            VA_ETHREAD_1,
            0x1234,
            VA_TEB_1,
            VA_TRAP_1,
            VA_ETHREAD_2 + u64::from(ot.thread_list_entry),
        );
        write_ethread(
            &mut mem,
            &ot,
            VA_ETHREAD_2,
            0x0100,
            VA_TEB_2,
            VA_TRAP_2,
            VA_ETHREAD_1 + u64::from(ot.thread_list_entry),
        );

        // TEBs: user stack base/limit
        mem.map(Address::from(VA_TEB_1), 0x20);
        mem.write_u64(Address::from(VA_TEB_1 + 8), 0x0000_7ff7_5010_0000);
        mem.write_u64(Address::from(VA_TEB_1 + 16), 0x0000_7ff7_5000_0000);
        mem.map(Address::from(VA_TEB_2), 0x20);
        mem.write_u64(Address::from(VA_TEB_2 + 8), 0x0000_7ff7_5110_0000);
        mem.write_u64(Address::from(VA_TEB_2 + 16), 0x0000_7ff7_5100_0000);

        // trap frames: the first RSP lands inside the kernel stack, the
        // second points nowhere sane
        mem.map(Address::from(VA_TRAP_1), 0x200);
        mem.write_u64(Address::from(VA_TRAP_1 + u64::from(ot.trap_rip)), 0x0000_7ffb_0000_1234);
        mem.write_u64(Address::from(VA_TRAP_1 + u64::from(ot.trap_rsp)), STACK_LIMIT_K + 0x800);
        mem.map(Address::from(VA_TRAP_2), 0x200);
        mem.write_u64(Address::from(VA_TRAP_2 + u64::from(ot.trap_rip)), 0x0000_7ffb_0000_5678);
        mem.write_u64(Address::from(VA_TRAP_2 + u64::from(ot.trap_rsp)), 0x0000_1000_0000_0000);

        let vmm = vmm_with(mem, si.clone());
        vmm.set_ethread_offsets(ot);
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(
                    8,
                    "test.exe",
                    VA_EPROC,
                    0,
                    0,
                    false,
                    eprocess_bytes(&[(
                        ot.thread_list_head_kp as usize,
                        VA_ETHREAD_1 + u64::from(ot.thread_list_entry),
                    )]),
                ),
            ],
        );

        let map = vmm.thread_map(&procs[1]);
        assert_eq!(map.entries.len(), 2);
        // sorted ascending by tid
        assert_eq!(map.entries[0].tid, 0x0100);
        assert_eq!(map.entries[1].tid, 0x1234);
        let t1 = map.by_tid(0x1234).unwrap();
        assert_eq!(t1.pid, 8);
        assert_eq!(t1.va_teb, Address::from(VA_TEB_1));
        assert_eq!(t1.va_stack_base_user, Address::from(0x0000_7ff7_5010_0000u64));
        assert_eq!(t1.va_stack_limit_user, Address::from(0x0000_7ff7_5000_0000u64));
        // RSP within the kernel stack keeps the trap values
        assert_eq!(t1.va_rip, Address::from(0x0000_7ffb_0000_1234u64));
        assert_eq!(t1.va_rsp, Address::from(STACK_LIMIT_K + 0x800));
        // RSP outside both stacks is vetoed
        let t2 = map.by_tid(0x0100).unwrap();
        assert!(t2.va_rip.is_null());
        assert!(t2.va_rsp.is_null());
        assert_eq!(t2.kernel_time, 100);
        assert_eq!(t2.user_time, 50);
    }

    #[test]
    fn test_thread_walk_requires_offsets() {
        let si = sysinfo_x64(10, 19041);
        let vmm = vmm_with(DummyMemory::new(), si.clone());
        let procs = install_processes(
            &vmm,
            vec![
                np_system(&si, vec![]),
                np_user(8, "test.exe", VA_EPROC, 0, 0, false, vec![]),
            ],
        );
        // without a symbol provider the thread map stays empty
        assert!(vmm.thread_map(&procs[1]).entries.is_empty());
    }
}
