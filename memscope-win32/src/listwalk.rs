/*!
Batched two-pass traversal of kernel doubly-linked lists.

One round-trip per record on a high-latency backing store is ruinous.
The walker therefore keeps four address sets: `all` (everything seen,
used for bulk prefetch and as the sticky set of the next refresh),
`try1` (records to attempt from cache), `try2` (records that missed the
cache) and `valid` (records accepted by the pre callback). The first
pass drains `try1` with cache-only reads, demoting misses to `try2`;
when `try1` runs dry everything gathered so far is prefetched in one
batch and the passes alternate until both sets are empty.

Back-links are only discovered by reading forward, which is why a
second full pass over `valid` (after one more bulk prefetch) performs
the actual record processing via the post callback.
*/

use crate::vmm::Vmm;
use crate::win32::process::{AddrContainer, Win32Process};
use crate::util::va;

use std::sync::Arc;

use hashbrown::HashSet;
use log::trace;

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

/// Hard bound on processed records; guards against crafted circular
/// lists.
pub(crate) const LIST_WALK_LOOP_PROTECT_MAX: usize = 0x1000;

/// Per-record link validity decided by the pre callback.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct ListWalkLinks {
    pub valid_entry: bool,
    pub valid_flink: bool,
    pub valid_blink: bool,
}

/// Pre callback: `(va, record bytes, flink, blink, extra prefetch addresses)`.
/// Returning no valid links stops traversal through this record.
pub(crate) type ListWalkPre<'a> =
    &'a mut dyn FnMut(Address, &[u8], Address, Address, &mut Vec<Address>) -> ListWalkLinks;

/// Post callback invoked on each valid record after the final bulk
/// prefetch: `(va, record bytes)`.
pub(crate) type ListWalkPost<'a> = &'a mut dyn FnMut(Address, &[u8]);

/// Walks a linked list with batched prefetch.
///
/// `heads` are record addresses (already adjusted by `o_list`);
/// `o_list` is the offset of the `LIST_ENTRY` within the record and
/// `cb_record` the record size read per entry. Traversal stops after
/// `max_valid` accepted records. Returns the number of accepted
/// records.
#[allow(clippy::too_many_arguments)]
pub(crate) fn list_traverse_prefetch<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    f32: bool,
    heads: &[Address],
    o_list: usize,
    cb_record: usize,
    max_valid: usize,
    mut pre: Option<ListWalkPre>,
    post: Option<ListWalkPost>,
    sticky: Option<&AddrContainer>,
) -> usize {
    // 1: prefetch any addresses stored in the optional sticky container
    if let Some(container) = sticky {
        if let Some(addrs) = container.get() {
            vmm.prefetch(proc, addrs.iter().copied(), cb_record);
        }
    }

    // 2: seed the sets with the caller-supplied heads
    let mut all: Vec<Address> = Vec::new();
    let mut all_set: HashSet<u64> = HashSet::new();
    let mut try1: Vec<Address> = Vec::new();
    let mut try2: Vec<Address> = Vec::new();
    let mut valid: Vec<Address> = Vec::new();
    for &head in heads {
        if !head.is_null() && all_set.insert(head.as_u64()) {
            all.push(head);
            try1.push(head);
        }
    }

    let mut pb = vec![0u8; cb_record];
    let mut extra: Vec<Address> = Vec::new();
    let mut f_try1 = true;
    let mut c_loop = 0;

    // 3: initial list walk, alternating between the cache-only and the
    // ordinary read pass
    loop {
        if c_loop >= LIST_WALK_LOOP_PROTECT_MAX {
            trace!("list walk loop protection triggered");
            break;
        }
        let va = if f_try1 {
            match try1.pop() {
                Some(va) => {
                    let cb_read =
                        vmm.read_ex(proc, va, &mut pb, ReadFlags::FORCECACHE_READ);
                    if cb_read != cb_record {
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

        let va_flink = Address::from(va::ptr(f32, &pb, o_list));
        let va_blink = Address::from(va::ptr(f32, &pb, o_list + if f32 { 4 } else { 8 }));

        let links = match pre.as_mut() {
            Some(cb) => cb(va, &pb, va_flink, va_blink, &mut extra),
            None => {
                let (vf, vb) = if f32 {
                    (va_flink.as_u64() & 0x3 == 0, va_blink.as_u64() & 0x3 == 0)
                } else {
                    (
                        va::kaddr64_8(va_flink.as_u64()) || va::uaddr64_8(va_flink.as_u64()),
                        va::kaddr64_8(va_blink.as_u64()) || va::uaddr64_8(va_blink.as_u64()),
                    )
                };
                ListWalkLinks {
                    valid_entry: vf || vb,
                    valid_flink: vf,
                    valid_blink: vb,
                }
            }
        };

        for e in extra.drain(..) {
            if !e.is_null() && all_set.insert(e.as_u64()) {
                all.push(e);
            }
        }

        if links.valid_entry {
            valid.push(va);
            if valid.len() >= max_valid {
                break;
            }
        }

        let next_f = va_flink - o_list;
        let next_b = va_blink - o_list;
        if links.valid_flink && all_set.insert(next_f.as_u64()) {
            all.push(next_f);
            try1.push(next_f);
        }
        if links.valid_blink && all_set.insert(next_b.as_u64()) {
            all.push(next_b);
            try1.push(next_b);
        }
    }

    // 4: prefetch everything gathered into the cache in one batch
    vmm.prefetch(proc, all.iter().copied(), cb_record);

    // 5: second walk committing the valid records
    let c_valid = valid.len();
    if let Some(post) = post {
        for &va in valid.iter() {
            if vmm.read(proc, va, &mut pb).is_ok() {
                post(va, &pb);
            }
        }
    }

    // 6: store the gathered set for the next refresh if desirable
    if let Some(container) = sticky {
        if vmm.cfg.volatile_mem && vmm.cfg.process_cache {
            container.set(Arc::new(all));
        }
    }

    c_valid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use memscope_core::mem::DummyMemory;

    #[test]
    fn test_circular_list_terminates() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        // two records pointing at each other through links at offset 0
        let a = 0xffff_8000_0020_0000u64;
        let b = 0xffff_8000_0020_1000u64;
        mem.write_u64(Address::from(a), b);
        mem.write_u64(Address::from(a + 8), b);
        mem.write_u64(Address::from(b), a);
        mem.write_u64(Address::from(b + 8), a);

        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let mut visited = 0u32;
        let mut post = |_va: Address, _pb: &[u8]| visited += 1;
        let c_valid = list_traverse_prefetch(
            &vmm,
            &procs[0],
            false,
            &[Address::from(a)],
            0,
            0x10,
            usize::MAX,
            None,
            Some(&mut post),
            None,
        );
        assert_eq!(c_valid, 2);
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_loop_protection_bound() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        // a long unique chain exceeding the safety bound
        let base = 0xffff_8000_0100_0000u64;
        for i in 0..0x1100u64 {
            let va = base + i * 0x10;
            mem.write_u64(Address::from(va), va + 0x10);
            mem.write_u64(Address::from(va + 8), va + 0x10);
        }
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let c_valid = list_traverse_prefetch(
            &vmm,
            &procs[0],
            false,
            &[Address::from(base)],
            0,
            0x10,
            usize::MAX,
            None,
            None,
            None,
        );
        assert!(c_valid <= LIST_WALK_LOOP_PROTECT_MAX);
        assert!(c_valid > 0);
    }

    #[test]
    fn test_cache_miss_demotes_to_second_pass() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        let a = 0xffff_8000_0030_0000u64;
        mem.write_u64(Address::from(a), a);
        mem.write_u64(Address::from(a + 8), a);
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        // nothing is cached up front: the first pass misses, the record
        // must still be committed by the second pass
        let mut committed = Vec::new();
        let mut post = |va: Address, _pb: &[u8]| committed.push(va);
        list_traverse_prefetch(
            &vmm,
            &procs[0],
            false,
            &[Address::from(a)],
            0,
            0x10,
            usize::MAX,
            None,
            Some(&mut post),
            None,
        );
        assert_eq!(committed, vec![Address::from(a)]);
    }
}
