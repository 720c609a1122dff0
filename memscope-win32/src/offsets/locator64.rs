/*!
64-bit EPROCESS offset discovery without debug symbols.

The locator reads the SYSTEM and smss.exe EPROCESS blocks and derives
the field offsets from invariants of the two: the literal `System`
image name, PID 4 followed by valid list links pointing back at SYSTEM,
a PEB that is zero in SYSTEM but a user-mode pointer in smss, pool tags
in front of the object table, and so on.
*/

use super::EprocessOffsets;
use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::process::Win32Process;

use log::debug;

use memscope_core::arch::page_table_verify;
use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

const EPROCESS64_MAX_SIZE: usize = 0x800;

const NAME_SYSTEM: u64 = 0x0000_6d65_7473_7953; // "System\0\0"
const NAME_SMSS: u64 = 0x6578_652e_7373_6d73; // "smss.exe"
const NAME_REGISTRY: u64 = 0x7972_7473_6967_6552; // "Registry"
const NAME_SECURE_SYSTEM: u64 = 0x5320_6572_7563_6553; // "Secure S"

pub(crate) fn locate<P: PhysicalMemory>(vmm: &Vmm<P>, sys: &Win32Process) -> EprocessOffsets {
    let mut po = EprocessOffsets::default();

    let mut pb_sys = [0u8; EPROCESS64_MAX_SIZE];
    if vmm.read(sys, sys.va_eprocess, &mut pb_sys).is_err() {
        return po;
    }

    // find offset State (static for now)
    if va::dw(&pb_sys, 0x04) != 0 {
        return po;
    }
    po.state = 0x04;

    // find offset DTB (static for now)
    if sys.dtb.as_u64() != 0xffff_ffff_ffff_f000 & va::qw(&pb_sys, 0x28) {
        return po;
    }
    po.dtb = 0x28;

    // find offset for Name
    let mut found = false;
    let mut i = 0;
    while i < EPROCESS64_MAX_SIZE - 8 {
        if va::qw(&pb_sys, i) == NAME_SYSTEM {
            po.name = i as u16;
            found = true;
            break;
        }
        i += 8;
    }
    if !found {
        return po;
    }

    // find offset for PID, FLink, BLink (assumed to follow each other)
    let mut pb_next = [0u8; EPROCESS64_MAX_SIZE];
    found = false;
    i = 0;
    while i < EPROCESS64_MAX_SIZE - 8 {
        if va::qw(&pb_sys, i) == 4 {
            // PID candidate: the next QWORD must be a kernel pointer
            let flink = va::qw(&pb_sys, i + 8);
            if flink & 0xffff_0000_0000_0003 != 0xffff_0000_0000_0000 {
                i += 8;
                continue;
            }
            let va_next = Address::from(flink) - (i + 8);
            if vmm.read(sys, va_next, &mut pb_next).is_err() {
                i += 8;
                continue;
            }
            let name = va::qw(&pb_next, po.name as usize);
            if name != NAME_SMSS && name != NAME_REGISTRY && name != NAME_SECURE_SYSTEM {
                i += 8;
                continue;
            }
            if va::qw(&pb_next, i + 16).wrapping_sub((i + 8) as u64) != sys.va_eprocess.as_u64() {
                i += 8;
                continue;
            }
            po.pid = i as u16;
            po.flink = i as u16 + 8;
            po.blink = i as u16 + 16;
            found = true;
            break;
        }
        i += 8;
    }
    if !found {
        return po;
    }

    // find and read smss.exe
    let mut pb_smss = pb_sys;
    found = false;
    for _ in 1..8 {
        let va_next = Address::from(va::qw(&pb_smss, po.flink as usize)) - po.flink as usize;
        if vmm.read(sys, va_next, &mut pb_smss).is_ok()
            && va::qw(&pb_smss, po.name as usize) == NAME_SMSS
        {
            found = true;
            break;
        }
    }
    if !found {
        return po;
    }

    // parent pid is assumed to be located between BLink and Name
    i = po.blink as usize;
    while i < po.name as usize {
        if va::qw(&pb_sys, i) == 0 && va::qw(&pb_smss, i) == 4 {
            po.ppid = i as u16;
            break;
        }
        i += 8;
    }
    if po.ppid == 0 {
        return po;
    }

    // find offset for PEB by comparing SYSTEM and smss: zero in SYSTEM,
    // user-aligned pointer in smss, and the page behind it must not
    // start with an MZ header. retry on siblings if paging defeats the
    // check.
    found = false;
    for _ in 0..4 {
        i = 0x280;
        while i < 0x580 {
            if va::qw(&pb_sys, i) != 0 {
                i += 8;
                continue;
            }
            let va_peb = va::qw(&pb_smss, i);
            if va_peb == 0 || va_peb & 0xffff_8000_0000_0fff != 0 {
                i += 8;
                continue;
            }
            // verify the potential PEB
            let smss_dtb = Address::from(va::qw(&pb_smss, po.dtb as usize) & !0xfff);
            let pa_peb = match vmm.virt2phys(smss_dtb, Address::from(va_peb)) {
                Ok(pa) => pa,
                Err(_) => {
                    i += 8;
                    continue;
                }
            };
            let pb_page = match vmm.read_phys_page(pa_peb) {
                Ok(pb) => pb,
                Err(_) => {
                    i += 8;
                    continue;
                }
            };
            if va::w(&pb_page, 0) == 0x5a4d {
                // MZ header, likely an image base rather than a PEB
                i += 8;
                continue;
            }
            po.peb = i as u16;
            found = true;
            break;
        }
        if found {
            break;
        }
        // failed locating the PEB (paging?) -> try the next process
        let va_next = Address::from(va::qw(&pb_smss, po.flink as usize)) - po.flink as usize;
        if vmm.read(sys, va_next, &mut pb_smss).is_err() {
            return po;
        }
    }
    if !found {
        return po;
    }

    // Wow64Process offset - "static" rule
    if po.name < po.peb {
        po.vista_or_7 = true;
        po.wow64 = po.name + 0x40; // Vista, Win7
    } else {
        po.wow64 = po.peb + 0x30; // Win8, Win10
    }

    // locate ObjectTable and SeAuditProcessCreationInfo by bulk reading
    // candidate pointers and validating pool tags / unicode contents
    if (po.name as usize) < 0x100 {
        return po; // implausible layout, candidate window would wrap
    }
    {
        let mut candidates: Vec<(Address, u16, u8)> = Vec::new();
        // ObjectTable candidate pointers
        i = po.name as usize - 0x0e0;
        while i < po.name as usize - 0x020 {
            let p = va::qw(&pb_sys, i);
            if va::kaddr64_16(p) {
                let target = Address::from(p) - 0x10;
                if !candidates.iter().any(|c| c.0 == target) {
                    candidates.push((target, i as u16, 1));
                }
            }
            i += 8;
        }
        // SeAuditProcessCreationInfo candidate pointers from smss
        i = po.peb as usize + 0x058;
        while i < po.peb as usize + 0x090 {
            let p = va::qw(&pb_smss, i);
            if va::kaddr64_8(p) {
                let target = Address::from(p);
                if !candidates.iter().any(|c| c.0 == target) {
                    candidates.push((target, i as u16, 2));
                }
            }
            i += 8;
        }

        // prefetch and interpret
        vmm.prefetch(sys, candidates.iter().map(|c| c.0), 0x40);
        let mut pb = [0u8; 0x40];
        for &(va_p, off, kind) in candidates.iter() {
            let read_full =
                vmm.read_ex(sys, va_p, &mut pb, ReadFlags::FORCECACHE_READ) == 0x40;
            if !read_full {
                // allocation may start at a page boundary; retry past
                // the pool header
                if (va_p + 0x10).page_offset() != 0
                    || vmm.read_ex(sys, va_p + 0x10, &mut pb[0x10..], ReadFlags::FORCECACHE_READ)
                        != 0x30
                {
                    continue;
                }
            }
            if kind == 1 {
                // object table: prepended pool tag 'Obtb' ...
                if va::dw(&pb, 4) == u32::from_le_bytes(*b"Obtb") {
                    po.object_table = off;
                }
                // ... or page-aligned with the expected zero/pointer
                // pattern and no pool header
                if va::kaddr64_page(va_p.as_u64() + 0x10)
                    && va::qw(&pb, 0x10 + 0x10) == 0
                    && va::kaddr64_8(va::qw(&pb, 0x10 + 0x18))
                    && va::kaddr64_8(va::qw(&pb, 0x10 + 0x20))
                {
                    po.object_table = off;
                }
            } else {
                // SeAuditProcessCreationInfo: inline L"\Device\" with a
                // consistent UNICODE_STRING in front
                if va::qw(&pb, 0x10) == 0x0076_0065_0044_005c
                    && va::qw(&pb, 0x18) == 0x005c_0065_0063_0069
                    && va::w(&pb, 0x00) < 2 * 260
                    && va::w(&pb, 0x00) < va::w(&pb, 0x02)
                {
                    po.se_audit = off;
                }
            }
        }
        if po.object_table == 0 || po.se_audit == 0 {
            return po;
        }
    }

    // find offset for VadRoot by searching for the ExitStatus value
    // 0x00000103 located prior to it; scan back 0x40 for a duplicate
    // pointer which disambiguates VadHint vs. VadRoot
    {
        found = false;
        i = 0x140 + po.name as usize;
        while i < 0x7f0 {
            let f = va::kaddr64(va::qw(&pb_sys, i))
                && (va::dw(&pb_sys, i - 4) == 0x0000_0103 || va::dw(&pb_sys, i - 12) == 0x0000_0103);
            if f {
                found = true;
                break;
            }
            i += 8;
        }
        if !found {
            return po;
        }
        po.vad_root = i as u16;
        let mut j = i - 8;
        while j > i - 0x40 {
            if va::qw(&pb_sys, j) == va::qw(&pb_sys, po.vad_root as usize) {
                po.vad_root = j as u16;
                break;
            }
            j -= 8;
        }
    }

    // optional shadow (user) DTB, post-meltdown builds only: SYSTEM has
    // an entry pointing at a PML4 with an empty low half, smss has none
    {
        let pa_max = vmm.sysinfo.pa_max.as_u64();
        i = 0x240;
        while i < EPROCESS64_MAX_SIZE - 8 {
            let pa_dtb0 = va::qw(&pb_sys, i);
            let pa_dtb1 = va::qw(&pb_smss, i);
            let plausible = pa_dtb1 & !1 == 0
                && pa_dtb0 != 0
                && pa_dtb0 & 0xffe == 0
                && pa_dtb0 < pa_max;
            if plausible {
                if let Ok(pb_page) = vmm.read_phys_page(Address::from(pa_dtb0 & !0xfff)) {
                    if pb_page[..0x800].iter().all(|&b| b == 0)
                        && page_table_verify(&pb_page, Address::from(pa_dtb0 & !0xfff), true)
                    {
                        po.dtb_user = i as u16;
                        break;
                    }
                }
            }
            i += 8;
        }
    }

    po.set_max_offset();
    po.valid = true;
    debug!("eprocess offsets located by pattern scan");
    po
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;

    use memscope_core::mem::DummyMemory;

    /// Builds the SYSTEM/smss EPROCESS pair the locator keys on.
    fn locator_image() -> DummyMemory {
        let mut mem = DummyMemory::new();
        let va_sys = TEST_VA_EPROCESS_SYSTEM;
        let va_smss = 0xffff_8000_0011_0000u64;

        // SYSTEM
        mem.map(Address::from(va_sys), 0x800);
        mem.write_u64(Address::from(va_sys + 0x28), TEST_DTB_SYSTEM);
        mem.write(Address::from(va_sys + 0x5a8), b"System\0\0");
        mem.write_u64(Address::from(va_sys + 0x440), 4);
        mem.write_u64(Address::from(va_sys + 0x448), va_smss + 0x448);
        mem.write_u64(Address::from(va_sys + 0x450), va_smss + 0x448);
        // object table pointer + pool tag in front of the table
        let va_obtable = 0xffff_8000_0030_0100u64;
        mem.write_u64(Address::from(va_sys + 0x570), va_obtable);
        mem.write(Address::from(va_obtable - 0x10 + 4), b"Obtb");
        // vad root with the ExitStatus marker in front
        mem.write_u32(Address::from(va_sys + 0x6e4), 0x0000_0103);
        mem.write_u64(Address::from(va_sys + 0x6e8), 0xffff_8000_0044_0000);

        // smss.exe
        mem.map(Address::from(va_smss), 0x800);
        mem.write_u64(Address::from(va_smss + 0x28), 0x002a_b000);
        mem.write(Address::from(va_smss + 0x5a8), b"smss.exe");
        mem.write_u64(Address::from(va_smss + 0x448), va_sys + 0x448);
        mem.write_u64(Address::from(va_smss + 0x450), va_sys + 0x448);
        mem.write_u64(Address::from(va_smss + 0x458), 4); // ppid
        let va_peb = 0x0000_7ff7_0000_0000u64;
        mem.write_u64(Address::from(va_smss + 0x3f8), va_peb);
        mem.map(Address::from(va_peb), 0x1000); // not an MZ page
        // SeAuditProcessCreationInfo with the inline \Device\ path
        let va_audit = 0xffff_8000_0050_0000u64;
        mem.write_u64(Address::from(va_smss + 0x460), va_audit);
        mem.write_u16(Address::from(va_audit), 0x34);
        mem.write_u16(Address::from(va_audit + 2), 0x36);
        mem.write_u64(Address::from(va_audit + 8), va_audit + 0x10);
        mem.write_utf16(
            Address::from(va_audit + 0x10),
            "\\Device\\HarddiskVolume2\\Windows\\smss.exe",
        );
        mem
    }

    #[test]
    fn test_locate_system_smss() {
        let si = sysinfo_x64(10, 19041);
        let vmm = vmm_with(locator_image(), si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let po = locate(&vmm, &procs[0]);
        assert!(po.valid);
        assert_eq!(po.state, 0x04);
        assert_eq!(po.dtb, 0x28);
        assert_eq!(po.name, 0x5a8);
        assert_eq!(po.pid, 0x440);
        assert_eq!(po.flink, 0x448);
        assert_eq!(po.blink, 0x450);
        assert_eq!(po.ppid, 0x458);
        assert_eq!(po.peb, 0x3f8);
        assert_eq!(po.object_table, 0x570);
        assert_eq!(po.se_audit, 0x460);
        assert_eq!(po.vad_root, 0x6e8);
        // Name > PEB on this layout -> Win8+ rule for Wow64Process
        assert!(!po.vista_or_7);
        assert_eq!(po.wow64, po.peb + 0x30);
        assert_eq!(po.cb_max, 0x6e8 + 0x80);
        // shadow dtb not present in this image
        assert_eq!(po.dtb_user, 0);
    }

    #[test]
    fn test_locate_fails_without_name() {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        // an EPROCESS block without the literal System name
        mem.map(Address::from(TEST_VA_EPROCESS_SYSTEM), 0x800);
        mem.write_u64(
            Address::from(TEST_VA_EPROCESS_SYSTEM + 0x28),
            TEST_DTB_SYSTEM,
        );
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let po = locate(&vmm, &procs[0]);
        assert!(!po.valid);
    }
}
