/*!
32-bit EPROCESS offset discovery; analogous to the 64-bit locator with
pointer size 4, stride 4 and the x86 heuristics.
*/

use super::EprocessOffsets;
use crate::util::va;
use crate::vmm::Vmm;
use crate::win32::process::Win32Process;

use log::debug;

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

const EPROCESS32_MAX_SIZE: usize = 0x480;

const NAME_SYSTEM: u64 = 0x0000_6d65_7473_7953; // "System\0\0"
const NAME_SMSS: u64 = 0x6578_652e_7373_6d73; // "smss.exe"
const NAME_REGISTRY: u64 = 0x7972_7473_6967_6552; // "Registry"
const NAME_SECURE_SYSTEM: u64 = 0x5320_6572_7563_6553; // "Secure S"

pub(crate) fn locate<P: PhysicalMemory>(vmm: &Vmm<P>, sys: &Win32Process) -> EprocessOffsets {
    let mut po = EprocessOffsets::default();

    let mut pb_sys = [0u8; EPROCESS32_MAX_SIZE];
    if vmm.read(sys, sys.va_eprocess, &mut pb_sys).is_err() {
        return po;
    }

    // find offset State (static for now)
    if va::dw(&pb_sys, 0x04) != 0 {
        return po;
    }
    po.state = 0x04;

    // offset DTB is static on x86
    po.dtb = 0x18;

    // find offset for Name
    let mut found = false;
    let mut i = 0;
    while i < EPROCESS32_MAX_SIZE - 8 {
        if va::qw(&pb_sys, i) == NAME_SYSTEM {
            po.name = i as u16;
            found = true;
            break;
        }
        i += 4;
    }
    if !found {
        return po;
    }

    // find offset for PID, FLink, BLink (assumed to follow each other)
    let mut pb_next = [0u8; EPROCESS32_MAX_SIZE];
    found = false;
    i = 0;
    while i < EPROCESS32_MAX_SIZE - 4 {
        if va::dw(&pb_sys, i) == 4 {
            let flink = u64::from(va::dw(&pb_sys, i + 4));
            if flink & 0x8000_0003 != 0x8000_0000 {
                i += 4;
                continue;
            }
            let va_next = Address::from(flink) - (i + 4);
            if vmm.read(sys, va_next, &mut pb_next).is_err() {
                i += 4;
                continue;
            }
            let name = va::qw(&pb_next, po.name as usize);
            if name != NAME_SMSS && name != NAME_REGISTRY && name != NAME_SECURE_SYSTEM {
                i += 4;
                continue;
            }
            if u64::from(va::dw(&pb_next, i + 8)).wrapping_sub((i + 4) as u64)
                != sys.va_eprocess.as_u64()
            {
                i += 4;
                continue;
            }
            po.pid = i as u16;
            po.flink = i as u16 + 4;
            po.blink = i as u16 + 8;
            found = true;
            break;
        }
        i += 4;
    }
    if !found {
        return po;
    }

    // find and read smss.exe
    let mut pb_smss = pb_sys;
    found = false;
    for _ in 1..8 {
        let va_next =
            Address::from(u64::from(va::dw(&pb_smss, po.flink as usize))) - po.flink as usize;
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
        if va::dw(&pb_sys, i) == 0 && va::dw(&pb_smss, i) == 4 {
            po.ppid = i as u16;
            break;
        }
        i += 4;
    }
    if po.ppid == 0 {
        return po;
    }

    // find offset for PEB by comparing SYSTEM and smss
    found = false;
    for _ in 0..4 {
        i = 0x100;
        while i < 0x240 {
            if va::dw(&pb_sys, i) != 0 {
                i += 4;
                continue;
            }
            let va_peb = u64::from(va::dw(&pb_smss, i));
            if va_peb == 0 || va_peb & 0x8000_0fff != 0 {
                i += 4;
                continue;
            }
            let smss_dtb = Address::from(u64::from(va::dw(&pb_smss, po.dtb as usize)) & !0xfff);
            let pa_peb = match vmm.virt2phys(smss_dtb, Address::from(va_peb)) {
                Ok(pa) => pa,
                Err(_) => {
                    i += 4;
                    continue;
                }
            };
            let pb_page = match vmm.read_phys_page(pa_peb) {
                Ok(pb) => pb,
                Err(_) => {
                    i += 4;
                    continue;
                }
            };
            if va::w(&pb_page, 0) == 0x5a4d {
                i += 4;
                continue;
            }
            po.peb = i as u16;
            found = true;
            break;
        }
        if found {
            break;
        }
        let va_next =
            Address::from(u64::from(va::dw(&pb_smss, po.flink as usize))) - po.flink as usize;
        if vmm.read(sys, va_next, &mut pb_smss).is_err() {
            return po;
        }
    }
    if !found {
        return po;
    }

    // locate ObjectTable and SeAuditProcessCreationInfo
    if (po.name as usize) < 0xd0 {
        return po; // implausible layout, candidate window would wrap
    }
    {
        let mut candidates: Vec<(Address, u16, u8)> = Vec::new();
        i = po.name as usize - 0x0c0;
        while i < po.name as usize - 0x010 {
            let p = u64::from(va::dw(&pb_sys, i));
            if va::kaddr32_8(p) {
                let target = Address::from(p) - 0x10;
                if !candidates.iter().any(|c| c.0 == target) {
                    candidates.push((target, i as u16, 1));
                }
            }
            i += 4;
        }
        i = po.peb as usize + 0x040;
        while i < po.peb as usize + 0x058 {
            let p = u64::from(va::dw(&pb_smss, i));
            if va::kaddr32_4(p) {
                let target = Address::from(p);
                if !candidates.iter().any(|c| c.0 == target) {
                    candidates.push((target, i as u16, 2));
                }
            }
            i += 4;
        }

        vmm.prefetch(sys, candidates.iter().map(|c| c.0), 0x40);
        let mut pb = [0u8; 0x40];
        for &(va_p, off, kind) in candidates.iter() {
            let read_full =
                vmm.read_ex(sys, va_p, &mut pb, ReadFlags::FORCECACHE_READ) == 0x40;
            if !read_full {
                if (va_p + 0x10).page_offset() != 0
                    || vmm.read_ex(sys, va_p + 0x10, &mut pb[0x10..], ReadFlags::FORCECACHE_READ)
                        != 0x30
                {
                    continue;
                }
            }
            if kind == 1 {
                if va::dw(&pb, 12) == u32::from_le_bytes(*b"Obtb") {
                    po.object_table = off;
                }
                if va::kaddr32_page(va_p.as_u64() + 0x10)
                    && va::dw(&pb, 0x10 + 0x0c) == 0
                    && va::kaddr32_4(u64::from(va::dw(&pb, 0x10 + 0x10)))
                    && va::kaddr32_4(u64::from(va::dw(&pb, 0x10 + 0x14)))
                {
                    po.object_table = off;
                }
            } else {
                if va::qw(&pb, 0x08) == 0x0076_0065_0044_005c
                    && va::qw(&pb, 0x10) == 0x005c_0065_0063_0069
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

    // find offset for VadRoot via the ExitStatus marker; WINXP carries
    // a duplicated pointer pair instead
    {
        found = false;
        i = 0x0e0 + po.name as usize;
        while i < 0x380 {
            let f = va::kaddr32(u64::from(va::dw(&pb_sys, i)))
                && (va::dw(&pb_sys, i - 4) == 0x0000_0103 || va::dw(&pb_sys, i - 12) == 0x0000_0103);
            if f {
                found = true;
                break;
            }
            i += 4;
        }
        if !found && va::dw(&pb_sys, 0x11c) == va::dw(&pb_sys, 0x120) {
            i = 0x11c;
            found = true;
        }
        if !found {
            return po;
        }
        po.vad_root = i as u16;
        let mut j = i - 8;
        while j > i - 0x30 {
            if va::dw(&pb_sys, j) == va::dw(&pb_sys, po.vad_root as usize) {
                po.vad_root = j as u16;
                break;
            }
            j -= 4;
        }
    }

    // the shadow DTB is not searched for in a 32-bit EPROCESS
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

    const VA_SMSS: u64 = 0x801b_0000;
    const VA_OBTABLE: u64 = 0x8100_0010;
    const VA_AUDIT: u64 = 0x8120_0000;
    const VA_PEB: u64 = 0x7ffd_0000;

    /// 32-bit SYSTEM/smss EPROCESS pair with the invariants the
    /// locator keys on.
    fn locator_image() -> DummyMemory {
        let va_sys = TEST_VA_EPROCESS_SYSTEM_X86;
        let mut mem = DummyMemory::new();

        // SYSTEM
        mem.map(Address::from(va_sys), 0x480);
        mem.write(Address::from(va_sys + 0x16c), b"System\0\0");
        mem.write_u32(Address::from(va_sys + 0xb4), 4); // pid
        mem.write_u32(Address::from(va_sys + 0xb8), (VA_SMSS + 0xb8) as u32);
        mem.write_u32(Address::from(va_sys + 0xbc), (VA_SMSS + 0xb8) as u32);
        // object table pointer + pool tag in front of the table
        mem.write_u32(Address::from(va_sys + 0xf4), VA_OBTABLE as u32);
        mem.write(Address::from(VA_OBTABLE - 0x10 + 12), b"Obtb");
        // vad root with the ExitStatus marker in front
        mem.write_u32(Address::from(va_sys + 0x274), 0x0000_0103);
        mem.write_u32(Address::from(va_sys + 0x278), 0x8200_0000);

        // smss.exe
        mem.map(Address::from(VA_SMSS), 0x480);
        mem.write_u32(Address::from(VA_SMSS + 0x18), 0x002a_b000); // dtb
        mem.write(Address::from(VA_SMSS + 0x16c), b"smss.exe");
        mem.write_u32(Address::from(VA_SMSS + 0xb8), (va_sys + 0xb8) as u32);
        mem.write_u32(Address::from(VA_SMSS + 0xbc), (va_sys + 0xb8) as u32);
        mem.write_u32(Address::from(VA_SMSS + 0xc0), 4); // ppid
        mem.write_u32(Address::from(VA_SMSS + 0x1a8), VA_PEB as u32);
        mem.map(Address::from(VA_PEB), 0x1000); // not an MZ page
        // SeAuditProcessCreationInfo with the inline \Device\ path
        mem.write_u32(Address::from(VA_SMSS + 0x1ec), VA_AUDIT as u32);
        mem.write_u16(Address::from(VA_AUDIT), 0x30);
        mem.write_u16(Address::from(VA_AUDIT + 2), 0x32);
        mem.write_u32(Address::from(VA_AUDIT + 4), (VA_AUDIT + 8) as u32);
        mem.write_utf16(
            Address::from(VA_AUDIT + 8),
            "\\Device\\HarddiskVolume1\\Windows\\smss.exe",
        );
        mem
    }

    #[test]
    fn test_locate_system_smss() {
        let si = sysinfo_x86(6, 7601);
        let vmm = vmm_with(locator_image(), si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let po = locate(&vmm, &procs[0]);
        assert!(po.valid);
        assert_eq!(po.state, 0x04);
        assert_eq!(po.dtb, 0x18);
        assert_eq!(po.name, 0x16c);
        assert_eq!(po.pid, 0xb4);
        assert_eq!(po.flink, 0xb8);
        assert_eq!(po.blink, 0xbc);
        assert_eq!(po.ppid, 0xc0);
        assert_eq!(po.peb, 0x1a8);
        assert_eq!(po.object_table, 0xf4);
        assert_eq!(po.se_audit, 0x1ec);
        assert_eq!(po.vad_root, 0x278);
        // 32-bit systems carry neither Wow64Process nor a shadow dtb
        assert_eq!(po.wow64, 0);
        assert_eq!(po.dtb_user, 0);
        assert_eq!(po.cb_max, 0x278 + 0x80);
    }

    #[test]
    fn test_locate_fails_without_list_links() {
        let si = sysinfo_x86(6, 7601);
        let mut mem = DummyMemory::new();
        // name only; the PID/FLink/BLink triple is missing
        mem.map(Address::from(TEST_VA_EPROCESS_SYSTEM_X86), 0x480);
        mem.write(
            Address::from(TEST_VA_EPROCESS_SYSTEM_X86 + 0x16c),
            b"System\0\0",
        );
        let vmm = vmm_with(mem, si.clone());
        let procs = install_processes(&vmm, vec![np_system(&si, vec![])]);

        let po = locate(&vmm, &procs[0]);
        assert!(!po.valid);
    }
}
