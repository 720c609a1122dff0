/*!
x86 (non-PAE) 2-level page table walk.
*/

use super::read_phys_u32;
use crate::error::{Error, Result};
use crate::mem::PhysicalMemory;
use crate::types::Address;

/// Walks PD -> PT, honoring 4 MiB large pages.
pub fn virt_to_phys<P: PhysicalMemory>(phys: &mut P, dtb: Address, va: Address) -> Result<Address> {
    let va = va.as_u64() as u32;
    let dtb = dtb.as_u64() & !0xfff;

    // PDE
    let pde = read_phys_u32(phys, Address::from(dtb + u64::from((va >> 22) * 4)))?;
    if pde & 1 == 0 {
        return Err(Error::VirtualTranslate);
    }
    if pde & 0x80 != 0 {
        // 4 MiB page
        return Ok(Address::from(
            u64::from(pde & 0xffc0_0000) + u64::from(va & 0x003f_ffff),
        ));
    }

    // PTE
    let pte = read_phys_u32(
        phys,
        Address::from(u64::from(pde & 0xffff_f000) + u64::from(((va >> 12) & 0x3ff) * 4)),
    )?;
    if pte & 1 == 0 {
        return Err(Error::VirtualTranslate);
    }
    Ok(Address::from(
        u64::from(pte & 0xffff_f000) + u64::from(va & 0xfff),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::DummyMemory;

    #[test]
    fn test_walk_4k() {
        let mut mem = DummyMemory::new();
        let dtb = 0x1000u64;
        let va = 0x8042_1678u32;

        mem.write_u32(Address::from(dtb + u64::from(va >> 22) * 4), 0x2000 | 1);
        mem.write_u32(
            Address::from(0x2000u64 + u64::from((va >> 12) & 0x3ff) * 4),
            0x0065_4000 | 1,
        );

        let pa = virt_to_phys(&mut mem, Address::from(dtb), Address::from(u64::from(va))).unwrap();
        assert_eq!(pa, Address::from(0x0065_4678u64));
    }

    #[test]
    fn test_walk_4m() {
        let mut mem = DummyMemory::new();
        let dtb = 0x1000u64;
        let va = 0x0060_0042u32;

        mem.write_u32(
            Address::from(dtb + u64::from(va >> 22) * 4),
            0x0040_0000 | 0x80 | 1,
        );

        let pa = virt_to_phys(&mut mem, Address::from(dtb), Address::from(u64::from(va))).unwrap();
        assert_eq!(pa, Address::from(0x0060_0042u64));
    }
}
