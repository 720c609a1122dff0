/*!
Architecture identifiers and virtual address translation.

Translation deliberately only covers what an introspection layer needs
to walk guest structures: the classic x86 2-level and the x64 4-level
page walks, plus an identity mode used by synthetic test images.
*/

pub mod x64;
pub mod x86;

use crate::error::{Error, Result};
use crate::mem::PhysicalMemory;
use crate::types::Address;

/// Identifies a target architecture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub enum Architecture {
    X86,
    X64,
}

impl Architecture {
    /// Returns the pointer width in bits.
    pub const fn bits(self) -> u8 {
        match self {
            Architecture::X86 => 32,
            Architecture::X64 => 64,
        }
    }

    /// Returns the size of a pointer in bytes.
    pub const fn size_addr(self) -> usize {
        match self {
            Architecture::X86 => 4,
            Architecture::X64 => 8,
        }
    }

    /// Returns the page size of the architecture.
    pub const fn page_size(self) -> usize {
        0x1000
    }
}

/// Resolves guest virtual addresses to physical addresses.
#[derive(Debug, Clone, Copy)]
pub enum Translator {
    /// Virtual addresses equal physical addresses. Used by synthetic
    /// memory images in tests.
    Identity,
    /// Hardware page table walk rooted at `dtb`.
    PageTable { arch: Architecture, dtb: Address },
}

impl Translator {
    pub fn new(arch: Architecture, dtb: Address) -> Self {
        Translator::PageTable { arch, dtb }
    }

    /// Translates a single virtual address.
    pub fn virt_to_phys<P: PhysicalMemory>(&self, phys: &mut P, va: Address) -> Result<Address> {
        match *self {
            Translator::Identity => Ok(va),
            Translator::PageTable {
                arch: Architecture::X64,
                dtb,
            } => x64::virt_to_phys(phys, dtb, va),
            Translator::PageTable {
                arch: Architecture::X86,
                dtb,
            } => x86::virt_to_phys(phys, dtb, va),
        }
    }
}

/// Checks whether a page of memory plausibly is a hardware page table.
///
/// All present entries must carry a physical frame; for a PML4 the
/// Windows self-reference entry is additionally required when
/// `self_ref` is set.
pub fn page_table_verify(pb: &[u8], pa: Address, self_ref: bool) -> bool {
    if pb.len() < 0x1000 {
        return false;
    }
    let mut c_present = 0;
    let mut f_self = false;
    for i in 0..512 {
        let e = u64::from_le_bytes([
            pb[i * 8],
            pb[i * 8 + 1],
            pb[i * 8 + 2],
            pb[i * 8 + 3],
            pb[i * 8 + 4],
            pb[i * 8 + 5],
            pb[i * 8 + 6],
            pb[i * 8 + 7],
        ]);
        if e & 1 == 0 {
            continue;
        }
        let frame = e & 0x000f_ffff_ffff_f000;
        if frame == 0 {
            return false;
        }
        if frame == pa.as_u64() {
            f_self = true;
        }
        c_present += 1;
    }
    if self_ref && !f_self {
        return false;
    }
    c_present > 0
}

pub(crate) fn read_phys_u64<P: PhysicalMemory>(phys: &mut P, pa: Address) -> Result<u64> {
    let mut buf = [0u8; 8];
    phys.phys_read_raw_into(pa, &mut buf)
        .map_err(|_| Error::VirtualTranslate)?;
    Ok(u64::from_le_bytes(buf))
}

pub(crate) fn read_phys_u32<P: PhysicalMemory>(phys: &mut P, pa: Address) -> Result<u32> {
    let mut buf = [0u8; 4];
    phys.phys_read_raw_into(pa, &mut buf)
        .map_err(|_| Error::VirtualTranslate)?;
    Ok(u32::from_le_bytes(buf))
}
