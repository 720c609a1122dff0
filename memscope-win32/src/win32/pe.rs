/*!
Validating PE parser over process memory: header verification, export
(EAT) and import (IAT) table reconstruction and the small header
derived quantities the module map carries (raw file size, section and
import/export counts).

All parsing happens on buffers read out of the inspected process;
nothing is ever trusted without bounds validation first.
*/

use crate::strmap::StrMapBuilder;
use crate::util::{self, va};
use crate::vmm::Vmm;
use crate::win32::maps::{EatEntry, EatMap, IatEntry, IatMap, IatThunk, ModuleEntry};
use crate::win32::process::Win32Process;

use log::trace;

use dataview::Pod;
use pelite::image::{
    IMAGE_DATA_DIRECTORY, IMAGE_DOS_HEADER, IMAGE_EXPORT_DIRECTORY, IMAGE_IMPORT_DESCRIPTOR,
    IMAGE_SECTION_HEADER,
};

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::{Address, PAGE_SIZE};

pub(crate) const IMAGE_DIRECTORY_ENTRY_EXPORT: usize = 0;
pub(crate) const IMAGE_DIRECTORY_ENTRY_IMPORT: usize = 1;
pub(crate) const IMAGE_DIRECTORY_ENTRY_IAT: usize = 12;

const IMAGE_DOS_SIGNATURE: u16 = 0x5a4d; // MZ
const IMAGE_NT_SIGNATURE: u32 = 0x0000_4550; // PE\0\0
const IMAGE_NT_OPTIONAL_HDR32_MAGIC: u16 = 0x010b;
const IMAGE_NT_OPTIONAL_HDR64_MAGIC: u16 = 0x020b;

/// Maximum size of an export directory read.
const EAT_MAX_SIZE: u32 = 0x0100_0000;
/// Maximum module size mapped for import parsing.
const IAT_MAX_MODULE_SIZE: u32 = 0x0200_0000;

/// Validated view over the header page of a PE image.
pub(crate) struct PeHeader<'a> {
    pb: &'a [u8],
    o_nt: usize,
    hdr32: bool,
}

impl<'a> PeHeader<'a> {
    /// Validates DOS and NT signatures and the optional header magic.
    /// Returns `None` unless the buffer starts with a plausible image.
    pub fn verify(pb: &'a [u8]) -> Option<Self> {
        if pb.len() < std::mem::size_of::<IMAGE_DOS_HEADER>() {
            return None;
        }
        let dos = Pod::as_data_view(pb).copy::<IMAGE_DOS_HEADER>(0);
        if dos.e_magic != IMAGE_DOS_SIGNATURE {
            return None;
        }
        let e_lfanew = dos.e_lfanew as i64;
        if e_lfanew < 0 || e_lfanew > 0x800 {
            return None;
        }
        let o_nt = e_lfanew as usize;
        if o_nt + 0x18 + 2 > pb.len() {
            return None;
        }
        if va::dw(pb, o_nt) != IMAGE_NT_SIGNATURE {
            return None;
        }
        let magic = va::w(pb, o_nt + 0x18);
        let hdr32 = match magic {
            IMAGE_NT_OPTIONAL_HDR32_MAGIC => true,
            IMAGE_NT_OPTIONAL_HDR64_MAGIC => false,
            _ => return None,
        };
        Some(Self { pb, o_nt, hdr32 })
    }

    pub fn is32(&self) -> bool {
        self.hdr32
    }

    #[inline]
    fn o_opt(&self) -> usize {
        self.o_nt + 0x18
    }

    pub fn size_of_image(&self) -> u32 {
        va::dw(self.pb, self.o_opt() + 0x38)
    }

    pub fn size_of_headers(&self) -> u32 {
        va::dw(self.pb, self.o_opt() + 0x3c)
    }

    pub fn number_of_sections(&self) -> u16 {
        va::w(self.pb, self.o_nt + 4 + 2)
    }

    fn size_of_optional_header(&self) -> u16 {
        va::w(self.pb, self.o_nt + 4 + 16)
    }

    pub fn data_directory(&self, index: usize) -> Option<IMAGE_DATA_DIRECTORY> {
        let (o_count, o_dir) = if self.hdr32 {
            (0x5c, 0x60)
        } else {
            (0x6c, 0x70)
        };
        let count = va::dw(self.pb, self.o_opt() + o_count) as usize;
        if index >= count.min(16) {
            return None;
        }
        let off = self.o_opt() + o_dir + index * 8;
        if off + 8 > self.pb.len() {
            return None;
        }
        Some(IMAGE_DATA_DIRECTORY {
            VirtualAddress: va::dw(self.pb, off),
            Size: va::dw(self.pb, off + 4),
        })
    }

    /// Section headers reachable within the header page.
    pub fn section_headers(&self) -> Vec<IMAGE_SECTION_HEADER> {
        let mut out = Vec::new();
        let o_sect = self.o_opt() + self.size_of_optional_header() as usize;
        let cb_sect = std::mem::size_of::<IMAGE_SECTION_HEADER>();
        for i in 0..self.number_of_sections() as usize {
            let off = o_sect + i * cb_sect;
            if off + cb_sect > self.pb.len() {
                break;
            }
            out.push(Pod::as_data_view(self.pb).copy::<IMAGE_SECTION_HEADER>(off));
        }
        out
    }

    /// Size of the image in its raw (file) form.
    pub fn file_raw_size(&self) -> u32 {
        let mut cb = self.size_of_headers();
        for section in self.section_headers() {
            cb = cb.max(section.PointerToRawData.wrapping_add(section.SizeOfRawData));
        }
        cb
    }

    /// Number of import thunks, derived from the IAT data directory.
    pub fn iat_count(&self) -> u32 {
        match self.data_directory(IMAGE_DIRECTORY_ENTRY_IAT) {
            Some(dir) if dir.VirtualAddress != 0 => {
                dir.Size / if self.hdr32 { 4 } else { 8 }
            }
            _ => 0,
        }
    }
}

/// Reads and verifies the header page of a module.
pub(crate) fn read_verified_header<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    va_module: Address,
    flags: ReadFlags,
) -> Option<(Vec<u8>, bool)> {
    let mut pb = vec![0u8; PAGE_SIZE];
    if vmm.read_ex(proc, va_module, &mut pb, flags) != PAGE_SIZE {
        return None;
    }
    let hdr32 = PeHeader::verify(&pb)?.is32();
    Some((pb, hdr32))
}

/// SizeOfImage of the module mapped at `va_module`.
pub(crate) fn size<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    va_module: Address,
) -> Option<u32> {
    let (pb, _) = read_verified_header(vmm, proc, va_module, ReadFlags::empty())?;
    let hdr = PeHeader::verify(&pb)?;
    match hdr.size_of_image() {
        0 => None,
        cb => Some(cb),
    }
}

/// Module name embedded in the export directory.
pub(crate) fn module_name<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    va_module: Address,
    pb_header: Option<&[u8]>,
) -> Option<String> {
    let owned;
    let pb = match pb_header {
        Some(pb) => pb,
        None => {
            owned = read_verified_header(vmm, proc, va_module, ReadFlags::empty())?.0;
            &owned
        }
    };
    let hdr = PeHeader::verify(pb)?;
    let dir = hdr.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)?;
    if dir.VirtualAddress == 0 || dir.Size == 0 {
        return None;
    }
    let exp: IMAGE_EXPORT_DIRECTORY = vmm
        .read_pod(proc, va_module + dir.VirtualAddress as usize)
        .ok()?;
    if exp.Name == 0 {
        return None;
    }
    let name = vmm
        .read_cstr(proc, va_module + exp.Name as usize, 64)
        .ok()?;
    if name.is_empty() {
        return None;
    }
    Some(name)
}

/// Number of exported functions, from the export directory header.
pub(crate) fn eat_count<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    va_module: Address,
    pb_header: &[u8],
    flags: ReadFlags,
) -> u32 {
    let hdr = match PeHeader::verify(pb_header) {
        Some(h) => h,
        None => return 0,
    };
    let dir = match hdr.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT) {
        Some(d) if d.VirtualAddress != 0 && d.Size != 0 => d,
        _ => return 0,
    };
    let mut pb = [0u8; std::mem::size_of::<IMAGE_EXPORT_DIRECTORY>()];
    if vmm.read_ex(proc, va_module + dir.VirtualAddress as usize, &mut pb, flags) != pb.len() {
        return 0;
    }
    let exp = Pod::as_data_view(&pb[..]).copy::<IMAGE_EXPORT_DIRECTORY>(0);
    if exp.NumberOfFunctions > 0xffff {
        return 0;
    }
    exp.NumberOfFunctions
}

/// RVA of a data directory, for prefetch sizing.
pub(crate) fn directory_rva(pb_header: &[u8], index: usize) -> Option<u32> {
    let hdr = PeHeader::verify(pb_header)?;
    let dir = hdr.data_directory(index)?;
    if dir.VirtualAddress == 0 {
        return None;
    }
    Some(dir.VirtualAddress)
}

fn cstr_in_buffer(pb: &[u8], off: usize) -> Option<String> {
    if off >= pb.len() {
        return None;
    }
    let end = pb[off..]
        .iter()
        .position(|&c| c == 0)
        .map(|n| off + n)
        .unwrap_or(pb.len());
    Some(String::from_utf8_lossy(&pb[off..end]).into_owned())
}

/// Builds the export map of a module. On any validation failure an
/// empty snapshot is returned.
pub(crate) fn eat_initialize<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    module: &ModuleEntry,
) -> EatMap {
    eat_initialize_work(vmm, proc, module).unwrap_or_default()
}

fn eat_initialize_work<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    module: &ModuleEntry,
) -> Option<EatMap> {
    let va_base = module.va_base;
    let (pb_hdr, _) = read_verified_header(vmm, proc, va_base, ReadFlags::empty())?;
    let hdr = PeHeader::verify(&pb_hdr)?;

    // load the export directory in one read
    let dir = hdr.data_directory(IMAGE_DIRECTORY_ENTRY_EXPORT)?;
    let o_exp_dir = dir.VirtualAddress;
    let cb_exp_dir = dir.Size;
    if o_exp_dir == 0 || cb_exp_dir == 0 || cb_exp_dir > EAT_MAX_SIZE {
        return None;
    }
    let va_exp_dir = va_base + o_exp_dir as usize;
    let mut pb_exp = vec![0u8; cb_exp_dir as usize];
    vmm.read(proc, va_exp_dir, &mut pb_exp).ok()?;

    // sanity check the directory header
    if pb_exp.len() < std::mem::size_of::<IMAGE_EXPORT_DIRECTORY>() {
        return None;
    }
    let exp = Pod::as_data_view(&pb_exp[..]).copy::<IMAGE_EXPORT_DIRECTORY>(0);
    if exp.NumberOfFunctions == 0 || exp.NumberOfFunctions > 0xffff {
        return None;
    }
    if exp.NumberOfNames > exp.NumberOfFunctions {
        return None;
    }
    let c_functions = exp.NumberOfFunctions as usize;
    let c_names = exp.NumberOfNames as usize;

    let va_names = va_base + exp.AddressOfNames as usize;
    let va_ordinals = va_base + exp.AddressOfNameOrdinals as usize;
    let va_functions = va_base + exp.AddressOfFunctions as usize;
    let va_end = va_exp_dir + cb_exp_dir as usize;
    if va_names < va_exp_dir || va_names > va_end - c_names * 4 {
        return None;
    }
    if va_ordinals < va_exp_dir || va_ordinals > va_end - c_names * 2 {
        return None;
    }
    if va_functions < va_exp_dir || va_functions > va_end - c_names * 4 {
        return None;
    }
    let o_names = (exp.AddressOfNames - o_exp_dir) as usize;
    let o_ordinals = (exp.AddressOfNameOrdinals - o_exp_dir) as usize;
    let o_functions = (exp.AddressOfFunctions - o_exp_dir) as usize;

    let mut pool = StrMapBuilder::new();
    let mut entries = vec![
        EatEntry {
            o_names: -1,
            ..Default::default()
        };
        c_functions
    ];

    // walk exported function names
    for i in 0..c_names {
        let ordinal_index = va::w(&pb_exp, o_ordinals + i * 2) as usize;
        if ordinal_index >= c_functions {
            continue; // name ordinal out of range
        }
        let rva_name = va::dw(&pb_exp, o_names + i * 4);
        if rva_name < o_exp_dir || rva_name >= o_exp_dir + cb_exp_dir {
            continue; // name outside the export directory
        }
        let e = &mut entries[ordinal_index];
        e.va_function =
            va_base + va::dw(&pb_exp, o_functions + ordinal_index * 4) as usize;
        e.ordinal = exp.Base + ordinal_index as u32;
        e.o_functions = ordinal_index as u32;
        e.o_names = i as i32;
        if let Some(name) = cstr_in_buffer(&pb_exp, (rva_name - o_exp_dir) as usize) {
            e.name = pool.push(&name);
        }
    }

    // walk exported functions, fill the unnamed slots and build the
    // name hash lookup table
    let mut hash = vec![0u64; c_functions];
    for (i, e) in entries.iter_mut().enumerate() {
        if e.o_names >= 0 {
            hash[i] = ((i as u64) << 32) | u64::from(util::hash32(pool.peek(e.name)));
            continue;
        }
        e.va_function = va_base + va::dw(&pb_exp, o_functions + i * 4) as usize;
        e.ordinal = exp.Base + i as u32;
        e.o_functions = i as u32;
        e.o_names = -1;
    }
    hash.sort_unstable_by_key(|&h| (h & 0xffff_ffff, h));

    trace!(
        "eat: base={:x} functions={} names={}",
        va_base,
        c_functions,
        c_names
    );

    Some(EatMap {
        va_module_base: va_base,
        ordinal_base: exp.Base,
        c_functions: exp.NumberOfFunctions,
        c_names: exp.NumberOfNames,
        va_address_of_functions: va_functions,
        va_address_of_names: va_names,
        entries,
        pool: pool.finish(),
        hash,
    })
}

/// Builds the import map of a module. On any validation failure an
/// empty snapshot is returned.
pub(crate) fn iat_initialize<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    module: &ModuleEntry,
) -> IatMap {
    iat_initialize_work(vmm, proc, module).unwrap_or_default()
}

fn iat_initialize_work<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    proc: &Win32Process,
    module: &ModuleEntry,
) -> Option<IatMap> {
    let va_base = module.va_base;
    if module.cb_image == 0 || module.cb_image > IAT_MAX_MODULE_SIZE {
        return None;
    }
    let cb_module = module.cb_image as usize;

    // map the whole module image
    let (mut pb_module, cb_read) =
        vmm.read_vec(proc, va_base, cb_module, ReadFlags::ZEROPAD_ON_FAIL);
    if cb_read <= 0x2000 {
        return None;
    }
    pb_module[cb_module - 1] = 0;

    let (_, hdr32) = read_verified_header(vmm, proc, va_base, ReadFlags::empty())?;
    let hdr = PeHeader::verify(&pb_module)?;
    let dir = hdr.data_directory(IMAGE_DIRECTORY_ENTRY_IMPORT)?;
    let o_import = dir.VirtualAddress as usize;
    if o_import == 0 || o_import >= cb_module {
        return None;
    }

    let c_map = module.c_iat as usize;
    let cb_desc = std::mem::size_of::<IMAGE_IMPORT_DESCRIPTOR>();
    let cb_thunk = if hdr32 { 4 } else { 8 };

    let mut pool = StrMapBuilder::new();
    let mut entries: Vec<IatEntry> = Vec::with_capacity(c_map);

    // walk imported modules / functions
    let mut i = 0usize;
    loop {
        let o_desc = o_import + i * cb_desc;
        if o_desc + cb_desc >= cb_module || entries.len() >= c_map {
            break;
        }
        let desc = Pod::as_data_view(&pb_module[..]).copy::<IMAGE_IMPORT_DESCRIPTOR>(o_desc);
        if desc.FirstThunk == 0 {
            break;
        }
        if desc.Name as usize > cb_module - 64 {
            i += 1;
            continue;
        }
        let mut j = 0usize;
        loop {
            if entries.len() >= c_map {
                break;
            }
            let o_iat = desc.FirstThunk as usize + j * cb_thunk;
            let o_hna = desc.OriginalFirstThunk as usize + j * cb_thunk;
            if o_iat + cb_thunk > cb_module || o_hna + cb_thunk > cb_module {
                break;
            }
            let va_fn = if hdr32 {
                u64::from(va::dw(&pb_module, o_iat))
            } else {
                va::qw(&pb_module, o_iat)
            };
            let rva_name_fn = if hdr32 {
                u64::from(va::dw(&pb_module, o_hna))
            } else {
                va::qw(&pb_module, o_hna)
            };
            if va_fn == 0 || rva_name_fn == 0 {
                break;
            }
            if !hdr32 && !va::uaddr64(va_fn) && !va::kaddr64(va_fn) {
                break;
            }

            let f_name_fn = (rva_name_fn as usize) < cb_module;
            let f_name_mod = (desc.Name as usize) < cb_module;
            let mut e = IatEntry {
                va_function: Address::from(va_fn),
                ..Default::default()
            };
            if f_name_fn {
                if let Some(name) = cstr_in_buffer(&pb_module, rva_name_fn as usize + 2) {
                    e.function = pool.push(&name);
                }
            }
            if f_name_mod {
                if let Some(name) = cstr_in_buffer(&pb_module, desc.Name as usize) {
                    e.module = pool.push(&name);
                }
            }
            e.thunk = IatThunk {
                f32: hdr32,
                hint: if f_name_fn {
                    va::w(&pb_module, rva_name_fn as usize)
                } else {
                    0
                },
                rva_first_thunk: desc.FirstThunk + (j * cb_thunk) as u32,
                rva_original_first_thunk: desc.OriginalFirstThunk + (j * cb_thunk) as u32,
                rva_name_function: rva_name_fn as u32,
                rva_name_module: desc.Name,
            };
            entries.push(e);
            j += 1;
        }
        i += 1;
    }

    trace!("iat: base={:x} entries={}", va_base, entries.len());

    Some(IatMap {
        va_module_base: va_base,
        entries,
        pool: pool.finish(),
    })
}
