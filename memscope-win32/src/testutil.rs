/*!
Fixtures for tests: synthetic guest images over the sparse dummy
backend with identity translation, plus canned symbol/registry
providers.
*/

use crate::offsets::{EprocessOffsets, EthreadOffsets};
use crate::providers::{
    RegistryHive, RegistryKeyInfo, RegistryProvider, SymbolProvider,
};
use crate::vmm::{SystemInfo, Vmm, VmmBuilder};
use crate::win32::process::{NewProcess, Win32Process};

use std::collections::HashMap;
use std::sync::Arc;

use memscope_core::arch::Architecture;
use memscope_core::mem::DummyMemory;
use memscope_core::types::Address;

pub const TEST_DTB_SYSTEM: u64 = 0x001a_b000;
pub const TEST_VA_EPROCESS_SYSTEM: u64 = 0xffff_8000_0010_0000;

pub fn sysinfo_x64(version_major: u32, version_build: u32) -> SystemInfo {
    SystemInfo {
        arch: Architecture::X64,
        dtb: Address::from(TEST_DTB_SYSTEM),
        va_eprocess_system: Address::from(TEST_VA_EPROCESS_SYSTEM),
        kernel_base: Address::from(0xffff_8000_0400_0000u64),
        kernel_size: 0x0080_0000,
        version_major,
        version_build,
        pa_max: Address::from(0x1_0000_0000u64),
        va_ps_loaded_module_list: Address::NULL,
    }
}

pub const TEST_VA_EPROCESS_SYSTEM_X86: u64 = 0x801a_0000;

pub fn sysinfo_x86(version_major: u32, version_build: u32) -> SystemInfo {
    SystemInfo {
        arch: Architecture::X86,
        dtb: Address::from(TEST_DTB_SYSTEM),
        va_eprocess_system: Address::from(TEST_VA_EPROCESS_SYSTEM_X86),
        kernel_base: Address::from(0x8280_0000u64),
        kernel_size: 0x0060_0000,
        version_major,
        version_build,
        pa_max: Address::from(0x8000_0000u64),
        va_ps_loaded_module_list: Address::NULL,
    }
}

pub fn vmm_with(mem: DummyMemory, sysinfo: SystemInfo) -> Vmm<DummyMemory> {
    VmmBuilder::new(mem, sysinfo).identity_translation().build()
}

pub fn np_system(si: &SystemInfo, eprocess_bytes: Vec<u8>) -> NewProcess {
    NewProcess {
        pid: 4,
        ppid: 0,
        state: 0,
        dtb: si.dtb,
        dtb_user: Address::NULL,
        name: "System".to_string(),
        user_only: false,
        va_eprocess: si.va_eprocess_system,
        va_peb: Address::NULL,
        va_peb32: 0,
        wow64: false,
        no_link: false,
        eprocess_bytes,
    }
}

#[allow(clippy::too_many_arguments)]
pub fn np_user(
    pid: u32,
    name: &str,
    va_eprocess: u64,
    va_peb: u64,
    va_peb32: u32,
    wow64: bool,
    eprocess_bytes: Vec<u8>,
) -> NewProcess {
    NewProcess {
        pid,
        ppid: 4,
        state: 0,
        dtb: Address::from(0x2000_0000u64 + u64::from(pid) * 0x1000),
        dtb_user: Address::NULL,
        name: name.to_string(),
        user_only: true,
        va_eprocess: Address::from(va_eprocess),
        va_peb: Address::from(va_peb),
        va_peb32,
        wow64,
        no_link: false,
        eprocess_bytes,
    }
}

/// Stages the given processes and publishes them as the process table.
pub fn install_processes(vmm: &Vmm<DummyMemory>, nps: Vec<NewProcess>) -> Vec<Arc<Win32Process>> {
    let out: Vec<_> = nps
        .into_iter()
        .filter_map(|np| vmm.process_create_entry(true, np))
        .collect();
    vmm.process_create_finish();
    out
}

/// EPROCESS offsets matching the synthetic fixtures (win10 x64 flavor).
pub fn eprocess_offsets_x64() -> EprocessOffsets {
    let mut po = EprocessOffsets {
        valid: true,
        vista_or_7: false,
        state: 0x04,
        dtb: 0x28,
        dtb_user: 0x280,
        name: 0x5a8,
        pid: 0x440,
        ppid: 0x458,
        flink: 0x448,
        blink: 0x450,
        peb: 0x3f8,
        wow64: 0x3f8 + 0x30,
        object_table: 0x570,
        se_audit: 0x460,
        vad_root: 0x6e8,
        opt_create_time: 0,
        opt_exit_time: 0,
        cb_max: 0,
    };
    po.set_max_offset();
    po
}

/// ETHREAD offsets matching the synthetic fixtures.
pub fn ethread_offsets_x64() -> EthreadOffsets {
    EthreadOffsets {
        valid: true,
        thread_list_head_kp: 0x5e0,
        thread_list_entry: 0x4e8,
        cid: 0x478,
        teb: 0xf0,
        create_time: 0x490,
        exit_time: 0x498,
        exit_status: 0x4a0,
        state: 0x184,
        suspend_count: 0x1ba,
        running: 0,
        priority: 0x1c9,
        base_priority: 0x1ca,
        start_address: 0x4b8,
        stack_base: 0x38,
        stack_limit: 0x30,
        trap_frame: 0x90,
        affinity: 0x1d8,
        kernel_time: 0x288,
        user_time: 0x28c,
        process_opt: 0x220,
        trap_rip: 0x168,
        trap_rsp: 0x180,
        cb_max: 0x700,
    }
}

/// EPROCESS bytes with the object table / thread list / se-audit
/// pointers of the fixture offsets filled in as requested.
pub fn eprocess_bytes(fill: &[(usize, u64)]) -> Vec<u8> {
    let mut pb = vec![0u8; eprocess_offsets_x64().cb_max as usize];
    for &(off, value) in fill {
        pb[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
    pb
}

#[derive(Default)]
pub struct TestSymbols {
    pub symbols: HashMap<(String, String), Address>,
    pub offsets: HashMap<(String, String), u32>,
    pub sizes: HashMap<String, u32>,
}

impl TestSymbols {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn symbol(mut self, module: &str, name: &str, va: u64) -> Self {
        self.symbols
            .insert((module.to_string(), name.to_string()), Address::from(va));
        self
    }

    pub fn field(mut self, type_name: &str, field: &str, offset: u32) -> Self {
        self.offsets
            .insert((type_name.to_string(), field.to_string()), offset);
        self
    }

    /// EPROCESS type information of a win10 x64 kernel.
    pub fn win10_x64() -> Self {
        Self::new()
            .field("_DISPATCHER_HEADER", "SignalState", 0x04)
            .field("_KPROCESS", "DirectoryTableBase", 0x28)
            .field("_KPROCESS", "UserDirectoryTableBase", 0x280)
            .field("_EPROCESS", "ImageFileName", 0x5a8)
            .field("_EPROCESS", "UniqueProcessId", 0x440)
            .field("_EPROCESS", "InheritedFromUniqueProcessId", 0x458)
            .field("_EPROCESS", "ActiveProcessLinks", 0x448)
            .field("_EPROCESS", "Peb", 0x3f8)
            .field("_EPROCESS", "SeAuditProcessCreationInfo", 0x460)
            .field("_EPROCESS", "VadRoot", 0x6e8)
            .field("_EPROCESS", "ObjectTable", 0x570)
            .field("_EPROCESS", "CreateTime", 0x468)
            .field("_EPROCESS", "ExitTime", 0x470)
    }
}

impl SymbolProvider for TestSymbols {
    fn symbol_address(&self, module: &str, symbol: &str) -> Option<Address> {
        self.symbols
            .get(&(module.to_string(), symbol.to_string()))
            .copied()
    }

    fn type_child_offset(&self, type_name: &str, field: &str) -> Option<u32> {
        self.offsets
            .get(&(type_name.to_string(), field.to_string()))
            .copied()
    }

    fn type_size(&self, type_name: &str) -> Option<u32> {
        self.sizes.get(type_name).copied()
    }
}

#[derive(Default)]
pub struct TestRegistry {
    pub values: HashMap<String, Vec<u8>>,
    pub hives: Vec<RegistryHive>,
    pub hive_values: HashMap<(u64, String), (u32, Vec<u8>)>,
    pub keys: HashMap<(u64, u32), RegistryKeyInfo>,
}

impl RegistryProvider for TestRegistry {
    fn value_query(&self, path: &str) -> Option<Vec<u8>> {
        self.values.get(path).cloned()
    }

    fn hives(&self) -> Vec<RegistryHive> {
        self.hives.clone()
    }

    fn hive_value_query(&self, hive: Address, path: &str) -> Option<(u32, Vec<u8>)> {
        self.hive_values
            .get(&(hive.as_u64(), path.to_string()))
            .cloned()
    }

    fn hive_by_address(&self, va: Address) -> Option<RegistryHive> {
        self.hives.iter().find(|h| h.va == va).cloned()
    }

    fn key_by_cell(&self, hive: Address, cell: u32) -> Option<RegistryKeyInfo> {
        self.keys.get(&(hive.as_u64(), cell)).cloned()
    }
}

/// Export directory specification for [`write_pe64`].
pub struct ExportSpec {
    pub ordinal_base: u32,
    pub functions: Vec<u32>,
    /// (name, index into `functions`)
    pub names: Vec<(String, u16)>,
    pub dll_name: Option<String>,
}

/// Writes a minimal PE32+ image at `base`: DOS header with
/// `e_lfanew = 0x80`, NT headers and optionally an export directory at
/// RVA 0x200. Returns SizeOfImage.
pub fn write_pe64(mem: &mut DummyMemory, base: u64, size_of_image: u32, export: Option<ExportSpec>) -> u32 {
    let base = Address::from(base);
    mem.map(base, 0x1000);
    mem.write(base, b"MZ");
    mem.write_u32(base + 0x3c, 0x80); // e_lfanew
    mem.write(base + 0x80, b"PE\0\0");
    // file header: NumberOfSections=1, SizeOfOptionalHeader=0xf0
    mem.write_u16(base + 0x84 + 2, 1);
    mem.write_u16(base + 0x84 + 16, 0xf0);
    // optional header
    let opt = base + 0x98;
    mem.write_u16(opt, 0x020b);
    mem.write_u32(opt + 0x10, 0x1000); // AddressOfEntryPoint
    mem.write_u32(opt + 0x38, size_of_image);
    mem.write_u32(opt + 0x3c, 0x400); // SizeOfHeaders
    mem.write_u32(opt + 0x6c, 16); // NumberOfRvaAndSizes

    // one section header so the raw size derivation has data
    let sect = opt + 0xf0;
    mem.write(sect, b".text\0\0\0");
    mem.write_u32(sect + 8, size_of_image - 0x1000); // VirtualSize
    mem.write_u32(sect + 12, 0x1000); // VirtualAddress
    mem.write_u32(sect + 16, size_of_image - 0x1000); // SizeOfRawData
    mem.write_u32(sect + 20, 0x400); // PointerToRawData

    if let Some(spec) = export {
        let c_funcs = spec.functions.len() as u32;
        let c_names = spec.names.len() as u32;
        // export data directory
        mem.write_u32(opt + 0x70, 0x200);
        mem.write_u32(opt + 0x74, 0x200);

        let dir = base + 0x200;
        mem.map(dir, 0x200);
        mem.write_u32(dir + 0x10, 0x2f0); // Name rva (within the directory)
        mem.write_u32(dir + 0x14, spec.ordinal_base);
        mem.write_u32(dir + 0x18, c_funcs);
        mem.write_u32(dir + 0x1c, c_names);
        mem.write_u32(dir + 0x20, 0x228); // AddressOfFunctions
        mem.write_u32(dir + 0x24, 0x260); // AddressOfNames
        mem.write_u32(dir + 0x28, 0x290); // AddressOfNameOrdinals

        for (i, &rva) in spec.functions.iter().enumerate() {
            mem.write_u32(base + 0x228 + i * 4, rva);
        }
        let mut o_str = 0x2c0u32;
        for (i, (name, index)) in spec.names.iter().enumerate() {
            mem.write_u32(base + 0x260 + i * 4, o_str);
            mem.write_u16(base + 0x290 + i * 2, *index);
            let mut bytes = name.clone().into_bytes();
            bytes.push(0);
            mem.write(base + o_str as usize, &bytes);
            o_str += bytes.len() as u32;
        }
        if let Some(dll_name) = spec.dll_name {
            let mut bytes = dll_name.into_bytes();
            bytes.push(0);
            mem.write(base + 0x2f0, &bytes);
        }
    }
    size_of_image
}
