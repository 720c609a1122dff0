/*!
Published snapshot types.

Every map is an immutable snapshot with an embedded string pool; callers
hold them through `Arc` references and caches may keep additional
references keyed by refresh epoch. A component that fails to build its
snapshot publishes an empty map instead of surfacing an error.
*/

use crate::strmap::{StrPool, StrRef};
use crate::util;

use memscope_core::types::Address;

/// Classification of a module map entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleType {
    /// Present on the loader lists.
    Linked,
    /// Image VAD with executable pages but not on the loader lists.
    NotLinked,
    /// Image VAD without executable pages.
    Data,
    /// Caller-supplied injected module base.
    Injected,
}

impl Default for ModuleType {
    fn default() -> Self {
        ModuleType::Linked
    }
}

#[derive(Debug, Clone, Default)]
pub struct ModuleEntry {
    pub va_base: Address,
    pub va_entry: Address,
    pub cb_image: u32,
    pub tp: ModuleType,
    pub wow64: bool,
    pub name: StrRef,
    pub full_name: StrRef,
    pub cb_file_raw: u32,
    pub c_sections: u32,
    pub c_iat: u32,
    pub c_eat: u32,
}

/// Per-process module map.
#[derive(Default)]
pub struct ModuleMap {
    pub entries: Vec<ModuleEntry>,
    pub pool: StrPool,
    /// `(index << 32) | hash32(name)` sorted ascending by the low dword.
    pub hash: Vec<u64>,
}

impl ModuleMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, e: &ModuleEntry) -> &str {
        self.pool.get(e.name)
    }

    pub fn full_name(&self, e: &ModuleEntry) -> &str {
        self.pool.get(e.full_name)
    }

    pub fn by_base(&self, va: Address) -> Option<&ModuleEntry> {
        self.entries.iter().find(|e| e.va_base == va)
    }

    /// O(log n) display-name lookup through the sorted hash table.
    pub fn by_name(&self, name: &str) -> Option<&ModuleEntry> {
        let h = u64::from(util::hash32_name_fs(name));
        let mut i = self.hash.partition_point(|&e| (e & 0xffff_ffff) < h);
        while i < self.hash.len() && self.hash[i] & 0xffff_ffff == h {
            let idx = (self.hash[i] >> 32) as usize;
            if let Some(e) = self.entries.get(idx) {
                if self.name(e).eq_ignore_ascii_case(name) {
                    return Some(e);
                }
            }
            i += 1;
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct EatEntry {
    pub va_function: Address,
    pub ordinal: u32,
    /// Index into AddressOfFunctions.
    pub o_functions: u32,
    /// Index into AddressOfNames, or -1 for unnamed slots.
    pub o_names: i32,
    pub name: StrRef,
}

/// Export address table of one module.
#[derive(Default)]
pub struct EatMap {
    pub va_module_base: Address,
    pub ordinal_base: u32,
    pub c_functions: u32,
    pub c_names: u32,
    pub va_address_of_functions: Address,
    pub va_address_of_names: Address,
    pub entries: Vec<EatEntry>,
    pub pool: StrPool,
    /// `(index << 32) | hash32(name)` sorted ascending by the low dword.
    pub hash: Vec<u64>,
}

impl EatMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn name(&self, e: &EatEntry) -> &str {
        self.pool.get(e.name)
    }

    /// Resolves an exported function by name.
    pub fn lookup(&self, name: &str) -> Option<&EatEntry> {
        let h = u64::from(util::hash32(name));
        let mut i = self.hash.partition_point(|&e| (e & 0xffff_ffff) < h);
        while i < self.hash.len() && self.hash[i] & 0xffff_ffff == h {
            let idx = (self.hash[i] >> 32) as usize;
            if let Some(e) = self.entries.get(idx) {
                if self.name(e) == name {
                    return Some(e);
                }
            }
            i += 1;
        }
        None
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IatThunk {
    pub f32: bool,
    pub hint: u16,
    pub rva_first_thunk: u32,
    pub rva_original_first_thunk: u32,
    pub rva_name_function: u32,
    pub rva_name_module: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IatEntry {
    pub va_function: Address,
    pub module: StrRef,
    pub function: StrRef,
    pub thunk: IatThunk,
}

/// Import address table of one module.
#[derive(Default)]
pub struct IatMap {
    pub va_module_base: Address,
    pub entries: Vec<IatEntry>,
    pub pool: StrPool,
}

impl IatMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn module(&self, e: &IatEntry) -> &str {
        self.pool.get(e.module)
    }

    pub fn function(&self, e: &IatEntry) -> &str {
        self.pool.get(e.function)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HeapEntry {
    pub va_segment: Address,
    /// Stable heap index within the process.
    pub heap_id: u32,
    /// First segment of its heap.
    pub primary: bool,
    pub pages: u32,
    pub pages_uncommitted: u32,
}

/// Per-process heap segment map, sorted by segment address.
#[derive(Default)]
pub struct HeapMap {
    pub entries: Vec<HeapEntry>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadEntry {
    pub va_ethread: Address,
    pub tid: u32,
    pub pid: u32,
    pub exit_status: u32,
    pub state: u8,
    pub suspend_count: u8,
    pub running: u8,
    pub priority: u8,
    pub base_priority: u8,
    pub va_teb: Address,
    pub ft_create_time: u64,
    pub ft_exit_time: u64,
    pub va_start_address: Address,
    pub va_stack_base_kernel: Address,
    pub va_stack_limit_kernel: Address,
    pub va_stack_base_user: Address,
    pub va_stack_limit_user: Address,
    pub va_trap_frame: Address,
    pub va_rip: Address,
    pub va_rsp: Address,
    pub affinity: u64,
    pub kernel_time: u32,
    pub user_time: u32,
}

/// Per-process thread map, sorted ascending by TID.
#[derive(Default)]
pub struct ThreadMap {
    pub entries: Vec<ThreadEntry>,
}

impl ThreadMap {
    pub fn by_tid(&self, tid: u32) -> Option<&ThreadEntry> {
        let i = self.entries.partition_point(|e| e.tid < tid);
        self.entries.get(i).filter(|e| e.tid == tid)
    }
}

/// Type-specific enrichment of a handle entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleInfo {
    None,
    /// File object; size resolved through the section object pointers.
    File { cb: u32 },
    Process { pid: u32 },
    Thread { tid: u32 },
    Registry { va_hive: Address, cell: u32 },
}

impl Default for HandleInfo {
    fn default() -> Self {
        HandleInfo::None
    }
}

#[derive(Debug, Clone, Default)]
pub struct HandleEntry {
    /// Kernel object address (past the object header).
    pub va_object: Address,
    pub granted_access: u32,
    pub handle: u32,
    pub pid: u32,
    /// Decoded object type index.
    pub type_index: u8,
    pub pool_tag: u32,
    pub handle_count: u64,
    pub pointer_count: u64,
    pub va_create_info: Address,
    pub va_security_descriptor: Address,
    pub text: StrRef,
    pub info: HandleInfo,
}

/// Per-process handle map.
#[derive(Default)]
pub struct HandleMap {
    pub entries: Vec<HandleEntry>,
    pub pool: Option<StrPool>,
}

impl HandleMap {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True once the text enrichment pass has run.
    pub fn has_text(&self) -> bool {
        self.pool.is_some()
    }

    pub fn text(&self, e: &HandleEntry) -> &str {
        self.pool.as_ref().map(|p| p.get(e.text)).unwrap_or("")
    }
}

#[derive(Debug, Clone, Default)]
pub struct UnloadedModuleEntry {
    pub va_base: Address,
    pub cb_image: u32,
    pub wow64: bool,
    pub checksum: u32,
    pub time_date_stamp: u32,
    pub ft_unload: u64,
    pub name: StrRef,
}

/// Unloaded module history of a process (or of the kernel for PID 4).
#[derive(Default)]
pub struct UnloadedModuleMap {
    pub entries: Vec<UnloadedModuleEntry>,
    pub pool: StrPool,
}

impl UnloadedModuleMap {
    pub fn name(&self, e: &UnloadedModuleEntry) -> &str {
        self.pool.get(e.name)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PteMapEntry {
    pub va_base: Address,
    pub pages: u64,
    pub nx: bool,
    pub wow64: bool,
    pub text: StrRef,
}

/// Tagged hardware page map of a process.
#[derive(Default)]
pub struct PteMap {
    pub entries: Vec<PteMapEntry>,
    pub pool: StrPool,
    /// Module/PE-scan tagging has run.
    pub tag_scan: bool,
}

impl PteMap {
    pub fn text(&self, e: &PteMapEntry) -> &str {
        self.pool.get(e.text)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysMemEntry {
    pub pa: Address,
    pub cb: u64,
}

/// Physical memory run map of the target system.
#[derive(Default)]
pub struct PhysMemMap {
    pub entries: Vec<PhysMemEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct UserEntry {
    /// String form of the SID.
    pub sid: StrRef,
    pub hash_sid: u32,
    pub va_reg_hive: Address,
    pub name: StrRef,
}

/// Map of non-built-in user accounts.
#[derive(Default)]
pub struct UserMap {
    pub entries: Vec<UserEntry>,
    pub pool: StrPool,
}

impl UserMap {
    pub fn sid(&self, e: &UserEntry) -> &str {
        self.pool.get(e.sid)
    }

    pub fn name(&self, e: &UserEntry) -> &str {
        self.pool.get(e.name)
    }

    /// Looks up an account name by SID string. This is the portable
    /// variant; resolution of well-known SIDs through the host OS is
    /// deliberately not part of this layer.
    pub fn name_from_sid(&self, sid: &str) -> Option<&str> {
        let h = util::hash32(sid);
        self.entries
            .iter()
            .find(|e| e.hash_sid == h && self.sid(e) == sid)
            .map(|e| self.name(e))
    }
}
