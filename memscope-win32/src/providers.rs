/*!
Traits for the external engines the introspection layer consumes.

The PDB symbol resolver, the registry hive engine and the VAD/PTE map
builders are separate subsystems; the core only ever talks to them
through these seams. All providers are optional — a missing provider
degrades the affected artifact to an empty snapshot, it never fails the
caller.
*/

use memscope_core::types::Address;

/// Resolves debug symbols and type information.
///
/// Addresses returned are virtual addresses in the target system, i.e.
/// the provider is expected to have rebased symbols onto the loaded
/// module images.
pub trait SymbolProvider: Send + Sync {
    /// Address of a symbol, e.g. `("nt", "ObTypeIndexTable")` or
    /// `("ntdll", "RtlpUnloadEventTrace")`.
    fn symbol_address(&self, module: &str, symbol: &str) -> Option<Address>;

    /// Offset of a field within a type, e.g. `("_EPROCESS", "Peb")`.
    fn type_child_offset(&self, type_name: &str, field: &str) -> Option<u32>;

    /// Size of a type, e.g. `"_ETHREAD"`.
    fn type_size(&self, type_name: &str) -> Option<u32>;
}

#[derive(Debug, Clone)]
pub struct RegistryHive {
    pub va: Address,
    pub name: String,
}

#[derive(Debug, Clone, Default)]
pub struct RegistryKeyInfo {
    pub name: String,
    pub cell: u32,
}

/// Access to the registry hive engine.
pub trait RegistryProvider: Send + Sync {
    /// Queries a value by full path, e.g.
    /// `HKLM\HARDWARE\RESOURCEMAP\System Resources\Physical Memory\.Translated`.
    fn value_query(&self, path: &str) -> Option<Vec<u8>>;

    /// Enumerates all known hives.
    fn hives(&self) -> Vec<RegistryHive>;

    /// Queries a value relative to a hive root. Returns the value type
    /// and the raw data.
    fn hive_value_query(&self, hive: Address, path: &str) -> Option<(u32, Vec<u8>)>;

    /// Resolves a hive by the virtual address of its `_CMHIVE`.
    fn hive_by_address(&self, va: Address) -> Option<RegistryHive>;

    /// Resolves a key by hive and cell offset.
    fn key_by_cell(&self, hive: Address, cell: u32) -> Option<RegistryKeyInfo>;
}

/// One virtual address descriptor of a process.
#[derive(Debug, Clone, Copy)]
pub struct VadEntry {
    pub va_start: Address,
    pub va_end: Address,
    /// Range is backed by an image section.
    pub image: bool,
}

/// Supplies the VAD map of a process.
pub trait VadProvider: Send + Sync {
    fn vad_map(&self, pid: u32) -> Option<Vec<VadEntry>>;
}

/// One contiguous hardware page range of a process, as derived from the
/// page tables. Ranges are expected sorted ascending by base.
#[derive(Debug, Clone, Copy)]
pub struct PteRange {
    pub va_base: Address,
    pub pages: u64,
    /// Range is mapped no-execute.
    pub nx: bool,
}

/// Supplies the hardware page map of a process.
pub trait PteProvider: Send + Sync {
    fn pte_map(&self, pid: u32) -> Option<Vec<PteRange>>;
}
