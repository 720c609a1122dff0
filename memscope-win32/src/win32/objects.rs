/*!
Kernel object type table and the Windows 10 type-index decoding.

The table is initialized once from `nt!ObTypeIndexTable` (requiring the
symbol provider); each slot carries the display name read from the
`_OBJECT_TYPE` and, for well-known types, the canonical structure name
verified through the `ObNm` pool tag.
*/

use crate::strmap::{StrMapBuilder, StrPool, StrRef};
use crate::util::{self, va, MAX_PATH};
use crate::vmm::Vmm;

use std::sync::PoisonError;

use log::{debug, trace};

use memscope_core::mem::{PhysicalMemory, ReadFlags};
use memscope_core::types::Address;

/// Display-name to structure-name pairs; order defines the canonical
/// slot indices used by the type shortcuts below.
const NAME2OBJECT: [(&str, &str); 18] = [
    ("ALPC Port", "_ALPC_PORT"),
    ("Device", "_DEVICE_OBJECT"),
    ("Directory", "_OBJECT_DIRECTORY"),
    ("Driver", "_DRIVER_OBJECT"),
    ("Event", "_KEVENT"),
    ("File", "_FILE_OBJECT"),
    ("Job", "_EJOB"),
    ("Key", "_CM_KEY_BODY"),
    ("Mutant", "_KMUTANT"),
    ("Process", "_EPROCESS"),
    ("Section", "_SECTION"),
    ("Semaphore", "_KSEMAPHORE"),
    ("Session", "_MM_SESSION_SPACE"),
    ("SymbolicLink", "_OBJECT_SYMBOLIC_LINK"),
    ("Thread", "_ETHREAD"),
    ("Timer", "_KTIMER"),
    ("Token", "_TOKEN"),
    ("Type", "_OBJECT_TYPE"),
];

const CANONICAL_PROCESS: usize = 9;
const CANONICAL_THREAD: usize = 14;

/// Resolved information about one object type slot.
#[derive(Debug, Clone)]
pub struct ObjectType {
    pub type_index: u8,
    pub name: String,
    /// Canonical structure name, when pool-tag verified.
    pub type_struct: Option<&'static str>,
    /// Size of the structure per debug symbols; 0 when unknown.
    pub cb: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct TypeSlot {
    name: StrRef,
    cb: u32,
    canonical: Option<usize>,
}

/// The 0-255 slot object type table plus the per-boot header cookie.
pub struct ObjectTypeTable {
    pub initialized: bool,
    pub failed: bool,
    pub cookie: u8,
    pub count: u16,
    slots: Vec<Option<TypeSlot>>,
    canonical_index: [u8; NAME2OBJECT.len()],
    pool: StrPool,
}

impl Default for ObjectTypeTable {
    fn default() -> Self {
        Self {
            initialized: false,
            failed: false,
            cookie: 0,
            count: 0,
            slots: vec![None; 256],
            canonical_index: [0; NAME2OBJECT.len()],
            pool: StrPool::default(),
        }
    }
}

impl ObjectTypeTable {
    fn get(&self, type_index: u8) -> Option<ObjectType> {
        let slot = self.slots.get(type_index as usize)?.as_ref()?;
        Some(ObjectType {
            type_index,
            name: self.pool.get(slot.name).to_string(),
            type_struct: slot.canonical.map(|i| NAME2OBJECT[i].1),
            cb: slot.cb,
        })
    }
}

fn initialize_table<P: PhysicalMemory>(vmm: &Vmm<P>, table: &mut ObjectTypeTable) -> Option<()> {
    let f32 = vmm.sysinfo.f32();
    let sys = vmm.system_process().ok()?;
    let sym = vmm.symbols.as_deref()?;
    let va_type_table = sym.symbol_address("nt", "ObTypeIndexTable")?;

    if vmm.sysinfo.version_major == 10 {
        let va_cookie = sym.symbol_address("nt", "ObHeaderCookie")?;
        let mut cookie = [0u8; 1];
        vmm.read(&sys, va_cookie, &mut cookie).ok()?;
        table.cookie = cookie[0];
    }

    // fetch and count the object type addresses
    let cb_ptr = if f32 { 4 } else { 8 };
    let mut pb = vec![0u8; 256 * cb_ptr];
    vmm.read_ex(&sys, va_type_table, &mut pb, ReadFlags::ZEROPAD_ON_FAIL);
    let mut ava = [0u64; 256];
    let mut c_type = 2usize;
    while c_type < 256 {
        let p = va::ptr(f32, &pb, c_type * cb_ptr);
        let valid = if f32 {
            va::kaddr32_8(p)
        } else {
            va::kaddr64_16(p)
        };
        if !valid {
            break;
        }
        ava[c_type] = p;
        c_type += 1;
    }
    if c_type == 2 {
        return None; // none found
    }

    // fetch the unicode length and buffer address of each type name
    vmm.prefetch(&sys, ava.iter().take(c_type).map(|&v| Address::from(v)), 0x10);
    let mut alen = [0u16; 256];
    let mut pb16 = [0u8; 0x10];
    for i in 2..c_type {
        let va_name = Address::from(ava[i]) + if f32 { 8 } else { 16 };
        let mut ok = vmm.read_ex(&sys, va_name, &mut pb16, ReadFlags::FORCECACHE_READ) == 0x10;
        let len = va::w(&pb16, 0);
        ok = ok && len != 0 && (len as usize) < MAX_PATH && len <= va::w(&pb16, 2);
        let buffer = if f32 {
            u64::from(va::dw(&pb16, 4))
        } else {
            va::qw(&pb16, 8)
        };
        ok = ok
            && if f32 {
                va::kaddr32_8(buffer)
            } else {
                va::kaddr64_16(buffer)
            };
        if ok {
            alen[i] = len;
            ava[i] = buffer;
        } else {
            ava[i] = 0;
        }
    }

    // fetch the names, verifying the prepended 'ObNm' pool tag
    vmm.prefetch(
        &sys,
        ava.iter().take(c_type).map(|&v| Address::from(v)),
        2 * MAX_PATH,
    );
    let mut pool = StrMapBuilder::new();
    let mut pb_name = vec![0u8; 16 + 2 * MAX_PATH];
    for i in 2..c_type {
        if ava[i] == 0 {
            continue;
        }
        let cb = 16 + alen[i] as usize;
        let ok = vmm.read_ex(
            &sys,
            Address::from(ava[i]) - 16,
            &mut pb_name[..cb],
            ReadFlags::FORCECACHE_READ,
        ) == cb;
        if !ok || !util::pool_tag_prepended(f32, &pb_name[..16], b"ObNm") {
            continue;
        }
        let name = crate::win32::unicode::utf16_bytes_to_string(&pb_name[16..cb]);
        if name.is_empty() {
            continue;
        }
        table.slots[i] = Some(TypeSlot {
            name: pool.push(&name),
            cb: 0,
            canonical: None,
        });
    }

    // match canonical names and resolve their structure sizes
    for i in 2..c_type {
        let name = match table.slots[i].as_ref() {
            Some(slot) => pool.peek(slot.name).to_string(),
            None => continue,
        };
        for (j, &(display, type_struct)) in NAME2OBJECT.iter().enumerate() {
            if name == display {
                table.canonical_index[j] = i as u8;
                if let Some(slot) = table.slots[i].as_mut() {
                    slot.canonical = Some(j);
                    slot.cb = sym.type_size(type_struct).unwrap_or(0);
                }
            }
        }
    }

    table.count = c_type as u16;
    table.pool = pool.finish();
    debug!("object type table initialized with {} types", c_type - 2);
    Some(())
}

/// Resolves an object type slot, initializing the table on first use.
pub(crate) fn object_type_get<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    type_index: u8,
) -> Option<ObjectType> {
    {
        let table = vmm
            .obtypes
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        if table.initialized {
            return table.get(type_index);
        }
    }
    let mut table = vmm
        .obtypes
        .write()
        .unwrap_or_else(PoisonError::into_inner);
    if table.initialized {
        return table.get(type_index);
    }
    let ok = initialize_table(vmm, &mut table).is_some();
    table.initialized = true;
    table.failed = !ok;
    table.get(type_index)
}

/// Decodes the encoded `_OBJECT_HEADER.TypeIndex` of Windows 10+ by
/// xoring with the second byte of the header address and the per-boot
/// `ObHeaderCookie`.
pub(crate) fn type_index_decode<P: PhysicalMemory>(
    vmm: &Vmm<P>,
    va_object_header: Address,
    encoded: u8,
) -> u8 {
    if vmm.sysinfo.version_major != 10 {
        return encoded;
    }
    // dummy lookup to trigger table initialization
    let _ = object_type_get(vmm, 0);
    let table = vmm
        .obtypes
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    if table.failed {
        return 0;
    }
    let decoded = encoded ^ (va_object_header.as_u64() >> 8) as u8 ^ table.cookie;
    trace!(
        "type index {:02x} @ {:x} -> {:02x}",
        encoded,
        va_object_header,
        decoded
    );
    decoded
}

/// Type index of `Process` objects, used by no-link discovery.
pub(crate) fn process_type_index<P: PhysicalMemory>(vmm: &Vmm<P>) -> Option<u8> {
    let _ = object_type_get(vmm, 2)?;
    let table = vmm
        .obtypes
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    match table.canonical_index[CANONICAL_PROCESS] {
        0 => None,
        i => Some(i),
    }
}

/// Type index of `Thread` objects.
pub(crate) fn thread_type_index<P: PhysicalMemory>(vmm: &Vmm<P>) -> Option<u8> {
    let _ = object_type_get(vmm, 2)?;
    let table = vmm
        .obtypes
        .read()
        .unwrap_or_else(PoisonError::into_inner);
    match table.canonical_index[CANONICAL_THREAD] {
        0 => None,
        i => Some(i),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::*;
    use crate::vmm::VmmBuilder;

    use memscope_core::mem::DummyMemory;

    const VA_TYPE_TABLE: u64 = 0xffff_8000_00a2_0000;
    const VA_COOKIE: u64 = 0xffff_8000_00a3_0000;
    const VA_TYPE_PROCESS: u64 = 0xffff_8000_00a0_0000;
    const VA_TYPE_THREAD: u64 = 0xffff_8000_00a1_0000;
    const COOKIE: u8 = 0x42;

    fn write_object_type(mem: &mut DummyMemory, va_type: u64, va_name_buf: u64, name: &str) {
        // _OBJECT_TYPE.Name at +16, buffer pool-tagged 'ObNm'
        mem.map(Address::from(va_type), 0x40);
        mem.write_u16(Address::from(va_type + 16), (name.len() * 2) as u16);
        mem.write_u16(Address::from(va_type + 18), (name.len() * 2 + 2) as u16);
        mem.write_u64(Address::from(va_type + 24), va_name_buf);
        mem.write(Address::from(va_name_buf - 12), b"ObNm");
        mem.write_utf16(Address::from(va_name_buf), name);
    }

    /// Object type table image with `Process` at index 2 and `Thread`
    /// at index 3.
    fn objects_vmm() -> Vmm<DummyMemory> {
        let si = sysinfo_x64(10, 19041);
        let mut mem = DummyMemory::new();
        mem.write(Address::from(VA_COOKIE), &[COOKIE]);
        mem.map(Address::from(VA_TYPE_TABLE), 0x800);
        mem.write_u64(Address::from(VA_TYPE_TABLE + 2 * 8), VA_TYPE_PROCESS);
        mem.write_u64(Address::from(VA_TYPE_TABLE + 3 * 8), VA_TYPE_THREAD);
        write_object_type(&mut mem, VA_TYPE_PROCESS, 0xffff_8000_00b0_0100, "Process");
        write_object_type(&mut mem, VA_TYPE_THREAD, 0xffff_8000_00b1_0100, "Thread");

        let sym = TestSymbols::new()
            .symbol("nt", "ObTypeIndexTable", VA_TYPE_TABLE)
            .symbol("nt", "ObHeaderCookie", VA_COOKIE);
        let vmm = VmmBuilder::new(mem, si.clone())
            .identity_translation()
            .symbol_provider(Box::new(sym))
            .build();
        install_processes(&vmm, vec![np_system(&si, vec![])]);
        vmm
    }

    #[test]
    fn test_type_table_and_cookie_decode() {
        let vmm = objects_vmm();

        let process = object_type_get(&vmm, 2).expect("Process type");
        assert_eq!(process.name, "Process");
        assert_eq!(process.type_struct, Some("_EPROCESS"));
        let thread = object_type_get(&vmm, 3).expect("Thread type");
        assert_eq!(thread.name, "Thread");
        assert_eq!(thread.type_struct, Some("_ETHREAD"));
        assert_eq!(process_type_index(&vmm), Some(2));
        assert_eq!(thread_type_index(&vmm), Some(3));

        // the win10 decode must undo the header-address/cookie xor
        let va_hdr = Address::from(0xffff_9a8b_1234_5600u64);
        let encoded = 2u8 ^ ((va_hdr.as_u64() >> 8) as u8) ^ COOKIE;
        assert_eq!(type_index_decode(&vmm, va_hdr, encoded), 2);
        assert_ne!(type_index_decode(&vmm, va_hdr + 0x100usize, encoded), 2);
    }

    #[test]
    fn test_decode_passthrough_before_win10() {
        let si = sysinfo_x64(6, 7601);
        let vmm = vmm_with(DummyMemory::new(), si.clone());
        install_processes(&vmm, vec![np_system(&si, vec![])]);
        // pre-win10 type indices are stored in the clear
        let va_hdr = Address::from(0xffff_8000_0099_0000u64);
        assert_eq!(type_index_decode(&vmm, va_hdr, 0x1f), 0x1f);
    }

    #[test]
    fn test_decode_zero_when_table_unavailable() {
        // win10 without a symbol provider: initialization fails and the
        // decoder reports the index as unknown
        let si = sysinfo_x64(10, 19041);
        let vmm = vmm_with(DummyMemory::new(), si.clone());
        install_processes(&vmm, vec![np_system(&si, vec![])]);
        assert_eq!(
            type_index_decode(&vmm, Address::from(0xffff_8000_0099_0000u64), 0x1f),
            0
        );
        assert!(object_type_get(&vmm, 2).is_none());
    }
}
