/*!
Guest structure definitions shared by the walkers.

These mirror the in-memory layout of the (mostly undocumented) Windows
records this layer consumes. Structures that vary per build are read
field-wise at explicit offsets instead.
*/

use dataview::Pod;

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct ListEntry64 {
    pub flink: u64,
    pub blink: u64,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct ListEntry32 {
    pub flink: u32,
    pub blink: u32,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct UnicodeString64 {
    pub length: u16,
    pub maximum_length: u16,
    pub _pad: u32,
    pub buffer: u64,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct UnicodeString32 {
    pub length: u16,
    pub maximum_length: u16,
    pub buffer: u32,
}

// more extensive definition of the Windows LDR_DATA_TABLE_ENTRY struct.
#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct LdrModule64 {
    pub in_load_order_module_list: ListEntry64,
    pub in_memory_order_module_list: ListEntry64,
    pub in_initialization_order_module_list: ListEntry64,
    pub base_address: u64,
    pub entry_point: u64,
    pub size_of_image: u32,
    pub _filler1: u32,
    pub full_dll_name: UnicodeString64,
    pub base_dll_name: UnicodeString64,
    pub flags: u32,
    pub load_count: i16,
    pub tls_index: i16,
    pub hash_table_entry: ListEntry64,
    pub time_date_stamp: u32,
    pub _filler2: u32,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct LdrModule32 {
    pub in_load_order_module_list: ListEntry32,
    pub in_memory_order_module_list: ListEntry32,
    pub in_initialization_order_module_list: ListEntry32,
    pub base_address: u32,
    pub entry_point: u32,
    pub size_of_image: u32,
    pub full_dll_name: UnicodeString32,
    pub base_dll_name: UnicodeString32,
    pub flags: u32,
    pub load_count: i16,
    pub tls_index: i16,
    pub hash_table_entry: ListEntry32,
    pub time_date_stamp: u32,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct PebLdrData64 {
    pub reserved1: [u8; 8],
    pub reserved2: u64,
    pub in_load_order_module_list: ListEntry64,
    pub in_memory_order_module_list: ListEntry64,
    pub in_initialization_order_module_list: ListEntry64,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct PebLdrData32 {
    pub reserved1: [u8; 8],
    pub reserved2: u32,
    pub in_load_order_module_list: ListEntry32,
    pub in_memory_order_module_list: ListEntry32,
    pub in_initialization_order_module_list: ListEntry32,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct Peb64 {
    pub reserved1: [u8; 2],
    pub being_debugged: u8,
    pub reserved2: u8,
    pub _filler: u32,
    pub reserved3: [u64; 2],
    pub ldr: u64,
    pub process_parameters: u64,
    pub sub_system_data: u64,
    pub process_heap: u64,
    pub unknown1: [u64; 22],
    pub number_of_heaps: u32,
    pub maximum_number_of_heaps: u32,
    pub process_heaps: u64,
}

#[derive(Debug, Clone, Copy, Default, Pod)]
#[repr(C)]
pub struct Peb32 {
    pub reserved1: [u8; 2],
    pub being_debugged: u8,
    pub reserved2: u8,
    pub reserved3: [u32; 2],
    pub ldr: u32,
    pub process_parameters: u32,
    pub sub_system_data: u32,
    pub process_heap: u32,
    pub unknown1: [u32; 27],
    pub number_of_heaps: u32,
    pub maximum_number_of_heaps: u32,
    pub process_heaps: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn test_layouts() {
        assert_eq!(size_of::<LdrModule64>(), 0x88);
        assert_eq!(size_of::<LdrModule32>(), 0x48);
        assert_eq!(size_of::<PebLdrData64>(), 0x40);
        assert_eq!(size_of::<PebLdrData32>(), 0x24);
        assert_eq!(size_of::<UnicodeString64>(), 0x10);
        assert_eq!(size_of::<UnicodeString32>(), 0x8);
    }

    #[test]
    fn test_peb_heap_fields() {
        // NumberOfHeaps/ProcessHeaps live at the offsets the heap
        // walker depends on
        let p = Peb64::default();
        let base = &p as *const _ as usize;
        assert_eq!(&p.ldr as *const _ as usize - base, 0x18);
        assert_eq!(&p.process_heap as *const _ as usize - base, 0x30);
        assert_eq!(&p.number_of_heaps as *const _ as usize - base, 0xe8);
        assert_eq!(&p.process_heaps as *const _ as usize - base, 0xf0);

        let p = Peb32::default();
        let base = &p as *const _ as usize;
        assert_eq!(&p.ldr as *const _ as usize - base, 0xc);
        assert_eq!(&p.process_heap as *const _ as usize - base, 0x18);
        assert_eq!(&p.number_of_heaps as *const _ as usize - base, 0x88);
        assert_eq!(&p.process_heaps as *const _ as usize - base, 0x90);
    }
}
