use crate::win32::maps::*;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use memscope_core::types::Address;

/// Exit status value of a process that has not exited.
pub const EXIT_STATUS_STILL_ACTIVE: u32 = 259;

/// EPROCESS ImageFileName byte length.
pub const IMAGE_FILE_NAME_LENGTH: usize = 15;

/// Container holding an address set with atomic replace semantics.
///
/// Used for the sticky prefetch sets that seed the first bulk prefetch
/// of a list walk on subsequent refreshes.
#[derive(Default)]
pub struct AddrContainer(Mutex<Option<Arc<Vec<Address>>>>);

impl AddrContainer {
    pub fn get(&self) -> Option<Arc<Vec<Address>>> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, v: Arc<Vec<Address>>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = Some(v);
    }

    pub fn exists(&self) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

/// Command line and image path read from `RTL_USER_PROCESS_PARAMETERS`.
#[derive(Debug, Clone, Default)]
pub struct ProcessParameters {
    pub image_path_name: String,
    pub command_line: String,
}

/// Per-process state that survives refreshes.
///
/// The sidecar is carried over when a refresh re-creates the process
/// object for the same (PID, EPROCESS) identity, so that expensive
/// one-time lookups and learned prefetch sets outlive the short-lived
/// process snapshots.
#[derive(Default)]
pub struct ProcessPersistent {
    pub ldr_prefetch64: AddrContainer,
    pub ldr_prefetch32: AddrContainer,
    pub thread_prefetch: AddrContainer,
    /// Injected module bases supplied by callers, revalidated each refresh.
    pub injected: Mutex<Vec<Address>>,
    /// Canonical `\Device\...` path from SeAuditProcessCreationInfo.
    pub path_kernel: Mutex<Option<String>>,
    /// Long name derived from `path_kernel`.
    pub name_long: Mutex<Option<String>>,
    pub proc_params: Mutex<Option<ProcessParameters>>,
}

impl ProcessPersistent {
    pub fn path_kernel(&self) -> Option<String> {
        self.path_kernel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn name_long(&self) -> Option<String> {
        self.name_long
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Field bundle used to construct a [`Win32Process`].
pub(crate) struct NewProcess {
    pub pid: u32,
    pub ppid: u32,
    pub state: u32,
    pub dtb: Address,
    pub dtb_user: Address,
    pub name: String,
    pub user_only: bool,
    pub va_eprocess: Address,
    pub va_peb: Address,
    pub va_peb32: u32,
    pub wow64: bool,
    pub no_link: bool,
    pub eprocess_bytes: Vec<u8>,
}

pub(crate) struct ProcessMaps {
    module: RwLock<Option<Arc<ModuleMap>>>,
    heap: RwLock<Option<Arc<HeapMap>>>,
    thread: RwLock<Option<Arc<ThreadMap>>>,
    handle: RwLock<Option<Arc<HandleMap>>>,
    unloaded: RwLock<Option<Arc<UnloadedModuleMap>>>,
    pte: RwLock<Option<Arc<PteMap>>>,
}

impl Default for ProcessMaps {
    fn default() -> Self {
        Self {
            module: RwLock::new(None),
            heap: RwLock::new(None),
            thread: RwLock::new(None),
            handle: RwLock::new(None),
            unloaded: RwLock::new(None),
            pte: RwLock::new(None),
        }
    }
}

macro_rules! map_slot {
    ($get:ident, $set:ident, $field:ident, $ty:ty) => {
        pub(crate) fn $get(&self) -> Option<Arc<$ty>> {
            self.maps
                .$field
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        pub(crate) fn $set(&self, v: Arc<$ty>) {
            *self
                .maps
                .$field
                .write()
                .unwrap_or_else(PoisonError::into_inner) = Some(v);
        }
    };
}

/// A process reconstructed from kernel memory.
pub struct Win32Process {
    pub pid: u32,
    pub ppid: u32,
    /// `_DISPATCHER_HEADER.SignalState`; nonzero once the process exited.
    pub state: u32,
    pub dtb: Address,
    /// Shadow (user) directory table base, if discovered.
    pub dtb_user: Address,
    /// Short name from `EPROCESS.ImageFileName` (max 15 chars).
    pub name: String,
    pub va_eprocess: Address,
    /// Process is inspected through its user-mode address space.
    pub user_only: bool,
    /// Process was found through the object table rather than the
    /// EPROCESS list.
    pub no_link: bool,
    pub va_peb: Address,
    pub va_peb32: u32,
    pub wow64: bool,
    /// Raw EPROCESS bytes captured at enumeration time.
    pub eprocess_bytes: Vec<u8>,

    pub persistent: Arc<ProcessPersistent>,

    pub(crate) maps: ProcessMaps,
    lock_update: Mutex<()>,
    lock_update_ext: Mutex<()>,
}

impl Win32Process {
    pub(crate) fn new(np: NewProcess, persistent: Arc<ProcessPersistent>) -> Self {
        Self {
            pid: np.pid,
            ppid: np.ppid,
            state: np.state,
            dtb: np.dtb,
            dtb_user: np.dtb_user,
            name: np.name,
            va_eprocess: np.va_eprocess,
            user_only: np.user_only,
            no_link: np.no_link,
            va_peb: np.va_peb,
            va_peb32: np.va_peb32,
            wow64: np.wow64,
            eprocess_bytes: np.eprocess_bytes,
            persistent,
            maps: ProcessMaps::default(),
            lock_update: Mutex::new(()),
            lock_update_ext: Mutex::new(()),
        }
    }

    /// The kernel process (PID 4).
    pub fn is_kernel(&self) -> bool {
        self.pid == 4
    }

    /// Serializes module, heap and handle (core) initialization.
    pub(crate) fn lock_update(&self) -> MutexGuard<'_, ()> {
        self.lock_update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Serializes thread enumeration and handle text enrichment so they
    /// do not contend with the core map initializers.
    pub(crate) fn lock_update_ext(&self) -> MutexGuard<'_, ()> {
        self.lock_update_ext
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    map_slot!(map_module, set_map_module, module, ModuleMap);
    map_slot!(map_heap, set_map_heap, heap, HeapMap);
    map_slot!(map_thread, set_map_thread, thread, ThreadMap);
    map_slot!(map_handle, set_map_handle, handle, HandleMap);
    map_slot!(map_unloaded, set_map_unloaded, unloaded, UnloadedModuleMap);
    map_slot!(map_pte, set_map_pte, pte, PteMap);

    /// Drops all derived per-process maps. Existing holders keep their
    /// snapshots alive through their own references.
    pub(crate) fn clear_maps(&self) {
        *self.maps.module.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.maps.heap.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.maps.thread.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.maps.handle.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.maps.unloaded.write().unwrap_or_else(PoisonError::into_inner) = None;
        *self.maps.pte.write().unwrap_or_else(PoisonError::into_inner) = None;
    }
}

impl std::fmt::Debug for Win32Process {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Win32Process")
            .field("pid", &self.pid)
            .field("ppid", &self.ppid)
            .field("name", &self.name)
            .field("dtb", &self.dtb)
            .field("va_eprocess", &self.va_eprocess)
            .field("user_only", &self.user_only)
            .field("wow64", &self.wow64)
            .finish()
    }
}

/// Immutable process table snapshot keyed by PID.
#[derive(Default)]
pub struct ProcessTable {
    map: BTreeMap<u32, Arc<Win32Process>>,
}

impl ProcessTable {
    pub fn get(&self, pid: u32) -> Option<Arc<Win32Process>> {
        self.map.get(&pid).cloned()
    }

    pub fn insert(&mut self, proc: Arc<Win32Process>) {
        self.map.insert(proc.pid, proc);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Win32Process>> {
        self.map.values()
    }
}
