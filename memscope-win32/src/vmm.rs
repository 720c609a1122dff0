/*!
The explicit context value all introspection entry points operate on.

Everything the original keeps in global state — caches, locks, offset
tables, the process table — lives on [`Vmm`]. The context is generic
over the physical memory backend and safe to share between threads.
*/

use crate::cachemap::EpochCache;
use crate::error::{Error, Result};
use crate::offsets::{EprocessOffsets, EthreadOffsets};
use crate::providers::{PteProvider, RegistryProvider, SymbolProvider, VadProvider};
use crate::win32::maps::*;
use crate::win32::objects::ObjectTypeTable;
use crate::win32::process::{NewProcess, ProcessParameters, ProcessTable, Win32Process};
use crate::win32::{handle, heap, module, objects, pe, physmem, proc_enum, ptemap, thread, unloaded, user};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use log::trace;

use memscope_core::arch::{Architecture, Translator};
use memscope_core::mem::{PageCache, PhysicalMemory};
use memscope_core::types::Address;

/// Facts about the target system established before introspection
/// starts (boot information scan, kernel PE parsing and similar).
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub arch: Architecture,
    /// Directory table base of the SYSTEM process.
    pub dtb: Address,
    /// Virtual address of the SYSTEM `_EPROCESS`.
    pub va_eprocess_system: Address,
    pub kernel_base: Address,
    pub kernel_size: usize,
    pub version_major: u32,
    pub version_build: u32,
    /// Highest physical address of the memory image.
    pub pa_max: Address,
    /// Virtual address of `PsLoadedModuleList`.
    pub va_ps_loaded_module_list: Address,
}

impl SystemInfo {
    /// True when the target runs a 32-bit kernel.
    pub fn f32(&self) -> bool {
        self.arch == Architecture::X86
    }
}

pub(crate) struct VmmConfig {
    /// The backing medium is live/volatile; learned prefetch sets are
    /// worth persisting across refreshes.
    pub volatile_mem: bool,
    /// Per-process caching (sticky prefetch containers) is enabled.
    pub process_cache: bool,
    /// Treat guest virtual addresses as physical (synthetic images).
    pub identity_translation: bool,
}

const KEY_UNLOADED_UNRESOLVED: u64 = 0;
const KEY_UNLOADED_FAILED: u64 = u64::MAX;

pub struct Vmm<P: PhysicalMemory> {
    pub(crate) phys: Mutex<P>,
    pub(crate) cache: PageCache,
    epoch_medium: AtomicU64,

    pub sysinfo: SystemInfo,
    pub(crate) cfg: VmmConfig,

    offsets_eprocess: RwLock<EprocessOffsets>,
    offsets_ethread: Mutex<Option<Option<EthreadOffsets>>>,

    procs: RwLock<Arc<ProcessTable>>,
    staging: Mutex<Option<ProcessTable>>,

    pub(crate) eat_cache: EpochCache<EatMap>,
    pub(crate) iat_cache: EpochCache<IatMap>,

    pub(crate) obtypes: RwLock<ObjectTypeTable>,

    physmem_map: Mutex<Option<Arc<PhysMemMap>>>,
    user_map: Mutex<Option<Arc<UserMap>>>,
    lock_update_map: Mutex<()>,

    /// Sticky prefetch set of the EPROCESS list walk.
    pub(crate) eproc_prefetch: crate::win32::process::AddrContainer,

    /// Cached `ntdll!RtlpUnloadEventTrace` per bitness; 0 = unresolved,
    /// `u64::MAX` = resolution failed, do not retry.
    pub(crate) unloaded_ntdll32: AtomicU64,
    pub(crate) unloaded_ntdll64: AtomicU64,

    pub(crate) symbols: Option<Box<dyn SymbolProvider>>,
    pub(crate) registry: Option<Box<dyn RegistryProvider>>,
    pub(crate) vad: Option<Box<dyn VadProvider>>,
    pub(crate) pte: Option<Box<dyn PteProvider>>,
}

impl<P: PhysicalMemory> Vmm<P> {
    pub fn builder(phys: P, sysinfo: SystemInfo) -> VmmBuilder<P> {
        VmmBuilder::new(phys, sysinfo)
    }

    /// Current medium refresh epoch. Derived snapshots cached under an
    /// older epoch are invisible.
    pub fn epoch(&self) -> u64 {
        self.epoch_medium.load(Ordering::Acquire)
    }

    /// Starts a new refresh epoch: the page cache and all derived maps
    /// become invalid. Snapshots already handed out stay alive through
    /// their own references.
    pub fn refresh_medium(&self) {
        self.epoch_medium.fetch_add(1, Ordering::AcqRel);
        self.cache.clear();
        *self
            .physmem_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        *self.user_map.lock().unwrap_or_else(PoisonError::into_inner) = None;
        for proc in self.process_table().iter() {
            proc.clear_maps();
        }
    }

    // ------------------------------------------------------------------
    // process table
    // ------------------------------------------------------------------

    pub(crate) fn process_table(&self) -> Arc<ProcessTable> {
        self.procs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn process_get(&self, pid: u32) -> Option<Arc<Win32Process>> {
        self.process_table().get(pid)
    }

    /// The SYSTEM process (PID 4).
    pub fn system_process(&self) -> Result<Arc<Win32Process>> {
        self.process_get(4).ok_or(Error::ProcessInfo)
    }

    pub fn process_list(&self) -> Vec<Arc<Win32Process>> {
        self.process_table().iter().cloned().collect()
    }

    /// Walks the EPROCESS list and republishes the process table.
    /// Returns the quality gate: true when more than 10 processes were
    /// enumerated.
    pub fn process_enumerate(&self, total_refresh: bool) -> Result<bool> {
        let sys = self.system_process()?;
        let no_link = if self.process_table().len() > 1 {
            proc_enum::find_no_link_processes(self)
        } else {
            None
        };
        proc_enum::enumerate(self, &sys, total_refresh, no_link)
    }

    /// Creates a process in the staging table of an ongoing enumeration.
    /// Returns `None` on a collision (PID already staged, or PID reused
    /// with a different DTB on an incremental refresh).
    pub(crate) fn process_create_entry(
        &self,
        total_refresh: bool,
        np: NewProcess,
    ) -> Option<Arc<Win32Process>> {
        let mut staging = self.staging.lock().unwrap_or_else(PoisonError::into_inner);
        let st = staging.get_or_insert_with(ProcessTable::default);
        if st.get(np.pid).is_some() {
            return None;
        }

        let old = self.process_table().get(np.pid);
        let persistent = match old {
            Some(ref old) if old.va_eprocess == np.va_eprocess && old.dtb == np.dtb => {
                if !total_refresh {
                    // identity unchanged, keep the object and its maps
                    let kept = old.clone();
                    st.insert(kept.clone());
                    return Some(kept);
                }
                old.persistent.clone()
            }
            Some(_) if !total_refresh => return None,
            // total refresh with changed identity: PID was reused, the
            // sidecar does not carry over
            _ => Arc::new(Default::default()),
        };

        let proc = Arc::new(Win32Process::new(np, persistent));
        st.insert(proc.clone());
        Some(proc)
    }

    /// Publishes the staging table as the current process table.
    pub(crate) fn process_create_finish(&self) {
        let table = self
            .staging
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(table) = table {
            trace!("publishing process table with {} entries", table.len());
            *self.procs.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        }
    }

    // ------------------------------------------------------------------
    // offsets
    // ------------------------------------------------------------------

    pub fn eprocess_offsets(&self) -> EprocessOffsets {
        *self
            .offsets_eprocess
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Installs EPROCESS offsets, e.g. from a previously dumped offset
    /// file or a test fixture.
    pub fn set_eprocess_offsets(&self, po: EprocessOffsets) {
        *self
            .offsets_eprocess
            .write()
            .unwrap_or_else(PoisonError::into_inner) = po;
    }

    /// ETHREAD offsets, resolved through the symbol provider on first
    /// use.
    pub fn ethread_offsets(&self) -> Option<EthreadOffsets> {
        let mut guard = self
            .offsets_ethread
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(resolved) = *guard {
            return resolved;
        }
        let resolved = self
            .symbols
            .as_deref()
            .and_then(EthreadOffsets::from_symbols);
        *guard = Some(resolved);
        resolved
    }

    /// Installs ETHREAD offsets directly.
    pub fn set_ethread_offsets(&self, ot: EthreadOffsets) {
        *self
            .offsets_ethread
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Some(ot));
    }

    // ------------------------------------------------------------------
    // per-process artifacts
    // ------------------------------------------------------------------

    /// Module map of a process; built on first use, cached until the
    /// next refresh epoch.
    pub fn module_map(&self, proc: &Win32Process) -> Arc<ModuleMap> {
        self.module_map_with_injected(proc, None)
    }

    /// Module map, additionally merging the given injected module base
    /// addresses into the persistent injected set.
    pub fn module_map_with_injected(
        &self,
        proc: &Win32Process,
        injected: Option<&[Address]>,
    ) -> Arc<ModuleMap> {
        let force = injected.map(|s| !s.is_empty()).unwrap_or(false);
        if !force {
            if let Some(m) = proc.map_module() {
                return m;
            }
        }
        let _guard = proc.lock_update();
        if !force {
            if let Some(m) = proc.map_module() {
                return m;
            }
        }
        let map = Arc::new(module::initialize(self, proc, injected));
        proc.set_map_module(map.clone());
        map
    }

    /// Export table of a module, cached by `(PID, module base)` until
    /// the next refresh epoch.
    pub fn eat_map(&self, proc: &Win32Process, module: &ModuleEntry) -> Arc<EatMap> {
        let key = eat_iat_key(proc.pid, module.va_base);
        let epoch = self.epoch();
        if let Some(m) = self.eat_cache.get(key, epoch) {
            return m;
        }
        let _guard = proc.lock_update();
        if let Some(m) = self.eat_cache.get(key, epoch) {
            return m;
        }
        let map = Arc::new(pe::eat_initialize(self, proc, module));
        self.eat_cache.put(key, epoch, map.clone());
        map
    }

    /// Import table of a module, cached by `(PID, module base)` until
    /// the next refresh epoch.
    pub fn iat_map(&self, proc: &Win32Process, module: &ModuleEntry) -> Arc<IatMap> {
        let key = eat_iat_key(proc.pid, module.va_base);
        let epoch = self.epoch();
        if let Some(m) = self.iat_cache.get(key, epoch) {
            return m;
        }
        let _guard = proc.lock_update();
        if let Some(m) = self.iat_cache.get(key, epoch) {
            return m;
        }
        let map = Arc::new(pe::iat_initialize(self, proc, module));
        self.iat_cache.put(key, epoch, map.clone());
        map
    }

    pub fn heap_map(&self, proc: &Win32Process) -> Arc<HeapMap> {
        if let Some(m) = proc.map_heap() {
            return m;
        }
        let _guard = proc.lock_update();
        if let Some(m) = proc.map_heap() {
            return m;
        }
        let map = Arc::new(heap::initialize(self, proc));
        proc.set_map_heap(map.clone());
        map
    }

    pub fn thread_map(&self, proc: &Win32Process) -> Arc<ThreadMap> {
        if let Some(m) = proc.map_thread() {
            return m;
        }
        let _guard = proc.lock_update_ext();
        if let Some(m) = proc.map_thread() {
            return m;
        }
        let map = Arc::new(thread::initialize(self, proc));
        proc.set_map_thread(map.clone());
        map
    }

    /// Handle map of a process. Without `extended_text` only the core
    /// information (object addresses, access masks, handle values) is
    /// populated; with it, object names and type specific details are
    /// resolved as well.
    pub fn handle_map(&self, proc: &Win32Process, extended_text: bool) -> Arc<HandleMap> {
        let core = {
            if let Some(m) = proc.map_handle() {
                m
            } else {
                let _guard = proc.lock_update();
                if let Some(m) = proc.map_handle() {
                    m
                } else {
                    let map = Arc::new(handle::initialize_core(self, proc));
                    proc.set_map_handle(map.clone());
                    map
                }
            }
        };
        if !extended_text || core.has_text() {
            return core;
        }
        let _guard = proc.lock_update_ext();
        if let Some(m) = proc.map_handle() {
            if m.has_text() {
                return m;
            }
        }
        let map = Arc::new(handle::initialize_text(self, proc, &core));
        proc.set_map_handle(map.clone());
        map
    }

    pub fn unloaded_module_map(&self, proc: &Win32Process) -> Arc<UnloadedModuleMap> {
        if let Some(m) = proc.map_unloaded() {
            return m;
        }
        if proc.user_only {
            // resolve the ntdll unload array up front; it performs
            // module and EAT lookups that take the update lock
            unloaded::prewarm_user(self, proc);
        }
        let _guard = proc.lock_update();
        if let Some(m) = proc.map_unloaded() {
            return m;
        }
        let map = Arc::new(unloaded::initialize(self, proc));
        proc.set_map_unloaded(map.clone());
        map
    }

    /// Tagged hardware page map of a process.
    pub fn pte_map(&self, proc: &Win32Process) -> Arc<PteMap> {
        if let Some(m) = proc.map_pte() {
            if m.tag_scan {
                return m;
            }
        }
        // the tagging pass consumes the module map; build it before
        // taking the update lock
        let _ = self.module_map(proc);
        let _guard = proc.lock_update();
        if let Some(m) = proc.map_pte() {
            if m.tag_scan {
                return m;
            }
        }
        let map = Arc::new(ptemap::initialize(self, proc));
        proc.set_map_pte(map.clone());
        map
    }

    /// Image path and command line from the process PEB, cached in the
    /// persistent sidecar.
    pub fn process_parameters(&self, proc: &Win32Process) -> ProcessParameters {
        crate::win32::proc_enum::user_process_parameters(self, proc)
    }

    // ------------------------------------------------------------------
    // process-global artifacts
    // ------------------------------------------------------------------

    /// Physical memory run map; `MmPhysicalMemoryBlock` with a registry
    /// fallback.
    pub fn physmem_map(&self) -> Arc<PhysMemMap> {
        if let Some(m) = self
            .physmem_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return m;
        }
        let _guard = self
            .lock_update_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = self
            .physmem_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return m;
        }
        let map = Arc::new(physmem::initialize(self));
        *self
            .physmem_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(map.clone());
        map
    }

    /// Map of non-built-in user accounts.
    pub fn user_map(&self) -> Arc<UserMap> {
        if let Some(m) = self
            .user_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return m;
        }
        let _guard = self
            .lock_update_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(m) = self
            .user_map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
        {
            return m;
        }
        let map = Arc::new(user::initialize(self));
        *self.user_map.lock().unwrap_or_else(PoisonError::into_inner) = Some(map.clone());
        map
    }

    /// Resolves a decoded object type index to its display name and
    /// structure information.
    pub fn object_type(&self, type_index: u8) -> Option<objects::ObjectType> {
        objects::object_type_get(self, type_index)
    }

    // ------------------------------------------------------------------
    // misc plumbing
    // ------------------------------------------------------------------

    pub(crate) fn phys_lock(&self) -> MutexGuard<'_, P> {
        self.phys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn translator(&self, proc: &Win32Process) -> Translator {
        self.translator_dtb(proc.dtb)
    }

    pub(crate) fn translator_dtb(&self, dtb: Address) -> Translator {
        if self.cfg.identity_translation {
            Translator::Identity
        } else {
            Translator::new(self.sysinfo.arch, dtb)
        }
    }

    pub(crate) fn unloaded_ntdll_cache(&self, f32: bool) -> Option<Address> {
        let raw = if f32 {
            self.unloaded_ntdll32.load(Ordering::Relaxed)
        } else {
            self.unloaded_ntdll64.load(Ordering::Relaxed)
        };
        match raw {
            KEY_UNLOADED_UNRESOLVED => None,
            KEY_UNLOADED_FAILED => Some(Address::NULL),
            va => Some(Address::from(va)),
        }
    }

    pub(crate) fn unloaded_ntdll_store(&self, f32: bool, va: Option<Address>) {
        let raw = match va {
            Some(va) if !va.is_null() => va.as_u64(),
            _ => KEY_UNLOADED_FAILED,
        };
        if f32 {
            self.unloaded_ntdll32.store(raw, Ordering::Relaxed);
        } else {
            self.unloaded_ntdll64.store(raw, Ordering::Relaxed);
        }
    }
}

#[inline]
fn eat_iat_key(pid: u32, va_base: Address) -> u64 {
    u64::from(pid) ^ (u64::from(pid) << 48) ^ va_base.as_u64()
}

/// Builder assembling a [`Vmm`] context from the memory backend, the
/// established system facts and the optional collaborator engines.
pub struct VmmBuilder<P: PhysicalMemory> {
    phys: P,
    sysinfo: SystemInfo,
    volatile_mem: bool,
    process_cache: bool,
    identity_translation: bool,
    symbols: Option<Box<dyn SymbolProvider>>,
    registry: Option<Box<dyn RegistryProvider>>,
    vad: Option<Box<dyn VadProvider>>,
    pte: Option<Box<dyn PteProvider>>,
}

impl<P: PhysicalMemory> VmmBuilder<P> {
    pub fn new(phys: P, sysinfo: SystemInfo) -> Self {
        Self {
            phys,
            sysinfo,
            volatile_mem: true,
            process_cache: true,
            identity_translation: false,
            symbols: None,
            registry: None,
            vad: None,
            pte: None,
        }
    }

    /// Marks the backing medium as non-volatile (e.g. a dump file);
    /// learned prefetch sets are not persisted in that case.
    pub fn non_volatile(mut self) -> Self {
        self.volatile_mem = false;
        self
    }

    pub fn no_process_cache(mut self) -> Self {
        self.process_cache = false;
        self
    }

    /// Treat virtual addresses as physical. Intended for synthetic
    /// memory images in tests.
    pub fn identity_translation(mut self) -> Self {
        self.identity_translation = true;
        self
    }

    pub fn symbol_provider(mut self, p: Box<dyn SymbolProvider>) -> Self {
        self.symbols = Some(p);
        self
    }

    pub fn registry_provider(mut self, p: Box<dyn RegistryProvider>) -> Self {
        self.registry = Some(p);
        self
    }

    pub fn vad_provider(mut self, p: Box<dyn VadProvider>) -> Self {
        self.vad = Some(p);
        self
    }

    pub fn pte_provider(mut self, p: Box<dyn PteProvider>) -> Self {
        self.pte = Some(p);
        self
    }

    pub fn build(self) -> Vmm<P> {
        let vmm = Vmm {
            phys: Mutex::new(self.phys),
            cache: PageCache::new(),
            epoch_medium: AtomicU64::new(1),
            cfg: VmmConfig {
                volatile_mem: self.volatile_mem,
                process_cache: self.process_cache,
                identity_translation: self.identity_translation,
            },
            offsets_eprocess: RwLock::new(EprocessOffsets::default()),
            offsets_ethread: Mutex::new(None),
            procs: RwLock::new(Arc::new(ProcessTable::default())),
            staging: Mutex::new(None),
            eat_cache: EpochCache::new(0x20),
            iat_cache: EpochCache::new(0x20),
            obtypes: RwLock::new(ObjectTypeTable::default()),
            physmem_map: Mutex::new(None),
            user_map: Mutex::new(None),
            lock_update_map: Mutex::new(()),
            eproc_prefetch: Default::default(),
            unloaded_ntdll32: AtomicU64::new(KEY_UNLOADED_UNRESOLVED),
            unloaded_ntdll64: AtomicU64::new(KEY_UNLOADED_UNRESOLVED),
            symbols: self.symbols,
            registry: self.registry,
            vad: self.vad,
            pte: self.pte,
            sysinfo: self.sysinfo,
        };

        // seed the process table with the SYSTEM process; the first
        // enumeration replaces it with the fully populated table.
        let sys = NewProcess {
            pid: 4,
            ppid: 0,
            state: 0,
            dtb: vmm.sysinfo.dtb,
            dtb_user: Address::NULL,
            name: "System".to_string(),
            user_only: false,
            va_eprocess: vmm.sysinfo.va_eprocess_system,
            va_peb: Address::NULL,
            va_peb32: 0,
            wow64: false,
            no_link: false,
            eprocess_bytes: Vec::new(),
        };
        {
            let mut table = ProcessTable::default();
            table.insert(Arc::new(Win32Process::new(sys, Arc::new(Default::default()))));
            *vmm.procs.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(table);
        }
        vmm
    }
}
