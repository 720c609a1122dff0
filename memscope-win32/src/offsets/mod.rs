pub mod locator32;
pub mod locator64;

use crate::providers::SymbolProvider;

use log::{debug, warn};

/// Offsets of the fields the introspection layer needs within
/// `_EPROCESS` (and `_KPROCESS`).
///
/// These are normally discovered by the pattern-matching locators in
/// [`locator64`]/[`locator32`]; [`EprocessOffsets::from_symbols`] is the
/// slower fallback through debug symbols.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub struct EprocessOffsets {
    pub valid: bool,
    /// System is Vista or 7 (as opposed to Win8+); decided by `Name < PEB`.
    pub vista_or_7: bool,

    pub state: u16,
    pub dtb: u16,
    /// Shadow (user) directory table base; 0 when not present.
    pub dtb_user: u16,
    pub name: u16,
    pub pid: u16,
    pub ppid: u16,
    pub flink: u16,
    pub blink: u16,
    pub peb: u16,
    /// 0 when the offset is unknown (32-bit systems).
    pub wow64: u16,
    pub object_table: u16,
    pub se_audit: u16,
    pub vad_root: u16,

    pub opt_create_time: u16,
    pub opt_exit_time: u16,

    /// Conservative upper bound of all used offsets; the number of
    /// EPROCESS bytes read per process.
    pub cb_max: u16,
}

impl EprocessOffsets {
    /// Computes `cb_max` as the maximum discovered offset plus 0x80.
    pub fn set_max_offset(&mut self) {
        let mut o = self.opt_create_time.max(self.opt_exit_time);
        o = o.max(self.state).max(self.dtb).max(self.dtb_user);
        o = o.max(self.name).max(self.pid).max(self.ppid);
        o = o.max(self.peb).max(self.flink).max(self.blink);
        o = o.max(self.se_audit).max(self.vad_root).max(self.object_table);
        self.cb_max = o + 0x80;
    }

    /// Fallback that resolves the offsets from debug symbols.
    pub fn from_symbols(sym: &dyn SymbolProvider, f32: bool) -> Self {
        let mut po = EprocessOffsets::default();
        let field = |t: &str, f: &str| sym.type_child_offset(t, f).unwrap_or(0) as u16;

        po.state = field("_DISPATCHER_HEADER", "SignalState");
        po.dtb = field("_KPROCESS", "DirectoryTableBase");
        po.dtb_user = field("_KPROCESS", "UserDirectoryTableBase");
        po.name = field("_EPROCESS", "ImageFileName");
        po.pid = field("_EPROCESS", "UniqueProcessId");
        po.ppid = field("_EPROCESS", "InheritedFromUniqueProcessId");
        po.flink = field("_EPROCESS", "ActiveProcessLinks");
        po.blink = po.flink + if f32 { 4 } else { 8 };
        po.peb = field("_EPROCESS", "Peb");
        po.se_audit = field("_EPROCESS", "SeAuditProcessCreationInfo");
        po.vad_root = field("_EPROCESS", "VadRoot");
        po.object_table = field("_EPROCESS", "ObjectTable");
        po.opt_create_time = field("_EPROCESS", "CreateTime");
        po.opt_exit_time = field("_EPROCESS", "ExitTime");
        if !f32 {
            if po.name < po.peb {
                po.vista_or_7 = true;
                po.wow64 = po.name + 0x40; // Vista, Win7
            } else {
                po.wow64 = po.peb + 0x30; // Win8, Win10
            }
        }
        match sym.type_size("_EPROCESS") {
            Some(cb) => po.cb_max = cb as u16,
            None => po.set_max_offset(),
        }
        po.valid = po.state != 0
            && po.dtb != 0
            && po.name != 0
            && po.ppid != 0
            && po.flink != 0
            && po.peb != 0
            && po.vad_root != 0
            && po.se_audit != 0
            && po.object_table != 0;
        po
    }

    pub(crate) fn log_print(&self) {
        if self.valid {
            debug!(
                "eprocess offsets: pid={:03x} ppid={:03x} stat={:03x} dtb={:03x} dtbu={:03x} name={:03x} peb={:03x}",
                self.pid, self.ppid, self.state, self.dtb, self.dtb_user, self.name, self.peb
            );
            debug!(
                "eprocess offsets: flink={:03x} blink={:03x} max={:03x} seaudit={:03x} vad={:03x} objtable={:03x} wow64={:03x}",
                self.flink, self.blink, self.cb_max, self.se_audit, self.vad_root, self.object_table, self.wow64
            );
        } else {
            warn!("eprocess offset location failed");
        }
    }
}

/// Offsets within `_ETHREAD`/`_KTHREAD` plus the `ThreadListHead` field
/// of `_EPROCESS`. Always resolved through debug symbols.
#[derive(Debug, Clone, Copy, Default)]
#[cfg_attr(feature = "serde", derive(::serde::Serialize))]
pub struct EthreadOffsets {
    pub valid: bool,

    /// `_EPROCESS.ThreadListHead`.
    pub thread_list_head_kp: u16,
    pub thread_list_entry: u16,
    pub cid: u16,
    pub teb: u16,
    pub create_time: u16,
    pub exit_time: u16,
    pub exit_status: u16,
    pub state: u16,
    pub suspend_count: u16,
    /// Optional; 0 when the field does not exist on this build.
    pub running: u16,
    pub priority: u16,
    pub base_priority: u16,
    pub start_address: u16,
    pub stack_base: u16,
    pub stack_limit: u16,
    pub trap_frame: u16,
    pub affinity: u16,
    pub kernel_time: u16,
    pub user_time: u16,
    /// Optional `_KTHREAD.Process` back-pointer; 0 when unknown.
    pub process_opt: u16,
    pub trap_rip: u16,
    pub trap_rsp: u16,

    /// Number of ETHREAD bytes to read per thread.
    pub cb_max: u16,
}

impl EthreadOffsets {
    pub fn from_symbols(sym: &dyn SymbolProvider) -> Option<Self> {
        let mut ot = EthreadOffsets::default();
        let field = |t: &str, f: &str| sym.type_child_offset(t, f).map(|o| o as u16);

        ot.thread_list_head_kp = field("_EPROCESS", "ThreadListHead")?;
        ot.thread_list_entry = field("_ETHREAD", "ThreadListEntry")?;
        ot.cid = field("_ETHREAD", "Cid")?;
        ot.teb = field("_KTHREAD", "Teb")?;
        ot.create_time = field("_ETHREAD", "CreateTime")?;
        ot.exit_time = field("_ETHREAD", "ExitTime")?;
        ot.exit_status = field("_ETHREAD", "ExitStatus")?;
        ot.state = field("_KTHREAD", "State")?;
        ot.suspend_count = field("_KTHREAD", "SuspendCount")?;
        ot.running = field("_KTHREAD", "Running").unwrap_or(0);
        ot.priority = field("_KTHREAD", "Priority")?;
        ot.base_priority = field("_KTHREAD", "BasePriority")?;
        ot.start_address = field("_ETHREAD", "StartAddress")?;
        ot.stack_base = field("_KTHREAD", "StackBase")?;
        ot.stack_limit = field("_KTHREAD", "StackLimit")?;
        ot.trap_frame = field("_KTHREAD", "TrapFrame")?;
        ot.affinity = field("_KTHREAD", "Affinity")?;
        ot.kernel_time = field("_KTHREAD", "KernelTime")?;
        ot.user_time = field("_KTHREAD", "UserTime")?;
        ot.process_opt = field("_KTHREAD", "Process").unwrap_or(0);
        ot.trap_rip = field("_KTRAP_FRAME", "Rip").or_else(|| field("_KTRAP_FRAME", "Eip"))?;
        ot.trap_rsp = field("_KTRAP_FRAME", "Rsp").or_else(|| field("_KTRAP_FRAME", "HardwareEsp"))?;

        match sym.type_size("_ETHREAD") {
            Some(cb) => ot.cb_max = cb as u16,
            None => {
                let mut o = ot.thread_list_entry.max(ot.cid).max(ot.teb);
                o = o.max(ot.exit_time).max(ot.start_address).max(ot.affinity);
                o = o.max(ot.stack_base).max(ot.stack_limit).max(ot.trap_frame);
                o = o.max(ot.kernel_time).max(ot.user_time);
                ot.cb_max = o + 0x80;
            }
        }
        ot.valid = true;
        Some(ot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestSymbols;

    #[test]
    fn test_eprocess_from_symbols() {
        // offsets of a win10 x64 kernel
        let sym = TestSymbols::win10_x64();
        let po = EprocessOffsets::from_symbols(&sym, false);
        assert!(po.valid);
        assert_eq!(po.dtb, 0x28);
        assert_eq!(po.pid, 0x440);
        assert_eq!(po.blink, po.flink + 8);
        // win10: PEB below ImageFileName -> Win8+ rule
        assert!(!po.vista_or_7);
        assert_eq!(po.wow64, po.peb + 0x30);
    }

    #[test]
    fn test_max_offset() {
        let mut po = EprocessOffsets {
            name: 0x5a8,
            vad_root: 0x658,
            ..Default::default()
        };
        po.set_max_offset();
        assert_eq!(po.cb_max, 0x658 + 0x80);
    }
}
