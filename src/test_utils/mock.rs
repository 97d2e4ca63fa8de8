//! A simulated VMX processor.
//!
//! Every test thread owns one simulated CPU: a field store per VMCS, the
//! launch state of each VMCS, a log of the VMX instructions issued, and a
//! queue of scripted VM exits consumed by [`MockHal::enter_guest`].

use std::alloc::{Layout, alloc_zeroed, dealloc};
use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::vec::Vec;

use axerrno::{AxResult, ax_err_type};
use x86::vmx::{Result as VmResult, VmFail};

use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmx::vmcs::{VmcsControl32, VmcsReadOnly32, VmcsReadOnlyNW};
use crate::vmx::{
    ControlCapabilities, EptFlushSupport, InterruptController, InterruptPoll, InvEptType,
    InvVpidType, TlbFlushMode, VmxConfig, VmxExitReason, VpidFlushSupport,
};
use crate::{GuestMemory, HostPhysAddr, HostVirtAddr, VmxHal};

/// A VMX instruction seen by the simulated CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockOp {
    VmxOn,
    VmxOff,
    Vmptrld(usize),
    Vmclear(usize),
    Vmread(u32),
    Vmwrite(u32, u64),
    Invept(InvEptType, u64),
    Invvpid(InvVpidType, u16, u64),
    Entry { launched: bool },
}

/// A failing `VMLAUNCH`/`VMRESUME`.
#[derive(Debug, Clone, Copy)]
enum EntryFail {
    /// `VMfailValid` with this VM-instruction error.
    Valid(u32),
    Invalid,
}

/// What the guest "did" until the next VM exit.
#[derive(Debug, Clone, Default)]
pub struct ScriptedExit {
    reason: u32,
    fields: Vec<(u32, u64)>,
    regs: Option<GeneralRegisters>,
    fail: Option<EntryFail>,
}

impl ScriptedExit {
    pub fn new(reason: VmxExitReason) -> Self {
        Self {
            reason: reason as u32,
            ..Default::default()
        }
    }

    /// The entry failed and the processor reports `reason` with bit 31 set.
    pub fn entry_failure(reason: VmxExitReason, qualification: u64) -> Self {
        Self::new(reason)
            .raw_reason(reason as u32 | 1 << 31)
            .with(VmcsReadOnlyNW::EXIT_QUALIFICATION as u32, qualification)
    }

    /// `VMLAUNCH`/`VMRESUME` itself fails.
    pub fn vm_fail(fail: VmFail, instruction_error: u32) -> Self {
        let fail = match fail {
            VmFail::VmFailValid => EntryFail::Valid(instruction_error),
            VmFail::VmFailInvalid => EntryFail::Invalid,
        };
        Self {
            fail: Some(fail),
            ..Default::default()
        }
    }

    pub fn raw_reason(mut self, raw: u32) -> Self {
        self.reason = raw;
        self
    }

    /// Sets a VMCS field as part of the exit.
    pub fn with(mut self, field: u32, value: u64) -> Self {
        self.fields.push((field, value));
        self
    }

    pub fn with_regs(mut self, regs: GeneralRegisters) -> Self {
        self.regs = Some(regs);
        self
    }
}

/// State of the simulated CPU at a VM entry.
#[derive(Debug, Clone)]
pub struct EntryRecord {
    pub launched: bool,
    pub regs: GeneralRegisters,
    pub cr2: u64,
    /// VM-entry interruption-information field at the entry.
    pub entry_interruption_info: u64,
    pub cpu: usize,
}

#[derive(Default)]
struct MockCpu {
    cpu_id: usize,
    irq_enabled: bool,
    /// Host CPUs in VMX operation.
    vmx_on: HashSet<usize>,
    vmcs_fields: HashMap<usize, HashMap<u32, u64>>,
    current: Option<usize>,
    launched: HashSet<usize>,
    log: Vec<MockOp>,
    /// Fields written while interrupts were enabled.
    irq_on_writes: Vec<u32>,
    fail_writes_to: HashSet<u32>,
    exits: VecDeque<ScriptedExit>,
    entries: Vec<EntryRecord>,
    host_nmis: usize,
}

impl MockCpu {
    fn fields(&mut self) -> Option<&mut HashMap<u32, u64>> {
        let current = self.current?;
        Some(self.vmcs_fields.entry(current).or_default())
    }

    fn set_instruction_error(&mut self, code: u32) {
        if let Some(fields) = self.fields() {
            fields.insert(VmcsReadOnly32::VM_INSTRUCTION_ERROR as u32, code as u64);
        }
    }
}

thread_local! {
    static CPU: RefCell<MockCpu> = RefCell::new(MockCpu {
        irq_enabled: true,
        ..Default::default()
    });
}

fn with_cpu<R>(f: impl FnOnce(&mut MockCpu) -> R) -> R {
    CPU.with(|cpu| f(&mut cpu.borrow_mut()))
}

/// Exit information fields that a real exit always overwrites.
const EXIT_INFO_FIELDS: [u32; 5] = [
    VmcsReadOnlyNW::EXIT_QUALIFICATION as u32,
    VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO as u32,
    VmcsReadOnly32::IDT_VECTORING_INFO as u32,
    VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN as u32,
    VmcsReadOnly32::EXIT_REASON as u32,
];

const ENTRY_INTR_INFO: u32 = VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD as u32;

#[derive(Debug)]
pub struct MockHal;

impl MockHal {
    /// Forgets everything and puts the simulated CPU back on CPU 0.
    pub fn reset() {
        with_cpu(|cpu| {
            *cpu = MockCpu {
                irq_enabled: true,
                ..Default::default()
            }
        });
    }

    /// Moves the calling thread to another simulated host CPU. The current
    /// VMCS is lost, as on a real migration.
    pub fn set_cpu(cpu_id: usize) {
        with_cpu(|cpu| {
            cpu.cpu_id = cpu_id;
            cpu.current = None;
        });
    }

    pub fn ops() -> Vec<MockOp> {
        with_cpu(|cpu| cpu.log.clone())
    }

    pub fn clear_log() {
        with_cpu(|cpu| {
            cpu.log.clear();
            cpu.irq_on_writes.clear();
        });
    }

    /// All VMWRITEs in order.
    pub fn writes() -> Vec<(u32, u64)> {
        with_cpu(|cpu| {
            cpu.log
                .iter()
                .filter_map(|op| match *op {
                    MockOp::Vmwrite(field, value) => Some((field, value)),
                    _ => None,
                })
                .collect()
        })
    }

    /// The values written to `field`, in order.
    pub fn writes_to(field: u32) -> Vec<u64> {
        Self::writes()
            .into_iter()
            .filter(|&(f, _)| f == field)
            .map(|(_, value)| value)
            .collect()
    }

    /// All VMREADs in order.
    pub fn reads() -> Vec<u32> {
        with_cpu(|cpu| {
            cpu.log
                .iter()
                .filter_map(|op| match *op {
                    MockOp::Vmread(field) => Some(field),
                    _ => None,
                })
                .collect()
        })
    }

    pub fn entries() -> Vec<EntryRecord> {
        with_cpu(|cpu| cpu.entries.clone())
    }

    pub fn host_nmis() -> usize {
        with_cpu(|cpu| cpu.host_nmis)
    }

    pub fn irqs_enabled() -> bool {
        with_cpu(|cpu| cpu.irq_enabled)
    }

    /// Fields written by VMWRITEs issued with interrupts enabled.
    pub fn writes_with_irqs_enabled() -> Vec<u32> {
        with_cpu(|cpu| cpu.irq_on_writes.clone())
    }

    /// Field of the current VMCS, without logging a VMREAD.
    pub fn field(field: u32) -> Option<u64> {
        with_cpu(|cpu| cpu.fields().and_then(|fields| fields.get(&field).copied()))
    }

    /// Sets a field of the current VMCS, as the guest or the processor would.
    pub fn set_field(field: u32, value: u64) {
        with_cpu(|cpu| {
            if let Some(fields) = cpu.fields() {
                fields.insert(field, value);
            }
        });
    }

    /// VMWRITEs to `field` fail with `VMfailValid` from now on.
    pub fn fail_writes_to(field: u32) {
        with_cpu(|cpu| {
            cpu.fail_writes_to.insert(field);
        });
    }

    pub fn script_exit(exit: ScriptedExit) {
        with_cpu(|cpu| cpu.exits.push_back(exit));
    }

    pub fn scripted_exits_left() -> usize {
        with_cpu(|cpu| cpu.exits.len())
    }
}

impl VmxHal for MockHal {
    fn alloc_frame() -> Option<HostPhysAddr> {
        let layout = Layout::from_size_align(4096, 4096).ok()?;
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            None
        } else {
            Some(HostPhysAddr::from(ptr as usize))
        }
    }

    fn dealloc_frame(paddr: HostPhysAddr) {
        if let Ok(layout) = Layout::from_size_align(4096, 4096) {
            unsafe { dealloc(paddr.as_usize() as *mut u8, layout) }
        }
    }

    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr {
        HostVirtAddr::from(paddr.as_usize())
    }

    fn current_cpu_id() -> usize {
        with_cpu(|cpu| cpu.cpu_id)
    }

    fn irq_save() -> bool {
        with_cpu(|cpu| core::mem::replace(&mut cpu.irq_enabled, false))
    }

    fn irq_restore(enabled: bool) {
        if enabled {
            with_cpu(|cpu| cpu.irq_enabled = true);
        }
    }

    fn prepare_vmxon() -> crate::Result {
        Ok(())
    }

    fn finish_vmxoff() {}

    fn read_host_msr(msr: Msr) -> u64 {
        0x1000_0000 | msr as u64
    }

    unsafe fn vmxon(_region: HostPhysAddr) -> VmResult<()> {
        with_cpu(|cpu| {
            cpu.log.push(MockOp::VmxOn);
            let id = cpu.cpu_id;
            if !cpu.vmx_on.insert(id) {
                return Err(VmFail::VmFailInvalid);
            }
            Ok(())
        })
    }

    unsafe fn vmxoff() -> VmResult<()> {
        with_cpu(|cpu| {
            cpu.log.push(MockOp::VmxOff);
            let id = cpu.cpu_id;
            cpu.vmx_on.remove(&id);
            Ok(())
        })
    }

    unsafe fn vmptrld(vmcs: HostPhysAddr) -> VmResult<()> {
        with_cpu(|cpu| {
            cpu.log.push(MockOp::Vmptrld(vmcs.as_usize()));
            cpu.current = Some(vmcs.as_usize());
            Ok(())
        })
    }

    unsafe fn vmclear(vmcs: HostPhysAddr) -> VmResult<()> {
        with_cpu(|cpu| {
            let paddr = vmcs.as_usize();
            cpu.log.push(MockOp::Vmclear(paddr));
            cpu.launched.remove(&paddr);
            if cpu.current == Some(paddr) {
                cpu.current = None;
            }
            Ok(())
        })
    }

    fn vmread(field: u32) -> VmResult<u64> {
        with_cpu(|cpu| {
            cpu.log.push(MockOp::Vmread(field));
            let fields = cpu.fields().ok_or(VmFail::VmFailInvalid)?;
            Ok(fields.get(&field).copied().unwrap_or(0))
        })
    }

    fn vmwrite(field: u32, value: u64) -> VmResult<()> {
        with_cpu(|cpu| {
            if cpu.current.is_none() {
                return Err(VmFail::VmFailInvalid);
            }
            if cpu.fail_writes_to.contains(&field) {
                // VMWRITE to a read-only or unsupported field
                cpu.set_instruction_error(12);
                return Err(VmFail::VmFailValid);
            }
            cpu.log.push(MockOp::Vmwrite(field, value));
            if cpu.irq_enabled {
                cpu.irq_on_writes.push(field);
            }
            if let Some(fields) = cpu.fields() {
                fields.insert(field, value);
            }
            Ok(())
        })
    }

    fn invept(kind: InvEptType, eptp: u64) -> VmResult<()> {
        with_cpu(|cpu| cpu.log.push(MockOp::Invept(kind, eptp)));
        Ok(())
    }

    fn invvpid(kind: InvVpidType, vpid: u16, addr: u64) -> VmResult<()> {
        with_cpu(|cpu| cpu.log.push(MockOp::Invvpid(kind, vpid, addr)));
        Ok(())
    }

    fn setup_host_state() -> crate::Result {
        Ok(())
    }

    unsafe fn enter_guest(
        regs: &mut GeneralRegisters,
        cr2: &mut u64,
        launched: bool,
    ) -> VmResult<()> {
        with_cpu(|cpu| {
            let current = cpu.current.ok_or(VmFail::VmFailInvalid)?;
            cpu.log.push(MockOp::Entry { launched });
            assert!(!cpu.irq_enabled, "VM entry with interrupts enabled");

            let entry_interruption_info = cpu
                .fields()
                .and_then(|fields| fields.get(&ENTRY_INTR_INFO).copied())
                .unwrap_or(0);
            cpu.entries.push(EntryRecord {
                launched,
                regs: *regs,
                cr2: *cr2,
                entry_interruption_info,
                cpu: cpu.cpu_id,
            });

            // VMRESUME of a VMCS that was never launched, VMLAUNCH of a launched one
            match (launched, cpu.launched.contains(&current)) {
                (true, false) => {
                    cpu.set_instruction_error(5);
                    return Err(VmFail::VmFailValid);
                }
                (false, true) => {
                    cpu.set_instruction_error(4);
                    return Err(VmFail::VmFailValid);
                }
                _ => {}
            }

            let exit = cpu.exits.pop_front().expect("no scripted VM exit left");
            match exit.fail {
                Some(EntryFail::Valid(error)) => {
                    cpu.set_instruction_error(error);
                    return Err(VmFail::VmFailValid);
                }
                Some(EntryFail::Invalid) => return Err(VmFail::VmFailInvalid),
                None => {}
            }

            let fields = cpu.vmcs_fields.entry(current).or_default();
            for field in EXIT_INFO_FIELDS {
                fields.insert(field, 0);
            }
            if let Some(info) = fields.get_mut(&ENTRY_INTR_INFO) {
                *info &= !(1 << 31);
            }
            fields.insert(VmcsReadOnly32::EXIT_REASON as u32, exit.reason as u64);
            for (field, value) in exit.fields {
                fields.insert(field, value);
            }
            if exit.reason & (1 << 31) == 0 {
                cpu.launched.insert(current);
            }
            if let Some(new_regs) = exit.regs {
                *regs = new_regs;
            }
            Ok(())
        })
    }

    fn dispatch_host_nmi() {
        with_cpu(|cpu| cpu.host_nmis += 1);
    }
}

/// A VM configuration with every feature available.
pub fn test_config(mode: TlbFlushMode) -> VmxConfig {
    VmxConfig {
        vmcs_revision_id: 1,
        controls: ControlCapabilities::FLEXIBLE,
        tlb_flush_mode: mode,
        ept_flush: EptFlushSupport {
            single_context: true,
            all_contexts: true,
        },
        vpid_flush: VpidFlushSupport {
            individual_address: true,
            single_context: true,
            all_contexts: true,
            single_context_retaining_globals: true,
        },
        max_asid: 16,
        unrestricted_guest: mode.uses_ept(),
        nested_paging: mode.uses_ept(),
        tpr_shadow: true,
        preemption_timer_shift: Some(5),
        preemption_timer: None,
        cr0_fixed0: 0x8000_0021,
        cr0_fixed1: 0xffff_ffff,
        cr4_fixed0: 0x2000,
        cr4_fixed1: 0x3767ff,
        real_mode_tss_base: 0xf_c000,
        identity_page_table: 0xf_d000,
    }
}

/// A local APIC stand-in.
#[derive(Debug, Default)]
pub struct MockInterruptController {
    pub nmi_pending: bool,
    /// Pending vectors, highest priority first.
    pub pending: Vec<u8>,
    /// Priority class of the guest's TPR.
    pub task_priority: u8,
    pub acknowledged: Vec<u8>,
    pub nmis_acknowledged: usize,
}

impl InterruptController for MockInterruptController {
    fn has_pending_nmi(&self) -> bool {
        self.nmi_pending
    }

    fn acknowledge_nmi(&mut self) {
        self.nmi_pending = false;
        self.nmis_acknowledged += 1;
    }

    fn poll_interrupt(&mut self) -> InterruptPoll {
        match self.pending.first() {
            None => InterruptPoll::None,
            Some(&vector) if vector >> 4 <= self.task_priority => {
                InterruptPoll::MaskedByPriority(vector)
            }
            Some(&vector) => InterruptPoll::Ready(vector),
        }
    }

    fn acknowledge_interrupt(&mut self, vector: u8) {
        self.pending.retain(|&v| v != vector);
        self.acknowledged.push(vector);
    }
}

/// Flat guest-physical memory covering the first megabyte and a bit.
pub struct MockGuestMemory {
    pub bytes: Vec<u8>,
}

impl MockGuestMemory {
    pub const SIZE: usize = 0x11_0000;

    pub fn new() -> Self {
        Self {
            bytes: vec![0; Self::SIZE],
        }
    }

    pub fn read_u16(&self, gpa: u64) -> u16 {
        let gpa = gpa as usize;
        u16::from_le_bytes([self.bytes[gpa], self.bytes[gpa + 1]])
    }

    pub fn write_u16(&mut self, gpa: u64, value: u16) {
        let gpa = gpa as usize;
        self.bytes[gpa..gpa + 2].copy_from_slice(&value.to_le_bytes());
    }

    /// Writes a real-mode IVT entry.
    pub fn set_ivt_entry(&mut self, vector: u8, segment: u16, offset: u16) {
        let base = vector as u64 * 4;
        self.write_u16(base, offset);
        self.write_u16(base + 2, segment);
    }
}

impl GuestMemory for MockGuestMemory {
    fn read_phys(&self, gpa: u64, buf: &mut [u8]) -> AxResult {
        let start = gpa as usize;
        let src = self
            .bytes
            .get(start..start + buf.len())
            .ok_or(ax_err_type!(InvalidInput))?;
        buf.copy_from_slice(src);
        Ok(())
    }

    fn write_phys(&mut self, gpa: u64, data: &[u8]) -> AxResult {
        let start = gpa as usize;
        let dst = self
            .bytes
            .get_mut(start..start + data.len())
            .ok_or(ax_err_type!(InvalidInput))?;
        dst.copy_from_slice(data);
        Ok(())
    }
}
