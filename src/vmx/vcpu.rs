use alloc::sync::Arc;
use core::fmt::{Debug, Formatter, Result as FmtResult};
use core::sync::atomic::{AtomicBool, Ordering};

use axerrno::AxResult;
use x86::vmx::VmFail;

use super::config::VmxConfig;
use super::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
use super::event::{
    CommitOutcome, DeliveryConflict, EventInjector, GuestMemory, InjectionPhase,
    InterruptController, PendingEvent, resolve_delivery_conflict,
};
use super::field_cache::{VmcsContext, VmcsControlCache, VmxTransient};
use super::guest_state::{
    ExitHistory, GuestCpuContext, GuestState, PagingSyncFlags, SYSCALL_MSRS, StateGroups,
};
use super::percpu::VmxPerCpuState;
use super::tlb::VcpuTlbState;
use super::vmcs::{
    EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
    VmcsControl64, VmcsGuest32, VmcsGuest64, VmcsGuestNW, VmxInterruptInfo, vm_fail_reason,
};
use crate::regs::{GeneralRegisters, GeneralRegistersDiff};
use crate::{Result, VmxError, VmxHal};

/// Bit 31 of the exit reason: the VM entry itself failed.
const VM_ENTRY_FAILURE: u32 = 1 << 31;

/// Guest state loaded on first setup.
#[derive(Debug, Clone, Copy, Default)]
pub struct VcpuSetup {
    /// Guest RIP at reset.
    pub entry: u64,
    /// EPT pointer, required when EPT is in use.
    pub eptp: Option<u64>,
    pub exception_bitmap: u32,
    pub tsc_offset: u64,
    /// Host physical address of the virtual-APIC page, enables the TPR shadow.
    pub virtual_apic_page: Option<u64>,
}

/// Whether the vCPU's VMCS is loaded on a host CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VcpuSession {
    /// The VMCS is clear and the software context is authoritative.
    Detached,
    Attached { host_cpu: usize },
}

/// Set by the host scheduler to make the run loop leave the CPU before the
/// next VM entry.
#[derive(Debug, Default)]
pub struct PreemptSignal(AtomicBool);

impl PreemptSignal {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

/// VM-Exit Informations handed to the exit handler.
#[derive(Debug, Clone, Copy)]
pub struct VmxExitInfo {
    /// VM-exit reason.
    pub exit_reason: VmxExitReason,
    /// Exit reason field as read from the VMCS.
    pub raw_reason: u32,
    /// Guest RIP at the exit.
    pub guest_rip: u64,
    /// Length in bytes of the instruction that caused the exit.
    pub exit_instruction_length: u32,
    /// The exit is a page fault raised while delivering an external
    /// interrupt or NMI. The interrupted event waits in the pending trap.
    pub vectoring_pf: bool,
}

/// What the run loop does after an exit was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction<S> {
    /// Enter the guest again.
    Continue,
    /// Return [`VcpuExit::Stopped`] to the caller of [`VmxVcpu::run`].
    Stop(S),
}

/// Handles the VM exits the core does not handle itself.
pub trait ExitHandler<H: VmxHal> {
    /// Returned to the caller of [`VmxVcpu::run`] when the handler stops the loop.
    type Stop;

    fn handle_exit(
        &mut self,
        vcpu: &mut VmxVcpu<H>,
        exit: &VmxExitInfo,
    ) -> AxResult<ExitAction<Self::Stop>>;
}

/// Why [`VmxVcpu::run`] returned.
#[derive(Debug)]
pub enum VcpuExit<S> {
    /// The exit handler stopped the loop.
    Stopped(S),
    /// The guest shut down; the VM must be reset.
    Reset,
    /// The hardware rejected the VM entry. The vCPU is halted.
    EntryFailed(VmEntryFailure),
    /// Real-mode guest state the hardware can not run; the vCPU must be
    /// emulated until it leaves real mode.
    EmulationRequired,
    /// The host scheduler asked for the CPU back. The vCPU is detached.
    Preempted,
}

/// Diagnostics of a failed VM entry.
#[derive(Debug, Clone)]
pub struct VmEntryFailure {
    /// Exit reason field, `None` if `VMLAUNCH`/`VMRESUME` itself failed.
    pub raw_reason: Option<u32>,
    pub exit_reason: Option<VmxExitReason>,
    pub qualification: u64,
    pub instruction_error: Option<VmxInstructionError>,
    pub guest: GuestCpuContext,
}

enum EntryOutcome {
    Exited(u32),
    Failed(VmFail),
}

/// A virtual CPU within a guest.
pub struct VmxVcpu<H: VmxHal> {
    id: usize,
    config: Arc<VmxConfig>,
    vmcs: VmcsContext<H>,
    guest: GuestState,
    events: EventInjector,
    tlb: VcpuTlbState,
    transient: VmxTransient,
    session: VcpuSession,
    preempt: Arc<PreemptSignal>,
    last_failure: Option<VmEntryFailure>,
    halted: bool,
}

impl<H: VmxHal> VmxVcpu<H> {
    /// Create a new [`VmxVcpu`].
    pub fn new(id: usize, config: Arc<VmxConfig>) -> Result<Self> {
        let vmcs = VmcsContext::new(config.vmcs_revision_id)?;
        let guest = GuestState::new(config.clone(), GuestCpuContext::new_reset(0));
        let vcpu = Self {
            id,
            config,
            vmcs,
            guest,
            events: EventInjector::new(),
            tlb: VcpuTlbState::new(),
            transient: VmxTransient::default(),
            session: VcpuSession::Detached,
            preempt: Arc::new(PreemptSignal::new()),
            last_failure: None,
            halted: false,
        };
        info!("[HV] created VmxVcpu(vmcs: {:#x})", vcpu.vmcs.phys_addr());
        Ok(vcpu)
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn config(&self) -> &Arc<VmxConfig> {
        &self.config
    }

    pub fn session(&self) -> VcpuSession {
        self.session
    }

    /// A VM entry failed; the vCPU does not run until it is set up or reset again.
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// Programs the VMCS controls and host state and puts the guest in its
    /// reset state at `setup.entry`. Leaves the vCPU attached to this CPU.
    pub fn setup(&mut self, percpu: &VmxPerCpuState<H>, setup: VcpuSetup) -> Result {
        self.attach(percpu)?;
        let config = self.config.clone();
        let caps = &config.controls;
        let mode = config.tlb_flush_mode;

        let eptp = match (mode.uses_ept(), setup.eptp) {
            (true, Some(eptp)) => eptp,
            (true, None) => {
                return Err(VmxError::InvalidVmcsConfig(
                    "EPT is in use but no EPT pointer was given".into(),
                ));
            }
            (false, _) => 0,
        };

        let mut pin_set = PinbasedControls::NMI_EXITING
            | PinbasedControls::EXTERNAL_INTERRUPT_EXITING
            | PinbasedControls::VIRTUAL_NMIS;
        if config.preemption_timer.is_some() {
            pin_set |= PinbasedControls::VMX_PREEMPTION_TIMER;
        }
        let pin = caps.pin.adjust("pin-based controls", 0, pin_set.bits(), 0)?;

        // Intercept all I/O ports, and use the secondary controls.
        let mut primary_set = PrimaryControls::UNCOND_IO_EXITING
            | PrimaryControls::SECONDARY_CONTROLS
            | PrimaryControls::USE_TSC_OFFSETTING;
        let mut primary_clear =
            PrimaryControls::INTERRUPT_WINDOW_EXITING | PrimaryControls::NMI_WINDOW_EXITING;
        let paging_exits = PrimaryControls::CR3_LOAD_EXITING
            | PrimaryControls::CR3_STORE_EXITING
            | PrimaryControls::INVLPG_EXITING;
        if config.nested_paging {
            primary_clear |= paging_exits;
        } else {
            primary_set |= paging_exits;
        }
        let apic_page = setup.virtual_apic_page.filter(|_| config.tpr_shadow);
        if apic_page.is_some() {
            primary_set |= PrimaryControls::USE_TPR_SHADOW;
        } else {
            primary_clear |= PrimaryControls::USE_TPR_SHADOW;
        }
        let primary = caps.primary.adjust(
            "primary processor-based controls",
            0,
            primary_set.bits(),
            primary_clear.bits(),
        )?;

        let mut secondary_set = SecondaryControls::empty();
        let mut secondary_clear = SecondaryControls::empty();
        for (enabled, bit) in [
            (mode.uses_ept(), SecondaryControls::ENABLE_EPT),
            (mode.uses_vpid(), SecondaryControls::ENABLE_VPID),
            (config.unrestricted_guest, SecondaryControls::UNRESTRICTED_GUEST),
        ] {
            if enabled {
                secondary_set |= bit;
            } else {
                secondary_clear |= bit;
            }
        }
        let secondary = caps.secondary.adjust(
            "secondary processor-based controls",
            0,
            secondary_set.bits(),
            secondary_clear.bits(),
        )?;

        // Switch EFER and PAT on entry and exit. External interrupts are
        // taken by the host once interrupts are enabled again.
        let exit = caps.exit.adjust(
            "VM-exit controls",
            0,
            (ExitControls::HOST_ADDRESS_SPACE_SIZE
                | ExitControls::SAVE_IA32_PAT
                | ExitControls::LOAD_IA32_PAT
                | ExitControls::SAVE_IA32_EFER
                | ExitControls::LOAD_IA32_EFER)
                .bits(),
            ExitControls::ACK_INTERRUPT_ON_EXIT.bits(),
        )?;
        let entry = caps.entry.adjust(
            "VM-entry controls",
            0,
            (EntryControls::LOAD_IA32_PAT | EntryControls::LOAD_IA32_EFER).bits(),
            EntryControls::IA32E_MODE_GUEST.bits(),
        )?;

        self.vmcs.init_controls(VmcsControlCache {
            pin,
            primary,
            secondary,
            entry,
            exit,
            exception_bitmap: setup.exception_bitmap,
            tsc_offset: setup.tsc_offset,
            eptp,
            ..Default::default()
        })?;
        if let Some(page) = apic_page {
            VmcsControl64::VIRT_APIC_ADDR.write::<H>(page)?;
        }

        VmcsGuest64::LINK_PTR.write::<H>(u64::MAX)?; // SDM Vol. 3C, Section 24.4.2
        VmcsGuest64::IA32_DEBUGCTL.write::<H>(0)?;
        VmcsGuest32::ACTIVITY_STATE.write::<H>(0)?;
        VmcsGuestNW::PENDING_DBG_EXCEPTIONS.write::<H>(0)?;

        for msr in SYSCALL_MSRS {
            self.vmcs.set_host_msr(msr as u32, H::read_host_msr(msr))?;
        }
        H::setup_host_state()?;

        self.reset(setup.entry);
        debug!(
            "vCPU {}: controls pin {:#x} primary {:#x} secondary {:#x} exit {:#x} entry {:#x}",
            self.id, pin, primary, secondary, exit, entry
        );
        Ok(())
    }

    /// Puts the guest back into its reset state at `entry`, e.g. after
    /// [`VcpuExit::Reset`]. Pending events are dropped.
    pub fn reset(&mut self, entry: u64) {
        self.guest.reset(GuestCpuContext::new_reset(entry));
        self.events = EventInjector::new();
        self.tlb.request_flush();
        self.last_failure = None;
        self.halted = false;
    }

    /// Loads the VMCS on the current CPU.
    pub fn attach(&mut self, percpu: &VmxPerCpuState<H>) -> Result {
        if !percpu.is_enabled() {
            return Err(VmxError::VmxNotEnabled);
        }
        let cpu = H::current_cpu_id();
        if percpu.cpu_id() != cpu {
            return Err(VmxError::BadState("per-CPU state used on another CPU"));
        }
        match self.session {
            VcpuSession::Attached { host_cpu } if host_cpu == cpu => return Ok(()),
            VcpuSession::Attached { .. } => {
                return Err(VmxError::BadState("vCPU is attached to another CPU"));
            }
            VcpuSession::Detached => {}
        }

        let irq = H::irq_save();
        let loaded = self.vmcs.load(cpu);
        H::irq_restore(irq);
        loaded?;
        self.session = VcpuSession::Attached { host_cpu: cpu };
        debug!("vCPU {} attached to CPU {}", self.id, cpu);
        Ok(())
    }

    /// Pulls the whole guest context out of the VMCS and clears it, so that
    /// the vCPU can be attached on any CPU afterwards.
    pub fn detach(&mut self) -> Result {
        let VcpuSession::Attached { host_cpu } = self.session else {
            return Ok(());
        };
        if H::current_cpu_id() != host_cpu {
            return Err(VmxError::BadState("vCPU must be detached on its own CPU"));
        }
        self.guest.import(StateGroups::all(), &self.vmcs)?;

        let irq = H::irq_save();
        let cleared = self.vmcs.clear();
        H::irq_restore(irq);
        cleared?;
        self.session = VcpuSession::Detached;
        debug!("vCPU {} detached from CPU {}", self.id, host_cpu);
        Ok(())
    }

    /// Runs the guest until the exit handler stops it or something needs the
    /// caller's attention.
    ///
    /// On return the whole guest context is in software, except after
    /// [`VcpuExit::Preempted`] where the vCPU is also detached. An event
    /// still pending after an error is kept in the pending trap.
    pub fn run<C, M, E>(
        &mut self,
        percpu: &mut VmxPerCpuState<H>,
        intc: &mut C,
        mem: &mut M,
        handler: &mut E,
    ) -> Result<VcpuExit<E::Stop>>
    where
        C: InterruptController + ?Sized,
        M: GuestMemory + ?Sized,
        E: ExitHandler<H> + ?Sized,
    {
        if self.halted {
            return Err(VmxError::BadState("vCPU is halted after a failed VM entry"));
        }
        self.attach(percpu)?;

        let result = self.run_loop(percpu, intc, mem, handler);
        match &result {
            Err(err) => {
                warn!("vCPU {}: run loop aborted: {}", self.id, err);
                if let Err(uncommit_err) = self.events.uncommit::<H>() {
                    warn!("vCPU {}: failed to take back the event: {}", self.id, uncommit_err);
                }
                if self.session != VcpuSession::Detached {
                    if let Err(import_err) = self.guest.import(StateGroups::all(), &self.vmcs) {
                        warn!("vCPU {}: failed to import guest state: {}", self.id, import_err);
                    }
                }
            }
            Ok(VcpuExit::Preempted) => {}
            Ok(_) => self.guest.import(StateGroups::all(), &self.vmcs)?,
        }
        result
    }

    fn run_loop<C, M, E>(
        &mut self,
        percpu: &mut VmxPerCpuState<H>,
        intc: &mut C,
        mem: &mut M,
        handler: &mut E,
    ) -> Result<VcpuExit<E::Stop>>
    where
        C: InterruptController + ?Sized,
        M: GuestMemory + ?Sized,
        E: ExitHandler<H> + ?Sized,
    {
        loop {
            if self.preempt.take() {
                trace!("vCPU {}: preempted", self.id);
                self.events.abort();
                self.detach()?;
                return Ok(VcpuExit::Preempted);
            }

            self.events
                .evaluate(&self.config, &mut self.guest, &mut self.vmcs, intc)?;
            let committed = self
                .events
                .commit(&self.config, &mut self.guest, &mut self.vmcs, mem)?;
            if committed == CommitOutcome::TripleFault {
                error!("vCPU {}: triple fault during real-mode event delivery", self.id);
                return Ok(VcpuExit::Reset);
            }

            let irq = H::irq_save();
            let entered = self.enter(percpu);
            H::irq_restore(irq);

            let raw = match entered? {
                EntryOutcome::Exited(raw) => raw,
                EntryOutcome::Failed(VmFail::VmFailInvalid) => return Err(VmxError::InvalidVmcsPtr),
                EntryOutcome::Failed(fail @ VmFail::VmFailValid) => {
                    self.events.uncommit::<H>()?;
                    let failure = self.entry_failed(None, vm_fail_reason::<H>(fail));
                    return Ok(VcpuExit::EntryFailed(failure));
                }
            };
            let reason = raw & 0xffff;

            if raw & VM_ENTRY_FAILURE != 0 {
                self.events.uncommit::<H>()?;
                if reason == VmxExitReason::INVALID_GUEST_STATE as u32 && self.guest.is_real_on_v86() {
                    debug!("vCPU {}: real-mode state rejected, emulation required", self.id);
                    return Ok(VcpuExit::EmulationRequired);
                }
                let instruction_error = self.vmcs.instruction_error().ok();
                let failure = self.entry_failed(Some(raw), instruction_error);
                return Ok(VcpuExit::EntryFailed(failure));
            }
            self.events.entered();

            let vectoring_pf = match self.resolve_conflicts(reason)? {
                Some(DeliveryConflict::TripleFault) => {
                    error!("vCPU {}: triple fault during event delivery", self.id);
                    return Ok(VcpuExit::Reset);
                }
                Some(DeliveryConflict::DoubleFault) => continue,
                Some(DeliveryConflict::ReflectSecond { vectoring_pf, .. }) => {
                    if !vectoring_pf {
                        continue;
                    }
                    true
                }
                _ => false,
            };

            let exit_reason = VmxExitReason::try_from(reason).map_err(|_| {
                error!("vCPU {}: unknown VM-exit reason {:#x}", self.id, raw);
                VmxError::UnknownExitReason(raw)
            })?;
            match exit_reason {
                VmxExitReason::TRIPLE_FAULT => {
                    error!(
                        "vCPU {}: triple fault at {:#x}",
                        self.id,
                        self.guest.context().rip
                    );
                    return Ok(VcpuExit::Reset);
                }
                VmxExitReason::INTERRUPT_WINDOW => {
                    self.vmcs.set_interrupt_window(false)?;
                    continue;
                }
                VmxExitReason::NMI_WINDOW => {
                    self.vmcs.set_nmi_window(false)?;
                    continue;
                }
                // taken by the host when interrupts were enabled again
                VmxExitReason::EXTERNAL_INTERRUPT => continue,
                VmxExitReason::EXCEPTION_NMI if self.exit_was_nmi()? => continue,
                _ => {}
            }

            let exit = VmxExitInfo {
                exit_reason,
                raw_reason: raw,
                guest_rip: self.guest.context().rip,
                exit_instruction_length: self.transient.exit_instruction_len::<H>()?,
                vectoring_pf,
            };
            trace!("vCPU {}: {:?}", self.id, exit);

            let regs_before = log_enabled!(log::Level::Trace).then(|| *self.guest.regs());
            let action = handler
                .handle_exit(self, &exit)
                .map_err(VmxError::Collaborator)?;
            if let Some(before) = regs_before {
                let diff = GeneralRegistersDiff::new(before, *self.guest.regs());
                if !diff.is_same() {
                    trace!("{:?} handler changed {:?}", exit.exit_reason, diff);
                }
            }
            if let ExitAction::Stop(stop) = action {
                return Ok(VcpuExit::Stopped(stop));
            }
        }
    }

    /// The part of an iteration that runs with interrupts disabled: the
    /// final guest-state export, TLB maintenance, the VM entry and the
    /// first look at the exit.
    fn enter(&mut self, percpu: &mut VmxPerCpuState<H>) -> Result<EntryOutcome> {
        let cpu = H::current_cpu_id();
        if self.session != (VcpuSession::Attached { host_cpu: cpu }) || percpu.cpu_id() != cpu {
            return Err(VmxError::BadState("vCPU is not attached to the current CPU"));
        }
        self.guest.export(StateGroups::all(), &mut self.vmcs)?;

        let action = self.tlb.plan(percpu.tlb_mut(), &self.config);
        if self.config.tlb_flush_mode.uses_vpid() {
            self.vmcs.set_vpid(self.tlb.asid() as u16)?;
        }
        if !action.is_empty() {
            trace!("vCPU {}: {:?}", self.id, action);
        }
        action.execute::<H>(self.vmcs.controls().eptp)?;
        if let Some(ticks) = self.config.preemption_timer {
            VmcsGuest32::VMX_PREEMPTION_TIMER_VALUE.write::<H>(ticks)?;
        }

        let mut cr2 = self.guest.cr2();
        let launched = self.vmcs.is_launched();
        let entered = unsafe { H::enter_guest(self.guest.regs_mut(), &mut cr2, launched) };
        self.transient.reset();
        if let Err(fail) = entered {
            return Ok(EntryOutcome::Failed(fail));
        }
        self.guest.set_cr2(cr2);
        self.guest.mark_guest_ran();

        let raw = self.transient.exit_reason::<H>()?;
        self.guest.history_mut().record_exit(raw);
        if raw & VM_ENTRY_FAILURE == 0 {
            self.vmcs.mark_launched();
            if raw & 0xffff == VmxExitReason::EXCEPTION_NMI as u32 && self.exit_was_nmi()? {
                H::dispatch_host_nmi();
            }
        }
        Ok(EntryOutcome::Exited(raw))
    }

    fn exit_was_nmi(&mut self) -> Result<bool> {
        Ok(self
            .transient
            .exit_interruption::<H>()?
            .is_some_and(|info| info.int_type == VmxInterruptionType::NMI))
    }

    /// Handles an exit that interrupted event delivery.
    fn resolve_conflicts(&mut self, reason: u32) -> Result<Option<DeliveryConflict>> {
        self.guest.import(
            StateGroups::RIP | StateGroups::RFLAGS | StateGroups::INTERRUPTIBILITY,
            &self.vmcs,
        )?;
        let exit_intr = if reason == VmxExitReason::EXCEPTION_NMI as u32 {
            self.transient.exit_interruption::<H>()?
        } else {
            None
        };
        let idt = self.transient.idt_vectoring::<H>()?;

        // an IRET that faulted had already unblocked NMIs
        if let Some(info) = &exit_intr {
            if info.nmi_unblocking && info.vector != x86::irq::DOUBLE_FAULT_VECTOR && idt.is_none() {
                self.guest
                    .modify(StateGroups::INTERRUPTIBILITY, &self.vmcs, |ctx| {
                        ctx.nmi_blocked = true
                    })?;
            }
        }
        let Some(idt_info) = idt else {
            return Ok(None);
        };

        let instr_len = if idt_info.int_type.is_soft() {
            self.transient.exit_instruction_len::<H>()?
        } else {
            0
        };
        let fault_address = match &exit_intr {
            Some(info)
                if info.int_type == VmxInterruptionType::HardException
                    && info.vector == x86::irq::PAGE_FAULT_VECTOR =>
            {
                Some(self.transient.exit_qualification::<H>()?)
            }
            _ => None,
        };
        let conflict = resolve_delivery_conflict(
            Some(&idt_info),
            exit_intr.as_ref(),
            instr_len,
            fault_address,
        );
        trace!("vCPU {}: delivery conflict {:?}", self.id, conflict);
        self.events
            .apply_conflict(&conflict, &mut self.guest, &self.vmcs)?;
        Ok(Some(conflict))
    }

    fn entry_failed(
        &mut self,
        raw_reason: Option<u32>,
        instruction_error: Option<VmxInstructionError>,
    ) -> VmEntryFailure {
        let qualification = match raw_reason {
            Some(_) => self.transient.exit_qualification::<H>().unwrap_or(0),
            None => 0,
        };
        if let Err(err) = self.guest.import(StateGroups::all(), &self.vmcs) {
            warn!("vCPU {}: guest state incomplete: {}", self.id, err);
        }
        let failure = VmEntryFailure {
            raw_reason,
            exit_reason: raw_reason.and_then(|raw| VmxExitReason::try_from(raw & 0xffff).ok()),
            qualification,
            instruction_error,
            guest: self.guest.context().clone(),
        };
        error!("vCPU {}: VM entry failed: {:#x?}", self.id, failure);
        self.halted = true;
        self.last_failure = Some(failure.clone());
        failure
    }

    /// Imports `groups` and returns the guest context.
    pub fn state(&mut self, groups: StateGroups) -> Result<&GuestCpuContext> {
        self.guest.read(groups, &self.vmcs)
    }

    /// Imports `groups`, lets `f` change them and exports them on the next entry.
    pub fn modify_state<R>(
        &mut self,
        groups: StateGroups,
        f: impl FnOnce(&mut GuestCpuContext) -> R,
    ) -> Result<R> {
        self.guest.modify(groups, &self.vmcs, f)
    }

    pub fn guest_state(&self) -> &GuestState {
        &self.guest
    }

    pub fn regs(&self) -> &GeneralRegisters {
        self.guest.regs()
    }

    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        self.guest.regs_mut()
    }

    /// Skips the instruction that caused the exit.
    pub fn advance_rip(&mut self, instr_len: u32) -> Result {
        self.guest.modify(
            StateGroups::RIP | StateGroups::INTERRUPTIBILITY,
            &self.vmcs,
            |ctx| {
                ctx.rip += instr_len as u64;
                ctx.interrupt_shadow = None;
            },
        )
    }

    /// Queues an event for the next entry.
    pub fn queue_event(&mut self, event: PendingEvent) -> Result {
        self.events.slot_mut().try_set(event)
    }

    pub fn pending_event(&self) -> Option<&PendingEvent> {
        self.events.slot().peek()
    }

    pub fn cancel_pending_event(&mut self) -> Option<PendingEvent> {
        self.events.slot_mut().take()
    }

    pub fn pending_trap(&self) -> Option<&PendingEvent> {
        self.events.pending_trap()
    }

    /// Takes the event handed back to software, e.g. before a ring-3 round trip.
    pub fn take_pending_trap(&mut self) -> Option<PendingEvent> {
        self.events.take_trap()
    }

    /// Puts an event taken with [`VmxVcpu::take_pending_trap`] back.
    pub fn restore_pending_trap(&mut self, event: PendingEvent) -> Result {
        self.events.set_trap(event)
    }

    pub fn injection_phase(&self) -> InjectionPhase {
        self.events.phase()
    }

    /// Flushes every translation of this vCPU before the next entry.
    pub fn request_tlb_flush(&mut self) {
        self.tlb.request_flush();
    }

    /// Invalidates the translations of one guest-linear address.
    pub fn flush_guest_page(&mut self, gla: u64) -> Result {
        self.tlb.flush_page::<H>(&self.config, gla)
    }

    pub fn tlb(&self) -> &VcpuTlbState {
        &self.tlb
    }

    /// Takes the CR3/PDPTE changes the paging code has to catch up with.
    pub fn take_paging_sync(&mut self) -> PagingSyncFlags {
        self.guest.take_paging_sync()
    }

    pub fn exit_history(&self) -> &ExitHistory {
        self.guest.history()
    }

    /// The signal the host scheduler sets to get the CPU back.
    pub fn preempt_signal(&self) -> Arc<PreemptSignal> {
        self.preempt.clone()
    }

    pub fn exit_qualification(&mut self) -> Result<u64> {
        self.transient.exit_qualification::<H>()
    }

    pub fn exit_instruction_length(&mut self) -> Result<u32> {
        self.transient.exit_instruction_len::<H>()
    }

    pub fn exit_instruction_info(&mut self) -> Result<u32> {
        self.transient.exit_instruction_info::<H>()
    }

    pub fn guest_linear_addr(&mut self) -> Result<u64> {
        self.transient.guest_linear_addr::<H>()
    }

    pub fn guest_physical_addr(&mut self) -> Result<u64> {
        self.transient.guest_physical_addr::<H>()
    }

    /// Interruption information of the exception or NMI that caused the exit.
    pub fn exit_interruption(&mut self) -> Result<Option<VmxInterruptInfo>> {
        self.transient.exit_interruption::<H>()
    }

    pub fn idt_vectoring(&mut self) -> Result<Option<VmxInterruptInfo>> {
        self.transient.idt_vectoring::<H>()
    }

    pub fn vmcs(&self) -> &VmcsContext<H> {
        &self.vmcs
    }

    pub fn vmcs_mut(&mut self) -> &mut VmcsContext<H> {
        &mut self.vmcs
    }

    pub fn last_failure(&self) -> Option<&VmEntryFailure> {
        self.last_failure.as_ref()
    }
}

impl<H: VmxHal> Debug for VmxVcpu<H> {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let ctx = self.guest.context();
        f.debug_struct("VmxVcpu")
            .field("id", &self.id)
            .field("session", &self.session)
            .field("launch_state", &self.vmcs.launch_state())
            .field("stale", &self.guest.not_authoritative())
            .field("rip", &ctx.rip)
            .field("cs", &ctx.cs)
            .field("cr0", &ctx.cr0)
            .field("pending_event", &self.events.slot().peek())
            .field("pending_trap", &self.events.pending_trap())
            .field("tlb", &self.tlb)
            .field("halted", &self.halted)
            .finish()
    }
}
