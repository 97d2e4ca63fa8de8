//! Event evaluation, injection and delivery-conflict resolution.

use axerrno::AxResult;
use bitflags::bitflags;
use x86::irq::{
    DOUBLE_FAULT_VECTOR, GENERAL_PROTECTION_FAULT_VECTOR, NONMASKABLE_INTERRUPT_VECTOR,
    PAGE_FAULT_VECTOR,
};
use x86_64::registers::rflags::RFlags;

use super::config::VmxConfig;
use super::definitions::VmxInterruptionType;
use super::field_cache::VmcsContext;
use super::guest_state::{GuestState, StateGroups};
use super::vmcs::{VmcsControl32, VmxInterruptInfo};
use crate::segmentation::Segment;
use crate::{Result, VmxError, VmxHal};

bitflags! {
    /// Guest interruptibility state. (SDM Vol. 3C, Section 25.4.2)
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interruptibility: u32 {
        const BLOCKING_BY_STI = 1 << 0;
        const BLOCKING_BY_MOV_SS = 1 << 1;
        const BLOCKING_BY_SMI = 1 << 2;
        const BLOCKING_BY_NMI = 1 << 3;
    }
}

impl Interruptibility {
    /// Blocking that covers the next instruction only.
    pub const SHADOW: Self = Self::BLOCKING_BY_STI.union(Self::BLOCKING_BY_MOV_SS);
}

/// An event to be delivered to the guest on the next VM entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingEvent {
    pub vector: u8,
    pub kind: VmxInterruptionType,
    pub error_code: Option<u32>,
    /// Length of the instruction that raised a software event.
    pub instr_len: u32,
    /// Faulting linear address of a page fault, loaded into CR2.
    pub fault_address: Option<u64>,
}

impl PendingEvent {
    /// A hardware exception.
    pub const fn exception(vector: u8, error_code: Option<u32>) -> Self {
        Self {
            vector,
            kind: VmxInterruptionType::HardException,
            error_code,
            instr_len: 0,
            fault_address: None,
        }
    }

    pub const fn page_fault(error_code: u32, address: u64) -> Self {
        Self {
            fault_address: Some(address),
            ..Self::exception(PAGE_FAULT_VECTOR, Some(error_code))
        }
    }

    /// `#DF`. Its error code is always zero.
    pub const fn double_fault() -> Self {
        Self::exception(DOUBLE_FAULT_VECTOR, Some(0))
    }

    pub const fn general_protection(error_code: u32) -> Self {
        Self::exception(GENERAL_PROTECTION_FAULT_VECTOR, Some(error_code))
    }

    pub const fn nmi() -> Self {
        Self {
            vector: NONMASKABLE_INTERRUPT_VECTOR,
            kind: VmxInterruptionType::NMI,
            error_code: None,
            instr_len: 0,
            fault_address: None,
        }
    }

    pub const fn external(vector: u8) -> Self {
        Self {
            vector,
            kind: VmxInterruptionType::External,
            error_code: None,
            instr_len: 0,
            fault_address: None,
        }
    }

    /// `INT n`.
    pub const fn software_interrupt(vector: u8, instr_len: u32) -> Self {
        Self {
            vector,
            kind: VmxInterruptionType::SoftIntr,
            error_code: None,
            instr_len,
            fault_address: None,
        }
    }

    /// `INT3` or `INTO`.
    pub const fn software_exception(vector: u8, instr_len: u32) -> Self {
        Self {
            kind: VmxInterruptionType::SoftException,
            ..Self::software_interrupt(vector, instr_len)
        }
    }

    /// `INT1`.
    pub const fn privileged_software_exception(vector: u8, instr_len: u32) -> Self {
        Self {
            kind: VmxInterruptionType::PrivSoft,
            ..Self::software_interrupt(vector, instr_len)
        }
    }

    /// Rebuilds an event from exit interruption or IDT-vectoring information.
    pub fn from_interrupt_info(info: &VmxInterruptInfo, instr_len: u32) -> Self {
        Self {
            vector: info.vector,
            kind: info.int_type,
            error_code: info.err_code,
            instr_len: if info.int_type.is_soft() { instr_len } else { 0 },
            fault_address: None,
        }
    }

    pub fn is_hardware_exception(&self) -> bool {
        self.kind == VmxInterruptionType::HardException
    }

    pub fn to_interrupt_info(&self) -> VmxInterruptInfo {
        VmxInterruptInfo {
            vector: self.vector,
            int_type: self.kind,
            err_code: self.error_code,
            nmi_unblocking: false,
        }
    }

    /// Value of the VM-entry interruption-information field.
    pub fn entry_interruption_info(&self) -> u32 {
        self.to_interrupt_info().bits()
    }
}

/// The single pending-event slot of a vCPU.
#[derive(Debug, Default)]
pub struct EventSlot(Option<PendingEvent>);

/// Proof that an [`EventSlot`] is empty. Consumed by [`VacantEvent::set`].
#[derive(Debug)]
pub struct VacantEvent<'a>(&'a mut Option<PendingEvent>);

impl VacantEvent<'_> {
    pub fn set(self, event: PendingEvent) {
        *self.0 = Some(event);
    }
}

impl EventSlot {
    pub const fn new() -> Self {
        Self(None)
    }

    pub fn is_pending(&self) -> bool {
        self.0.is_some()
    }

    pub fn peek(&self) -> Option<&PendingEvent> {
        self.0.as_ref()
    }

    /// The slot, if nothing is pending.
    pub fn vacant(&mut self) -> Option<VacantEvent<'_>> {
        match self.0 {
            None => Some(VacantEvent(&mut self.0)),
            Some(_) => None,
        }
    }

    /// Sets the pending event. Fails if one is already pending.
    pub fn try_set(&mut self, event: PendingEvent) -> Result {
        match self.vacant() {
            Some(vacant) => {
                vacant.set(event);
                Ok(())
            }
            None => Err(VmxError::EventAlreadyPending),
        }
    }

    pub fn take(&mut self) -> Option<PendingEvent> {
        self.0.take()
    }
}

/// Where the injection state machine of a vCPU stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionPhase {
    Idle,
    /// Interrupt sources are being polled.
    Evaluating,
    /// An event won and waits in the slot.
    Pending,
    /// The event was written to the VMCS, or delivered in software, and the
    /// guest has not been entered yet.
    Committed,
}

/// Result of polling the interrupt controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptPoll {
    None,
    /// An interrupt with this vector can be delivered.
    Ready(u8),
    /// The highest pending vector is masked by the guest's task priority.
    MaskedByPriority(u8),
}

/// Source of NMIs and external interrupts, usually a virtual local APIC.
pub trait InterruptController {
    fn has_pending_nmi(&self) -> bool;
    /// The pending NMI was injected.
    fn acknowledge_nmi(&mut self);
    fn poll_interrupt(&mut self) -> InterruptPoll;
    /// The interrupt returned by [`InterruptController::poll_interrupt`] was
    /// injected.
    fn acknowledge_interrupt(&mut self, vector: u8);
}

/// Access to guest physical memory.
pub trait GuestMemory {
    fn read_phys(&self, gpa: u64, buf: &mut [u8]) -> AxResult;
    fn write_phys(&mut self, gpa: u64, data: &[u8]) -> AxResult;
}

/// Exception classes for double-fault detection. (SDM Vol. 3A, Table 6-4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionClass {
    Benign,
    Contributory,
    PageFault,
    DoubleFault,
}

impl ExceptionClass {
    pub const fn of(vector: u8) -> Self {
        use x86::irq::*;
        match vector {
            DIVIDE_ERROR_VECTOR
            | INVALID_TSS_VECTOR
            | SEGMENT_NOT_PRESENT_VECTOR
            | STACK_SEGEMENT_FAULT_VECTOR
            | GENERAL_PROTECTION_FAULT_VECTOR => Self::Contributory,
            PAGE_FAULT_VECTOR => Self::PageFault,
            DOUBLE_FAULT_VECTOR => Self::DoubleFault,
            _ => Self::Benign,
        }
    }
}

/// What to do about an event whose delivery was cut short by a VM exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryConflict {
    /// Nothing was being delivered.
    None,
    /// The exit was not caused by the delivery; deliver the event again.
    Reinject(PendingEvent),
    /// The delivery raised an exception that is handled serially.
    ReflectSecond {
        second: PendingEvent,
        /// An interrupt or NMI to redeliver after `second`.
        deferred: Option<PendingEvent>,
        /// `second` is a page fault raised while delivering an external
        /// interrupt or NMI.
        vectoring_pf: bool,
    },
    DoubleFault,
    /// Shutdown: the VM must be reset.
    TripleFault,
}

/// Classifies a VM exit that happened during event delivery. (SDM Vol. 3A, Table 6-5)
///
/// `idt` is the IDT-vectoring information of the exit, `exit` the exit
/// interruption information if the exit was caused by an exception.
/// `fault_address` is the exit qualification of a page-fault exit; the
/// processor does not load it into the guest CR2.
pub fn resolve_delivery_conflict(
    idt: Option<&VmxInterruptInfo>,
    exit: Option<&VmxInterruptInfo>,
    instr_len: u32,
    fault_address: Option<u64>,
) -> DeliveryConflict {
    let Some(idt) = idt else {
        return DeliveryConflict::None;
    };
    let first = PendingEvent::from_interrupt_info(idt, instr_len);
    let second = match exit {
        Some(info) if info.int_type == VmxInterruptionType::HardException => {
            let mut second = PendingEvent::from_interrupt_info(info, 0);
            if second.vector == PAGE_FAULT_VECTOR {
                second.fault_address = fault_address;
            }
            second
        }
        _ => return DeliveryConflict::Reinject(first),
    };

    match first.kind {
        VmxInterruptionType::HardException => {
            use ExceptionClass::*;
            match (ExceptionClass::of(first.vector), ExceptionClass::of(second.vector)) {
                (DoubleFault, _) => DeliveryConflict::TripleFault,
                (Contributory, Contributory) | (PageFault, Contributory | PageFault) => {
                    DeliveryConflict::DoubleFault
                }
                _ => DeliveryConflict::ReflectSecond {
                    second,
                    deferred: None,
                    vectoring_pf: false,
                },
            }
        }
        VmxInterruptionType::External | VmxInterruptionType::NMI => {
            DeliveryConflict::ReflectSecond {
                second,
                deferred: Some(first),
                vectoring_pf: second.vector == PAGE_FAULT_VECTOR,
            }
        }
        // the instruction is executed again and raises the event again
        _ => DeliveryConflict::ReflectSecond {
            second,
            deferred: None,
            vectoring_pf: false,
        },
    }
}

/// Outcome of committing the pending event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Nothing was pending.
    Nothing,
    /// Written to the VM-entry interruption-information field.
    Hardware(PendingEvent),
    /// Delivered through the real-mode IVT; the guest context already points
    /// at the handler.
    Software(PendingEvent),
    /// Software delivery shut the guest down.
    TripleFault,
}

/// Real-mode delivery result.
enum RealModeDelivery {
    Delivered(PendingEvent),
    TripleFault,
}

/// RFLAGS bits cleared when entering a real-mode interrupt handler.
const REAL_MODE_ENTRY_CLEAR: u64 = RFlags::INTERRUPT_FLAG.bits()
    | RFlags::TRAP_FLAG.bits()
    | RFlags::RESUME_FLAG.bits()
    | RFlags::ALIGNMENT_CHECK.bits();

/// The event injection state machine of one vCPU.
#[derive(Debug)]
pub struct EventInjector {
    slot: EventSlot,
    /// Events handed back to software, redelivered before new sources are polled.
    trap: Option<PendingEvent>,
    phase: InjectionPhase,
    /// Event committed to the VMCS for the coming entry.
    in_flight: Option<PendingEvent>,
}

impl EventInjector {
    pub const fn new() -> Self {
        Self {
            slot: EventSlot::new(),
            trap: None,
            phase: InjectionPhase::Idle,
            in_flight: None,
        }
    }

    pub fn phase(&self) -> InjectionPhase {
        self.phase
    }

    pub fn slot(&self) -> &EventSlot {
        &self.slot
    }

    pub fn slot_mut(&mut self) -> &mut EventSlot {
        &mut self.slot
    }

    pub fn pending_trap(&self) -> Option<&PendingEvent> {
        self.trap.as_ref()
    }

    /// Hands the trap to the caller, e.g. for a ring-3 round trip.
    pub fn take_trap(&mut self) -> Option<PendingEvent> {
        self.trap.take()
    }

    /// Puts an event handed back earlier into the trap.
    pub fn set_trap(&mut self, event: PendingEvent) -> Result {
        if self.trap.is_some() {
            return Err(VmxError::EventAlreadyPending);
        }
        self.trap = Some(event);
        Ok(())
    }

    /// Moves the pending event to the trap so that it survives an aborted run.
    /// It stays in the slot if the trap is occupied.
    pub fn abort(&mut self) {
        if self.trap.is_none() {
            self.trap = self.slot.take();
        }
        if self.phase != InjectionPhase::Committed {
            self.phase = InjectionPhase::Idle;
        }
    }

    /// Takes back an event committed to the VMCS that was never delivered.
    pub fn uncommit<H: VmxHal>(&mut self) -> Result {
        if let Some(event) = self.in_flight.take() {
            let restore = if self.slot.is_pending() {
                self.set_trap(event)
            } else {
                self.slot.try_set(event)
            };
            VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write::<H>(0)?;
            restore?;
        }
        self.phase = InjectionPhase::Idle;
        self.abort();
        Ok(())
    }

    /// The guest was entered with whatever was committed.
    pub fn entered(&mut self) {
        self.in_flight = None;
        self.phase = InjectionPhase::Idle;
    }

    /// Picks at most one event to inject on the next entry.
    ///
    /// The trap wins over everything, then an already pending event, then
    /// NMIs, then external interrupts. Sources that cannot be delivered now
    /// arm the matching window exit.
    pub fn evaluate<H: VmxHal, C: InterruptController + ?Sized>(
        &mut self,
        config: &VmxConfig,
        state: &mut GuestState,
        vmcs: &mut VmcsContext<H>,
        intc: &mut C,
    ) -> Result {
        self.phase = InjectionPhase::Evaluating;
        if self.trap.is_some() {
            if let Some(vacant) = self.slot.vacant() {
                if let Some(trap) = self.trap.take() {
                    trace!("redelivering trapped event {:?}", trap);
                    vacant.set(trap);
                }
            }
        }
        if self.slot.is_pending() {
            self.phase = InjectionPhase::Pending;
            return Ok(());
        }

        let ctx = state.read(
            StateGroups::RIP | StateGroups::RFLAGS | StateGroups::INTERRUPTIBILITY,
            vmcs,
        )?;
        let blocking = ctx.interruptibility();
        let shadow = blocking.intersects(Interruptibility::SHADOW);
        let if_set = ctx.interrupts_enabled();

        if intc.has_pending_nmi() {
            if !shadow && !blocking.contains(Interruptibility::BLOCKING_BY_NMI) {
                intc.acknowledge_nmi();
                self.slot.try_set(PendingEvent::nmi())?;
                vmcs.set_nmi_window(false)?;
                self.phase = InjectionPhase::Pending;
                return Ok(());
            }
            vmcs.set_nmi_window(true)?;
        }

        match intc.poll_interrupt() {
            InterruptPoll::Ready(vector) => {
                if if_set && !shadow {
                    intc.acknowledge_interrupt(vector);
                    self.slot.try_set(PendingEvent::external(vector))?;
                    vmcs.set_interrupt_window(false)?;
                    self.phase = InjectionPhase::Pending;
                    return Ok(());
                }
                vmcs.set_interrupt_window(true)?;
            }
            InterruptPoll::MaskedByPriority(vector) => {
                if config.tpr_shadow {
                    vmcs.set_tpr_threshold((vector >> 4) as u32)?;
                }
            }
            InterruptPoll::None => {
                if config.tpr_shadow {
                    vmcs.set_tpr_threshold(0)?;
                }
            }
        }
        self.phase = InjectionPhase::Idle;
        Ok(())
    }

    /// Commits the pending event for the next entry.
    ///
    /// On failure the event is moved to the trap.
    pub fn commit<H: VmxHal, M: GuestMemory + ?Sized>(
        &mut self,
        config: &VmxConfig,
        state: &mut GuestState,
        vmcs: &mut VmcsContext<H>,
        mem: &mut M,
    ) -> Result<CommitOutcome> {
        let Some(event) = self.slot.take() else {
            self.phase = InjectionPhase::Idle;
            return Ok(CommitOutcome::Nothing);
        };

        let real_mode = !config.unrestricted_guest
            && !state.read(StateGroups::CR0, vmcs)?.protected_mode();
        let outcome = if real_mode {
            match Self::deliver_real_mode(event, state, vmcs, mem) {
                Ok(RealModeDelivery::Delivered(delivered)) => Ok(CommitOutcome::Software(delivered)),
                Ok(RealModeDelivery::TripleFault) => Ok(CommitOutcome::TripleFault),
                Err(err) => Err(err),
            }
        } else {
            Self::write_entry_event(event, state, vmcs).map(|_| CommitOutcome::Hardware(event))
        };

        match outcome {
            Ok(outcome) => {
                trace!("committed {:?}", outcome);
                if let CommitOutcome::Hardware(event) = outcome {
                    self.in_flight = Some(event);
                }
                self.phase = InjectionPhase::Committed;
                Ok(outcome)
            }
            Err(err) => {
                warn!("failed to commit {:?}: {}", event, err);
                if self.trap.is_none() {
                    self.trap = Some(event);
                } else {
                    self.slot.try_set(event)?;
                }
                self.phase = InjectionPhase::Idle;
                Err(err)
            }
        }
    }

    fn write_entry_event<H: VmxHal>(
        event: PendingEvent,
        state: &mut GuestState,
        vmcs: &mut VmcsContext<H>,
    ) -> Result {
        if event.kind.is_soft() {
            VmcsControl32::VMENTRY_INSTRUCTION_LEN.write::<H>(event.instr_len)?;
        }
        if let Some(error_code) = event.error_code {
            VmcsControl32::VMENTRY_EXCEPTION_ERR_CODE.write::<H>(error_code)?;
        }
        VmcsControl32::VMENTRY_INTERRUPTION_INFO_FIELD.write::<H>(event.entry_interruption_info())?;

        if event.is_hardware_exception() && event.vector == PAGE_FAULT_VECTOR {
            if let Some(address) = event.fault_address {
                state.set_cr2(address);
            }
        }
        if event.is_hardware_exception() || event.kind == VmxInterruptionType::NMI {
            state.modify(StateGroups::INTERRUPTIBILITY, vmcs, |ctx| {
                ctx.interrupt_shadow = None;
            })?;
        }
        Ok(())
    }

    /// Delivers `event` the way a real-mode processor does: push FLAGS, CS
    /// and IP, then jump through the IVT.
    fn deliver_real_mode<H: VmxHal, M: GuestMemory + ?Sized>(
        mut event: PendingEvent,
        state: &mut GuestState,
        vmcs: &mut VmcsContext<H>,
        mem: &mut M,
    ) -> Result<RealModeDelivery> {
        let groups = StateGroups::RIP
            | StateGroups::RSP
            | StateGroups::RFLAGS
            | StateGroups::CS
            | StateGroups::SS
            | StateGroups::IDTR
            | StateGroups::INTERRUPTIBILITY;
        let ctx = state.read(groups, vmcs)?;

        // a missing IVT entry raises #GP, a missing #GP entry raises #DF
        while (event.vector as u64) * 4 + 3 > ctx.idtr.limit as u64 {
            event = match event.vector {
                DOUBLE_FAULT_VECTOR => return Ok(RealModeDelivery::TripleFault),
                GENERAL_PROTECTION_FAULT_VECTOR => PendingEvent::double_fault(),
                _ => PendingEvent::general_protection(0),
            };
            debug!("real-mode IVT entry missing, raising vector {}", event.vector);
        }

        let sp = ctx.rsp as u16;
        if sp == 1 {
            return Ok(RealModeDelivery::TripleFault);
        }

        let mut entry = [0u8; 4];
        mem.read_phys(ctx.idtr.base + event.vector as u64 * 4, &mut entry)?;
        let offset = u16::from_le_bytes([entry[0], entry[1]]);
        let selector = u16::from_le_bytes([entry[2], entry[3]]);

        let return_ip = (ctx.rip as u16).wrapping_add(event.instr_len as u16);
        let frame = [ctx.rflags as u16, ctx.cs.selector.bits(), return_ip];
        let mut sp = sp;
        for word in frame {
            sp = sp.wrapping_sub(2);
            mem.write_phys(ctx.ss.base + sp as u64, &word.to_le_bytes())?;
        }

        state.modify(groups, vmcs, |ctx| {
            ctx.rsp = (ctx.rsp & !0xffff) | sp as u64;
            ctx.rflags &= !REAL_MODE_ENTRY_CLEAR;
            ctx.cs = Segment::real_mode(selector, ctx.cs.access_rights);
            ctx.rip = offset as u64;
            ctx.interrupt_shadow = None;
        })?;
        Ok(RealModeDelivery::Delivered(event))
    }

    /// Queues the events a delivery conflict leaves behind.
    pub fn apply_conflict<H: VmxHal>(
        &mut self,
        conflict: &DeliveryConflict,
        state: &mut GuestState,
        vmcs: &VmcsContext<H>,
    ) -> Result {
        let unblock_nmi = |state: &mut GuestState, event: &PendingEvent| -> Result {
            // an NMI whose delivery was cut short is not blocking further NMIs
            if event.kind == VmxInterruptionType::NMI {
                state.modify(StateGroups::INTERRUPTIBILITY, vmcs, |ctx| ctx.nmi_blocked = false)?;
            }
            Ok(())
        };
        match conflict {
            DeliveryConflict::None | DeliveryConflict::TripleFault => {}
            DeliveryConflict::Reinject(event) => {
                trace!("reinjecting {:?}", event);
                unblock_nmi(state, event)?;
                self.slot.try_set(*event)?;
            }
            DeliveryConflict::ReflectSecond {
                second,
                deferred,
                vectoring_pf,
            } => {
                if let Some(deferred) = deferred {
                    unblock_nmi(state, deferred)?;
                    self.set_trap(*deferred)?;
                }
                // a vectoring #PF goes to the exit handler, which may resolve it
                if !vectoring_pf {
                    self.slot.try_set(*second)?;
                }
            }
            DeliveryConflict::DoubleFault => {
                warn!("exception during event delivery, raising #DF");
                self.slot.try_set(PendingEvent::double_fault())?;
            }
        }
        if self.slot.is_pending() {
            self.phase = InjectionPhase::Pending;
        }
        Ok(())
    }
}

impl Default for EventInjector {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hw(vector: u8, err: Option<u32>) -> VmxInterruptInfo {
        VmxInterruptInfo {
            vector,
            int_type: VmxInterruptionType::HardException,
            err_code: err,
            nmi_unblocking: false,
        }
    }

    #[test]
    fn slot_holds_one_event() {
        let mut slot = EventSlot::new();
        slot.vacant().unwrap().set(PendingEvent::external(0x30));
        assert!(slot.vacant().is_none());
        assert!(matches!(
            slot.try_set(PendingEvent::nmi()),
            Err(VmxError::EventAlreadyPending)
        ));
        assert_eq!(slot.peek().unwrap().vector, 0x30);
        assert_eq!(slot.take().unwrap().vector, 0x30);
        assert!(slot.try_set(PendingEvent::nmi()).is_ok());
    }

    #[test]
    fn entry_info_encoding() {
        assert_eq!(PendingEvent::page_fault(2, 0x1000).entry_interruption_info(), 0x8000_0b0e);
        assert_eq!(PendingEvent::double_fault().entry_interruption_info(), 0x8000_0b08);
        assert_eq!(PendingEvent::nmi().entry_interruption_info(), 0x8000_0202);
        assert_eq!(
            PendingEvent::software_interrupt(0x80, 2).entry_interruption_info(),
            0x8000_0480
        );
        assert_eq!(
            PendingEvent::software_exception(3, 1).entry_interruption_info(),
            0x8000_0603
        );
    }

    #[test]
    fn exception_classes() {
        for v in [0, 10, 11, 12, 13] {
            assert_eq!(ExceptionClass::of(v), ExceptionClass::Contributory);
        }
        assert_eq!(ExceptionClass::of(14), ExceptionClass::PageFault);
        assert_eq!(ExceptionClass::of(8), ExceptionClass::DoubleFault);
        assert_eq!(ExceptionClass::of(6), ExceptionClass::Benign);
    }

    #[test]
    fn conflict_table() {
        let pf = hw(14, Some(0));
        let gp = hw(13, Some(0));
        let ud = hw(6, None);
        let df = hw(8, Some(0));

        assert_eq!(resolve_delivery_conflict(None, Some(&pf), 0, None), DeliveryConflict::None);
        assert_eq!(
            resolve_delivery_conflict(Some(&pf), Some(&pf), 0, None),
            DeliveryConflict::DoubleFault
        );
        assert_eq!(
            resolve_delivery_conflict(Some(&pf), Some(&gp), 0, None),
            DeliveryConflict::DoubleFault
        );
        assert_eq!(
            resolve_delivery_conflict(Some(&gp), Some(&gp), 0, None),
            DeliveryConflict::DoubleFault
        );
        assert_eq!(
            resolve_delivery_conflict(Some(&df), Some(&ud), 0, None),
            DeliveryConflict::TripleFault
        );
        // contributory then page fault is handled serially
        assert_eq!(
            resolve_delivery_conflict(Some(&gp), Some(&pf), 0, None),
            DeliveryConflict::ReflectSecond {
                second: PendingEvent::exception(14, Some(0)),
                deferred: None,
                vectoring_pf: false,
            }
        );
        // exit not caused by an exception: deliver the first event again
        assert_eq!(
            resolve_delivery_conflict(Some(&gp), None, 0, None),
            DeliveryConflict::Reinject(PendingEvent::exception(13, Some(0)))
        );
    }

    #[test]
    fn page_fault_while_delivering_interrupt_is_vectoring() {
        let ext = VmxInterruptInfo::from(0x40, None);
        let pf = hw(14, Some(2));
        assert_eq!(
            resolve_delivery_conflict(Some(&ext), Some(&pf), 0, None),
            DeliveryConflict::ReflectSecond {
                second: PendingEvent::exception(14, Some(2)),
                deferred: Some(PendingEvent::external(0x40)),
                vectoring_pf: true,
            }
        );
    }

    #[test]
    fn reflected_page_fault_carries_exit_qualification() {
        let ud = hw(6, None);
        let pf = hw(14, Some(0));
        assert_eq!(
            resolve_delivery_conflict(Some(&ud), Some(&pf), 0, Some(0xdead_000)),
            DeliveryConflict::ReflectSecond {
                second: PendingEvent::page_fault(0, 0xdead_000),
                deferred: None,
                vectoring_pf: false,
            }
        );
        // only a page fault takes the address
        let gp = hw(13, Some(0));
        assert_eq!(
            resolve_delivery_conflict(Some(&ud), Some(&gp), 0, Some(0xdead_000)),
            DeliveryConflict::ReflectSecond {
                second: PendingEvent::general_protection(0),
                deferred: None,
                vectoring_pf: false,
            }
        );
    }

    #[test]
    fn soft_interrupt_reinjected_with_length() {
        let int80 = VmxInterruptInfo {
            vector: 0x80,
            int_type: VmxInterruptionType::SoftIntr,
            err_code: None,
            nmi_unblocking: false,
        };
        assert_eq!(
            resolve_delivery_conflict(Some(&int80), None, 2, None),
            DeliveryConflict::Reinject(PendingEvent::software_interrupt(0x80, 2))
        );
    }
}
