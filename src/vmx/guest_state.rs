//! Synchronization of the software guest CPU context with the VMCS.
//!
//! Every [`StateGroup`] lives in exactly one [`StateLocation`]. Groups are
//! pulled from the VMCS lazily by [`GuestState::import`] and pushed back by
//! [`GuestState::export`] only when software changed them. Writing a group
//! always imports it first, so a group can never be dirty while its software
//! copy is stale.

use alloc::sync::Arc;

use bitflags::bitflags;
use x86::segmentation::SegmentSelector;
use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::model_specific::EferFlags;
use x86_64::registers::rflags::RFlags;

use super::config::VmxConfig;
use super::event::Interruptibility;
use super::field_cache::VmcsContext;
use super::vmcs::{EntryControls, VmcsGuest16, VmcsGuest32, VmcsGuest64, VmcsGuestNW};
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::segmentation::{DescriptorTable, Segment, SegmentAccessRights};
use crate::{Result, VmxError, VmxHal};

/// A unit of guest state that is imported and exported as a whole.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StateGroup {
    Rip,
    Rsp,
    Rflags,
    Cs,
    Ss,
    Ds,
    Es,
    Fs,
    Gs,
    Ldtr,
    Tr,
    Gdtr,
    Idtr,
    Cr0,
    Cr4,
    Efer,
    Cr3,
    Pdptes,
    Dr7,
    Sysenter,
    Pat,
    SyscallMsrs,
    Interruptibility,
}

impl StateGroup {
    pub const COUNT: usize = 23;

    /// All groups, in import order.
    pub const ALL: [Self; Self::COUNT] = [
        Self::Rip,
        Self::Rsp,
        Self::Rflags,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Es,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
        Self::Gdtr,
        Self::Idtr,
        Self::Cr0,
        Self::Cr4,
        Self::Efer,
        Self::Cr3,
        Self::Pdptes,
        Self::Dr7,
        Self::Sysenter,
        Self::Pat,
        Self::SyscallMsrs,
        Self::Interruptibility,
    ];

    /// Export order: control registers first, a CR0 change may invalidate
    /// how the other groups are written.
    const EXPORT_ORDER: [Self; Self::COUNT] = [
        Self::Cr0,
        Self::Cr4,
        Self::Efer,
        Self::Cr3,
        Self::Pdptes,
        Self::Rip,
        Self::Rsp,
        Self::Rflags,
        Self::Cs,
        Self::Ss,
        Self::Ds,
        Self::Es,
        Self::Fs,
        Self::Gs,
        Self::Ldtr,
        Self::Tr,
        Self::Gdtr,
        Self::Idtr,
        Self::Dr7,
        Self::Sysenter,
        Self::Pat,
        Self::SyscallMsrs,
        Self::Interruptibility,
    ];

    pub const fn flag(self) -> StateGroups {
        StateGroups::from_bits_retain(1 << self as u32)
    }

    /// Index into the real-mode saved attributes, for the six data/code segments.
    const fn v86_segment_index(self) -> Option<usize> {
        match self {
            Self::Cs => Some(0),
            Self::Ss => Some(1),
            Self::Ds => Some(2),
            Self::Es => Some(3),
            Self::Fs => Some(4),
            Self::Gs => Some(5),
            _ => None,
        }
    }
}

bitflags! {
    /// A set of [`StateGroup`]s.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StateGroups: u32 {
        const RIP = 1 << StateGroup::Rip as u32;
        const RSP = 1 << StateGroup::Rsp as u32;
        const RFLAGS = 1 << StateGroup::Rflags as u32;
        const CS = 1 << StateGroup::Cs as u32;
        const SS = 1 << StateGroup::Ss as u32;
        const DS = 1 << StateGroup::Ds as u32;
        const ES = 1 << StateGroup::Es as u32;
        const FS = 1 << StateGroup::Fs as u32;
        const GS = 1 << StateGroup::Gs as u32;
        const LDTR = 1 << StateGroup::Ldtr as u32;
        const TR = 1 << StateGroup::Tr as u32;
        const GDTR = 1 << StateGroup::Gdtr as u32;
        const IDTR = 1 << StateGroup::Idtr as u32;
        const CR0 = 1 << StateGroup::Cr0 as u32;
        const CR4 = 1 << StateGroup::Cr4 as u32;
        const EFER = 1 << StateGroup::Efer as u32;
        const CR3 = 1 << StateGroup::Cr3 as u32;
        const PDPTES = 1 << StateGroup::Pdptes as u32;
        const DR7 = 1 << StateGroup::Dr7 as u32;
        const SYSENTER = 1 << StateGroup::Sysenter as u32;
        const PAT = 1 << StateGroup::Pat as u32;
        const SYSCALL_MSRS = 1 << StateGroup::SyscallMsrs as u32;
        const INTERRUPTIBILITY = 1 << StateGroup::Interruptibility as u32;

        /// CS, SS, DS, ES, FS and GS.
        const V86_SEGMENTS = Self::CS.bits() | Self::SS.bits() | Self::DS.bits()
            | Self::ES.bits() | Self::FS.bits() | Self::GS.bits();
        const SEGMENTS = Self::V86_SEGMENTS.bits() | Self::LDTR.bits() | Self::TR.bits();
        const CONTROL_REGS = Self::CR0.bits() | Self::CR3.bits() | Self::CR4.bits();
    }
}

impl StateGroups {
    /// Iterates the groups in the set, in import order.
    pub fn groups(self) -> impl Iterator<Item = StateGroup> {
        StateGroup::ALL
            .into_iter()
            .filter(move |g| self.contains(g.flag()))
    }
}

/// Where the authoritative value of a state group currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateLocation {
    /// Only the VMCS is up to date; the software copy must be imported
    /// before it is read.
    Hardware,
    /// Software changed the group; it must be exported before VM entry.
    Software,
    /// Both copies agree.
    Synced,
}

#[derive(Debug, Clone)]
struct StateTracker {
    locations: [StateLocation; StateGroup::COUNT],
}

impl StateTracker {
    /// A fresh context is owned by software and exported on first entry.
    fn new() -> Self {
        Self {
            locations: [StateLocation::Software; StateGroup::COUNT],
        }
    }

    fn location(&self, group: StateGroup) -> StateLocation {
        self.locations[group as usize]
    }

    fn collect(&self, location: StateLocation) -> StateGroups {
        StateGroup::ALL
            .into_iter()
            .filter(|&g| self.location(g) == location)
            .fold(StateGroups::empty(), |acc, g| acc | g.flag())
    }

    fn imported(&mut self, group: StateGroup) {
        if self.location(group) == StateLocation::Hardware {
            self.locations[group as usize] = StateLocation::Synced;
        }
    }

    fn exported(&mut self, group: StateGroup) {
        if self.location(group) == StateLocation::Software {
            self.locations[group as usize] = StateLocation::Synced;
        }
    }

    fn mark_dirty(&mut self, groups: StateGroups) -> Result {
        if groups.groups().any(|g| self.location(g) == StateLocation::Hardware) {
            return Err(VmxError::BadState("guest state modified before import"));
        }
        for group in groups.groups() {
            self.locations[group as usize] = StateLocation::Software;
        }
        Ok(())
    }

    fn guest_ran(&mut self) {
        for location in self.locations.iter_mut() {
            debug_assert_ne!(*location, StateLocation::Software);
            *location = StateLocation::Hardware;
        }
    }
}

/// An interrupt shadow (blocking by STI or by MOV SS) covering the
/// instruction at `rip`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptShadow {
    pub rip: u64,
    pub mov_ss: bool,
}

/// The guest CPU context as software sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestCpuContext {
    /// General-purpose registers, swapped by the entry path.
    pub regs: GeneralRegisters,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,

    pub cs: Segment,
    pub ss: Segment,
    pub ds: Segment,
    pub es: Segment,
    pub fs: Segment,
    pub gs: Segment,
    pub ldtr: Segment,
    pub tr: Segment,
    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,

    /// CR0 as the guest sees it.
    pub cr0: u64,
    /// Software owned, swapped by the entry path.
    pub cr2: u64,
    pub cr3: u64,
    /// CR4 as the guest sees it.
    pub cr4: u64,
    pub dr7: u64,

    pub sysenter_cs: u32,
    pub sysenter_esp: u64,
    pub sysenter_eip: u64,
    pub efer: u64,
    pub pat: u64,
    pub star: u64,
    pub lstar: u64,
    pub cstar: u64,
    pub sfmask: u64,
    pub kernel_gs_base: u64,

    pub interrupt_shadow: Option<InterruptShadow>,
    pub nmi_blocked: bool,
    pub pdptes: [u64; 4],
}

impl GuestCpuContext {
    /// Power-on value of IA32_PAT.
    pub const RESET_PAT: u64 = 0x0007_0406_0007_0406;

    /// The state of a processor after reset, starting at `rip` in real mode.
    pub fn new_reset(rip: u64) -> Self {
        Self {
            regs: GeneralRegisters::default(),
            rip,
            rsp: 0,
            rflags: 0x2,
            cs: Segment::real_mode_code(),
            ss: Segment::real_mode_data(),
            ds: Segment::real_mode_data(),
            es: Segment::real_mode_data(),
            fs: Segment::real_mode_data(),
            gs: Segment::real_mode_data(),
            ldtr: Segment {
                access_rights: SegmentAccessRights::LDT,
                ..Segment::real_mode_data()
            },
            tr: Segment {
                access_rights: SegmentAccessRights::TSS_BUSY,
                ..Segment::real_mode_data()
            },
            gdtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            idtr: DescriptorTable {
                base: 0,
                limit: 0xffff,
            },
            cr0: (Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE | Cr0Flags::EXTENSION_TYPE)
                .bits(),
            cr2: 0,
            cr3: 0,
            cr4: 0,
            dr7: 0x400,
            sysenter_cs: 0,
            sysenter_esp: 0,
            sysenter_eip: 0,
            efer: 0,
            pat: Self::RESET_PAT,
            star: 0,
            lstar: 0,
            cstar: 0,
            sfmask: 0,
            kernel_gs_base: 0,
            interrupt_shadow: None,
            nmi_blocked: false,
            pdptes: [0; 4],
        }
    }

    pub fn protected_mode(&self) -> bool {
        self.cr0 & Cr0Flags::PROTECTED_MODE_ENABLE.bits() != 0
    }

    pub fn paging_enabled(&self) -> bool {
        self.cr0 & Cr0Flags::PAGING.bits() != 0
    }

    /// PAE paging without long mode: the PDPTEs are loaded from CR3.
    pub fn pae_paging(&self) -> bool {
        self.paging_enabled()
            && self.cr4 & Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits() != 0
            && self.efer & EferFlags::LONG_MODE_ACTIVE.bits() == 0
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.rflags & RFlags::INTERRUPT_FLAG.bits() != 0
    }

    /// The interruptibility state derived from the interrupt shadow and
    /// NMI blocking. A shadow recorded for another RIP has expired.
    pub fn interruptibility(&self) -> Interruptibility {
        let mut bits = Interruptibility::empty();
        if let Some(shadow) = self.interrupt_shadow.filter(|s| s.rip == self.rip) {
            // Blocking by STI requires RFLAGS.IF = 1. (SDM Vol. 3C, Section 27.3.1.5)
            if shadow.mov_ss || !self.interrupts_enabled() {
                bits |= Interruptibility::BLOCKING_BY_MOV_SS;
            } else {
                bits |= Interruptibility::BLOCKING_BY_STI;
            }
        }
        if self.nmi_blocked {
            bits |= Interruptibility::BLOCKING_BY_NMI;
        }
        bits
    }

    fn segment(&self, group: StateGroup) -> &Segment {
        match group {
            StateGroup::Cs => &self.cs,
            StateGroup::Ss => &self.ss,
            StateGroup::Ds => &self.ds,
            StateGroup::Es => &self.es,
            StateGroup::Fs => &self.fs,
            StateGroup::Gs => &self.gs,
            StateGroup::Ldtr => &self.ldtr,
            StateGroup::Tr => &self.tr,
            _ => unreachable!("{:?} is not a segment", group),
        }
    }

    fn segment_mut(&mut self, group: StateGroup) -> &mut Segment {
        match group {
            StateGroup::Cs => &mut self.cs,
            StateGroup::Ss => &mut self.ss,
            StateGroup::Ds => &mut self.ds,
            StateGroup::Es => &mut self.es,
            StateGroup::Fs => &mut self.fs,
            StateGroup::Gs => &mut self.gs,
            StateGroup::Ldtr => &mut self.ldtr,
            StateGroup::Tr => &mut self.tr,
            _ => unreachable!("{:?} is not a segment", group),
        }
    }
}

struct SegmentFields {
    selector: VmcsGuest16,
    base: VmcsGuestNW,
    limit: VmcsGuest32,
    access_rights: VmcsGuest32,
}

macro_rules! segment_fields {
    ($seg: ident) => {
        paste::paste! {
            SegmentFields {
                selector: VmcsGuest16::[<$seg _SELECTOR>],
                base: VmcsGuestNW::[<$seg _BASE>],
                limit: VmcsGuest32::[<$seg _LIMIT>],
                access_rights: VmcsGuest32::[<$seg _ACCESS_RIGHTS>],
            }
        }
    };
}

impl SegmentFields {
    fn of(group: StateGroup) -> Self {
        match group {
            StateGroup::Cs => segment_fields!(CS),
            StateGroup::Ss => segment_fields!(SS),
            StateGroup::Ds => segment_fields!(DS),
            StateGroup::Es => segment_fields!(ES),
            StateGroup::Fs => segment_fields!(FS),
            StateGroup::Gs => segment_fields!(GS),
            StateGroup::Ldtr => segment_fields!(LDTR),
            StateGroup::Tr => segment_fields!(TR),
            _ => unreachable!("{:?} is not a segment", group),
        }
    }
}

bitflags! {
    /// Work handed to the paging collaborator after a guest state import.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PagingSyncFlags: u8 {
        /// The guest changed CR3.
        const CR3 = 1 << 0;
        /// The PAE PDPTEs changed.
        const PAE_PDPES = 1 << 1;
    }
}

/// One VM exit as recorded for the profiling collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitHistoryEntry {
    /// Raw exit reason.
    pub reason: u32,
    /// Guest RIP, known once RIP was imported for this exit.
    pub rip: Option<u64>,
}

/// A ring of the most recent VM exits.
#[derive(Debug, Clone)]
pub struct ExitHistory {
    entries: [Option<ExitHistoryEntry>; Self::LEN],
    next: usize,
}

impl ExitHistory {
    pub const LEN: usize = 16;

    pub const fn new() -> Self {
        Self {
            entries: [None; Self::LEN],
            next: 0,
        }
    }

    pub fn record_exit(&mut self, reason: u32) {
        self.entries[self.next] = Some(ExitHistoryEntry { reason, rip: None });
        self.next = (self.next + 1) % Self::LEN;
    }

    fn record_rip(&mut self, rip: u64) {
        let last = (self.next + Self::LEN - 1) % Self::LEN;
        if let Some(entry) = self.entries[last].as_mut() {
            entry.rip.get_or_insert(rip);
        }
    }

    pub fn latest(&self) -> Option<&ExitHistoryEntry> {
        self.entries[(self.next + Self::LEN - 1) % Self::LEN].as_ref()
    }

    /// Entries from the oldest to the newest.
    pub fn iter(&self) -> impl Iterator<Item = &ExitHistoryEntry> {
        (0..Self::LEN).filter_map(move |i| self.entries[(self.next + i) % Self::LEN].as_ref())
    }
}

impl Default for ExitHistory {
    fn default() -> Self {
        Self::new()
    }
}

/// How the guest's mode is mapped onto hardware without unrestricted guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct HardwareMode {
    /// Real mode executed in virtual-8086 mode.
    real_on_v86: bool,
    /// Paging disabled by the guest, translated through the identity table.
    unpaged: bool,
}

impl HardwareMode {
    fn of(cr0: u64, config: &VmxConfig) -> Self {
        if config.unrestricted_guest {
            return Self::default();
        }
        Self {
            real_on_v86: cr0 & Cr0Flags::PROTECTED_MODE_ENABLE.bits() == 0,
            unpaged: config.nested_paging && cr0 & Cr0Flags::PAGING.bits() == 0,
        }
    }
}

/// Guest values hidden by the real-on-V86 conversion.
#[derive(Debug, Clone, Copy)]
struct RealModeState {
    rflags: u64,
    attrs: [SegmentAccessRights; 6],
}

/// RFLAGS bits forced while running real mode in virtual-8086 mode.
const V86_RFLAGS: u64 = RFlags::VIRTUAL_8086_MODE.bits() | RFlags::IOPL_HIGH.bits() | RFlags::IOPL_LOW.bits();

/// TSS + interrupt redirection bitmap + I/O bitmap + terminating byte.
const REAL_MODE_TSS_LIMIT: u32 = 0x68 + 32 + 0x2000;

pub(crate) const SYSCALL_MSRS: [Msr; 5] = [
    Msr::IA32_STAR,
    Msr::IA32_LSTAR,
    Msr::IA32_CSTAR,
    Msr::IA32_FMASK,
    Msr::IA32_KERNEL_GSBASE,
];

/// The guest-state sync engine of one vCPU.
pub struct GuestState {
    config: Arc<VmxConfig>,
    ctx: GuestCpuContext,
    tracker: StateTracker,
    mode: HardwareMode,
    real_mode: RealModeState,
    paging_sync: PagingSyncFlags,
    history: ExitHistory,
}

impl GuestState {
    pub fn new(config: Arc<VmxConfig>, ctx: GuestCpuContext) -> Self {
        Self {
            config,
            ctx,
            tracker: StateTracker::new(),
            mode: HardwareMode::default(),
            real_mode: RealModeState {
                rflags: 0,
                attrs: [SegmentAccessRights::empty(); 6],
            },
            paging_sync: PagingSyncFlags::empty(),
            history: ExitHistory::new(),
        }
    }

    /// Replaces the whole context; every group becomes dirty.
    pub fn reset(&mut self, ctx: GuestCpuContext) {
        self.ctx = ctx;
        self.tracker = StateTracker::new();
    }

    pub fn location(&self, group: StateGroup) -> StateLocation {
        self.tracker.location(group)
    }

    /// Groups whose software copy is stale.
    pub fn not_authoritative(&self) -> StateGroups {
        self.tracker.collect(StateLocation::Hardware)
    }

    /// Groups that must be exported before the next entry.
    pub fn dirty(&self) -> StateGroups {
        self.tracker.collect(StateLocation::Software)
    }

    /// The context without importing anything. Only groups outside
    /// [`GuestState::not_authoritative`] are meaningful.
    pub fn context(&self) -> &GuestCpuContext {
        &self.ctx
    }

    pub fn regs(&self) -> &GeneralRegisters {
        &self.ctx.regs
    }

    pub fn regs_mut(&mut self) -> &mut GeneralRegisters {
        &mut self.ctx.regs
    }

    pub fn cr2(&self) -> u64 {
        self.ctx.cr2
    }

    pub fn set_cr2(&mut self, cr2: u64) {
        self.ctx.cr2 = cr2;
    }

    pub fn is_real_on_v86(&self) -> bool {
        self.mode.real_on_v86
    }

    pub fn history(&self) -> &ExitHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut ExitHistory {
        &mut self.history
    }

    /// Takes the CR3/PDPTE resync requests for the paging collaborator.
    pub fn take_paging_sync(&mut self) -> PagingSyncFlags {
        core::mem::take(&mut self.paging_sync)
    }

    /// Imports `groups` and returns the context.
    pub fn read<H: VmxHal>(
        &mut self,
        groups: StateGroups,
        vmcs: &VmcsContext<H>,
    ) -> Result<&GuestCpuContext> {
        self.import(groups, vmcs)?;
        Ok(&self.ctx)
    }

    /// Imports `groups`, lets `f` change them and marks them dirty.
    pub fn modify<H: VmxHal, R>(
        &mut self,
        groups: StateGroups,
        vmcs: &VmcsContext<H>,
        f: impl FnOnce(&mut GuestCpuContext) -> R,
    ) -> Result<R> {
        self.import(groups, vmcs)?;
        let ret = f(&mut self.ctx);
        self.tracker.mark_dirty(groups)?;
        Ok(ret)
    }

    /// Every group is in the VMCS now; the guest may change any of them.
    pub fn mark_guest_ran(&mut self) {
        self.tracker.guest_ran();
    }

    /// Pulls the stale groups among `groups` from the VMCS.
    pub fn import<H: VmxHal>(&mut self, groups: StateGroups, vmcs: &VmcsContext<H>) -> Result {
        let mut wanted = groups;
        if wanted.contains(StateGroups::INTERRUPTIBILITY) {
            // the shadow is tied to the RIP it was recorded at
            wanted |= StateGroups::RIP | StateGroups::RFLAGS;
        }
        if wanted.intersects(StateGroups::CR3 | StateGroups::PDPTES) {
            wanted |= StateGroups::CR0 | StateGroups::CR4 | StateGroups::EFER;
        }
        let stale = wanted & self.not_authoritative();
        for group in stale.groups() {
            self.import_group(group, vmcs)?;
            self.tracker.imported(group);
        }
        Ok(())
    }

    fn import_group<H: VmxHal>(&mut self, group: StateGroup, vmcs: &VmcsContext<H>) -> Result {
        let ctx = &mut self.ctx;
        match group {
            StateGroup::Rip => {
                ctx.rip = VmcsGuestNW::RIP.read::<H>()? as u64;
                self.history.record_rip(ctx.rip);
            }
            StateGroup::Rsp => ctx.rsp = VmcsGuestNW::RSP.read::<H>()? as u64,
            StateGroup::Rflags => {
                let rflags = VmcsGuestNW::RFLAGS.read::<H>()? as u64;
                ctx.rflags = if self.mode.real_on_v86 {
                    (rflags & !V86_RFLAGS) | (self.real_mode.rflags & V86_RFLAGS)
                } else {
                    rflags
                };
            }
            StateGroup::Cs
            | StateGroup::Ss
            | StateGroup::Ds
            | StateGroup::Es
            | StateGroup::Fs
            | StateGroup::Gs
            | StateGroup::Ldtr => self.import_segment::<H>(group)?,
            StateGroup::Tr => {
                // hardware runs on the real-mode TSS, the guest's TR is untouched
                if !self.mode.real_on_v86 {
                    self.import_segment::<H>(group)?;
                }
            }
            StateGroup::Gdtr => {
                ctx.gdtr = DescriptorTable {
                    base: VmcsGuestNW::GDTR_BASE.read::<H>()? as u64,
                    limit: VmcsGuest32::GDTR_LIMIT.read::<H>()?,
                };
            }
            StateGroup::Idtr => {
                ctx.idtr = DescriptorTable {
                    base: VmcsGuestNW::IDTR_BASE.read::<H>()? as u64,
                    limit: VmcsGuest32::IDTR_LIMIT.read::<H>()?,
                };
            }
            StateGroup::Cr0 => {
                // must use the mask and shadow of the last export
                let controls = vmcs.controls();
                let mask = controls.cr0_guest_host_mask;
                let hw = VmcsGuestNW::CR0.read::<H>()? as u64;
                ctx.cr0 = (controls.cr0_read_shadow & mask) | (hw & !mask);
            }
            StateGroup::Cr4 => {
                let controls = vmcs.controls();
                let mask = controls.cr4_guest_host_mask;
                let hw = VmcsGuestNW::CR4.read::<H>()? as u64;
                ctx.cr4 = (controls.cr4_read_shadow & mask) | (hw & !mask);
            }
            StateGroup::Efer => ctx.efer = VmcsGuest64::IA32_EFER.read::<H>()?,
            StateGroup::Cr3 => {
                // without nested paging, or while the guest runs unpaged,
                // the hardware CR3 is not the guest's
                if self.config.nested_paging && !self.mode.unpaged && ctx.paging_enabled() {
                    let cr3 = VmcsGuestNW::CR3.read::<H>()? as u64;
                    if cr3 != ctx.cr3 {
                        ctx.cr3 = cr3;
                        self.paging_sync |= PagingSyncFlags::CR3;
                    }
                    if ctx.pae_paging() {
                        self.import_pdptes::<H>()?;
                    }
                }
            }
            StateGroup::Pdptes => {
                if self.config.nested_paging && ctx.pae_paging() {
                    self.import_pdptes::<H>()?;
                }
            }
            StateGroup::Dr7 => ctx.dr7 = VmcsGuestNW::DR7.read::<H>()? as u64,
            StateGroup::Sysenter => {
                ctx.sysenter_cs = VmcsGuest32::IA32_SYSENTER_CS.read::<H>()?;
                ctx.sysenter_esp = VmcsGuestNW::IA32_SYSENTER_ESP.read::<H>()? as u64;
                ctx.sysenter_eip = VmcsGuestNW::IA32_SYSENTER_EIP.read::<H>()? as u64;
            }
            StateGroup::Pat => ctx.pat = VmcsGuest64::IA32_PAT.read::<H>()?,
            StateGroup::SyscallMsrs => {
                // stored into the auto-store area on every exit
                let mut values = [
                    &mut ctx.star,
                    &mut ctx.lstar,
                    &mut ctx.cstar,
                    &mut ctx.sfmask,
                    &mut ctx.kernel_gs_base,
                ];
                for (msr, value) in SYSCALL_MSRS.iter().zip(values.iter_mut()) {
                    if let Some(stored) = vmcs.guest_msr(*msr as u32) {
                        **value = stored;
                    }
                }
            }
            StateGroup::Interruptibility => {
                let bits = Interruptibility::from_bits_truncate(
                    VmcsGuest32::INTERRUPTIBILITY_STATE.read::<H>()?,
                );
                ctx.interrupt_shadow = if bits.intersects(
                    Interruptibility::BLOCKING_BY_STI | Interruptibility::BLOCKING_BY_MOV_SS,
                ) {
                    Some(InterruptShadow {
                        rip: ctx.rip,
                        mov_ss: bits.contains(Interruptibility::BLOCKING_BY_MOV_SS),
                    })
                } else {
                    None
                };
                ctx.nmi_blocked = bits.contains(Interruptibility::BLOCKING_BY_NMI);
            }
        }
        Ok(())
    }

    fn import_segment<H: VmxHal>(&mut self, group: StateGroup) -> Result {
        let fields = SegmentFields::of(group);
        let selector = SegmentSelector::from_raw(fields.selector.read::<H>()?);
        let base = fields.base.read::<H>()? as u64;
        let limit = fields.limit.read::<H>()?;
        let raw_rights = fields.access_rights.read::<H>()?;
        let access_rights = match group.v86_segment_index() {
            Some(i) if self.mode.real_on_v86 => self.real_mode.attrs[i],
            _ => SegmentAccessRights::normalize_imported(raw_rights),
        };
        *self.ctx.segment_mut(group) = Segment {
            selector,
            base,
            limit,
            access_rights,
        };
        Ok(())
    }

    fn import_pdptes<H: VmxHal>(&mut self) -> Result {
        let mut pdptes = [0; 4];
        for (pdpte, field) in pdptes.iter_mut().zip(VmcsGuest64::PDPTES) {
            *pdpte = field.read::<H>()?;
        }
        if pdptes != self.ctx.pdptes {
            self.ctx.pdptes = pdptes;
            self.paging_sync |= PagingSyncFlags::PAE_PDPES;
        }
        Ok(())
    }

    /// Pushes the dirty groups among `groups` into the VMCS.
    ///
    /// A failed write aborts the export; the group that failed and the ones
    /// after it stay dirty.
    pub fn export<H: VmxHal>(&mut self, groups: StateGroups, vmcs: &mut VmcsContext<H>) -> Result {
        if (groups & self.dirty()).contains(StateGroups::INTERRUPTIBILITY) {
            self.import(StateGroups::RIP | StateGroups::RFLAGS, vmcs)?;
        }
        for group in StateGroup::EXPORT_ORDER {
            // a CR0 export may have dirtied further groups, check each time
            if groups.contains(group.flag()) && self.location(group) == StateLocation::Software {
                self.export_group(group, vmcs)?;
                self.tracker.exported(group);
            }
        }
        Ok(())
    }

    fn export_group<H: VmxHal>(&mut self, group: StateGroup, vmcs: &mut VmcsContext<H>) -> Result {
        match group {
            StateGroup::Rip => VmcsGuestNW::RIP.write::<H>(self.ctx.rip as usize)?,
            StateGroup::Rsp => VmcsGuestNW::RSP.write::<H>(self.ctx.rsp as usize)?,
            StateGroup::Rflags => {
                let mut rflags = self.ctx.rflags;
                if self.mode.real_on_v86 {
                    self.real_mode.rflags = rflags;
                    rflags = (rflags & !V86_RFLAGS) | RFlags::VIRTUAL_8086_MODE.bits();
                }
                VmcsGuestNW::RFLAGS.write::<H>(rflags as usize)?;
            }
            StateGroup::Cs
            | StateGroup::Ss
            | StateGroup::Ds
            | StateGroup::Es
            | StateGroup::Fs
            | StateGroup::Gs
            | StateGroup::Ldtr
            | StateGroup::Tr => self.export_segment::<H>(group)?,
            StateGroup::Gdtr => {
                VmcsGuestNW::GDTR_BASE.write::<H>(self.ctx.gdtr.base as usize)?;
                VmcsGuest32::GDTR_LIMIT.write::<H>(self.ctx.gdtr.limit)?;
            }
            StateGroup::Idtr => {
                VmcsGuestNW::IDTR_BASE.write::<H>(self.ctx.idtr.base as usize)?;
                VmcsGuest32::IDTR_LIMIT.write::<H>(self.ctx.idtr.limit)?;
            }
            StateGroup::Cr0 => self.export_cr0(vmcs)?,
            StateGroup::Cr4 => {
                let config = &self.config;
                let must0 = config.cr4_must0();
                let must1 = config.cr4_must1();
                let mut hw = (self.ctx.cr4 & must0) | must1;
                let mut mask = must1 | !must0;
                if self.mode.real_on_v86 {
                    hw |= Cr4Flags::VIRTUAL_8086_MODE_EXTENSIONS.bits();
                    mask |= Cr4Flags::VIRTUAL_8086_MODE_EXTENSIONS.bits();
                }
                if self.mode.unpaged {
                    // the identity table maps 4M pages
                    hw |= Cr4Flags::PAGE_SIZE_EXTENSION.bits();
                    hw &= !Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
                    mask |= (Cr4Flags::PAGE_SIZE_EXTENSION
                        | Cr4Flags::PHYSICAL_ADDRESS_EXTENSION)
                        .bits();
                }
                vmcs.set_cr4_mask_and_shadow(mask, self.ctx.cr4)?;
                VmcsGuestNW::CR4.write::<H>(hw as usize)?;
            }
            StateGroup::Efer => {
                VmcsGuest64::IA32_EFER.write::<H>(self.ctx.efer)?;
                let long_mode = self.ctx.efer & EferFlags::LONG_MODE_ACTIVE.bits() != 0;
                let mut entry = EntryControls::from_bits_truncate(vmcs.controls().entry);
                entry.set(EntryControls::IA32E_MODE_GUEST, long_mode);
                vmcs.set_entry_controls(entry.bits())?;
            }
            StateGroup::Cr3 => {
                let cr3 = if self.mode.unpaged {
                    self.config.identity_page_table
                } else {
                    self.ctx.cr3
                };
                VmcsGuestNW::CR3.write::<H>(cr3 as usize)?;
            }
            StateGroup::Pdptes => {
                if self.config.nested_paging && self.ctx.pae_paging() {
                    for (pdpte, field) in self.ctx.pdptes.iter().zip(VmcsGuest64::PDPTES) {
                        field.write::<H>(*pdpte)?;
                    }
                }
            }
            StateGroup::Dr7 => VmcsGuestNW::DR7.write::<H>(self.ctx.dr7 as usize)?,
            StateGroup::Sysenter => {
                VmcsGuest32::IA32_SYSENTER_CS.write::<H>(self.ctx.sysenter_cs)?;
                VmcsGuestNW::IA32_SYSENTER_ESP.write::<H>(self.ctx.sysenter_esp as usize)?;
                VmcsGuestNW::IA32_SYSENTER_EIP.write::<H>(self.ctx.sysenter_eip as usize)?;
            }
            StateGroup::Pat => VmcsGuest64::IA32_PAT.write::<H>(self.ctx.pat)?,
            StateGroup::SyscallMsrs => {
                let values = [
                    self.ctx.star,
                    self.ctx.lstar,
                    self.ctx.cstar,
                    self.ctx.sfmask,
                    self.ctx.kernel_gs_base,
                ];
                for (msr, value) in SYSCALL_MSRS.iter().zip(values) {
                    vmcs.set_guest_msr(*msr as u32, value)?;
                }
            }
            StateGroup::Interruptibility => {
                let bits = self.ctx.interruptibility();
                if !bits.intersects(
                    Interruptibility::BLOCKING_BY_STI | Interruptibility::BLOCKING_BY_MOV_SS,
                ) {
                    self.ctx.interrupt_shadow = None;
                }
                VmcsGuest32::INTERRUPTIBILITY_STATE.write::<H>(bits.bits())?;
            }
        }
        Ok(())
    }

    fn export_cr0<H: VmxHal>(&mut self, vmcs: &mut VmcsContext<H>) -> Result {
        let mode = HardwareMode::of(self.ctx.cr0, &self.config);
        if mode != self.mode {
            // groups written differently in the new mode are pulled out
            // under the old mode, then pushed again
            let mut affected = StateGroups::CR3 | StateGroups::CR4;
            if mode.real_on_v86 != self.mode.real_on_v86 {
                affected |= StateGroups::V86_SEGMENTS | StateGroups::TR | StateGroups::RFLAGS;
            }
            self.import(affected, vmcs)?;
            debug!(
                "guest hardware mode {:?} -> {:?}, CR0 {:#x}",
                self.mode, mode, self.ctx.cr0
            );
            self.mode = mode;
            self.tracker.mark_dirty(affected)?;
        }

        let must0 = self.config.cr0_must0();
        let must1 = self.config.cr0_must1();
        let hw = (self.ctx.cr0 & must0) | must1;
        let mask = must1 | !must0;
        vmcs.set_cr0_mask_and_shadow(mask, self.ctx.cr0)?;
        VmcsGuestNW::CR0.write::<H>(hw as usize)
    }

    fn export_segment<H: VmxHal>(&mut self, group: StateGroup) -> Result {
        let fields = SegmentFields::of(group);
        let seg = *self.ctx.segment(group);
        let seg = match group.v86_segment_index() {
            Some(i) if self.mode.real_on_v86 => {
                self.real_mode.attrs[i] = seg.access_rights;
                Segment::real_mode(seg.selector.bits(), SegmentAccessRights::V86)
            }
            None if group == StateGroup::Tr && self.mode.real_on_v86 => Segment {
                selector: SegmentSelector::from_raw(0),
                base: self.config.real_mode_tss_base,
                limit: REAL_MODE_TSS_LIMIT,
                access_rights: SegmentAccessRights::TSS_BUSY,
            },
            _ if seg.access_rights.is_empty() => Segment {
                access_rights: SegmentAccessRights::UNUSABLE,
                ..seg
            },
            _ => seg,
        };
        fields.selector.write::<H>(seg.selector.bits())?;
        fields.base.write::<H>(seg.base as usize)?;
        fields.limit.write::<H>(seg.limit)?;
        fields.access_rights.write::<H>(seg.access_rights.bits())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_flags_match_enum() {
        for group in StateGroup::ALL {
            assert_eq!(group.flag().bits(), 1 << group as u32);
        }
        assert_eq!(StateGroups::all().groups().count(), StateGroup::COUNT);
        assert_eq!(StateGroups::SEGMENTS.groups().count(), 8);
    }

    #[test]
    fn tracker_lifecycle() {
        let mut tracker = StateTracker::new();
        assert_eq!(tracker.collect(StateLocation::Software), StateGroups::all());

        for group in StateGroup::ALL {
            tracker.exported(group);
        }
        tracker.guest_ran();
        assert_eq!(tracker.collect(StateLocation::Hardware), StateGroups::all());

        assert!(tracker.mark_dirty(StateGroups::RIP).is_err());
        tracker.imported(StateGroup::Rip);
        assert_eq!(tracker.location(StateGroup::Rip), StateLocation::Synced);
        tracker.mark_dirty(StateGroups::RIP).unwrap();
        assert_eq!(tracker.location(StateGroup::Rip), StateLocation::Software);
        // importing a dirty group keeps the software value
        tracker.imported(StateGroup::Rip);
        assert_eq!(tracker.location(StateGroup::Rip), StateLocation::Software);
    }

    #[test]
    fn interrupt_shadow_expires_with_rip() {
        let mut ctx = GuestCpuContext::new_reset(0x100);
        ctx.rflags |= RFlags::INTERRUPT_FLAG.bits();
        ctx.interrupt_shadow = Some(InterruptShadow {
            rip: 0x100,
            mov_ss: false,
        });
        assert_eq!(ctx.interruptibility(), Interruptibility::BLOCKING_BY_STI);

        ctx.rflags &= !RFlags::INTERRUPT_FLAG.bits();
        assert_eq!(ctx.interruptibility(), Interruptibility::BLOCKING_BY_MOV_SS);

        ctx.rip = 0x101;
        ctx.nmi_blocked = true;
        assert_eq!(ctx.interruptibility(), Interruptibility::BLOCKING_BY_NMI);
    }

    #[test]
    fn exit_history_ring() {
        let mut history = ExitHistory::new();
        for reason in 0..20 {
            history.record_exit(reason);
            history.record_rip(0x1000 + reason as u64);
        }
        history.record_rip(0xdead);
        assert_eq!(history.iter().count(), ExitHistory::LEN);
        assert_eq!(history.iter().next().unwrap().reason, 4);
        assert_eq!(
            history.latest(),
            Some(&ExitHistoryEntry {
                reason: 19,
                rip: Some(0x1013)
            })
        );
    }
}
