//! Guest-state synchronization against the simulated VMCS.

use alloc::sync::Arc;

use x86_64::registers::control::{Cr0Flags, Cr4Flags};
use x86_64::registers::rflags::RFlags;

use crate::msr::Msr;
use crate::segmentation::{Segment, SegmentAccessRights};
use crate::test_utils::mock::{MockHal, MockOp, test_config};
use crate::vmx::vmcs::{VmcsControl32, VmcsGuest32, VmcsGuest64, VmcsGuestNW};
use crate::vmx::{
    GuestCpuContext, GuestState, PagingSyncFlags, StateGroup, StateGroups, StateLocation,
    TlbFlushMode, VmcsContext, VmcsControlCache, VmxConfig,
};

fn loaded_vmcs(config: &VmxConfig) -> VmcsContext<MockHal> {
    let mut vmcs = VmcsContext::new(config.vmcs_revision_id).unwrap();
    vmcs.load(0).unwrap();
    vmcs.init_controls(VmcsControlCache::default()).unwrap();
    vmcs
}

fn engine(mode: TlbFlushMode) -> (GuestState, VmcsContext<MockHal>) {
    MockHal::reset();
    let config = test_config(mode);
    let vmcs = loaded_vmcs(&config);
    let state = GuestState::new(Arc::new(config), GuestCpuContext::new_reset(0x1000));
    (state, vmcs)
}

/// Exports everything and lets the "guest" run.
fn enter(state: &mut GuestState, vmcs: &mut VmcsContext<MockHal>) {
    state.export(StateGroups::all(), vmcs).unwrap();
    state.mark_guest_ran();
    MockHal::clear_log();
}

#[test]
fn everything_starts_dirty() {
    let (state, _vmcs) = engine(TlbFlushMode::EptAndVpid);
    assert_eq!(state.dirty(), StateGroups::all());
    assert!(state.not_authoritative().is_empty());
}

#[test]
fn import_reads_each_field_once() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    enter(&mut state, &mut vmcs);
    assert_eq!(state.not_authoritative(), StateGroups::all());
    state.history_mut().record_exit(30);

    MockHal::set_field(VmcsGuestNW::RIP as u32, 0x2000);
    assert_eq!(state.read(StateGroups::RIP, &vmcs).unwrap().rip, 0x2000);
    assert_eq!(state.location(StateGroup::Rip), StateLocation::Synced);
    assert_eq!(MockHal::reads(), [VmcsGuestNW::RIP as u32]);

    // already synced: no further VMREADs
    state.import(StateGroups::RIP, &vmcs).unwrap();
    assert_eq!(MockHal::reads().len(), 1);
    assert_eq!(state.history().latest().and_then(|e| e.rip), Some(0x2000));
}

#[test]
fn interruptibility_import_pulls_rip_and_rflags() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    enter(&mut state, &mut vmcs);

    MockHal::set_field(VmcsGuestNW::RIP as u32, 0x3000);
    MockHal::set_field(VmcsGuestNW::RFLAGS as u32, 0x202);
    MockHal::set_field(VmcsGuest32::INTERRUPTIBILITY_STATE as u32, 1);
    let ctx = state.read(StateGroups::INTERRUPTIBILITY, &vmcs).unwrap();
    let shadow = ctx.interrupt_shadow.unwrap();
    assert_eq!(shadow.rip, 0x3000);
    assert!(!shadow.mov_ss);
    assert_eq!(state.location(StateGroup::Rip), StateLocation::Synced);
    assert_eq!(state.location(StateGroup::Rflags), StateLocation::Synced);
}

#[test]
fn export_only_writes_dirty_groups() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    enter(&mut state, &mut vmcs);
    state.import(StateGroups::all(), &vmcs).unwrap();
    MockHal::clear_log();

    state.export(StateGroups::all(), &mut vmcs).unwrap();
    assert!(MockHal::writes().is_empty());

    state
        .modify(StateGroups::RSP, &vmcs, |ctx| ctx.rsp = 0x8000)
        .unwrap();
    assert_eq!(state.dirty(), StateGroups::RSP);
    state.export(StateGroups::all(), &mut vmcs).unwrap();
    assert_eq!(MockHal::writes(), [(VmcsGuestNW::RSP as u32, 0x8000)]);
    assert!(state.dirty().is_empty());
}

#[test]
fn failed_write_keeps_group_dirty() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    MockHal::fail_writes_to(VmcsGuestNW::DR7 as u32);
    assert!(state.export(StateGroups::all(), &mut vmcs).is_err());
    assert_eq!(state.location(StateGroup::Dr7), StateLocation::Software);
    // groups exported before the failure are done
    assert_eq!(state.location(StateGroup::Cr0), StateLocation::Synced);
}

#[test]
fn cr0_is_rebuilt_from_read_shadow() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    enter(&mut state, &mut vmcs);

    // CD/NW are kept off in hardware but stay visible to the guest
    let hw_cr0 = MockHal::field(VmcsGuestNW::CR0 as u32).unwrap();
    assert_eq!(hw_cr0 & Cr0Flags::CACHE_DISABLE.bits(), 0);
    assert_eq!(
        vmcs.controls().cr0_read_shadow,
        GuestCpuContext::new_reset(0).cr0
    );

    // the guest turns on protected mode
    MockHal::set_field(VmcsGuestNW::CR0 as u32, hw_cr0 | 1);
    let cr0 = state.read(StateGroups::CR0, &vmcs).unwrap().cr0;
    assert_eq!(
        cr0,
        (Cr0Flags::CACHE_DISABLE
            | Cr0Flags::NOT_WRITE_THROUGH
            | Cr0Flags::EXTENSION_TYPE
            | Cr0Flags::PROTECTED_MODE_ENABLE)
            .bits()
    );
}

#[test]
fn real_mode_runs_as_v86_without_unrestricted_guest() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::VpidOnly);
    state
        .modify(StateGroups::DS, &vmcs, |ctx| {
            ctx.ds = Segment::real_mode(0x1234, SegmentAccessRights::REAL_DATA)
        })
        .unwrap();
    enter(&mut state, &mut vmcs);
    assert!(state.is_real_on_v86());

    assert_eq!(MockHal::field(VmcsGuestNW::DS_BASE as u32), Some(0x12340));
    assert_eq!(MockHal::field(VmcsGuest32::DS_LIMIT as u32), Some(0xffff));
    assert_eq!(MockHal::field(VmcsGuest32::DS_ACCESS_RIGHTS as u32), Some(0xf3));
    assert_eq!(MockHal::field(VmcsGuest32::CS_ACCESS_RIGHTS as u32), Some(0xf3));
    let rflags = MockHal::field(VmcsGuestNW::RFLAGS as u32).unwrap();
    assert_ne!(rflags & RFlags::VIRTUAL_8086_MODE.bits(), 0);
    assert_eq!(rflags & RFlags::IOPL_HIGH.bits(), 0);
    let config = test_config(TlbFlushMode::VpidOnly);
    assert_eq!(
        MockHal::field(VmcsGuestNW::TR_BASE as u32),
        Some(config.real_mode_tss_base)
    );
    let cr4 = MockHal::field(VmcsGuestNW::CR4 as u32).unwrap();
    assert_ne!(cr4 & Cr4Flags::VIRTUAL_8086_MODE_EXTENSIONS.bits(), 0);

    // the guest sees its own values again
    let ctx = state.read(StateGroups::all(), &vmcs).unwrap();
    assert_eq!(ctx.ds.access_rights, SegmentAccessRights::REAL_DATA);
    assert_eq!(ctx.cs.access_rights, SegmentAccessRights::REAL_CODE);
    assert_eq!(ctx.rflags, 0x2);
    assert_eq!(ctx.tr.access_rights, SegmentAccessRights::TSS_BUSY);
    assert_eq!(ctx.cr4, 0);
}

#[test]
fn leaving_real_mode_rewrites_segments() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::VpidOnly);
    enter(&mut state, &mut vmcs);

    state
        .modify(StateGroups::CR0, &vmcs, |ctx| {
            ctx.cr0 |= Cr0Flags::PROTECTED_MODE_ENABLE.bits()
        })
        .unwrap();
    MockHal::clear_log();
    state.export(StateGroups::all(), &mut vmcs).unwrap();

    assert!(!state.is_real_on_v86());
    assert_eq!(
        MockHal::writes_to(VmcsGuest32::DS_ACCESS_RIGHTS as u32),
        [SegmentAccessRights::REAL_DATA.bits() as u64]
    );
    assert_eq!(MockHal::writes_to(VmcsGuestNW::RFLAGS as u32), [0x2]);
    assert_eq!(MockHal::writes_to(VmcsGuestNW::TR_BASE as u32), [0]);
    assert!(state.dirty().is_empty());
}

#[test]
fn paged_cr3_change_requests_resync() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    state
        .modify(StateGroups::all(), &vmcs, |ctx| {
            ctx.cr0 |= (Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING).bits();
            ctx.cr4 |= Cr4Flags::PHYSICAL_ADDRESS_EXTENSION.bits();
            ctx.cr3 = 0x4000;
        })
        .unwrap();
    enter(&mut state, &mut vmcs);
    assert!(state.take_paging_sync().is_empty());

    MockHal::set_field(VmcsGuestNW::CR3 as u32, 0x5000);
    MockHal::set_field(VmcsGuest64::PDPTE0 as u32, 0x6001);
    state.import(StateGroups::CR3, &vmcs).unwrap();
    assert_eq!(state.context().cr3, 0x5000);
    assert_eq!(state.context().pdptes[0], 0x6001);
    assert_eq!(
        state.take_paging_sync(),
        PagingSyncFlags::CR3 | PagingSyncFlags::PAE_PDPES
    );
    assert!(state.take_paging_sync().is_empty());
}

#[test]
fn long_mode_sets_entry_control() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    state
        .modify(StateGroups::EFER, &vmcs, |ctx| ctx.efer = 0xd00)
        .unwrap();
    state.export(StateGroups::all(), &mut vmcs).unwrap();
    assert_ne!(vmcs.controls().entry & (1 << 9), 0);
    assert_eq!(
        MockHal::field(VmcsControl32::VMENTRY_CONTROLS as u32),
        Some(vmcs.controls().entry as u64)
    );
}

#[test]
fn syscall_msrs_use_auto_load_area() {
    let (mut state, mut vmcs) = engine(TlbFlushMode::EptAndVpid);
    state
        .modify(StateGroups::SYSCALL_MSRS, &vmcs, |ctx| {
            ctx.lstar = 0xffff_8000_0010_0000
        })
        .unwrap();
    state.export(StateGroups::all(), &mut vmcs).unwrap();
    assert_eq!(
        vmcs.guest_msr(Msr::IA32_LSTAR as u32),
        Some(0xffff_8000_0010_0000)
    );
    assert_eq!(
        MockHal::writes_to(VmcsControl32::VMENTRY_MSR_LOAD_COUNT as u32).last(),
        Some(&5)
    );
    assert!(!MockHal::ops().iter().any(|op| matches!(op, MockOp::Vmread(_))));
}
