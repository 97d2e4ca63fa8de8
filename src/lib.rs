#![cfg_attr(not(test), no_std)]
#![doc = include_str!("../README.md")]

#[macro_use]
extern crate log;

extern crate alloc;

mod error;
mod frame;
mod hal;
pub(crate) mod msr;
#[macro_use]
pub(crate) mod regs;
mod segmentation;
mod vmx;

#[cfg(test)]
mod test_utils;
#[cfg(test)]
mod tests;

pub use error::{Result, VmxError};
pub use hal::VmxHal;
pub use msr::Msr;
pub use regs::GeneralRegisters;
pub use segmentation::{DescriptorTable, Segment, SegmentAccessRights};

pub use vmx::{
    CommitOutcome, ControlCapabilities, ControlCapability, DeliveryConflict, EptFlushSupport,
    EventInjector, EventSlot, ExceptionClass, ExitAction, ExitHandler, ExitHistory,
    ExitHistoryEntry, GuestCpuContext, GuestMemory, GuestState, HostCpuTlbState, InjectionPhase,
    InterruptController, InterruptPoll, InterruptShadow, Interruptibility, InvEptType,
    InvVpidType, PagingSyncFlags, PendingEvent, PreemptSignal, StateGroup, StateGroups,
    StateLocation, TlbFlushAction, TlbFlushMode, TransientFields, VacantEvent, VcpuExit,
    VcpuSession, VcpuSetup, VcpuTlbState, VmEntryFailure, VmcsContext, VmcsControlCache,
    VmcsLaunchState, VmxBasic, VmxConfig, VmxExitInfo, VmxExitReason, VmxInstructionError,
    VmxInterruptInfo, VmxInterruptionType, VmxPerCpuState, VmxTransient, VmxVcpu,
    VpidFlushSupport, has_hardware_support, resolve_delivery_conflict,
};

/// Host physical address.
pub type HostPhysAddr = memory_addr::PhysAddr;
/// Host virtual address.
pub type HostVirtAddr = memory_addr::VirtAddr;
