mod config;
mod definitions;
mod event;
mod field_cache;
mod guest_state;
pub(crate) mod host;
pub(crate) mod instructions;
mod percpu;
mod structs;
mod tlb;
mod vcpu;
pub(crate) mod vmcs;

pub use self::config::{
    ControlCapabilities, ControlCapability, EptFlushSupport, TlbFlushMode, VmxConfig,
    VpidFlushSupport,
};
pub use self::definitions::{VmxExitReason, VmxInstructionError, VmxInterruptionType};
pub use self::event::{
    CommitOutcome, DeliveryConflict, EventInjector, EventSlot, ExceptionClass, GuestMemory,
    InjectionPhase, InterruptController, InterruptPoll, Interruptibility, PendingEvent,
    VacantEvent, resolve_delivery_conflict,
};
pub use self::field_cache::{
    TransientFields, VmcsContext, VmcsControlCache, VmcsLaunchState, VmxTransient,
};
pub use self::guest_state::{
    ExitHistory, ExitHistoryEntry, GuestCpuContext, GuestState, InterruptShadow, PagingSyncFlags,
    StateGroup, StateGroups, StateLocation,
};
pub use self::instructions::{InvEptType, InvVpidType};
pub use self::percpu::VmxPerCpuState;
pub use self::structs::VmxBasic;
pub use self::tlb::{HostCpuTlbState, TlbFlushAction, VcpuTlbState};
pub use self::vcpu::{
    ExitAction, ExitHandler, PreemptSignal, VcpuExit, VcpuSession, VcpuSetup, VmEntryFailure,
    VmxExitInfo, VmxVcpu,
};
pub use self::vmcs::VmxInterruptInfo;

/// Return if current platform support virtualization extension.
pub fn has_hardware_support() -> bool {
    if let Some(feature) = raw_cpuid::CpuId::new().get_feature_info() {
        feature.has_vmx()
    } else {
        false
    }
}
