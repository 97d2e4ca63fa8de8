use super::config::VmxConfig;
use super::instructions::{InvEptType, InvVpidType};
use super::structs::VmxRegion;
use super::tlb::HostCpuTlbState;
use super::vmcs::vm_fail_to_error;
use crate::{Result, VmxError, VmxHal};

/// Represents the per-CPU state for Virtual Machine Extensions (VMX).
///
/// Holds the VMXON region of one host CPU and the TLB bookkeeping shared
/// by every vCPU that runs there.
#[derive(Debug)]
pub struct VmxPerCpuState<H: VmxHal> {
    cpu_id: usize,

    /// The VMCS revision identifier the VMXON region was created with.
    pub(crate) vmcs_revision_id: u32,

    vmx_region: VmxRegion<H>,

    tlb: HostCpuTlbState,

    enabled: bool,
}

impl<H: VmxHal> VmxPerCpuState<H> {
    pub fn new(cpu_id: usize) -> Result<Self> {
        Ok(Self {
            cpu_id,
            vmcs_revision_id: 0,
            vmx_region: unsafe { VmxRegion::uninit() },
            tlb: HostCpuTlbState::new(cpu_id),
            enabled: false,
        })
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn tlb(&self) -> &HostCpuTlbState {
        &self.tlb
    }

    pub(crate) fn tlb_mut(&mut self) -> &mut HostCpuTlbState {
        &mut self.tlb
    }

    /// Turns VMX operation on for this CPU.
    ///
    /// Translations left behind by an earlier VMX user of this CPU are
    /// flushed, so VPIDs handed out from here on start clean.
    pub fn hardware_enable(&mut self, config: &VmxConfig) -> Result {
        if self.enabled {
            return Err(VmxError::VmxAlreadyEnabled);
        }
        if H::current_cpu_id() != self.cpu_id {
            return Err(VmxError::BadState("per-CPU state used on another CPU"));
        }

        H::prepare_vmxon()?;
        self.vmcs_revision_id = config.vmcs_revision_id;
        self.vmx_region = VmxRegion::new(self.vmcs_revision_id, false)?;
        unsafe { H::vmxon(self.vmx_region.phys_addr()) }.map_err(|err| {
            H::finish_vmxoff();
            VmxError::UnsupportedFeature(alloc::format!("VMXON failed: {:?}", err))
        })?;
        self.enabled = true;

        let mode = config.tlb_flush_mode;
        if mode.uses_ept() && config.ept_flush.all_contexts {
            H::invept(InvEptType::AllContexts, 0).map_err(vm_fail_to_error::<H>)?;
            self.tlb.all_contexts_flushed();
        } else if mode.uses_vpid() && config.vpid_flush.all_contexts {
            H::invvpid(InvVpidType::AllContexts, 0, 0).map_err(vm_fail_to_error::<H>)?;
            self.tlb.all_contexts_flushed();
        }
        info!("[AxVM] succeeded to turn on VMX on CPU {}.", self.cpu_id);
        Ok(())
    }

    pub fn hardware_disable(&mut self) -> Result {
        if !self.enabled {
            return Err(VmxError::VmxNotEnabled);
        }

        unsafe { H::vmxoff() }.map_err(vm_fail_to_error::<H>)?;
        H::finish_vmxoff();
        self.enabled = false;
        info!("[AxVM] succeeded to turn off VMX on CPU {}.", self.cpu_id);

        self.vmx_region = unsafe { VmxRegion::uninit() };
        Ok(())
    }
}
