//! Tagged-TLB management: VPID assignment and EPT/VPID invalidation.

use super::config::{TlbFlushMode, VmxConfig};
use super::instructions::{InvEptType, InvVpidType};
use super::vmcs::vm_fail_to_error;
use crate::{Result, VmxHal};

/// TLB bookkeeping of one host CPU.
///
/// Only code running on this CPU with interrupts disabled may touch it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCpuTlbState {
    pub(crate) cpu_id: usize,
    /// Last VPID handed out on this CPU. 0 belongs to the host.
    pub(crate) current_asid: u32,
    /// Bumped whenever VPIDs handed out earlier become invalid.
    pub(crate) flush_generation: u64,
    /// VPIDs may hold stale translations and must be flushed before use.
    pub(crate) flush_before_use: bool,
}

impl HostCpuTlbState {
    pub const fn new(cpu_id: usize) -> Self {
        Self {
            cpu_id,
            current_asid: 0,
            flush_generation: 0,
            flush_before_use: true,
        }
    }

    pub fn cpu_id(&self) -> usize {
        self.cpu_id
    }

    pub fn current_asid(&self) -> u32 {
        self.current_asid
    }

    pub fn flush_generation(&self) -> u64 {
        self.flush_generation
    }

    pub fn flush_before_use(&self) -> bool {
        self.flush_before_use
    }

    /// Every tagged translation on this CPU has just been invalidated.
    pub(crate) fn all_contexts_flushed(&mut self) {
        self.flush_before_use = false;
        self.flush_generation += 1;
    }

    /// Hands out the next VPID. Returns `true` if the counter wrapped.
    fn next_asid(&mut self, max_asid: u32) -> bool {
        self.current_asid += 1;
        if self.current_asid >= max_asid {
            self.current_asid = 1;
            self.flush_generation += 1;
            self.flush_before_use = true;
            return true;
        }
        false
    }
}

/// TLB bookkeeping of one vCPU.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VcpuTlbState {
    last_host_cpu: Option<usize>,
    generation: u64,
    asid: u32,
    force_flush: bool,
}

/// The invalidations to perform before the next VM entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TlbFlushAction {
    pub ept: Option<InvEptType>,
    pub vpid: Option<(InvVpidType, u16)>,
    /// A new VPID was assigned and must be written to the VMCS.
    pub asid_changed: bool,
    /// The host CPU ran out of VPIDs and started over.
    pub wrapped: bool,
}

impl TlbFlushAction {
    pub fn is_empty(&self) -> bool {
        self.ept.is_none() && self.vpid.is_none()
    }

    /// Issues the invalidations on the current CPU.
    pub fn execute<H: VmxHal>(&self, eptp: u64) -> Result {
        if let Some(kind) = self.ept {
            H::invept(kind, eptp).map_err(vm_fail_to_error::<H>)?;
        }
        if let Some((kind, vpid)) = self.vpid {
            H::invvpid(kind, vpid, 0).map_err(vm_fail_to_error::<H>)?;
        }
        Ok(())
    }
}

impl VcpuTlbState {
    pub const fn new() -> Self {
        Self {
            last_host_cpu: None,
            generation: 0,
            asid: 0,
            force_flush: true,
        }
    }

    pub fn last_host_cpu(&self) -> Option<usize> {
        self.last_host_cpu
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// VPID in use, 0 if none was assigned yet.
    pub fn asid(&self) -> u32 {
        self.asid
    }

    pub fn flush_pending(&self) -> bool {
        self.force_flush
    }

    /// Flushes this vCPU's translations before the next entry.
    pub fn request_flush(&mut self) {
        self.force_flush = true;
    }

    /// Invalidates the translations of one guest-linear address.
    pub fn flush_page<H: VmxHal>(&mut self, config: &VmxConfig, gla: u64) -> Result {
        if config.tlb_flush_mode.uses_vpid() && config.vpid_flush.individual_address && self.asid != 0 {
            H::invvpid(InvVpidType::IndividualAddress, self.asid as u16, gla)
                .map_err(vm_fail_to_error::<H>)
        } else {
            self.force_flush = true;
            Ok(())
        }
    }

    fn ept_flush(config: &VmxConfig) -> InvEptType {
        if config.ept_flush.single_context {
            InvEptType::SingleContext
        } else {
            InvEptType::AllContexts
        }
    }

    /// Decides which invalidations the next entry on `host` needs and
    /// updates the bookkeeping as if they were done.
    pub fn plan(&mut self, host: &mut HostCpuTlbState, config: &VmxConfig) -> TlbFlushAction {
        let moved = self.last_host_cpu != Some(host.cpu_id) || self.generation != host.flush_generation;
        let mut action = TlbFlushAction::default();

        match config.tlb_flush_mode {
            TlbFlushMode::None => {}
            TlbFlushMode::EptOnly => {
                if moved || self.force_flush {
                    action.ept = Some(Self::ept_flush(config));
                }
            }
            TlbFlushMode::VpidOnly | TlbFlushMode::EptAndVpid => {
                let kind = if moved {
                    action.wrapped = host.next_asid(config.max_asid);
                    action.asid_changed = self.asid != host.current_asid;
                    self.asid = host.current_asid;
                    if host.flush_before_use && config.vpid_flush.all_contexts {
                        host.flush_before_use = false;
                        Some(InvVpidType::AllContexts)
                    } else if config.vpid_flush.single_context {
                        Some(InvVpidType::SingleContext)
                    } else {
                        Some(InvVpidType::AllContexts)
                    }
                } else if self.force_flush {
                    if config.vpid_flush.single_context {
                        Some(InvVpidType::SingleContext)
                    } else {
                        Some(InvVpidType::AllContexts)
                    }
                } else {
                    None
                };

                if let Some(kind) = kind {
                    assert!(
                        self.asid >= 1 && self.asid < config.max_asid,
                        "VPID {} out of range 1..{}",
                        self.asid,
                        config.max_asid
                    );
                    action.vpid = Some((kind, self.asid as u16));
                    if config.tlb_flush_mode == TlbFlushMode::EptAndVpid {
                        action.ept = Some(Self::ept_flush(config));
                    }
                }
                if action.wrapped {
                    debug!(
                        "host CPU {}: VPIDs wrapped, generation {}",
                        host.cpu_id, host.flush_generation
                    );
                }
            }
        }

        self.last_host_cpu = Some(host.cpu_id);
        self.generation = host.flush_generation;
        self.force_flush = false;
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::test_config;

    #[test]
    fn none_mode_only_tracks() {
        let config = test_config(TlbFlushMode::None);
        let mut host = HostCpuTlbState::new(0);
        let mut vcpu = VcpuTlbState::new();
        let action = vcpu.plan(&mut host, &config);
        assert!(action.is_empty());
        assert_eq!(vcpu.last_host_cpu(), Some(0));
        assert_eq!(vcpu.asid(), 0);
    }

    #[test]
    fn ept_only_flushes_on_move_or_request() {
        let config = test_config(TlbFlushMode::EptOnly);
        let mut host = HostCpuTlbState::new(0);
        let mut vcpu = VcpuTlbState::new();
        assert_eq!(vcpu.plan(&mut host, &config).ept, Some(InvEptType::SingleContext));
        assert!(vcpu.plan(&mut host, &config).is_empty());

        vcpu.request_flush();
        let action = vcpu.plan(&mut host, &config);
        assert_eq!(action.ept, Some(InvEptType::SingleContext));
        assert_eq!(action.vpid, None);
    }

    #[test]
    fn vpid_assigned_once_per_cpu() {
        let config = test_config(TlbFlushMode::VpidOnly);
        let mut host = HostCpuTlbState::new(0);
        host.flush_before_use = false;
        let mut vcpu = VcpuTlbState::new();

        let first = vcpu.plan(&mut host, &config);
        assert!(first.asid_changed);
        assert_eq!(first.vpid, Some((InvVpidType::SingleContext, 1)));
        assert_eq!(first.ept, None);

        assert!(vcpu.plan(&mut host, &config).is_empty());

        vcpu.request_flush();
        let forced = vcpu.plan(&mut host, &config);
        assert!(!forced.asid_changed);
        assert_eq!(forced.vpid, Some((InvVpidType::SingleContext, 1)));
    }

    #[test]
    fn generation_bump_forces_new_vpid() {
        let config = test_config(TlbFlushMode::EptAndVpid);
        let mut host = HostCpuTlbState::new(0);
        host.flush_before_use = false;
        let mut vcpu = VcpuTlbState::new();
        vcpu.plan(&mut host, &config);

        host.flush_generation += 1;
        let action = vcpu.plan(&mut host, &config);
        assert!(action.asid_changed);
        assert_eq!(vcpu.asid(), 2);
        assert_eq!(action.ept, Some(InvEptType::SingleContext));
    }

    #[test]
    fn single_context_unsupported_falls_back() {
        let mut config = test_config(TlbFlushMode::VpidOnly);
        config.vpid_flush.single_context = false;
        let mut host = HostCpuTlbState::new(0);
        host.flush_before_use = false;
        let mut vcpu = VcpuTlbState::new();
        assert_eq!(
            vcpu.plan(&mut host, &config).vpid,
            Some((InvVpidType::AllContexts, 1))
        );
    }
}
