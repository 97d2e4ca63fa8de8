//! Unit tests for the x86_vmx_core crate, run against the simulated VMX
//! processor in `test_utils::mock`.

mod guest_state;

use alloc::sync::Arc;
use alloc::vec::Vec;

use axerrno::AxResult;

use crate::test_utils::mock::{MockGuestMemory, MockHal, MockInterruptController, test_config};
use crate::vmx::{
    ExitAction, ExitHandler, TlbFlushMode, VcpuExit, VcpuSetup, VmxConfig, VmxExitInfo,
    VmxPerCpuState, VmxVcpu,
};

/// Guest-physical address the test guests start at.
pub(crate) const GUEST_ENTRY: u64 = 0x7c00;
pub(crate) const TEST_EPTP: u64 = 0x0010_001e;

/// VMX on for host CPU `cpu`, with a set-up vCPU attached to it.
pub(crate) fn vcpu_on_cpu(
    config: VmxConfig,
    cpu: usize,
) -> (VmxPerCpuState<MockHal>, VmxVcpu<MockHal>) {
    MockHal::reset();
    MockHal::set_cpu(cpu);
    let config = Arc::new(config);
    let mut percpu = VmxPerCpuState::new(cpu).unwrap();
    percpu.hardware_enable(&config).unwrap();
    let mut vcpu = VmxVcpu::new(0, config).unwrap();
    vcpu.setup(
        &percpu,
        VcpuSetup {
            entry: GUEST_ENTRY,
            eptp: Some(TEST_EPTP),
            ..Default::default()
        },
    )
    .unwrap();
    MockHal::clear_log();
    (percpu, vcpu)
}

pub(crate) fn vcpu(mode: TlbFlushMode) -> (VmxPerCpuState<MockHal>, VmxVcpu<MockHal>) {
    vcpu_on_cpu(test_config(mode), 0)
}

/// Stops the run loop on the first exit it sees.
#[derive(Default)]
pub(crate) struct StopOnExit {
    pub exits: Vec<VmxExitInfo>,
}

impl ExitHandler<MockHal> for StopOnExit {
    type Stop = VmxExitInfo;

    fn handle_exit(
        &mut self,
        _vcpu: &mut VmxVcpu<MockHal>,
        exit: &VmxExitInfo,
    ) -> AxResult<ExitAction<VmxExitInfo>> {
        self.exits.push(*exit);
        Ok(ExitAction::Stop(*exit))
    }
}

/// An exit handler made of a closure.
pub(crate) struct FnHandler<F>(F);

pub(crate) fn handler<F>(f: F) -> FnHandler<F>
where
    F: FnMut(&mut VmxVcpu<MockHal>, &VmxExitInfo) -> AxResult<ExitAction<VmxExitInfo>>,
{
    FnHandler(f)
}

impl<F> ExitHandler<MockHal> for FnHandler<F>
where
    F: FnMut(&mut VmxVcpu<MockHal>, &VmxExitInfo) -> AxResult<ExitAction<VmxExitInfo>>,
{
    type Stop = VmxExitInfo;

    fn handle_exit(
        &mut self,
        vcpu: &mut VmxVcpu<MockHal>,
        exit: &VmxExitInfo,
    ) -> AxResult<ExitAction<VmxExitInfo>> {
        (self.0)(vcpu, exit)
    }
}

/// Runs with no interrupt sources until the first exit.
pub(crate) fn run_once(
    percpu: &mut VmxPerCpuState<MockHal>,
    vcpu: &mut VmxVcpu<MockHal>,
) -> crate::Result<VcpuExit<VmxExitInfo>> {
    let mut intc = MockInterruptController::default();
    let mut mem = MockGuestMemory::new();
    vcpu.run(percpu, &mut intc, &mut mem, &mut StopOnExit::default())
}
