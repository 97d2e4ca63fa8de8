use x86::bits64::vmx;
use x86::vmx::Result as VmResult;

use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::vmx::{InvEptType, InvVpidType};
use crate::{HostPhysAddr, HostVirtAddr};

/// The interfaces the host kernel provides to the VMX core.
///
/// Everything that touches the processor goes through this trait. The
/// provided methods execute the real instructions; a host only has to supply
/// memory management and CPU identity. Tests replace the VMX instructions
/// with a simulated processor.
pub trait VmxHal: Sized {
    /// Allocates a 4K-sized contiguous physical frame.
    fn alloc_frame() -> Option<HostPhysAddr>;

    /// Deallocates a frame allocated by [`VmxHal::alloc_frame`].
    fn dealloc_frame(paddr: HostPhysAddr);

    /// Converts a host physical address to a host virtual address.
    fn phys_to_virt(paddr: HostPhysAddr) -> HostVirtAddr;

    /// Id of the host CPU the calling thread runs on.
    fn current_cpu_id() -> usize;

    /// Disables local interrupts and returns whether they were enabled.
    fn irq_save() -> bool {
        let enabled = x86_64::instructions::interrupts::are_enabled();
        x86_64::instructions::interrupts::disable();
        enabled
    }

    /// Restores the interrupt flag saved by [`VmxHal::irq_save`].
    fn irq_restore(enabled: bool) {
        if enabled {
            x86_64::instructions::interrupts::enable();
        }
    }

    /// Checks the processor can enter VMX operation and sets CR4.VMXE.
    fn prepare_vmxon() -> crate::Result {
        crate::vmx::host::prepare_vmxon()
    }

    /// Undoes [`VmxHal::prepare_vmxon`] after `VMXOFF`.
    fn finish_vmxoff() {
        crate::vmx::host::finish_vmxoff()
    }

    /// Reads a host MSR, e.g. to fill the MSR auto-load area.
    fn read_host_msr(msr: Msr) -> u64 {
        msr.read()
    }

    /// Enters VMX operation with the given VMXON region.
    ///
    /// # Safety
    ///
    /// `region` must be a valid, initialized VMXON region and CR4.VMXE must be set.
    unsafe fn vmxon(region: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmxon(region.as_usize() as u64) }
    }

    /// Leaves VMX operation.
    ///
    /// # Safety
    ///
    /// No VMCS may still be in use on this processor.
    unsafe fn vmxoff() -> VmResult<()> {
        unsafe { vmx::vmxoff() }
    }

    /// Makes the VMCS at `vmcs` current and active on this processor.
    ///
    /// # Safety
    ///
    /// `vmcs` must be a VMCS region that is not active on another processor.
    unsafe fn vmptrld(vmcs: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmptrld(vmcs.as_usize() as u64) }
    }

    /// Flushes the VMCS at `vmcs` to memory and marks it clear.
    ///
    /// # Safety
    ///
    /// `vmcs` must be a VMCS region.
    unsafe fn vmclear(vmcs: HostPhysAddr) -> VmResult<()> {
        unsafe { vmx::vmclear(vmcs.as_usize() as u64) }
    }

    fn vmread(field: u32) -> VmResult<u64> {
        unsafe { vmx::vmread(field) }
    }

    fn vmwrite(field: u32, value: u64) -> VmResult<()> {
        unsafe { vmx::vmwrite(field, value) }
    }

    fn invept(kind: InvEptType, eptp: u64) -> VmResult<()> {
        unsafe { crate::vmx::instructions::invept(kind, eptp) }
    }

    fn invvpid(kind: InvVpidType, vpid: u16, addr: u64) -> VmResult<()> {
        unsafe { crate::vmx::instructions::invvpid(kind, vpid, addr) }
    }

    /// Writes the host-state area of the current VMCS.
    fn setup_host_state() -> crate::Result {
        crate::vmx::host::setup_vmcs_host::<Self>()
    }

    /// Runs the guest until the next VM exit.
    ///
    /// `regs` and `cr2` are swapped in before entry and hold the guest values
    /// again after the exit. `launched` selects `VMRESUME` over `VMLAUNCH`.
    ///
    /// # Safety
    ///
    /// The current VMCS must hold a complete guest and host state and
    /// interrupts must be disabled.
    unsafe fn enter_guest(
        regs: &mut GeneralRegisters,
        cr2: &mut u64,
        launched: bool,
    ) -> VmResult<()> {
        unsafe { crate::vmx::host::enter_guest::<Self>(regs, cr2, launched) }
    }

    /// Hands an NMI that caused a VM exit over to the host's NMI handler.
    fn dispatch_host_nmi() {
        unsafe { core::arch::asm!("int 2") }
    }
}
