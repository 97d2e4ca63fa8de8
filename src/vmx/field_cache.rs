use bitflags::bitflags;

use super::definitions::VmxInstructionError;
use super::structs::{MsrAutoArea, VmxRegion};
use super::vmcs::{
    self, PrimaryControls, VmcsControl16, VmcsControl32, VmcsControl64, VmcsControlNW,
    VmcsReadOnly32, VmcsReadOnly64, VmcsReadOnlyNW, VmxInterruptInfo,
};
use crate::{HostPhysAddr, Result, VmxError, VmxHal};

/// Launch state of a VMCS. (SDM Vol. 3C, Section 25.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmcsLaunchState {
    /// Not active on any processor. The next entry must use `VMLAUNCH`.
    Clear,
    /// Active on a processor, never launched there.
    Current,
    /// Launched. The next entry uses `VMRESUME`.
    Launched,
}

/// Software copy of the VMCS control fields this core changes at run time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmcsControlCache {
    pub pin: u32,
    pub primary: u32,
    pub secondary: u32,
    pub entry: u32,
    pub exit: u32,
    pub exception_bitmap: u32,
    pub cr0_guest_host_mask: u64,
    pub cr0_read_shadow: u64,
    pub cr4_guest_host_mask: u64,
    pub cr4_read_shadow: u64,
    pub tsc_offset: u64,
    pub vpid: u16,
    pub tpr_threshold: u32,
    pub eptp: u64,
}

/// Writes `value` only if it differs from `cached`. The cache is updated
/// after the write succeeded.
fn write_on_change<T: Copy + PartialEq>(
    cached: &mut T,
    value: T,
    write: impl FnOnce(T) -> Result,
) -> Result<bool> {
    if *cached == value {
        return Ok(false);
    }
    write(value)?;
    *cached = value;
    Ok(true)
}

/// A VMCS together with everything software remembers about it.
pub struct VmcsContext<H: VmxHal> {
    region: VmxRegion<H>,
    launch_state: VmcsLaunchState,
    loaded_on: Option<usize>,
    controls: VmcsControlCache,
    /// Guest MSRs: loaded on VM entry, stored on VM exit.
    guest_msrs: MsrAutoArea<H>,
    /// Host MSRs: loaded on VM exit.
    host_msrs: MsrAutoArea<H>,
}

impl<H: VmxHal> VmcsContext<H> {
    pub fn new(revision_id: u32) -> Result<Self> {
        Ok(Self {
            region: VmxRegion::new(revision_id, false)?,
            launch_state: VmcsLaunchState::Clear,
            loaded_on: None,
            controls: VmcsControlCache::default(),
            guest_msrs: MsrAutoArea::new()?,
            host_msrs: MsrAutoArea::new()?,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.region.phys_addr()
    }

    pub fn launch_state(&self) -> VmcsLaunchState {
        self.launch_state
    }

    pub fn is_launched(&self) -> bool {
        self.launch_state == VmcsLaunchState::Launched
    }

    /// The host CPU the VMCS is active on.
    pub fn loaded_on(&self) -> Option<usize> {
        self.loaded_on
    }

    pub fn controls(&self) -> &VmcsControlCache {
        &self.controls
    }

    fn ensure_current(&self) -> Result {
        if self.launch_state == VmcsLaunchState::Clear {
            return Err(VmxError::BadState("VMCS is not loaded"));
        }
        Ok(())
    }

    /// Makes the VMCS current on `cpu`.
    ///
    /// A VMCS active on another CPU must be cleared there first.
    pub fn load(&mut self, cpu: usize) -> Result {
        if let Some(other) = self.loaded_on.filter(|&other| other != cpu) {
            error!(
                "VMCS {:#x} is active on CPU {}, can not load it on CPU {}",
                self.phys_addr(),
                other,
                cpu
            );
            return Err(VmxError::BadState("VMCS active on another host CPU"));
        }
        unsafe { H::vmptrld(self.phys_addr()) }.map_err(vmcs::vm_fail_to_error::<H>)?;
        if self.launch_state == VmcsLaunchState::Clear {
            debug!("VMCS {:#x} loaded on CPU {}", self.phys_addr(), cpu);
            self.launch_state = VmcsLaunchState::Current;
        }
        self.loaded_on = Some(cpu);
        Ok(())
    }

    /// Flushes the VMCS to memory and makes it inactive, so that it can be
    /// loaded on another CPU.
    pub fn clear(&mut self) -> Result {
        if self.launch_state == VmcsLaunchState::Clear {
            return Ok(());
        }
        unsafe { H::vmclear(self.phys_addr()) }.map_err(vmcs::vm_fail_to_error::<H>)?;
        debug!(
            "VMCS {:#x} cleared on CPU {:?}",
            self.phys_addr(),
            self.loaded_on
        );
        self.launch_state = VmcsLaunchState::Clear;
        self.loaded_on = None;
        Ok(())
    }

    /// Records a successful `VMLAUNCH`.
    pub fn mark_launched(&mut self) {
        debug_assert_ne!(self.launch_state, VmcsLaunchState::Clear);
        self.launch_state = VmcsLaunchState::Launched;
    }

    /// Writes every cached control unconditionally and adopts `controls` as
    /// the cache. Also points the MSR areas at their pages.
    pub fn init_controls(&mut self, controls: VmcsControlCache) -> Result {
        self.ensure_current()?;
        VmcsControl32::PINBASED_EXEC_CONTROLS.write::<H>(controls.pin)?;
        VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.write::<H>(controls.primary)?;
        VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS.write::<H>(controls.secondary)?;
        VmcsControl32::VMENTRY_CONTROLS.write::<H>(controls.entry)?;
        VmcsControl32::VMEXIT_CONTROLS.write::<H>(controls.exit)?;
        VmcsControl32::EXCEPTION_BITMAP.write::<H>(controls.exception_bitmap)?;
        VmcsControlNW::CR0_GUEST_HOST_MASK.write::<H>(controls.cr0_guest_host_mask as usize)?;
        VmcsControlNW::CR0_READ_SHADOW.write::<H>(controls.cr0_read_shadow as usize)?;
        VmcsControlNW::CR4_GUEST_HOST_MASK.write::<H>(controls.cr4_guest_host_mask as usize)?;
        VmcsControlNW::CR4_READ_SHADOW.write::<H>(controls.cr4_read_shadow as usize)?;
        VmcsControl64::TSC_OFFSET.write::<H>(controls.tsc_offset)?;
        VmcsControl16::VPID.write::<H>(controls.vpid)?;
        VmcsControl32::TPR_THRESHOLD.write::<H>(controls.tpr_threshold)?;
        VmcsControl64::EPTP.write::<H>(controls.eptp)?;
        VmcsControl32::CR3_TARGET_COUNT.write::<H>(0)?;
        self.controls = controls;

        let guest_area = self.guest_msrs.phys_addr().as_usize() as u64;
        VmcsControl64::VMENTRY_MSR_LOAD_ADDR.write::<H>(guest_area)?;
        VmcsControl64::VMEXIT_MSR_STORE_ADDR.write::<H>(guest_area)?;
        VmcsControl64::VMEXIT_MSR_LOAD_ADDR.write::<H>(self.host_msrs.phys_addr().as_usize() as u64)?;
        self.sync_guest_msr_count()?;
        self.sync_host_msr_count()
    }

    pub fn set_pin_controls(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.pin, value, |v| {
            VmcsControl32::PINBASED_EXEC_CONTROLS.write::<H>(v)
        })
    }

    pub fn set_primary_controls(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.primary, value, |v| {
            VmcsControl32::PRIMARY_PROCBASED_EXEC_CONTROLS.write::<H>(v)
        })
    }

    pub fn set_secondary_controls(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.secondary, value, |v| {
            VmcsControl32::SECONDARY_PROCBASED_EXEC_CONTROLS.write::<H>(v)
        })
    }

    pub fn set_entry_controls(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.entry, value, |v| {
            VmcsControl32::VMENTRY_CONTROLS.write::<H>(v)
        })
    }

    pub fn set_exit_controls(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.exit, value, |v| {
            VmcsControl32::VMEXIT_CONTROLS.write::<H>(v)
        })
    }

    pub fn set_exception_bitmap(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.exception_bitmap, value, |v| {
            VmcsControl32::EXCEPTION_BITMAP.write::<H>(v)
        })
    }

    /// Updates the CR0 guest/host mask and read shadow.
    pub fn set_cr0_mask_and_shadow(&mut self, mask: u64, shadow: u64) -> Result {
        self.ensure_current()?;
        write_on_change(&mut self.controls.cr0_guest_host_mask, mask, |v| {
            VmcsControlNW::CR0_GUEST_HOST_MASK.write::<H>(v as usize)
        })?;
        write_on_change(&mut self.controls.cr0_read_shadow, shadow, |v| {
            VmcsControlNW::CR0_READ_SHADOW.write::<H>(v as usize)
        })?;
        Ok(())
    }

    /// Updates the CR4 guest/host mask and read shadow.
    pub fn set_cr4_mask_and_shadow(&mut self, mask: u64, shadow: u64) -> Result {
        self.ensure_current()?;
        write_on_change(&mut self.controls.cr4_guest_host_mask, mask, |v| {
            VmcsControlNW::CR4_GUEST_HOST_MASK.write::<H>(v as usize)
        })?;
        write_on_change(&mut self.controls.cr4_read_shadow, shadow, |v| {
            VmcsControlNW::CR4_READ_SHADOW.write::<H>(v as usize)
        })?;
        Ok(())
    }

    pub fn set_tsc_offset(&mut self, value: u64) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.tsc_offset, value, |v| {
            VmcsControl64::TSC_OFFSET.write::<H>(v)
        })
    }

    pub fn set_vpid(&mut self, vpid: u16) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.vpid, vpid, |v| {
            VmcsControl16::VPID.write::<H>(v)
        })
    }

    pub fn set_tpr_threshold(&mut self, value: u32) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.tpr_threshold, value, |v| {
            VmcsControl32::TPR_THRESHOLD.write::<H>(v)
        })
    }

    pub fn set_eptp(&mut self, value: u64) -> Result<bool> {
        self.ensure_current()?;
        write_on_change(&mut self.controls.eptp, value, |v| {
            VmcsControl64::EPTP.write::<H>(v)
        })
    }

    fn set_primary_bit(&mut self, bit: PrimaryControls, enable: bool) -> Result<bool> {
        let mut primary = self.controls.primary;
        if enable {
            primary |= bit.bits();
        } else {
            primary &= !bit.bits();
        }
        self.set_primary_controls(primary)
    }

    /// Enables or disables interrupt-window exiting.
    pub fn set_interrupt_window(&mut self, enable: bool) -> Result<bool> {
        self.set_primary_bit(PrimaryControls::INTERRUPT_WINDOW_EXITING, enable)
    }

    /// Enables or disables NMI-window exiting.
    pub fn set_nmi_window(&mut self, enable: bool) -> Result<bool> {
        self.set_primary_bit(PrimaryControls::NMI_WINDOW_EXITING, enable)
    }

    pub fn interrupt_window_enabled(&self) -> bool {
        self.controls.primary & PrimaryControls::INTERRUPT_WINDOW_EXITING.bits() != 0
    }

    pub fn nmi_window_enabled(&self) -> bool {
        self.controls.primary & PrimaryControls::NMI_WINDOW_EXITING.bits() != 0
    }

    fn sync_guest_msr_count(&self) -> Result {
        let count = self.guest_msrs.len() as u32;
        VmcsControl32::VMENTRY_MSR_LOAD_COUNT.write::<H>(count)?;
        VmcsControl32::VMEXIT_MSR_STORE_COUNT.write::<H>(count)
    }

    fn sync_host_msr_count(&self) -> Result {
        VmcsControl32::VMEXIT_MSR_LOAD_COUNT.write::<H>(self.host_msrs.len() as u32)
    }

    /// Value of a guest MSR in the auto-load/store area.
    pub fn guest_msr(&self, index: u32) -> Option<u64> {
        self.guest_msrs.get(index)
    }

    /// Adds or updates a guest MSR loaded on every VM entry.
    pub fn set_guest_msr(&mut self, index: u32, value: u64) -> Result {
        if self.guest_msrs.set(index, value)? {
            self.ensure_current()?;
            self.sync_guest_msr_count()?;
        }
        Ok(())
    }

    pub fn remove_guest_msr(&mut self, index: u32) -> Result<bool> {
        let removed = self.guest_msrs.remove(index);
        if removed {
            self.ensure_current()?;
            self.sync_guest_msr_count()?;
        }
        Ok(removed)
    }

    /// Adds or updates a host MSR loaded on every VM exit.
    pub fn set_host_msr(&mut self, index: u32, value: u64) -> Result {
        if self.host_msrs.set(index, value)? {
            self.ensure_current()?;
            self.sync_host_msr_count()?;
        }
        Ok(())
    }

    pub fn host_msr(&self, index: u32) -> Option<u64> {
        self.host_msrs.get(index)
    }

    /// Reads the VM-instruction error field.
    pub fn instruction_error(&self) -> Result<VmxInstructionError> {
        VmcsReadOnly32::VM_INSTRUCTION_ERROR
            .read::<H>()
            .map(VmxInstructionError::from)
    }
}

impl<H: VmxHal> Drop for VmcsContext<H> {
    fn drop(&mut self) {
        if self.launch_state != VmcsLaunchState::Clear {
            if let Err(err) = self.clear() {
                warn!("failed to clear VMCS on drop: {}", err);
            }
        }
    }
}

bitflags! {
    /// Transient exit fields already read for the current exit.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct TransientFields: u32 {
        const EXIT_REASON = 1 << 0;
        const EXIT_QUALIFICATION = 1 << 1;
        const EXIT_INTR_INFO = 1 << 2;
        const EXIT_INTR_ERROR_CODE = 1 << 3;
        const IDT_VECTORING_INFO = 1 << 4;
        const IDT_VECTORING_ERROR_CODE = 1 << 5;
        const EXIT_INSTR_LEN = 1 << 6;
        const EXIT_INSTR_INFO = 1 << 7;
        const GUEST_LINEAR_ADDR = 1 << 8;
        const GUEST_PHYSICAL_ADDR = 1 << 9;
    }
}

macro_rules! transient_field {
    ($(#[$doc:meta])* $name:ident: $ty:ty = $flag:ident, $field:expr) => {
        $(#[$doc])*
        pub fn $name<H: VmxHal>(&mut self) -> Result<$ty> {
            if !self.read.contains(TransientFields::$flag) {
                self.$name = $field.read::<H>()? as $ty;
                self.read.insert(TransientFields::$flag);
            }
            Ok(self.$name)
        }
    };
}

/// VM-exit information fields, each read from the VMCS at most once per exit.
#[derive(Debug, Default)]
pub struct VmxTransient {
    read: TransientFields,
    exit_reason: u32,
    exit_qualification: u64,
    exit_intr_info: u32,
    exit_intr_error_code: u32,
    idt_vectoring_info: u32,
    idt_vectoring_error_code: u32,
    exit_instruction_len: u32,
    exit_instruction_info: u32,
    guest_linear_addr: u64,
    guest_physical_addr: u64,
}

impl VmxTransient {
    /// Forgets every cached field. Called once per VM exit.
    pub fn reset(&mut self) {
        self.read = TransientFields::empty();
    }

    /// Fields read since the last exit.
    pub fn fields_read(&self) -> TransientFields {
        self.read
    }

    transient_field!(
        /// Raw exit reason, including the entry-failure bit.
        exit_reason: u32 = EXIT_REASON, VmcsReadOnly32::EXIT_REASON
    );
    transient_field!(exit_qualification: u64 = EXIT_QUALIFICATION, VmcsReadOnlyNW::EXIT_QUALIFICATION);
    transient_field!(exit_intr_info: u32 = EXIT_INTR_INFO, VmcsReadOnly32::VMEXIT_INTERRUPTION_INFO);
    transient_field!(
        exit_intr_error_code: u32 = EXIT_INTR_ERROR_CODE,
        VmcsReadOnly32::VMEXIT_INTERRUPTION_ERR_CODE
    );
    transient_field!(idt_vectoring_info: u32 = IDT_VECTORING_INFO, VmcsReadOnly32::IDT_VECTORING_INFO);
    transient_field!(
        idt_vectoring_error_code: u32 = IDT_VECTORING_ERROR_CODE,
        VmcsReadOnly32::IDT_VECTORING_ERR_CODE
    );
    transient_field!(
        exit_instruction_len: u32 = EXIT_INSTR_LEN,
        VmcsReadOnly32::VMEXIT_INSTRUCTION_LEN
    );
    transient_field!(
        exit_instruction_info: u32 = EXIT_INSTR_INFO,
        VmcsReadOnly32::VMEXIT_INSTRUCTION_INFO
    );
    transient_field!(guest_linear_addr: u64 = GUEST_LINEAR_ADDR, VmcsReadOnlyNW::GUEST_LINEAR_ADDR);
    transient_field!(
        guest_physical_addr: u64 = GUEST_PHYSICAL_ADDR,
        VmcsReadOnly64::GUEST_PHYSICAL_ADDR
    );

    /// The VM-exit interruption information, with its error code if valid.
    pub fn exit_interruption<H: VmxHal>(&mut self) -> Result<Option<VmxInterruptInfo>> {
        let info = self.exit_intr_info::<H>()?;
        let err_code = if info & (1 << 11) != 0 {
            self.exit_intr_error_code::<H>()?
        } else {
            0
        };
        Ok(VmxInterruptInfo::decode(info, err_code))
    }

    /// The IDT-vectoring information, with its error code if valid.
    pub fn idt_vectoring<H: VmxHal>(&mut self) -> Result<Option<VmxInterruptInfo>> {
        let info = self.idt_vectoring_info::<H>()?;
        let err_code = if info & (1 << 11) != 0 {
            self.idt_vectoring_error_code::<H>()?
        } else {
            0
        };
        Ok(VmxInterruptInfo::decode(info, err_code))
    }
}
