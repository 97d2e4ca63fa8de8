//! Host side of the VMX transitions: host-state area, VMXON prerequisites
//! and the guest entry/exit trampolines.

use core::arch::naked_asm;
use core::mem::{offset_of, size_of};

use bit_field::BitField;
use x86::dtables::{self, DescriptorTablePointer};
use x86::segmentation::SegmentSelector;
use x86::vmx::{Result as VmResult, VmFail};
use x86_64::registers::control::{Cr0, Cr3, Cr4, Cr4Flags};

use super::structs::{FeatureControl, FeatureControlFlags, VmxBasic};
use super::vmcs::{VmcsHost16, VmcsHost32, VmcsHost64, VmcsHostNW};
use crate::frame::PAGE_SIZE;
use crate::msr::Msr;
use crate::regs::GeneralRegisters;
use crate::{Result, VmxError, VmxHal};

/// Checks the processor can enter VMX operation and sets CR4.VMXE.
pub fn prepare_vmxon() -> Result {
    if !super::has_hardware_support() {
        return Err(VmxError::UnsupportedFeature(
            "CPU does not support feature VMX".into(),
        ));
    }
    if Cr4::read().contains(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) {
        return Err(VmxError::VmxAlreadyEnabled);
    }

    // Enable VMXON, if required.
    let ctrl = FeatureControl::read();
    let locked = ctrl.contains(FeatureControlFlags::LOCKED);
    let vmxon_outside = ctrl.contains(FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX);
    if !locked {
        FeatureControl::write(
            ctrl | FeatureControlFlags::LOCKED | FeatureControlFlags::VMXON_ENABLED_OUTSIDE_SMX,
        )
    } else if !vmxon_outside {
        return Err(VmxError::UnsupportedFeature("VMX disabled by BIOS".into()));
    }

    // Check control registers are in a VMX-friendly state. (SDM Vol. 3C, Appendix A.7, A.8)
    macro_rules! cr_is_valid {
        ($value: expr, $crx: ident) => {{
            use Msr::*;
            let value = $value;
            paste::paste! {
                let fixed0 = [<IA32_VMX_ $crx _FIXED0>].read();
                let fixed1 = [<IA32_VMX_ $crx _FIXED1>].read();
            }
            (!fixed0 | value != 0) && (fixed1 | !value != 0)
        }};
    }
    if !cr_is_valid!(Cr0::read().bits(), CR0) {
        return Err(VmxError::InvalidVmcsConfig(
            "host CR0 is not valid in VMX operation".into(),
        ));
    }
    if !cr_is_valid!(Cr4::read().bits(), CR4) {
        return Err(VmxError::InvalidVmcsConfig(
            "host CR4 is not valid in VMX operation".into(),
        ));
    }

    let vmx_basic = VmxBasic::read();
    if vmx_basic.region_size as usize != PAGE_SIZE {
        return Err(VmxError::UnsupportedFeature(
            "VMX region size is not 4K".into(),
        ));
    }
    if vmx_basic.mem_type != VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK {
        return Err(VmxError::UnsupportedFeature(
            "VMX memory type is not write-back".into(),
        ));
    }
    if vmx_basic.is_32bit_address {
        return Err(VmxError::UnsupportedFeature(
            "32-bit VMX not supported".into(),
        ));
    }

    unsafe { Cr4::write(Cr4::read() | Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS) };
    Ok(())
}

/// Clears CR4.VMXE after `VMXOFF`.
pub fn finish_vmxoff() {
    unsafe { Cr4::update(|cr4| cr4.remove(Cr4Flags::VIRTUAL_MACHINE_EXTENSIONS)) };
}

/// Fills the host-state area of the current VMCS from the live registers.
///
/// `HOST_RSP` is written on every entry.
pub fn setup_vmcs_host<H: VmxHal>() -> Result {
    VmcsHost64::IA32_PAT.write::<H>(Msr::IA32_PAT.read())?;
    VmcsHost64::IA32_EFER.write::<H>(Msr::IA32_EFER.read())?;

    VmcsHostNW::CR0.write::<H>(Cr0::read_raw() as _)?;
    VmcsHostNW::CR3.write::<H>(Cr3::read_raw().0.start_address().as_u64() as _)?;
    VmcsHostNW::CR4.write::<H>(Cr4::read_raw() as _)?;

    VmcsHost16::ES_SELECTOR.write::<H>(x86::segmentation::es().bits())?;
    VmcsHost16::CS_SELECTOR.write::<H>(x86::segmentation::cs().bits())?;
    VmcsHost16::SS_SELECTOR.write::<H>(x86::segmentation::ss().bits())?;
    VmcsHost16::DS_SELECTOR.write::<H>(x86::segmentation::ds().bits())?;
    VmcsHost16::FS_SELECTOR.write::<H>(x86::segmentation::fs().bits())?;
    VmcsHost16::GS_SELECTOR.write::<H>(x86::segmentation::gs().bits())?;
    VmcsHostNW::FS_BASE.write::<H>(Msr::IA32_FS_BASE.read() as _)?;
    VmcsHostNW::GS_BASE.write::<H>(Msr::IA32_GS_BASE.read() as _)?;

    let tr = unsafe { x86::task::tr() };
    let mut gdtp = DescriptorTablePointer::<u64>::default();
    let mut idtp = DescriptorTablePointer::<u64>::default();
    unsafe {
        dtables::sgdt(&mut gdtp);
        dtables::sidt(&mut idtp);
    }
    VmcsHost16::TR_SELECTOR.write::<H>(tr.bits())?;
    VmcsHostNW::TR_BASE.write::<H>(get_tr_base(tr, &gdtp) as _)?;
    VmcsHostNW::GDTR_BASE.write::<H>(gdtp.base as _)?;
    VmcsHostNW::IDTR_BASE.write::<H>(idtp.base as _)?;
    VmcsHostNW::RIP.write::<H>(vmx_exit as usize)?;

    VmcsHostNW::IA32_SYSENTER_ESP.write::<H>(0)?;
    VmcsHostNW::IA32_SYSENTER_EIP.write::<H>(0)?;
    VmcsHost32::IA32_SYSENTER_CS.write::<H>(0)?;
    Ok(())
}

fn get_tr_base(tr: SegmentSelector, gdt: &DescriptorTablePointer<u64>) -> u64 {
    let index = tr.index() as usize;
    let table_len = (gdt.limit as usize + 1) / size_of::<u64>();
    let table = unsafe { core::slice::from_raw_parts(gdt.base, table_len) };
    let entry = table[index];
    if entry & (1 << 47) != 0 {
        // present
        let base_low = entry.get_bits(16..40) | entry.get_bits(56..64) << 24;
        let base_high = table[index + 1] & 0xffff_ffff;
        base_low | base_high << 32
    } else {
        // no present
        0
    }
}

/// Guest registers followed by the host stack pointer saved across the
/// guest's run. `HOST_RSP` points at `host_stack_top`, so the exit path
/// pushes the guest registers right into `regs`.
#[repr(C)]
struct GuestEntryFrame {
    regs: GeneralRegisters,
    host_stack_top: u64,
}

/// RFLAGS.CF and RFLAGS.ZF, as left by a failed `VMLAUNCH`/`VMRESUME`.
const VM_FAIL_INVALID: u64 = 1 << 0;
const VM_FAIL_VALID: u64 = 1 << 6;

/// Get ready then vmlaunch or vmresume.
///
/// Returns 0 after a VM exit, or the failure flags of the instruction.
macro_rules! vmx_entry_with {
    ($instr:literal) => {
        naked_asm!(
            "push   rbp",
            "push   rbx",
            "push   r12",
            "push   r13",
            "push   r14",
            "push   r15",
            "mov    [rdi + {host_stack_top}], rsp", // save host RSP to the frame
            "mov    rsp, rdi",                      // set RSP to guest regs area
            restore_regs_from_stack!(),             // restore guest status
            $instr,                                 // let's go!
            "pushfq",                               // only reached on failure
            "pop    rax",
            "mov    rsp, [rsp]",
            "pop    r15",
            "pop    r14",
            "pop    r13",
            "pop    r12",
            "pop    rbx",
            "pop    rbp",
            "and    rax, {fail_mask}",
            "ret",
            host_stack_top = const offset_of!(GuestEntryFrame, host_stack_top),
            fail_mask = const VM_FAIL_INVALID | VM_FAIL_VALID,
        )
    };
}

/// Enter guest with vmlaunch.
///
/// Returns through [`vmx_exit`] after a VM exit.
#[unsafe(naked)]
unsafe extern "C" fn vmx_launch(_frame: *mut GuestEntryFrame) -> u64 {
    vmx_entry_with!("vmlaunch")
}

/// Enter guest with vmresume.
#[unsafe(naked)]
unsafe extern "C" fn vmx_resume(_frame: *mut GuestEntryFrame) -> u64 {
    vmx_entry_with!("vmresume")
}

/// Host RIP: saves the guest registers into the frame and returns from
/// [`vmx_launch`]/[`vmx_resume`] with 0.
#[unsafe(naked)]
unsafe extern "C" fn vmx_exit() {
    naked_asm!(
        save_regs_to_stack!(),                  // save guest status
        "mov    rsp, [rsp + {host_stack_top}]", // back to the host stack
        "pop    r15",
        "pop    r14",
        "pop    r13",
        "pop    r12",
        "pop    rbx",
        "pop    rbp",
        "xor    eax, eax",
        "ret",
        host_stack_top = const offset_of!(GuestEntryFrame, host_stack_top),
    )
}

/// Runs the guest on the current VMCS until the next VM exit.
///
/// # Safety
///
/// The VMCS must be current with a valid host and guest state, and
/// interrupts must be disabled.
pub unsafe fn enter_guest<H: VmxHal>(
    regs: &mut GeneralRegisters,
    cr2: &mut u64,
    launched: bool,
) -> VmResult<()> {
    let mut frame = GuestEntryFrame {
        regs: *regs,
        host_stack_top: 0,
    };
    let frame_ptr = &mut frame as *mut GuestEntryFrame;
    let host_rsp = frame_ptr as u64 + offset_of!(GuestEntryFrame, host_stack_top) as u64;
    H::vmwrite(VmcsHostNW::RSP as u32, host_rsp)?;

    let host_cr2 = unsafe { x86::controlregs::cr2() };
    unsafe { x86::controlregs::cr2_write(*cr2) };
    let status = unsafe {
        if launched {
            vmx_resume(frame_ptr)
        } else {
            vmx_launch(frame_ptr)
        }
    };
    if status != 0 {
        unsafe { x86::controlregs::cr2_write(host_cr2 as u64) };
        return Err(if status & VM_FAIL_VALID != 0 {
            VmFail::VmFailValid
        } else {
            VmFail::VmFailInvalid
        });
    }
    *cr2 = unsafe { x86::controlregs::cr2() } as u64;
    unsafe { x86::controlregs::cr2_write(host_cr2 as u64) };
    *regs = frame.regs;
    Ok(())
}
