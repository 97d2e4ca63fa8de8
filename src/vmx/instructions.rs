use core::arch::asm;

use x86::vmx::{Result, VmFail};

/// INVEPT type. (SDM Vol. 3C, Section 30.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvEptType {
    /// The logical processor invalidates all mappings associated with bits
    /// 51:12 of the EPT pointer (EPTP) specified in the INVEPT descriptor.
    /// It may invalidate other mappings as well.
    SingleContext = 1,
    /// The logical processor invalidates mappings associated with all EPTPs.
    AllContexts = 2,
}

/// INVVPID type. (SDM Vol. 3C, Section 30.3)
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvVpidType {
    /// Mappings for the linear address and VPID in the descriptor.
    IndividualAddress = 0,
    /// All mappings tagged with the VPID in the descriptor.
    SingleContext = 1,
    /// All mappings tagged with any VPID except 0.
    AllContexts = 2,
    /// Like `SingleContext`, keeping global translations.
    SingleContextRetainingGlobals = 3,
}

/// Decodes RFLAGS.CF/ZF after a VMX instruction. (SDM Vol. 3C, Section 30.2)
#[inline(always)]
fn vmx_capture_status(cf: u8, zf: u8) -> Result<()> {
    if zf != 0 {
        Err(VmFail::VmFailValid)
    } else if cf != 0 {
        Err(VmFail::VmFailInvalid)
    } else {
        Ok(())
    }
}

/// Invalidate Translations Derived from EPT.
///
/// # Safety
///
/// VMX operation must be on.
pub unsafe fn invept(inv_type: InvEptType, eptp: u64) -> Result<()> {
    let invept_desc = [eptp, 0];
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "invept {0}, [{1}]",
            "setc {2}",
            "setz {3}",
            in(reg) inv_type as u64,
            in(reg) &invept_desc,
            out(reg_byte) cf,
            out(reg_byte) zf,
        );
    }
    vmx_capture_status(cf, zf)
}

/// Invalidate Translations Based on VPID.
///
/// # Safety
///
/// VMX operation must be on.
pub unsafe fn invvpid(inv_type: InvVpidType, vpid: u16, address: u64) -> Result<()> {
    let invvpid_desc: [u64; 2] = [vpid as u64, address];
    let (cf, zf): (u8, u8);
    unsafe {
        asm!(
            "invvpid {0}, [{1}]",
            "setc {2}",
            "setz {3}",
            in(reg) inv_type as u64,
            in(reg) &invvpid_desc,
            out(reg_byte) cf,
            out(reg_byte) zf,
        );
    }
    vmx_capture_status(cf, zf)
}
