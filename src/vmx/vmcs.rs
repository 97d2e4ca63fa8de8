#![allow(non_camel_case_types)]
#![allow(dead_code)]

use bit_field::BitField;
use x86::vmx::VmFail;

use super::definitions::{VmxInstructionError, VmxInterruptionType};
use crate::{Result, VmxError, VmxHal};

pub use x86::vmx::vmcs::control::{
    EntryControls, ExitControls, PinbasedControls, PrimaryControls, SecondaryControls,
};

/// Field encoding of the VM-instruction error field, read after a `VMfailValid`.
const VM_INSTRUCTION_ERROR: u32 = 0x4400;

/// Decodes a failed VMX instruction on the current VMCS.
pub(crate) fn vm_fail_reason<H: VmxHal>(fail: VmFail) -> Option<VmxInstructionError> {
    match fail {
        VmFail::VmFailValid => H::vmread(VM_INSTRUCTION_ERROR)
            .ok()
            .map(|code| VmxInstructionError::from(code as u32)),
        VmFail::VmFailInvalid => None,
    }
}

pub(crate) fn vm_fail_to_error<H: VmxHal>(fail: VmFail) -> VmxError {
    match vm_fail_reason::<H>(fail) {
        Some(err) => VmxError::VmxInstructionError(err),
        None => VmxError::InvalidVmcsPtr,
    }
}

/// Reads a raw field of the current VMCS.
pub(crate) fn vmcs_read<H: VmxHal>(field: u32) -> Result<u64> {
    H::vmread(field).map_err(|fail| VmxError::VmcsRead {
        field,
        error: vm_fail_reason::<H>(fail),
    })
}

/// Writes a raw field of the current VMCS.
pub(crate) fn vmcs_write<H: VmxHal>(field: u32, value: u64) -> Result {
    #[cfg(feature = "tracing")]
    trace!("VMWRITE {:#06x} <- {:#x}", field, value);
    H::vmwrite(field, value).map_err(|fail| VmxError::VmcsWrite {
        field,
        error: vm_fail_reason::<H>(fail),
    })
}

macro_rules! vmcs_read {
    ($field_enum: ident, $ty: ty) => {
        impl $field_enum {
            pub fn read<H: VmxHal>(self) -> Result<$ty> {
                vmcs_read::<H>(self as u32).map(|v| v as $ty)
            }
        }
    };
}

macro_rules! vmcs_write {
    ($field_enum: ident, $ty: ty) => {
        impl $field_enum {
            pub fn write<H: VmxHal>(self, value: $ty) -> Result {
                vmcs_write::<H>(self as u32, value as u64)
            }
        }
    };
}

/// 16-Bit Control Fields. (SDM Vol. 3D, Appendix B.1.1)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsControl16 {
    /// Virtual-processor identifier (VPID).
    VPID = 0x0,
    /// Posted-interrupt notification vector.
    POSTED_INTERRUPT_NOTIFICATION_VECTOR = 0x2,
    /// EPTP index.
    EPTP_INDEX = 0x4,
}
vmcs_read!(VmcsControl16, u16);
vmcs_write!(VmcsControl16, u16);

/// 64-Bit Control Fields. (SDM Vol. 3D, Appendix B.2.1)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsControl64 {
    IO_BITMAP_A_ADDR = 0x2000,
    IO_BITMAP_B_ADDR = 0x2002,
    MSR_BITMAPS_ADDR = 0x2004,
    VMEXIT_MSR_STORE_ADDR = 0x2006,
    VMEXIT_MSR_LOAD_ADDR = 0x2008,
    VMENTRY_MSR_LOAD_ADDR = 0x200A,
    EXECUTIVE_VMCS_PTR = 0x200C,
    PML_ADDR = 0x200E,
    TSC_OFFSET = 0x2010,
    VIRT_APIC_ADDR = 0x2012,
    APIC_ACCESS_ADDR = 0x2014,
    POSTED_INTERRUPT_DESC_ADDR = 0x2016,
    VM_FUNCTION_CONTROLS = 0x2018,
    /// EPT pointer.
    EPTP = 0x201A,
    EOI_EXIT0 = 0x201C,
    EOI_EXIT1 = 0x201E,
    EOI_EXIT2 = 0x2020,
    EOI_EXIT3 = 0x2022,
    EPTP_LIST_ADDR = 0x2024,
    VMREAD_BITMAP_ADDR = 0x2026,
    VMWRITE_BITMAP_ADDR = 0x2028,
    VIRT_EXCEPTION_INFO_ADDR = 0x202A,
    XSS_EXITING_BITMAP = 0x202C,
    ENCLS_EXITING_BITMAP = 0x202E,
    SUBPAGE_PERM_TABLE_PTR = 0x2030,
    TSC_MULTIPLIER = 0x2032,
}
vmcs_read!(VmcsControl64, u64);
vmcs_write!(VmcsControl64, u64);

/// 32-Bit Control Fields. (SDM Vol. 3D, Appendix B.3.1)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsControl32 {
    PINBASED_EXEC_CONTROLS = 0x4000,
    PRIMARY_PROCBASED_EXEC_CONTROLS = 0x4002,
    EXCEPTION_BITMAP = 0x4004,
    PAGE_FAULT_ERR_CODE_MASK = 0x4006,
    PAGE_FAULT_ERR_CODE_MATCH = 0x4008,
    CR3_TARGET_COUNT = 0x400A,
    VMEXIT_CONTROLS = 0x400C,
    VMEXIT_MSR_STORE_COUNT = 0x400E,
    VMEXIT_MSR_LOAD_COUNT = 0x4010,
    VMENTRY_CONTROLS = 0x4012,
    VMENTRY_MSR_LOAD_COUNT = 0x4014,
    VMENTRY_INTERRUPTION_INFO_FIELD = 0x4016,
    VMENTRY_EXCEPTION_ERR_CODE = 0x4018,
    VMENTRY_INSTRUCTION_LEN = 0x401A,
    TPR_THRESHOLD = 0x401C,
    SECONDARY_PROCBASED_EXEC_CONTROLS = 0x401E,
    PLE_GAP = 0x4020,
    PLE_WINDOW = 0x4022,
}
vmcs_read!(VmcsControl32, u32);
vmcs_write!(VmcsControl32, u32);

/// Natural-Width Control Fields. (SDM Vol. 3D, Appendix B.4.1)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsControlNW {
    CR0_GUEST_HOST_MASK = 0x6000,
    CR4_GUEST_HOST_MASK = 0x6002,
    CR0_READ_SHADOW = 0x6004,
    CR4_READ_SHADOW = 0x6006,
    CR3_TARGET_VALUE0 = 0x6008,
    CR3_TARGET_VALUE1 = 0x600A,
    CR3_TARGET_VALUE2 = 0x600C,
    CR3_TARGET_VALUE3 = 0x600E,
}
vmcs_read!(VmcsControlNW, usize);
vmcs_write!(VmcsControlNW, usize);

/// 64-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.2.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsReadOnly64 {
    GUEST_PHYSICAL_ADDR = 0x2400,
}
vmcs_read!(VmcsReadOnly64, u64);

/// 32-Bit Read-Only Data Fields. (SDM Vol. 3D, Appendix B.3.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsReadOnly32 {
    VM_INSTRUCTION_ERROR = 0x4400,
    EXIT_REASON = 0x4402,
    VMEXIT_INTERRUPTION_INFO = 0x4404,
    VMEXIT_INTERRUPTION_ERR_CODE = 0x4406,
    IDT_VECTORING_INFO = 0x4408,
    IDT_VECTORING_ERR_CODE = 0x440A,
    VMEXIT_INSTRUCTION_LEN = 0x440C,
    VMEXIT_INSTRUCTION_INFO = 0x440E,
}
vmcs_read!(VmcsReadOnly32, u32);

/// Natural-Width Read-Only Data Fields. (SDM Vol. 3D, Appendix B.4.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsReadOnlyNW {
    EXIT_QUALIFICATION = 0x6400,
    IO_RCX = 0x6402,
    IO_RSI = 0x6404,
    IO_RDI = 0x6406,
    IO_RIP = 0x6408,
    GUEST_LINEAR_ADDR = 0x640A,
}
vmcs_read!(VmcsReadOnlyNW, usize);

/// 16-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.1.2)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsGuest16 {
    ES_SELECTOR = 0x800,
    CS_SELECTOR = 0x802,
    SS_SELECTOR = 0x804,
    DS_SELECTOR = 0x806,
    FS_SELECTOR = 0x808,
    GS_SELECTOR = 0x80a,
    LDTR_SELECTOR = 0x80c,
    TR_SELECTOR = 0x80e,
    INTERRUPT_STATUS = 0x810,
    PML_INDEX = 0x812,
}
vmcs_read!(VmcsGuest16, u16);
vmcs_write!(VmcsGuest16, u16);

/// 64-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.2.3)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsGuest64 {
    LINK_PTR = 0x2800,
    IA32_DEBUGCTL = 0x2802,
    IA32_PAT = 0x2804,
    IA32_EFER = 0x2806,
    IA32_PERF_GLOBAL_CTRL = 0x2808,
    PDPTE0 = 0x280A,
    PDPTE1 = 0x280C,
    PDPTE2 = 0x280E,
    PDPTE3 = 0x2810,
    IA32_BNDCFGS = 0x2812,
    IA32_RTIT_CTL = 0x2814,
}
vmcs_read!(VmcsGuest64, u64);
vmcs_write!(VmcsGuest64, u64);

impl VmcsGuest64 {
    pub const PDPTES: [Self; 4] = [Self::PDPTE0, Self::PDPTE1, Self::PDPTE2, Self::PDPTE3];
}

/// 32-Bit Guest-State Fields. (SDM Vol. 3D, Appendix B.3.3)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsGuest32 {
    ES_LIMIT = 0x4800,
    CS_LIMIT = 0x4802,
    SS_LIMIT = 0x4804,
    DS_LIMIT = 0x4806,
    FS_LIMIT = 0x4808,
    GS_LIMIT = 0x480A,
    LDTR_LIMIT = 0x480C,
    TR_LIMIT = 0x480E,
    GDTR_LIMIT = 0x4810,
    IDTR_LIMIT = 0x4812,
    ES_ACCESS_RIGHTS = 0x4814,
    CS_ACCESS_RIGHTS = 0x4816,
    SS_ACCESS_RIGHTS = 0x4818,
    DS_ACCESS_RIGHTS = 0x481A,
    FS_ACCESS_RIGHTS = 0x481C,
    GS_ACCESS_RIGHTS = 0x481E,
    LDTR_ACCESS_RIGHTS = 0x4820,
    TR_ACCESS_RIGHTS = 0x4822,
    INTERRUPTIBILITY_STATE = 0x4824,
    ACTIVITY_STATE = 0x4826,
    SMBASE = 0x4828,
    IA32_SYSENTER_CS = 0x482A,
    VMX_PREEMPTION_TIMER_VALUE = 0x482E,
}
vmcs_read!(VmcsGuest32, u32);
vmcs_write!(VmcsGuest32, u32);

/// Natural-Width Guest-State Fields. (SDM Vol. 3D, Appendix B.4.3)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsGuestNW {
    CR0 = 0x6800,
    CR3 = 0x6802,
    CR4 = 0x6804,
    ES_BASE = 0x6806,
    CS_BASE = 0x6808,
    SS_BASE = 0x680A,
    DS_BASE = 0x680C,
    FS_BASE = 0x680E,
    GS_BASE = 0x6810,
    LDTR_BASE = 0x6812,
    TR_BASE = 0x6814,
    GDTR_BASE = 0x6816,
    IDTR_BASE = 0x6818,
    DR7 = 0x681A,
    RSP = 0x681C,
    RIP = 0x681E,
    RFLAGS = 0x6820,
    PENDING_DBG_EXCEPTIONS = 0x6822,
    IA32_SYSENTER_ESP = 0x6824,
    IA32_SYSENTER_EIP = 0x6826,
    IA32_S_CET = 0x6828,
    SSP = 0x682A,
    IA32_INTERRUPT_SSP_TABLE_ADDR = 0x682C,
}
vmcs_read!(VmcsGuestNW, usize);
vmcs_write!(VmcsGuestNW, usize);

/// 16-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.1.3)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsHost16 {
    ES_SELECTOR = 0xC00,
    CS_SELECTOR = 0xC02,
    SS_SELECTOR = 0xC04,
    DS_SELECTOR = 0xC06,
    FS_SELECTOR = 0xC08,
    GS_SELECTOR = 0xC0A,
    TR_SELECTOR = 0xC0C,
}
vmcs_read!(VmcsHost16, u16);
vmcs_write!(VmcsHost16, u16);

/// 64-Bit Host-State Fields. (SDM Vol. 3D, Appendix B.2.4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsHost64 {
    IA32_PAT = 0x2C00,
    IA32_EFER = 0x2C02,
    IA32_PERF_GLOBAL_CTRL = 0x2C04,
}
vmcs_read!(VmcsHost64, u64);
vmcs_write!(VmcsHost64, u64);

/// 32-Bit Host-State Field. (SDM Vol. 3D, Appendix B.3.4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsHost32 {
    IA32_SYSENTER_CS = 0x4C00,
}
vmcs_read!(VmcsHost32, u32);
vmcs_write!(VmcsHost32, u32);

/// Natural-Width Host-State Fields. (SDM Vol. 3D, Appendix B.4.4)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmcsHostNW {
    CR0 = 0x6C00,
    CR3 = 0x6C02,
    CR4 = 0x6C04,
    FS_BASE = 0x6C06,
    GS_BASE = 0x6C08,
    TR_BASE = 0x6C0A,
    GDTR_BASE = 0x6C0C,
    IDTR_BASE = 0x6C0E,
    IA32_SYSENTER_ESP = 0x6C10,
    IA32_SYSENTER_EIP = 0x6C12,
    RSP = 0x6C14,
    RIP = 0x6C16,
}
vmcs_read!(VmcsHostNW, usize);
vmcs_write!(VmcsHostNW, usize);

/// VM-Entry/VM-Exit Interruption-Information Field. (SDM Vol. 3C, Section 24.8.3, 24.9.2)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxInterruptInfo {
    /// Vector of interrupt or exception.
    pub vector: u8,
    /// Determines details of how the injection is performed.
    pub int_type: VmxInterruptionType,
    /// For hardware exceptions that would have delivered an error code on the stack.
    pub err_code: Option<u32>,
    /// NMI unblocking due to IRET (exit interruption info only).
    pub nmi_unblocking: bool,
}

impl VmxInterruptInfo {
    /// Convert from the interrupt vector and the error code.
    pub fn from(vector: u8, err_code: Option<u32>) -> Self {
        Self {
            vector,
            int_type: VmxInterruptionType::from_vector(vector),
            err_code,
            nmi_unblocking: false,
        }
    }

    /// Decodes an interruption-information field. `None` if the valid bit is clear.
    pub fn decode(info: u32, err_code: u32) -> Option<Self> {
        if !info.get_bit(31) {
            return None;
        }
        let int_type = VmxInterruptionType::try_from(info.get_bits(8..11) as u8)
            .unwrap_or(VmxInterruptionType::Other);
        Some(Self {
            vector: info.get_bits(0..8) as u8,
            int_type,
            err_code: info.get_bit(11).then_some(err_code),
            nmi_unblocking: info.get_bit(12),
        })
    }

    /// Raw bits for writing to VMCS.
    pub fn bits(&self) -> u32 {
        let mut bits = self.vector as u32;
        bits.set_bits(8..11, self.int_type as u32);
        bits.set_bit(11, self.err_code.is_some());
        bits.set_bit(31, true);
        bits
    }
}
