use alloc::string::String;
use core::fmt;

use axerrno::{AxError, ax_err_type};

use crate::vmx::VmxInstructionError;

/// Errors raised by the VMX execution core.
#[derive(Debug)]
pub enum VmxError {
    /// A VMX instruction failed with `VMfailValid`; the VM-instruction error
    /// field holds the reason.
    VmxInstructionError(VmxInstructionError),
    /// A VMX instruction failed with `VMfailInvalid` (no current VMCS).
    InvalidVmcsPtr,
    /// `VMREAD` of a VMCS field failed.
    VmcsRead {
        /// Encoding of the field that could not be read.
        field: u32,
        /// Decoded VM-instruction error, `None` for `VMfailInvalid`.
        error: Option<VmxInstructionError>,
    },
    /// `VMWRITE` of a VMCS field failed.
    VmcsWrite {
        /// Encoding of the field that could not be written.
        field: u32,
        /// Decoded VM-instruction error, `None` for `VMfailInvalid`.
        error: Option<VmxInstructionError>,
    },
    /// A physical frame could not be allocated.
    MemoryAllocationFailed,
    /// The processor lacks a feature this core depends on.
    UnsupportedFeature(String),
    /// VMX operation is already on for this processor.
    VmxAlreadyEnabled,
    /// VMX operation is off for this processor.
    VmxNotEnabled,
    /// The processor configuration cannot host VMX operation.
    InvalidVmcsConfig(String),
    /// An operation was requested in a state that does not allow it.
    BadState(&'static str),
    /// A second event was queued while one was still pending.
    EventAlreadyPending,
    /// The exit reason reported by the processor is unknown.
    UnknownExitReason(u32),
    /// A collaborator (exit handler, guest memory, interrupt controller)
    /// reported a failure.
    Collaborator(AxError),
}

/// A specialized [`Result`](core::result::Result) type for the VMX core.
pub type Result<T = ()> = core::result::Result<T, VmxError>;

impl fmt::Display for VmxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmxInstructionError(err) => write!(f, "VMX instruction failed: {}", err.as_str()),
            Self::InvalidVmcsPtr => f.write_str("VMX instruction failed: no current VMCS"),
            Self::VmcsRead { field, error } => match error {
                Some(err) => write!(f, "VMREAD {field:#x} failed: {}", err.as_str()),
                None => write!(f, "VMREAD {field:#x} failed: no current VMCS"),
            },
            Self::VmcsWrite { field, error } => match error {
                Some(err) => write!(f, "VMWRITE {field:#x} failed: {}", err.as_str()),
                None => write!(f, "VMWRITE {field:#x} failed: no current VMCS"),
            },
            Self::MemoryAllocationFailed => f.write_str("physical frame allocation failed"),
            Self::UnsupportedFeature(what) => write!(f, "unsupported: {what}"),
            Self::VmxAlreadyEnabled => f.write_str("VMX is already enabled"),
            Self::VmxNotEnabled => f.write_str("VMX is not enabled"),
            Self::InvalidVmcsConfig(what) => write!(f, "invalid VMX configuration: {what}"),
            Self::BadState(what) => write!(f, "bad state: {what}"),
            Self::EventAlreadyPending => f.write_str("an event is already pending injection"),
            Self::UnknownExitReason(raw) => write!(f, "unknown VM-exit reason {raw:#x}"),
            Self::Collaborator(err) => write!(f, "collaborator failed: {err:?}"),
        }
    }
}

impl From<AxError> for VmxError {
    fn from(err: AxError) -> Self {
        Self::Collaborator(err)
    }
}

impl From<VmxError> for AxError {
    fn from(err: VmxError) -> Self {
        match err {
            VmxError::MemoryAllocationFailed => ax_err_type!(NoMemory),
            VmxError::UnsupportedFeature(_) => ax_err_type!(Unsupported),
            VmxError::EventAlreadyPending => ax_err_type!(ResourceBusy),
            VmxError::Collaborator(err) => err,
            _ => ax_err_type!(BadState),
        }
    }
}
