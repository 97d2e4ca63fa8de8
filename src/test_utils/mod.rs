//! Test doubles for the VMX core.

pub mod mock;
