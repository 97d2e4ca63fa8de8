use alloc::format;

use bit_field::BitField;
use x86_64::registers::control::Cr0Flags;

use super::structs::{MsrReadWrite, VmxBasic};
use super::vmcs::{PinbasedControls, PrimaryControls, SecondaryControls};
use crate::msr::Msr;
use crate::{Result, VmxError};

/// How tagged TLB entries are kept coherent, chosen once per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbFlushMode {
    /// Neither EPT nor VPID: every VM transition flushes the TLB.
    None,
    /// EPT without VPID.
    EptOnly,
    /// VPID without EPT.
    VpidOnly,
    /// Both EPT and VPID.
    EptAndVpid,
}

impl TlbFlushMode {
    pub const fn new(ept: bool, vpid: bool) -> Self {
        match (ept, vpid) {
            (false, false) => Self::None,
            (true, false) => Self::EptOnly,
            (false, true) => Self::VpidOnly,
            (true, true) => Self::EptAndVpid,
        }
    }

    pub const fn uses_ept(self) -> bool {
        matches!(self, Self::EptOnly | Self::EptAndVpid)
    }

    pub const fn uses_vpid(self) -> bool {
        matches!(self, Self::VpidOnly | Self::EptAndVpid)
    }
}

/// Supported INVEPT types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct EptFlushSupport {
    pub single_context: bool,
    pub all_contexts: bool,
}

/// Supported INVVPID types.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VpidFlushSupport {
    pub individual_address: bool,
    pub single_context: bool,
    pub all_contexts: bool,
    pub single_context_retaining_globals: bool,
}

/// Allowed 0-settings and allowed 1-settings of a VMX control field,
/// as reported by the `IA32_VMX_*_CTLS` capability MSRs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCapability {
    /// Bits that must be 1.
    pub allowed0: u32,
    /// Bits that may be 1.
    pub allowed1: u32,
}

impl ControlCapability {
    /// A capability that accepts any value.
    pub const FLEXIBLE: Self = Self {
        allowed0: 0,
        allowed1: u32::MAX,
    };

    pub const fn from_msr_value(value: u64) -> Self {
        Self {
            allowed0: value as u32,
            allowed1: (value >> 32) as u32,
        }
    }

    pub fn supports(&self, bits: u32) -> bool {
        self.allowed1 & bits == bits
    }

    /// Computes a control value with `set` bits on and `clear` bits off,
    /// keeping the other flexible bits of `old_value`.
    /// (SDM Vol. 3C, Section 32.5.1, Algorithm 3)
    pub fn adjust(&self, name: &str, old_value: u32, set: u32, clear: u32) -> Result<u32> {
        let Self { allowed0, allowed1 } = *self;
        debug_assert_eq!(allowed0 & allowed1, allowed0);
        if set & clear != 0 {
            return Err(VmxError::InvalidVmcsConfig(format!(
                "can not set and clear the same bit in {name}"
            )));
        }
        if allowed1 & set != set {
            // failed if set 0-bits in allowed1
            return Err(VmxError::UnsupportedFeature(format!(
                "can not set bits {:#x} in {name}",
                set & !allowed1
            )));
        }
        if allowed0 & clear != 0 {
            // failed if clear 1-bits in allowed0
            return Err(VmxError::UnsupportedFeature(format!(
                "can not clear bits {:#x} in {name}",
                allowed0 & clear
            )));
        }
        let flexible = !allowed0 & allowed1;
        let unknown = flexible & !(set | clear);
        let default = unknown & old_value;
        Ok(allowed0 | default | set)
    }
}

/// Capabilities of all VMX control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlCapabilities {
    pub pin: ControlCapability,
    pub primary: ControlCapability,
    pub secondary: ControlCapability,
    pub exit: ControlCapability,
    pub entry: ControlCapability,
}

impl ControlCapabilities {
    pub const FLEXIBLE: Self = Self {
        pin: ControlCapability::FLEXIBLE,
        primary: ControlCapability::FLEXIBLE,
        secondary: ControlCapability::FLEXIBLE,
        exit: ControlCapability::FLEXIBLE,
        entry: ControlCapability::FLEXIBLE,
    };
}

/// VM-wide VMX configuration.
///
/// Built once by the VM initializer and shared read-only by all vCPUs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmxConfig {
    pub vmcs_revision_id: u32,
    pub controls: ControlCapabilities,
    pub tlb_flush_mode: TlbFlushMode,
    pub ept_flush: EptFlushSupport,
    pub vpid_flush: VpidFlushSupport,
    /// ASIDs are handed out in `1..max_asid`.
    pub max_asid: u32,
    /// Real and unpaged protected mode run natively.
    pub unrestricted_guest: bool,
    /// The guest's physical memory is translated by EPT.
    pub nested_paging: bool,
    /// The TPR shadow is used, so TPR-threshold exits are available.
    pub tpr_shadow: bool,
    /// VMX-preemption timer rate: the timer counts down every `2^shift` TSC ticks.
    pub preemption_timer_shift: Option<u8>,
    /// Value loaded into the VMX-preemption timer on every VM entry.
    pub preemption_timer: Option<u32>,
    pub cr0_fixed0: u64,
    pub cr0_fixed1: u64,
    pub cr4_fixed0: u64,
    pub cr4_fixed1: u64,
    /// Guest-physical address of the TSS used for real-on-V86 execution.
    pub real_mode_tss_base: u64,
    /// Guest-physical address of the identity page table used while the
    /// guest runs unpaged with EPT and without unrestricted guest.
    pub identity_page_table: u64,
}

impl VmxConfig {
    /// Number of VPIDs: VPID is a 16-bit field and 0 belongs to the host.
    pub const VPID_LIMIT: u32 = 1 << 16;

    /// Reads the VMX capability MSRs of the current processor.
    ///
    /// `want_ept` and `want_vpid` are dropped silently when the processor
    /// lacks them.
    pub fn detect(want_ept: bool, want_vpid: bool) -> Result<Self> {
        if !super::has_hardware_support() {
            return Err(VmxError::UnsupportedFeature(
                "CPU does not support feature VMX".into(),
            ));
        }
        let basic = VmxBasic::from_raw(VmxBasic::read_raw());
        let read_cap = |true_msr: Msr, msr: Msr| {
            ControlCapability::from_msr_value(if basic.vmx_flex_controls {
                true_msr.read()
            } else {
                msr.read()
            })
        };
        let primary = read_cap(
            Msr::IA32_VMX_TRUE_PROCBASED_CTLS,
            Msr::IA32_VMX_PROCBASED_CTLS,
        );
        let secondary = if primary.supports(PrimaryControls::SECONDARY_CONTROLS.bits()) {
            ControlCapability::from_msr_value(Msr::IA32_VMX_PROCBASED_CTLS2.read())
        } else {
            ControlCapability {
                allowed0: 0,
                allowed1: 0,
            }
        };
        let controls = ControlCapabilities {
            pin: read_cap(
                Msr::IA32_VMX_TRUE_PINBASED_CTLS,
                Msr::IA32_VMX_PINBASED_CTLS,
            ),
            primary,
            secondary,
            exit: read_cap(Msr::IA32_VMX_TRUE_EXIT_CTLS, Msr::IA32_VMX_EXIT_CTLS),
            entry: read_cap(Msr::IA32_VMX_TRUE_ENTRY_CTLS, Msr::IA32_VMX_ENTRY_CTLS),
        };

        let ept = want_ept && secondary.supports(SecondaryControls::ENABLE_EPT.bits());
        let vpid = want_vpid && secondary.supports(SecondaryControls::ENABLE_VPID.bits());
        let cap = if ept || vpid {
            Msr::IA32_VMX_EPT_VPID_CAP.read()
        } else {
            0
        };
        // SDM Vol. 3D, Appendix A.10
        let ept_flush = EptFlushSupport {
            single_context: cap.get_bit(20) && cap.get_bit(25),
            all_contexts: cap.get_bit(20) && cap.get_bit(26),
        };
        let vpid_flush = VpidFlushSupport {
            individual_address: cap.get_bit(32) && cap.get_bit(40),
            single_context: cap.get_bit(32) && cap.get_bit(41),
            all_contexts: cap.get_bit(32) && cap.get_bit(42),
            single_context_retaining_globals: cap.get_bit(32) && cap.get_bit(43),
        };
        let preemption_timer_shift = controls
            .pin
            .supports(PinbasedControls::VMX_PREEMPTION_TIMER.bits())
            .then(|| Msr::IA32_VMX_MISC.read().get_bits(0..5) as u8);

        let config = Self {
            vmcs_revision_id: basic.revision_id,
            controls,
            tlb_flush_mode: TlbFlushMode::new(ept, vpid),
            ept_flush,
            vpid_flush,
            max_asid: Self::VPID_LIMIT,
            unrestricted_guest: ept
                && secondary.supports(SecondaryControls::UNRESTRICTED_GUEST.bits()),
            nested_paging: ept,
            tpr_shadow: primary.supports(PrimaryControls::USE_TPR_SHADOW.bits()),
            preemption_timer_shift,
            preemption_timer: None,
            cr0_fixed0: Msr::IA32_VMX_CR0_FIXED0.read(),
            cr0_fixed1: Msr::IA32_VMX_CR0_FIXED1.read(),
            cr4_fixed0: Msr::IA32_VMX_CR4_FIXED0.read(),
            cr4_fixed1: Msr::IA32_VMX_CR4_FIXED1.read(),
            real_mode_tss_base: 0,
            identity_page_table: 0,
        };
        config.validate()?;
        info!(
            "VMX config: revision {:#x}, TLB flush mode {:?}, unrestricted guest {}",
            config.vmcs_revision_id, config.tlb_flush_mode, config.unrestricted_guest
        );
        Ok(config)
    }

    /// Checks the invariants a hand-built configuration must respect.
    pub fn validate(&self) -> Result {
        if self.tlb_flush_mode.uses_ept()
            && !self.ept_flush.single_context
            && !self.ept_flush.all_contexts
        {
            return Err(VmxError::UnsupportedFeature(
                "EPT without any INVEPT type".into(),
            ));
        }
        if self.tlb_flush_mode.uses_vpid()
            && !self.vpid_flush.single_context
            && !self.vpid_flush.all_contexts
        {
            return Err(VmxError::UnsupportedFeature(
                "VPID without single- or all-context INVVPID".into(),
            ));
        }
        if self.tlb_flush_mode.uses_vpid() && !(2..=Self::VPID_LIMIT).contains(&self.max_asid) {
            return Err(VmxError::InvalidVmcsConfig(format!(
                "ASID limit {:#x} out of range",
                self.max_asid
            )));
        }
        if self.unrestricted_guest && !self.nested_paging {
            return Err(VmxError::InvalidVmcsConfig(
                "unrestricted guest requires EPT".into(),
            ));
        }
        if self.preemption_timer.is_some() && self.preemption_timer_shift.is_none() {
            return Err(VmxError::UnsupportedFeature(
                "VMX-preemption timer".into(),
            ));
        }
        Ok(())
    }

    /// Programs the VMX-preemption timer with `ticks` on every entry.
    pub fn with_preemption_timer(mut self, ticks: u32) -> Result<Self> {
        if self.preemption_timer_shift.is_none() {
            return Err(VmxError::UnsupportedFeature(
                "VMX-preemption timer".into(),
            ));
        }
        self.preemption_timer = Some(ticks);
        Ok(self)
    }

    /// CR0 bits that the guest may not choose freely.
    ///
    /// NW and CD may be set by the guest (they are kept off in hardware),
    /// PE and PG too if the guest is unrestricted.
    pub fn cr0_must0(&self) -> u64 {
        self.cr0_fixed1 & !(Cr0Flags::NOT_WRITE_THROUGH | Cr0Flags::CACHE_DISABLE).bits()
    }

    pub fn cr0_must1(&self) -> u64 {
        if self.unrestricted_guest {
            self.cr0_fixed0 & !(Cr0Flags::PAGING | Cr0Flags::PROTECTED_MODE_ENABLE).bits()
        } else {
            self.cr0_fixed0
        }
    }

    pub fn cr4_must0(&self) -> u64 {
        self.cr4_fixed1
    }

    pub fn cr4_must1(&self) -> u64 {
        self.cr4_fixed0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::test_config;

    const CAP: ControlCapability = ControlCapability::from_msr_value(0x0000_00ff_0000_0016);

    #[test]
    fn adjust_keeps_flexible_bits_of_old_value() {
        assert_eq!(CAP.allowed0, 0x16);
        assert_eq!(CAP.allowed1, 0xff);
        assert_eq!(CAP.adjust("test", 0xc0, 0x08, 0x20).unwrap(), 0xde);
        assert_eq!(CAP.adjust("test", 0, 0, 0).unwrap(), 0x16);
    }

    #[test]
    fn adjust_rejects_impossible_settings() {
        assert!(matches!(
            CAP.adjust("test", 0, 0x100, 0),
            Err(VmxError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            CAP.adjust("test", 0, 0, 0x02),
            Err(VmxError::UnsupportedFeature(_))
        ));
        assert!(matches!(
            CAP.adjust("test", 0, 0x08, 0x08),
            Err(VmxError::InvalidVmcsConfig(_))
        ));
    }

    #[test]
    fn flush_mode_from_features() {
        assert_eq!(TlbFlushMode::new(true, false), TlbFlushMode::EptOnly);
        assert!(TlbFlushMode::EptAndVpid.uses_ept() && TlbFlushMode::EptAndVpid.uses_vpid());
        assert!(!TlbFlushMode::None.uses_ept());
        assert!(!TlbFlushMode::EptOnly.uses_vpid());
    }

    #[test]
    fn validate_checks_combinations() {
        assert!(test_config(TlbFlushMode::EptAndVpid).validate().is_ok());

        let mut config = test_config(TlbFlushMode::VpidOnly);
        config.max_asid = 1;
        assert!(config.validate().is_err());

        let mut config = test_config(TlbFlushMode::VpidOnly);
        config.unrestricted_guest = true;
        assert!(matches!(
            config.validate(),
            Err(VmxError::InvalidVmcsConfig(_))
        ));

        let mut config = test_config(TlbFlushMode::EptOnly);
        config.ept_flush = EptFlushSupport::default();
        assert!(matches!(
            config.validate(),
            Err(VmxError::UnsupportedFeature(_))
        ));
    }

    #[test]
    fn preemption_timer_needs_support() {
        let config = test_config(TlbFlushMode::EptAndVpid)
            .with_preemption_timer(500)
            .unwrap();
        assert_eq!(config.preemption_timer, Some(500));

        let mut config = test_config(TlbFlushMode::EptAndVpid);
        config.preemption_timer_shift = None;
        assert!(config.with_preemption_timer(500).is_err());
    }

    #[test]
    fn unrestricted_guest_may_clear_pe_and_pg() {
        let config = test_config(TlbFlushMode::EptAndVpid);
        assert_eq!(config.cr0_must1(), 0x20);
        let config = test_config(TlbFlushMode::VpidOnly);
        assert_eq!(config.cr0_must1(), 0x8000_0021);
        assert_eq!(config.cr0_must0() & 0x6000_0000, 0);
    }
}
