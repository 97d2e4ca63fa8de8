use bit_field::BitField;
use bitflags::bitflags;

use crate::frame::{PAGE_SIZE, PhysFrame};
use crate::msr::Msr;
use crate::{HostPhysAddr, Result, VmxHal};

/// VMCS/VMXON region in 4K size. (SDM Vol. 3C, Section 24.2)
#[derive(Debug)]
pub struct VmxRegion<H: VmxHal> {
    frame: PhysFrame<H>,
}

impl<H: VmxHal> VmxRegion<H> {
    pub const unsafe fn uninit() -> Self {
        Self {
            frame: unsafe { PhysFrame::uninit() },
        }
    }

    pub fn new(revision_id: u32, shadow_indicator: bool) -> Result<Self> {
        let frame = PhysFrame::alloc_zero()?;
        unsafe {
            (*(frame.as_mut_ptr() as *mut u32))
                .set_bits(0..=30, revision_id)
                .set_bit(31, shadow_indicator);
        }
        Ok(Self { frame })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }
}

pub trait MsrReadWrite {
    const MSR: Msr;

    fn read_raw() -> u64 {
        Self::MSR.read()
    }

    unsafe fn write_raw(flags: u64) {
        unsafe {
            Self::MSR.write(flags);
        }
    }
}

/// Reporting Register of Basic VMX Capabilities. (SDM Vol. 3D, Appendix A.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmxBasic {
    /// The 31-bit VMCS revision identifier used by the processor.
    pub revision_id: u32,
    /// The number of bytes that software should allocate for the VMXON region
    /// and any VMCS region.
    pub region_size: u16,
    /// The width of the physical addresses that may be used for the VMXON
    /// region, each VMCS, and data structures referenced by pointers in a VMCS.
    pub is_32bit_address: bool,
    /// The memory type that should be used for the VMCS, for data structures
    /// referenced by pointers in the VMCS.
    pub mem_type: u8,
    /// The processor reports information in the VM-exit instruction-information
    /// field on VM exits due to execution of INS and OUTS.
    pub io_exit_info: bool,
    /// If any VMX controls that default to 1 may be cleared to 0.
    pub vmx_flex_controls: bool,
}

impl MsrReadWrite for VmxBasic {
    const MSR: Msr = Msr::IA32_VMX_BASIC;
}

impl VmxBasic {
    pub const VMX_MEMORY_TYPE_WRITE_BACK: u8 = 6;

    pub fn from_raw(msr: u64) -> Self {
        Self {
            revision_id: msr.get_bits(0..31) as u32,
            region_size: msr.get_bits(32..45) as u16,
            is_32bit_address: msr.get_bit(48),
            mem_type: msr.get_bits(50..54) as u8,
            io_exit_info: msr.get_bit(54),
            vmx_flex_controls: msr.get_bit(55),
        }
    }

    /// Read the current IA32_VMX_BASIC flags.
    pub fn read() -> Self {
        Self::from_raw(Self::read_raw())
    }
}

bitflags! {
    /// IA32_FEATURE_CONTROL flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FeatureControlFlags: u64 {
       /// Lock bit: when set, locks this MSR from being written. when clear,
       /// VMXON causes a #GP.
       const LOCKED = 1 << 0;
       /// Enable VMX inside SMX operation.
       const VMXON_ENABLED_INSIDE_SMX = 1 << 1;
       /// Enable VMX outside SMX operation.
       const VMXON_ENABLED_OUTSIDE_SMX = 1 << 2;
   }
}

/// Control Features in Intel 64 Processor. (SDM Vol. 3C, Section 23.7)
pub struct FeatureControl;

impl MsrReadWrite for FeatureControl {
    const MSR: Msr = Msr::IA32_FEATURE_CONTROL;
}

impl FeatureControl {
    /// Read the current IA32_FEATURE_CONTROL flags.
    pub fn read() -> FeatureControlFlags {
        FeatureControlFlags::from_bits_truncate(Self::read_raw())
    }

    /// Write IA32_FEATURE_CONTROL flags, preserving reserved values.
    pub fn write(flags: FeatureControlFlags) {
        let old_value = Self::read_raw();
        let reserved = old_value & !(FeatureControlFlags::all().bits());
        let new_value = reserved | flags.bits();
        unsafe { Self::write_raw(new_value) };
    }
}

/// One entry of a VM-entry/VM-exit MSR area. (SDM Vol. 3C, Section 24.7.2)
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsrAutoEntry {
    pub index: u32,
    reserved: u32,
    pub value: u64,
}

/// A page of MSR entries the processor loads or stores on VM entry/exit.
#[derive(Debug)]
pub struct MsrAutoArea<H: VmxHal> {
    frame: PhysFrame<H>,
    count: usize,
}

impl<H: VmxHal> MsrAutoArea<H> {
    pub const CAPACITY: usize = PAGE_SIZE / core::mem::size_of::<MsrAutoEntry>();

    pub fn new() -> Result<Self> {
        Ok(Self {
            frame: PhysFrame::alloc_zero()?,
            count: 0,
        })
    }

    pub fn phys_addr(&self) -> HostPhysAddr {
        self.frame.start_paddr()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn entries(&self) -> &[MsrAutoEntry] {
        unsafe {
            core::slice::from_raw_parts(self.frame.as_mut_ptr() as *const MsrAutoEntry, self.count)
        }
    }

    fn entries_mut(&mut self) -> &mut [MsrAutoEntry] {
        unsafe {
            core::slice::from_raw_parts_mut(
                self.frame.as_mut_ptr() as *mut MsrAutoEntry,
                Self::CAPACITY,
            )
        }
    }

    pub fn get(&self, index: u32) -> Option<u64> {
        self.entries()
            .iter()
            .find(|e| e.index == index)
            .map(|e| e.value)
    }

    /// Adds `index` or updates its value. Returns `true` if the entry count changed.
    pub fn set(&mut self, index: u32, value: u64) -> Result<bool> {
        let count = self.count;
        let entries = self.entries_mut();
        if let Some(entry) = entries[..count].iter_mut().find(|e| e.index == index) {
            entry.value = value;
            return Ok(false);
        }
        if count == Self::CAPACITY {
            return Err(crate::VmxError::BadState("MSR auto area full"));
        }
        entries[count] = MsrAutoEntry {
            index,
            reserved: 0,
            value,
        };
        self.count += 1;
        Ok(true)
    }

    /// Removes `index`, moving the last entry into its slot. Returns `true`
    /// if it was present.
    pub fn remove(&mut self, index: u32) -> bool {
        let count = self.count;
        let entries = self.entries_mut();
        match entries[..count].iter().position(|e| e.index == index) {
            Some(pos) => {
                entries[pos] = entries[count - 1];
                entries[count - 1] = MsrAutoEntry::default();
                self.count -= 1;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::mock::MockHal;

    #[test]
    fn vmx_basic_from_raw() {
        let raw = (1u64 << 55) | (6u64 << 50) | (0x1000u64 << 32) | 0x12;
        let basic = VmxBasic::from_raw(raw);
        assert_eq!(basic.revision_id, 0x12);
        assert_eq!(basic.region_size, 0x1000);
        assert_eq!(basic.mem_type, VmxBasic::VMX_MEMORY_TYPE_WRITE_BACK);
        assert!(basic.vmx_flex_controls);
        assert!(!basic.is_32bit_address);
    }

    #[test]
    fn region_header_holds_revision_and_shadow_bit() {
        MockHal::reset();
        let header = |region: &VmxRegion<MockHal>| {
            let ptr = MockHal::phys_to_virt(region.phys_addr()).as_ptr() as *const u32;
            unsafe { ptr.read() }
        };
        let region = VmxRegion::<MockHal>::new(0x42, false).unwrap();
        assert_eq!(header(&region), 0x42);
        let shadow = VmxRegion::<MockHal>::new(0x42, true).unwrap();
        assert_eq!(header(&shadow), 0x8000_0042);
    }

    #[test]
    fn msr_area_add_update_remove() {
        MockHal::reset();
        let mut area = MsrAutoArea::<MockHal>::new().unwrap();
        assert!(area.set(0xc000_0081, 1).unwrap());
        assert!(area.set(0xc000_0082, 2).unwrap());
        assert!(!area.set(0xc000_0081, 3).unwrap());
        assert_eq!(area.len(), 2);
        assert_eq!(area.get(0xc000_0081), Some(3));

        assert!(area.remove(0xc000_0081));
        assert!(!area.remove(0xc000_0081));
        assert_eq!(area.len(), 1);
        assert_eq!(area.entries()[0].index, 0xc000_0082);
    }
}
