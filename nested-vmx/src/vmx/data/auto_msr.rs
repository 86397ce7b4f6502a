//! VM-entry/VM-exit MSR-load and MSR-store areas.
//!
//! See `25.7.2 VM-Exit Controls for MSRs` and `25.8.2 VM-Entry Controls for MSRs`.

use crate::{
    platform::Platform,
    vmx::{error::VmxResult, vmcs::controls::AUTO_MSR_COUNT_MAX},
};
use tinyvec::ArrayVec;

/// One 16-byte entry of an MSR area.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct AutoMsr {
    pub msr: u32,
    pub reserved: u32,
    pub value: u64,
}

pub const AUTO_MSR_SIZE: u64 = 16;

impl AutoMsr {
    pub fn new(msr: u32, value: u64) -> Self {
        Self {
            msr,
            reserved: 0,
            value,
        }
    }

    fn from_bytes(bytes: &[u8; 16]) -> Self {
        let mut msr = [0u8; 4];
        let mut reserved = [0u8; 4];
        let mut value = [0u8; 8];
        msr.copy_from_slice(&bytes[0..4]);
        reserved.copy_from_slice(&bytes[4..8]);
        value.copy_from_slice(&bytes[8..16]);

        Self {
            msr: u32::from_le_bytes(msr),
            reserved: u32::from_le_bytes(reserved),
            value: u64::from_le_bytes(value),
        }
    }

    fn to_bytes(self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.msr.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.reserved.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.value.to_le_bytes());
        bytes
    }
}

pub type AutoMsrArea = ArrayVec<[AutoMsr; AUTO_MSR_COUNT_MAX as usize]>;

/// Reads `count` entries from guest-physical memory. The count is capped at the advertised maximum.
pub fn read_area(platform: &dyn Platform, gpa: u64, count: u32) -> VmxResult<AutoMsrArea> {
    let mut area = AutoMsrArea::new();
    for i in 0..count.min(AUTO_MSR_COUNT_MAX) as u64 {
        let mut bytes = [0u8; 16];
        platform.read_phys(gpa + i * AUTO_MSR_SIZE, &mut bytes)?;
        area.push(AutoMsr::from_bytes(&bytes));
    }

    Ok(area)
}

/// Writes the value of a single entry back to guest-physical memory.
pub fn write_entry(platform: &mut dyn Platform, gpa: u64, index: usize, entry: AutoMsr) -> VmxResult<()> {
    platform.write_phys(gpa + index as u64 * AUTO_MSR_SIZE, &entry.to_bytes())
}
