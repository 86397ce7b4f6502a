use crate::{platform::Platform, vmx::error::VmxResult};
use alloc::boxed::Box;
use x86::bits64::paging::BASE_PAGE_SIZE;

const CHAR_BIT: u32 = 8;
const RANGE_SIZE: u32 = 0x400 * CHAR_BIT;

/// The VMX MSR bitmap, one bit per MSR and access direction.
///
/// See `25.6.9 MSR-Bitmap Address`.
#[repr(C)]
#[derive(Clone)]
pub struct MsrBitmap {
    /// Reads of 0000_0000 to 0000_1FFF
    pub read_low: [u8; 0x400],
    /// Reads of C000_0000 to C000_1FFF
    pub read_high: [u8; 0x400],
    /// Writes of 0000_0000 to 0000_1FFF
    pub write_low: [u8; 0x400],
    /// Writes of C000_0000 to C000_1FFF
    pub write_high: [u8; 0x400],
}
const_assert_eq!(core::mem::size_of::<MsrBitmap>(), BASE_PAGE_SIZE);

impl MsrBitmap {
    pub fn new() -> Box<MsrBitmap> {
        Box::new(Self {
            read_low: [0; 0x400],
            read_high: [0; 0x400],
            write_low: [0; 0x400],
            write_high: [0; 0x400],
        })
    }

    /// Loads the guest hypervisor's bitmap from guest-physical memory.
    pub fn load(&mut self, platform: &dyn Platform, gpa: u64) -> VmxResult<()> {
        platform.read_phys(gpa, &mut self.read_low)?;
        platform.read_phys(gpa + 0x400, &mut self.read_high)?;
        platform.read_phys(gpa + 0x800, &mut self.write_low)?;
        platform.read_phys(gpa + 0xc00, &mut self.write_high)?;

        Ok(())
    }

    pub fn hook_msr(&mut self, msr: u32) {
        self.hook_wrmsr(msr);
        self.hook_rdmsr(msr);
    }

    pub fn hook_rdmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::msr_range(msr) {
            self.set_bit(offset + Self::msr_offset(msr));
        }
    }

    pub fn hook_wrmsr(&mut self, msr: u32) {
        if let Some(offset) = Self::msr_range(msr) {
            self.set_bit(2 * RANGE_SIZE + offset + Self::msr_offset(msr));
        }
    }

    /// Whether RDMSR of the MSR causes a VM-exit. MSRs outside both ranges always do.
    pub fn is_rdmsr_intercepted(&self, msr: u32) -> bool {
        match Self::msr_range(msr) {
            Some(offset) => self.bit(offset + Self::msr_offset(msr)),
            None => true,
        }
    }

    /// Whether WRMSR of the MSR causes a VM-exit. MSRs outside both ranges always do.
    pub fn is_wrmsr_intercepted(&self, msr: u32) -> bool {
        match Self::msr_range(msr) {
            Some(offset) => self.bit(2 * RANGE_SIZE + offset + Self::msr_offset(msr)),
            None => true,
        }
    }

    fn msr_offset(msr: u32) -> u32 {
        msr & 0x1fff
    }

    /// Returns the bit offset of the read range for the specified MSR.
    fn msr_range(msr: u32) -> Option<u32> {
        if (0x0000_0000..=0x0000_1FFF).contains(&msr) {
            Some(0)
        } else if (0xC000_0000..=0xC000_1FFF).contains(&msr) {
            Some(RANGE_SIZE)
        } else {
            None
        }
    }

    fn as_bytes(&self) -> &[u8; BASE_PAGE_SIZE] {
        // SAFETY: `repr(C)` struct of byte arrays with the size asserted above.
        unsafe { &*(self as *const Self as *const [u8; BASE_PAGE_SIZE]) }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8; BASE_PAGE_SIZE] {
        // SAFETY: See `as_bytes`.
        unsafe { &mut *(self as *mut Self as *mut [u8; BASE_PAGE_SIZE]) }
    }

    fn bit(&self, bit: u32) -> bool {
        self.as_bytes()[(bit / CHAR_BIT) as usize] & (1 << (bit % CHAR_BIT)) != 0
    }

    fn set_bit(&mut self, bit: u32) {
        self.as_bytes_mut()[(bit / CHAR_BIT) as usize] |= 1 << (bit % CHAR_BIT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::msr::{IA32_EFER, IA32_PAT};

    #[test]
    fn test_hooks() {
        let mut bitmap = MsrBitmap::new();
        bitmap.hook_rdmsr(IA32_PAT);
        bitmap.hook_wrmsr(IA32_EFER);

        assert!(bitmap.is_rdmsr_intercepted(IA32_PAT));
        assert!(!bitmap.is_wrmsr_intercepted(IA32_PAT));
        assert!(bitmap.is_wrmsr_intercepted(IA32_EFER));
        assert!(!bitmap.is_rdmsr_intercepted(IA32_EFER));

        // IA32_EFER (0xC000_0080) lands in the write-high quarter.
        assert_eq!(bitmap.write_high[0x80 / 8], 1);
    }

    #[test]
    fn test_out_of_range_msrs_exit() {
        let bitmap = MsrBitmap::new();
        assert!(bitmap.is_rdmsr_intercepted(0x4000_0000));
        assert!(bitmap.is_wrmsr_intercepted(0xc001_0000));
        assert!(!bitmap.is_rdmsr_intercepted(0x10));
    }
}
