use crate::{platform::Platform, vmx::error::VmxResult};
use alloc::boxed::Box;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// A VMREAD or VMWRITE bitmap. A set bit makes the access from non-root mode exit instead of being
/// redirected to the shadow VMCS.
///
/// See `25.6.15 VMCS Shadowing Bitmap Addresses`.
#[derive(Clone)]
pub struct VmcsBitmap([u8; BASE_PAGE_SIZE]);

impl VmcsBitmap {
    pub fn new() -> Box<Self> {
        Box::new(Self([0; BASE_PAGE_SIZE]))
    }

    pub fn load(&mut self, platform: &dyn Platform, gpa: u64) -> VmxResult<()> {
        platform.read_phys(gpa, &mut self.0)
    }

    pub fn set(&mut self, encoding: u64) {
        let bit = (encoding & 0x7fff) as usize;
        self.0[bit / 8] |= 1 << (bit % 8);
    }

    /// Encodings with any of bits 63:15 set always exit.
    pub fn is_intercepted(&self, encoding: u64) -> bool {
        if encoding >> 15 != 0 {
            return true;
        }

        let bit = encoding as usize;
        self.0[bit / 8] & (1 << (bit % 8)) != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bitmap() {
        let mut bitmap = VmcsBitmap::new();
        bitmap.set(0x681e);

        assert!(bitmap.is_intercepted(0x681e));
        assert!(!bitmap.is_intercepted(0x6820));
        assert!(bitmap.is_intercepted(0x1_0000));
    }
}
