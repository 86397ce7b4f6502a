use crate::{platform::Platform, vmx::error::VmxResult};
use alloc::boxed::Box;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// I/O bitmaps A (ports 0000-7FFF) and B (ports 8000-FFFF).
///
/// See `25.6.4 I/O-Bitmap Addresses`.
#[derive(Clone)]
pub struct IoBitmaps {
    pub a: [u8; BASE_PAGE_SIZE],
    pub b: [u8; BASE_PAGE_SIZE],
}

impl IoBitmaps {
    pub fn new() -> Box<Self> {
        Box::new(Self {
            a: [0; BASE_PAGE_SIZE],
            b: [0; BASE_PAGE_SIZE],
        })
    }

    pub fn load(&mut self, platform: &dyn Platform, gpa_a: u64, gpa_b: u64) -> VmxResult<()> {
        platform.read_phys(gpa_a, &mut self.a)?;
        platform.read_phys(gpa_b, &mut self.b)
    }

    pub fn hook_port(&mut self, port: u16) {
        let bitmap = if port < 0x8000 { &mut self.a } else { &mut self.b };
        let bit = (port & 0x7fff) as usize;
        bitmap[bit / 8] |= 1 << (bit % 8);
    }

    fn is_port_set(&self, port: u16) -> bool {
        let bitmap = if port < 0x8000 { &self.a } else { &self.b };
        let bit = (port & 0x7fff) as usize;
        bitmap[bit / 8] & (1 << (bit % 8)) != 0
    }

    /// Whether an access of `size` bytes at `port` exits. An access that wraps past port FFFF always
    /// does.
    pub fn is_intercepted(&self, port: u16, size: u8) -> bool {
        let last = port as u32 + size.max(1) as u32 - 1;
        if last > 0xffff {
            return true;
        }

        (port as u32..=last).any(|port| self.is_port_set(port as u16))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ports() {
        let mut bitmaps = IoBitmaps::new();
        bitmaps.hook_port(0x60);
        bitmaps.hook_port(0x8001);

        assert!(bitmaps.is_intercepted(0x60, 1));
        assert!(bitmaps.is_intercepted(0x5f, 2));
        assert!(!bitmaps.is_intercepted(0x61, 4));
        assert!(bitmaps.is_intercepted(0x7fff, 4));
        assert!(bitmaps.is_intercepted(0xfffe, 4));
        assert_eq!(bitmaps.b[0], 0b10);
    }
}
