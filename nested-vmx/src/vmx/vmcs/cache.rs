use crate::{
    platform::Platform,
    vmx::{
        error::VmxResult,
        vmcs::{LaunchState, Vmcs},
    },
};
use alloc::boxed::Box;
use x86::bits64::paging::BASE_PAGE_SIZE;

/// In-memory copy of the VMCS a guest hypervisor made current.
///
/// The copy and the guest-memory image are only synchronized by [`VmcsCache::load`] and
/// [`VmcsCache::flush`].
pub struct VmcsCache {
    gpa: Option<u64>,
    vmcs: Box<Vmcs>,
    dirty: bool,
}

impl Default for VmcsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl VmcsCache {
    pub fn new() -> Self {
        Self {
            gpa: None,
            vmcs: Box::new(Vmcs::new()),
            dirty: false,
        }
    }

    pub fn gpa(&self) -> Option<u64> {
        self.gpa
    }

    pub fn is_current(&self) -> bool {
        self.gpa.is_some()
    }

    /// The cached VMCS. Callers check [`VmcsCache::is_current`] first.
    pub fn vmcs(&self) -> &Vmcs {
        &self.vmcs
    }

    /// The cached VMCS for modification; marks the cache dirty.
    pub fn vmcs_mut(&mut self) -> &mut Vmcs {
        self.dirty = true;
        &mut self.vmcs
    }

    /// Flushes the current VMCS (if dirty) and makes the VMCS at `gpa` current.
    pub fn load(&mut self, platform: &mut dyn Platform, gpa: u64) -> VmxResult<()> {
        if self.gpa == Some(gpa) {
            return Ok(());
        }

        self.flush(platform)?;

        let mut bytes = [0u8; BASE_PAGE_SIZE];
        platform.read_phys(gpa, &mut bytes)?;
        *self.vmcs = Vmcs::from_bytes(&bytes);
        self.gpa = Some(gpa);
        self.dirty = false;

        Ok(())
    }

    /// Writes the cached copy back to guest memory if it was modified.
    pub fn flush(&mut self, platform: &mut dyn Platform) -> VmxResult<()> {
        let Some(gpa) = self.gpa else { return Ok(()) };
        if !self.dirty {
            return Ok(());
        }

        log::trace!("Flushing VMCS at {:#x}", gpa);
        platform.write_phys(gpa, self.vmcs.as_bytes())?;
        self.dirty = false;

        Ok(())
    }

    /// Forgets the current VMCS without writing it back.
    pub fn evict(&mut self) {
        self.gpa = None;
        self.dirty = false;
    }

    /// Marks the VMCS at `gpa` clear, whether or not it is current, and writes it to guest memory.
    /// A current VMCS stops being current.
    pub fn clear(&mut self, platform: &mut dyn Platform, gpa: u64) -> VmxResult<()> {
        if self.gpa == Some(gpa) {
            self.vmcs_mut().set_launch_state(LaunchState::Clear);
            self.flush(platform)?;
            self.evict();
            return Ok(());
        }

        let mut bytes = [0u8; BASE_PAGE_SIZE];
        platform.read_phys(gpa, &mut bytes)?;
        let mut vmcs = Vmcs::from_bytes(&bytes);
        vmcs.set_launch_state(LaunchState::Clear);
        platform.write_phys(gpa, vmcs.as_bytes())
    }
}
