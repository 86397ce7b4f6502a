use crate::vmx::features::VmxFeatures;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use spin::RwLock;

/// APIC-access pages registered with the platform, keyed by guest-physical address. The value is the
/// mask of virtual CPUs that currently use the page.
pub struct ApicAccessRegistry {
    pages: RwLock<HashMap<u64, u64, FnvBuildHasher>>,
}

impl ApicAccessRegistry {
    pub fn new() -> Self {
        Self {
            pages: RwLock::new(HashMap::with_hasher(FnvBuildHasher::default())),
        }
    }

    /// Records that `vcpu` uses the page. Returns whether the page was not registered before.
    pub fn register(&self, gpa: u64, vcpu: u32) -> bool {
        let mut pages = self.pages.write();
        let owners = pages.entry(gpa).or_insert(0);
        let first = *owners == 0;
        *owners |= 1 << vcpu;

        first
    }

    /// Drops `vcpu` from the page. Returns whether no virtual CPU uses the page anymore.
    pub fn deregister(&self, gpa: u64, vcpu: u32) -> bool {
        let mut pages = self.pages.write();
        let Some(owners) = pages.get_mut(&gpa) else { return false };

        *owners &= !(1 << vcpu);
        if *owners != 0 {
            return false;
        }

        pages.remove(&gpa);
        true
    }

    pub fn is_owner(&self, gpa: u64, vcpu: u32) -> bool {
        self.pages
            .read()
            .get(&gpa)
            .map(|owners| owners & (1 << vcpu) != 0)
            .unwrap_or_default()
    }
}

impl Default for ApicAccessRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by all virtual CPUs.
pub struct SharedData {
    pub features: VmxFeatures,
    pub apic_access: ApicAccessRegistry,
}

impl SharedData {
    pub fn new(features: VmxFeatures) -> Self {
        log::info!("Creating shared data");

        Self {
            features,
            apic_access: ApicAccessRegistry::new(),
        }
    }
}
