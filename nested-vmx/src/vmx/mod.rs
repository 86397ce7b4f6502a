use crate::vmx::{data::shared_data::SharedData, features::VmxFeatures, vcpu::Vcpu};
use alloc::{sync::Arc, vec::Vec};

pub mod apic;
pub mod checks;
pub mod data;
pub mod diag;
pub mod error;
pub mod events;
pub mod features;
pub mod instr;
pub mod intercept;
pub mod vcpu;
pub mod vmcs;
pub mod vmentry;
pub mod vmexit;

/// Highest number of virtual CPUs, bounded by the APIC-access trap owner mask.
pub const MAX_VCPUS: u32 = 64;

#[derive(Default)]
pub struct NestedVmxBuilder {
    features: Option<VmxFeatures>,
    vcpu_count: u32,
}

impl NestedVmxBuilder {
    /// Sets the VMX features exposed to the guest hypervisor.
    #[must_use]
    pub fn features(mut self, features: VmxFeatures) -> Self {
        self.features = Some(features);
        self
    }

    /// Sets the number of virtual CPUs.
    #[must_use]
    pub fn vcpus(mut self, count: u32) -> Self {
        self.vcpu_count = count;
        self
    }

    pub fn build(self) -> Option<NestedVmx> {
        let features = self.features.unwrap_or_default();
        if let Err(reason) = features.validate() {
            log::error!("Invalid VMX feature set: {}", reason);
            return None;
        }

        if self.vcpu_count == 0 || self.vcpu_count > MAX_VCPUS {
            log::error!("Unsupported number of virtual CPUs: {}", self.vcpu_count);
            return None;
        }

        let shared_data = Arc::new(SharedData::new(features));

        let mut vcpus = Vec::new();
        for i in 0..self.vcpu_count {
            vcpus.push(Vcpu::new(i, shared_data.clone()));
        }
        log::info!("Created {} virtual CPUs with nested VMX", vcpus.len());

        Some(NestedVmx { shared_data, vcpus })
    }
}

pub struct NestedVmx {
    shared_data: Arc<SharedData>,
    vcpus: Vec<Vcpu>,
}

impl NestedVmx {
    pub fn builder() -> NestedVmxBuilder {
        NestedVmxBuilder::default()
    }

    pub fn features(&self) -> &VmxFeatures {
        &self.shared_data.features
    }

    pub fn vcpu(&self, id: u32) -> Option<&Vcpu> {
        self.vcpus.get(id as usize)
    }

    pub fn vcpu_mut(&mut self, id: u32) -> Option<&mut Vcpu> {
        self.vcpus.get_mut(id as usize)
    }

    pub fn vcpus_mut(&mut self) -> impl Iterator<Item = &mut Vcpu> {
        self.vcpus.iter_mut()
    }
}
