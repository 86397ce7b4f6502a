pub mod auto_msr;
pub mod io_bitmap;
pub mod msr_bitmap;
pub mod shared_data;
pub mod vcpu_data;
pub mod vmcs_bitmap;
