pub mod logger;
pub mod msr;
pub mod paging;
