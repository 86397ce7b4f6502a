use x86::bits64::paging::BASE_PAGE_SIZE;
use x86_64::VirtAddr;

pub const PAGE_SIZE: u64 = BASE_PAGE_SIZE as u64;
pub const PAGE_SHIFT: u64 = 12;
pub const PAGE_OFFSET_MASK: u64 = PAGE_SIZE - 1;

/// PAE page-directory-pointer-table entry bits.
pub const PDPTE_P: u64 = 1 << 0;
const PDPTE_RSVD_LOW: u64 = 0b1_1110_0110;

pub fn is_page_aligned(addr: u64) -> bool {
    addr & PAGE_OFFSET_MASK == 0
}

/// Returns whether the physical address can be expressed with `width` address bits.
pub fn fits_phys_width(addr: u64, width: u8) -> bool {
    width >= 64 || addr >> width == 0
}

/// Returns whether bits 63:47 of the address are copies of bit 47.
pub fn is_canonical(addr: u64) -> bool {
    VirtAddr::new_truncate(addr).as_u64() == addr
}

/// Returns whether a PAE PDPTE can be loaded into the PDPTE registers.
///
/// An entry that is not present is never checked. A present entry must have bits 2:1, 8:5 and
/// everything above the physical-address width clear.
pub fn is_pdpte_valid(pdpte: u64, phys_width: u8) -> bool {
    if pdpte & PDPTE_P == 0 {
        return true;
    }

    let high = if phys_width >= 64 { 0 } else { !((1u64 << phys_width) - 1) };
    pdpte & (PDPTE_RSVD_LOW | high) == 0
}
