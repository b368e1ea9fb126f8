use crate::{host::TranslationHost, Gpa, Gva};

const PRESENT: u32 = 1 << 0;
const LARGE_PAGE: u32 = 1 << 7;
const FRAME_MASK: u32 = !0xFFF;
const LARGE_FRAME_MASK: u32 = !0x3F_FFFF;

/// Resolves `vaddr` under the page directory at `pgd`, reading page tables through
/// [`TranslationHost::read_physical_memory`].
///
/// Walks 32-bit non-PAE paging with 4 KiB and 4 MiB pages. Analysis code uses this to
/// translate addresses of a process other than the one currently scheduled.
///
/// # Arguments
///
/// * `host` - Source of guest physical memory
/// * `pgd` - Physical address of the page directory (the CR3 value)
/// * `vaddr` - Guest virtual address to translate
///
/// # Returns
///
/// The physical address, or `None` if a directory or table entry is not present.
///
/// # Examples
///
/// ```rust
/// use vmscope::host::{translate_with_page_directory, RecordingHost};
///
/// let mut host = RecordingHost::new();
/// // PDE 1 points at the page table at 0x5000, PTE 2 maps frame 0x9000
/// host.write_physical(0x4000 + 4, 0x5000 | 1);
/// host.write_physical(0x5000 + 8, 0x9000 | 1);
///
/// assert_eq!(translate_with_page_directory(&mut host, 0x4000, 0x0040_2123), Some(0x9123));
/// ```
pub fn translate_with_page_directory(
    host: &mut dyn TranslationHost,
    pgd: Gpa,
    vaddr: Gva,
) -> Option<Gpa> {
    let pde_addr = (pgd & FRAME_MASK) | ((vaddr >> 22) << 2);
    let pde = host.read_physical_memory(pde_addr);
    if pde & PRESENT == 0 {
        return None;
    }
    if pde & LARGE_PAGE != 0 {
        return Some((pde & LARGE_FRAME_MASK) | (vaddr & !LARGE_FRAME_MASK));
    }

    let pte_addr = (pde & FRAME_MASK) | (((vaddr >> 12) & 0x3FF) << 2);
    let pte = host.read_physical_memory(pte_addr);
    if pte & PRESENT == 0 {
        return None;
    }
    Some((pte & FRAME_MASK) | (vaddr & 0xFFF))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::RecordingHost;

    #[test]
    fn small_page() {
        let mut host = RecordingHost::new();
        host.write_physical(0x1000 + (0x3FF << 2), 0x2000 | PRESENT);
        host.write_physical(0x2000 + (0x3FF << 2), 0x0012_3000 | PRESENT);

        assert_eq!(
            translate_with_page_directory(&mut host, 0x1000, 0xFFFF_FABC),
            Some(0x0012_3ABC)
        );
    }

    #[test]
    fn large_page() {
        let mut host = RecordingHost::new();
        host.write_physical(0x1000 + (2 << 2), 0x0C00_0000 | LARGE_PAGE | PRESENT);

        assert_eq!(
            translate_with_page_directory(&mut host, 0x1000, 0x0081_2345),
            Some(0x0C01_2345)
        );
    }

    #[test]
    fn not_present() {
        let mut host = RecordingHost::new();
        assert_eq!(translate_with_page_directory(&mut host, 0x1000, 0x1234), None);

        host.write_physical(0x1000, 0x2000 | PRESENT);
        assert_eq!(translate_with_page_directory(&mut host, 0x1000, 0x1234), None);
    }
}
