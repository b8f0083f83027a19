//! VM-entry/VM-exit MSR load and store areas.
//!
//! Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.7.2 VM-Exit Controls for MSRs

use {
    crate::{config::MAX_AUTOLOAD_MSRS, error::HypervisorError, intel::page::PhysPage},
    x86::msr,
};

/// Size of one `{index, reserved, value}` entry.
const ENTRY_SIZE: usize = 16;

/// MSRs the engine ever places in an autoload area.
pub const AUTOLOAD_MSRS: [u32; 5] = [msr::IA32_EFER, msr::IA32_STAR, msr::IA32_LSTAR, msr::IA32_FMASK, msr::IA32_KERNEL_GSBASE];

/// An autoload area backed by one page, filled front to back.
pub struct MsrArea<'a> {
    page: &'a mut PhysPage,
    count: usize,
}

impl<'a> MsrArea<'a> {
    /// Wraps `page` holding `count` valid entries.
    pub fn new(page: &'a mut PhysPage, count: usize) -> Self {
        Self {
            page,
            count: count.min(MAX_AUTOLOAD_MSRS),
        }
    }

    pub fn count(&self) -> usize {
        self.count
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }

    pub fn push(&mut self, index: u32, value: u64) -> Result<(), HypervisorError> {
        if self.count == MAX_AUTOLOAD_MSRS {
            return Err(HypervisorError::OutOfMemory);
        }
        let offset = self.count * ENTRY_SIZE;
        self.page.write_u32(offset, index);
        self.page.write_u32(offset + 4, 0);
        self.page.write_u64(offset + 8, value);
        self.count += 1;
        Ok(())
    }

    pub fn entry(&self, slot: usize) -> Option<(u32, u64)> {
        if slot >= self.count {
            return None;
        }
        let offset = slot * ENTRY_SIZE;
        Some((self.page.read_u32(offset), self.page.read_u64(offset + 8)))
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, u64)> + '_ {
        (0..self.count).filter_map(|slot| self.entry(slot))
    }

    pub fn get(&self, index: u32) -> Option<u64> {
        self.iter().find(|(i, _)| *i == index).map(|(_, value)| value)
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{intel::page::PageAllocator, testing::TestPageAllocator},
    };

    #[test]
    fn entries_use_the_hardware_layout() {
        let mut allocator = TestPageAllocator::new();
        let mut page = allocator.allocate_page().unwrap();

        {
            let mut area = MsrArea::new(&mut page, 0);
            area.push(msr::IA32_EFER, 0xD01).unwrap();
            area.push(msr::IA32_LSTAR, 0xFFFF_8000_0000_1000).unwrap();
            assert_eq!(area.count(), 2);
            assert_eq!(area.get(msr::IA32_LSTAR), Some(0xFFFF_8000_0000_1000));
            assert_eq!(area.get(msr::IA32_STAR), None);
        }

        assert_eq!(page.read_u32(16), msr::IA32_LSTAR);
        assert_eq!(page.read_u32(20), 0);
        assert_eq!(page.read_u64(24), 0xFFFF_8000_0000_1000);
        allocator.free_page(page);
    }
}
