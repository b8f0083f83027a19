//! Page frames handed to the engine by the host kernel.

use core::ptr::NonNull;

/// One 4 KiB page with both its host-physical and host-virtual address.
#[derive(Debug, PartialEq, Eq)]
pub struct PhysPage {
    pub pa: u64,
    va: NonNull<u8>,
}

// The page is exclusively owned by whoever holds the `PhysPage`.
unsafe impl Send for PhysPage {}

impl PhysPage {
    /// # Safety
    ///
    /// `va` must map `pa`, be 4 KiB aligned, and stay valid and exclusively owned until the page is freed.
    pub unsafe fn new(pa: u64, va: NonNull<u8>) -> Self {
        Self { pa, va }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.va.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.va.as_ptr(), crate::config::PAGE_SIZE) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.va.as_ptr(), crate::config::PAGE_SIZE) }
    }

    pub fn zero(&mut self) {
        self.as_mut_slice().fill(0);
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.as_slice()[offset]
    }

    pub fn write_u8(&mut self, offset: usize, value: u8) {
        self.as_mut_slice()[offset] = value;
    }

    pub fn read_u32(&self, offset: usize) -> u32 {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.as_slice()[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn write_u32(&mut self, offset: usize, value: u32) {
        self.as_mut_slice()[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    pub fn read_u64(&self, offset: usize) -> u64 {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&self.as_slice()[offset..offset + 8]);
        u64::from_le_bytes(bytes)
    }

    pub fn write_u64(&mut self, offset: usize, value: u64) {
        self.as_mut_slice()[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }
}

/// Source of zeroable, physically contiguous single pages.
pub trait PageAllocator {
    fn allocate_page(&mut self) -> Option<PhysPage>;
    fn free_page(&mut self, page: PhysPage);
}
