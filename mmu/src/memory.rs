use std::sync::Arc;

use parking_lot::{ReentrantMutex, ReentrantMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::address_space::AddressSpace;
use crate::page::{PageFlags, PageFlagsTable};

/// The guest memory state shared by every vCPU: the external address
/// space, the page flags table and the big lock.
pub struct MemoryMap {
    space: Arc<dyn AddressSpace>,
    pages: RwLock<PageFlagsTable>,
    big_lock: ReentrantMutex<()>,
}

impl MemoryMap {
    pub fn new(space: Arc<dyn AddressSpace>) -> Self {
        Self {
            space,
            pages: RwLock::new(PageFlagsTable::new()),
            big_lock: ReentrantMutex::new(()),
        }
    }

    pub fn space(&self) -> &dyn AddressSpace {
        &*self.space
    }

    pub fn page_flags(&self, addr: u64) -> PageFlags {
        self.pages.read().get_flags(addr)
    }

    pub fn pages(&self) -> RwLockReadGuard<'_, PageFlagsTable> {
        self.pages.read()
    }

    /// Writers must go through the invalidation interface so TLBs and
    /// translated code stay coherent with the table.
    pub fn pages_mut(&self) -> RwLockWriteGuard<'_, PageFlagsTable> {
        self.pages.write()
    }

    /// Serializes device dispatch, TLB refills and every change to the
    /// page flags or the translated-code index. Taken after an
    /// exclusive section and before the page flags lock.
    pub fn big_lock(&self) -> ReentrantMutexGuard<'_, ()> {
        self.big_lock.lock()
    }
}
