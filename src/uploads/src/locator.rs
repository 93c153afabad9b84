//! Resource locators: handles into whole resources or pool-managed ranges.

use crate::batched::ResourceReposition;
use crate::{CommandListId, COMMAND_LIST_ID_INVALID};
use hal::{Resource, ResourceDesc};
use std::fmt;
use std::sync::{Arc, Weak};

const WHOLE: u64 = !0u64;

/// A pool of sub-allocated resources; the batched allocator is the canonical
/// implementation, but clients may plug their own.
pub trait ResourcePool: Send + Sync {
    /// Allocate `size` bytes from the pool. Returns an empty locator when the
    /// pool cannot satisfy the request (for example, it exceeds a page).
    fn allocate(&self, size: u32, name: &str) -> ResourceLocator;

    /// The descriptor to create a dedicated resource with when `allocate`
    /// declines the request.
    fn make_fallback_desc(&self, size: u32, name: &str) -> ResourceDesc;

    /// Add a reference on a range previously allocated from this pool.
    fn add_ref(&self, pool_marker: u64, resource: &Arc<dyn Resource>, offset: u64, size: u64);

    /// Release a reference on a range previously allocated from this pool.
    fn release(&self, pool_marker: u64, resource: &Arc<dyn Resource>, offset: u64, size: u64);
}

/// Handle to a resource, or to an interior range of one, optionally managed
/// by a pool.
///
/// Copying takes a pool reference for the range, dropping releases it; a
/// locator therefore releases exactly once over its lifetime.
pub struct ResourceLocator {
    resource: Option<Arc<dyn Resource>>,
    interior_offset: u64,
    interior_size: u64,
    pool: Option<Weak<dyn ResourcePool>>,
    pool_marker: u64,
    managed_by_pool: bool,
    completion_command_list: CommandListId,
}

impl ResourceLocator {
    /// An empty locator.
    pub fn empty() -> Self {
        ResourceLocator {
            resource: None,
            interior_offset: WHOLE,
            interior_size: WHOLE,
            pool: None,
            pool_marker: 0,
            managed_by_pool: false,
            completion_command_list: COMMAND_LIST_ID_INVALID,
        }
    }

    /// A locator owning a whole resource outright.
    pub fn whole(resource: Arc<dyn Resource>) -> Self {
        let mut locator = Self::empty();
        locator.resource = Some(resource);
        locator
    }

    /// A locator describing an interior range without pool management.
    pub fn range(resource: Arc<dyn Resource>, offset: u64, size: u64) -> Self {
        let mut locator = Self::empty();
        locator.resource = Some(resource);
        locator.interior_offset = offset;
        locator.interior_size = size;
        locator
    }

    /// A pool-managed locator. When `initial_ref_already_taken` is false, a
    /// reference is taken here; the batched allocator takes it beforehand to
    /// avoid a second page lookup.
    pub fn pooled(
        resource: Arc<dyn Resource>,
        offset: u64,
        size: u64,
        pool: Weak<dyn ResourcePool>,
        pool_marker: u64,
        initial_ref_already_taken: bool,
    ) -> Self {
        if !initial_ref_already_taken {
            if let Some(pool) = pool.upgrade() {
                pool.add_ref(pool_marker, &resource, offset, size);
            }
        }
        ResourceLocator {
            resource: Some(resource),
            interior_offset: offset,
            interior_size: size,
            pool: Some(pool),
            pool_marker,
            managed_by_pool: true,
            completion_command_list: COMMAND_LIST_ID_INVALID,
        }
    }

    /// Rebuild `from` with a completion command list attached.
    pub fn with_completion(mut from: ResourceLocator, id: CommandListId) -> Self {
        from.completion_command_list = id;
        from
    }

    /// Whether the locator points at anything.
    pub fn is_empty(&self) -> bool {
        self.resource.is_none()
    }

    /// Whether the locator covers its whole resource.
    pub fn is_whole_resource(&self) -> bool {
        self.interior_offset == WHOLE && self.interior_size == WHOLE
    }

    /// The resource the locator points into.
    pub fn containing_resource(&self) -> Option<&Arc<dyn Resource>> {
        self.resource.as_ref()
    }

    /// The byte range within the containing resource, or `(0, byte_count)`
    /// for whole-resource locators.
    pub fn range_in_containing_resource(&self) -> (u64, u64) {
        if self.is_whole_resource() {
            let size = self
                .resource
                .as_ref()
                .map(|r| u64::from(r.desc().byte_count()))
                .unwrap_or(0);
            (0, size)
        } else {
            (self.interior_offset, self.interior_offset + self.interior_size)
        }
    }

    /// Raw interior offset; `u64::MAX` for whole-resource locators.
    pub fn interior_offset(&self) -> u64 {
        self.interior_offset
    }

    /// The command list that must retire on the graphics queue before the
    /// contents are visible there.
    pub fn completion_command_list(&self) -> CommandListId {
        self.completion_command_list
    }

    /// The pool managing this range, if any.
    pub fn pool(&self) -> Option<&Weak<dyn ResourcePool>> {
        self.pool.as_ref()
    }

    /// The marker the pool associated with this locator's page.
    pub fn pool_marker(&self) -> u64 {
        self.pool_marker
    }

    /// The resource, provided the locator covers all of it.
    pub fn as_independent_resource(&self) -> Option<Arc<dyn Resource>> {
        if self.is_whole_resource() {
            self.resource.clone()
        } else {
            None
        }
    }

    /// A locator for a sub-range, carrying the same pool-management flag and
    /// completion id but *not* taking a new pool reference; the caller is
    /// responsible for the reference accounting.
    pub fn make_sub_locator(&self, offset: u64, size: u64) -> Self {
        let base = if self.is_whole_resource() { 0 } else { self.interior_offset };
        ResourceLocator {
            resource: self.resource.clone(),
            interior_offset: base + offset,
            interior_size: size,
            pool: self.pool.clone(),
            pool_marker: self.pool_marker,
            managed_by_pool: self.managed_by_pool,
            completion_command_list: self.completion_command_list,
        }
    }

    /// Rebuild this locator at a new home, preserving its pool accounting:
    /// a pool-managed locator takes a reference on the new range (the old
    /// range's reference releases with `self`), an unmanaged one just
    /// re-points.
    pub(crate) fn repositioned(&self, new_resource: &Arc<dyn Resource>, new_offset: u64) -> Self {
        let (start, end) = self.range_in_containing_resource();
        let size = end - start;
        if self.managed_by_pool {
            if let Some(pool) = &self.pool {
                let mut replacement = ResourceLocator::pooled(
                    Arc::clone(new_resource),
                    new_offset,
                    size,
                    pool.clone(),
                    self.pool_marker,
                    false,
                );
                replacement.completion_command_list = self.completion_command_list;
                return replacement;
            }
        }
        let mut replacement = ResourceLocator::range(Arc::clone(new_resource), new_offset, size);
        replacement.completion_command_list = self.completion_command_list;
        replacement
    }

    /// Re-point the locator according to a published reposition event.
    /// Returns true when the locator referenced the moved resource and was
    /// rewritten; the old range's reference is released and a reference is
    /// taken on the new range.
    pub fn apply_reposition(&mut self, event: &ResourceReposition) -> bool {
        let resource = match &self.resource {
            Some(r) => r,
            None => return false,
        };
        if !Arc::ptr_eq(resource, &event.original_resource) {
            return false;
        }
        let (start, end) = self.range_in_containing_resource();
        let size = end - start;
        let new_offset = match event.resolve_offset(start as u32, size as u32) {
            Some(o) => u64::from(o),
            None => return false,
        };
        let replacement = ResourceLocator::pooled(
            Arc::clone(&event.new_resource),
            new_offset,
            size,
            Arc::downgrade(&event.pool),
            event.pool_marker,
            false,
        );
        *self = replacement;
        true
    }
}

impl Default for ResourceLocator {
    fn default() -> Self {
        Self::empty()
    }
}

impl Clone for ResourceLocator {
    fn clone(&self) -> Self {
        if self.managed_by_pool {
            if let (Some(resource), Some(pool)) = (&self.resource, &self.pool) {
                if let Some(pool) = pool.upgrade() {
                    pool.add_ref(
                        self.pool_marker,
                        resource,
                        self.interior_offset,
                        self.interior_size,
                    );
                }
            }
        }
        ResourceLocator {
            resource: self.resource.clone(),
            interior_offset: self.interior_offset,
            interior_size: self.interior_size,
            pool: self.pool.clone(),
            pool_marker: self.pool_marker,
            managed_by_pool: self.managed_by_pool,
            completion_command_list: self.completion_command_list,
        }
    }
}

impl Drop for ResourceLocator {
    fn drop(&mut self) {
        if !self.managed_by_pool {
            return;
        }
        if let (Some(resource), Some(pool)) = (self.resource.take(), self.pool.take()) {
            if let Some(pool) = pool.upgrade() {
                pool.release(
                    self.pool_marker,
                    &resource,
                    self.interior_offset,
                    self.interior_size,
                );
            }
        }
    }
}

impl fmt::Debug for ResourceLocator {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_empty() {
            return write!(f, "ResourceLocator(empty)");
        }
        if self.is_whole_resource() {
            write!(f, "ResourceLocator(whole")?;
        } else {
            write!(
                f,
                "ResourceLocator({:#x}+{:#x}",
                self.interior_offset, self.interior_size
            )?;
        }
        if self.managed_by_pool {
            write!(f, ", pooled")?;
        }
        write!(f, ", cl {})", self.completion_command_list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hal::{AllocationRules, BindFlags};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicI64, Ordering};

    #[derive(Debug)]
    struct NullResource {
        desc: ResourceDesc,
    }

    impl NullResource {
        fn new(size: u32) -> Arc<dyn Resource> {
            Arc::new(NullResource {
                desc: ResourceDesc::linear_buffer(
                    BindFlags::VERTEX_BUFFER,
                    AllocationRules::empty(),
                    size,
                    "null",
                ),
            })
        }
    }

    impl Resource for NullResource {
        fn desc(&self) -> &ResourceDesc {
            &self.desc
        }

        fn as_any(&self) -> &dyn std::any::Any {
            self
        }

        fn mapped_ptr(&self) -> Option<*mut u8> {
            None
        }

        fn write_via_map(&self, _offset: u32, _data: &[u8]) -> Result<(), hal::MapError> {
            Err(hal::MapError::NotHostVisible)
        }

        fn read_via_map(&self, _offset: u32, _out: &mut [u8]) -> Result<(), hal::MapError> {
            Err(hal::MapError::NotHostVisible)
        }
    }

    // counts add_ref/release pairs per range so the exactly-once contract is
    // checkable
    struct CountingPool {
        balance: AtomicI64,
        log: Mutex<Vec<(u64, u64, i64)>>,
    }

    impl CountingPool {
        fn new() -> Arc<Self> {
            Arc::new(CountingPool {
                balance: AtomicI64::new(0),
                log: Mutex::new(Vec::new()),
            })
        }

        fn balance(&self) -> i64 {
            self.balance.load(Ordering::SeqCst)
        }
    }

    impl ResourcePool for CountingPool {
        fn allocate(&self, _size: u32, _name: &str) -> ResourceLocator {
            ResourceLocator::empty()
        }

        fn make_fallback_desc(&self, size: u32, name: &str) -> ResourceDesc {
            ResourceDesc::linear_buffer(
                BindFlags::VERTEX_BUFFER,
                AllocationRules::empty(),
                size,
                name.to_owned(),
            )
        }

        fn add_ref(&self, _marker: u64, _resource: &Arc<dyn Resource>, offset: u64, size: u64) {
            self.balance.fetch_add(1, Ordering::SeqCst);
            self.log.lock().push((offset, size, 1));
        }

        fn release(&self, _marker: u64, _resource: &Arc<dyn Resource>, offset: u64, size: u64) {
            self.balance.fetch_sub(1, Ordering::SeqCst);
            self.log.lock().push((offset, size, -1));
        }
    }

    #[test]
    fn clone_and_drop_release_exactly_once() {
        let pool = CountingPool::new();
        let resource = NullResource::new(0x100);
        let weak: Weak<dyn ResourcePool> = Arc::downgrade(&(pool.clone() as Arc<dyn ResourcePool>));
        let locator = ResourceLocator::pooled(resource, 0x10, 0x20, weak, 7, false);
        assert_eq!(pool.balance(), 1);
        let copy = locator.clone();
        assert_eq!(pool.balance(), 2);
        drop(locator);
        assert_eq!(pool.balance(), 1);
        drop(copy);
        assert_eq!(pool.balance(), 0);

        // every add and release targeted the same range
        for (offset, size, _) in pool.log.lock().iter() {
            assert_eq!((*offset, *size), (0x10, 0x20));
        }
    }

    #[test]
    fn initial_ref_already_taken_skips_the_add() {
        let pool = CountingPool::new();
        let resource = NullResource::new(0x100);
        let weak: Weak<dyn ResourcePool> = Arc::downgrade(&(pool.clone() as Arc<dyn ResourcePool>));
        let locator = ResourceLocator::pooled(resource, 0, 0x40, weak, 0, true);
        assert_eq!(pool.balance(), 0);
        drop(locator);
        // the release still happens; the pool pre-registered the reference
        assert_eq!(pool.balance(), -1);
    }

    #[test]
    fn sub_locator_takes_no_reference_of_its_own() {
        let pool = CountingPool::new();
        let resource = NullResource::new(0x100);
        let weak: Weak<dyn ResourcePool> = Arc::downgrade(&(pool.clone() as Arc<dyn ResourcePool>));
        let locator = ResourceLocator::pooled(resource, 0x20, 0x40, weak, 0, false);
        assert_eq!(pool.balance(), 1);
        let sub = locator.make_sub_locator(0x8, 0x10);
        assert_eq!(pool.balance(), 1);
        assert_eq!(sub.range_in_containing_resource(), (0x28, 0x38));
        // dropping the sub releases the reference the caller was meant to
        // have added for it
        drop(sub);
        assert_eq!(pool.balance(), 0);
        drop(locator);
        assert_eq!(pool.balance(), -1);
    }

    #[test]
    fn dead_pool_upgrade_fails_quietly() {
        let resource = NullResource::new(0x100);
        let weak: Weak<dyn ResourcePool> = {
            let pool = CountingPool::new();
            Arc::downgrade(&(pool.clone() as Arc<dyn ResourcePool>))
        };
        // the pool is gone; construction and drop must not panic
        let locator = ResourceLocator::pooled(resource, 0, 0x10, weak, 0, false);
        drop(locator);
    }

    #[test]
    fn whole_resource_reports_full_range() {
        let resource = NullResource::new(0x100);
        let locator = ResourceLocator::whole(resource);
        assert!(locator.is_whole_resource());
        assert_eq!(locator.range_in_containing_resource(), (0, 0x100));
        assert!(locator.as_independent_resource().is_some());

        let ranged = locator.make_sub_locator(0x10, 0x20);
        assert!(!ranged.is_whole_resource());
        assert!(ranged.as_independent_resource().is_none());
    }

    #[test]
    fn with_completion_preserves_everything_else() {
        let resource = NullResource::new(0x100);
        let locator = ResourceLocator::range(resource, 0x10, 0x20);
        let stamped = ResourceLocator::with_completion(locator, 42);
        assert_eq!(stamped.completion_command_list(), 42);
        assert_eq!(stamped.range_in_containing_resource(), (0x10, 0x30));
    }
}
