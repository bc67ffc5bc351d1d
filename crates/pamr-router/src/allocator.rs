//! Dynamic AgentID allocation.

use pamr_types::{AgentId, PamrError, PamrResult};

/// Hands out dynamic ids from a monotonic counter starting at
/// [`AgentId::MIN_DYNAMIC`].
///
/// Ids are never reused: once the counter passes [`AgentId::MAX_DYNAMIC`]
/// every further allocation fails with [`PamrError::CapacityExhausted`].
#[derive(Debug)]
pub struct AgentIdAllocator {
    next: Option<u32>,
}

impl AgentIdAllocator {
    pub fn new() -> Self {
        Self::starting_at(AgentId::MIN_DYNAMIC)
    }

    fn starting_at(first: u32) -> Self {
        Self { next: Some(first) }
    }

    /// Next free dynamic id.
    pub fn allocate(&mut self) -> PamrResult<AgentId> {
        let raw = self.next.ok_or(PamrError::CapacityExhausted)?;
        self.next = raw.checked_add(1).filter(|n| *n <= AgentId::MAX_DYNAMIC);
        AgentId::new(raw)
    }
}

impl Default for AgentIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_dynamic_id() {
        let mut alloc = AgentIdAllocator::new();
        assert_eq!(alloc.allocate().unwrap().get(), 4096);
        assert_eq!(alloc.allocate().unwrap().get(), 4097);
    }

    #[test]
    fn test_allocated_ids_are_never_reservable() {
        let mut alloc = AgentIdAllocator::new();
        for _ in 0..100 {
            assert!(!alloc.allocate().unwrap().is_reserved());
        }
    }

    #[test]
    fn test_exhaustion_is_fatal_not_wrapping() {
        let mut alloc = AgentIdAllocator::starting_at(AgentId::MAX_DYNAMIC);
        assert_eq!(alloc.allocate().unwrap().get(), AgentId::MAX_DYNAMIC);
        assert!(matches!(alloc.allocate(), Err(PamrError::CapacityExhausted)));
        assert!(matches!(alloc.allocate(), Err(PamrError::CapacityExhausted)));
    }
}
