//! Registry of emulated device objects and memory

use crate::error::{Error, Result};
use crate::runtime::ResourceId;
use std::collections::HashMap;

/// Kind of a registered object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) enum ObjectKind {
    Image,
    Buffer,
}

/// Memory binding of a registered object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(super) struct Binding {
    pub(super) allocation: ResourceId,
    /// True if the allocation was made for this object and dies with it
    pub(super) owned: bool,
}

#[derive(Debug)]
pub(super) struct ObjectRecord {
    pub(super) kind: ObjectKind,
    pub(super) binding: Option<Binding>,
}

/// Device memory and object registry
#[derive(Debug, Default)]
pub(super) struct HostMemory {
    budget: Option<u64>,
    allocations: HashMap<ResourceId, Vec<u8>>,
    objects: HashMap<ResourceId, ObjectRecord>,
    bytes_in_use: u64,
}

impl HostMemory {
    pub(super) fn new(budget: Option<u64>) -> Self {
        Self {
            budget,
            ..Self::default()
        }
    }

    /// Allocate `size` zeroed bytes, honouring the budget
    pub(super) fn allocate(&mut self, size: u64) -> Result<ResourceId> {
        if size == 0 {
            return Err(Error::allocation_failure(0, "zero-sized allocation"));
        }
        if let Some(budget) = self.budget {
            let available = budget.saturating_sub(self.bytes_in_use);
            if size > available {
                return Err(Error::allocation_failure(
                    size,
                    format!("memory budget exhausted ({available} of {budget} bytes available)"),
                ));
            }
        }
        let len = usize::try_from(size)
            .map_err(|_| Error::allocation_failure(size, "exceeds host address space"))?;

        let id = ResourceId::next();
        self.allocations.insert(id, vec![0u8; len]);
        self.bytes_in_use += size;
        Ok(id)
    }

    /// Release an allocation; returns false if it was unknown
    pub(super) fn free(&mut self, id: ResourceId) -> bool {
        match self.allocations.remove(&id) {
            Some(bytes) => {
                self.bytes_in_use -= bytes.len() as u64;
                true
            }
            None => false,
        }
    }

    pub(super) fn register(&mut self, id: ResourceId, kind: ObjectKind) {
        self.objects.insert(id, ObjectRecord { kind, binding: None });
    }

    pub(super) fn bind(&mut self, id: ResourceId, binding: Binding) -> Result<()> {
        let record = self.objects.get_mut(&id).ok_or_else(|| {
            Error::Backend(format!("bind on unknown object {id}"))
        })?;
        if !self.allocations.contains_key(&binding.allocation) {
            return Err(Error::precondition(
                "bind",
                format!("allocation {} has been freed", binding.allocation),
            ));
        }
        record.binding = Some(binding);
        Ok(())
    }

    /// Remove an object, releasing memory it owns
    pub(super) fn destroy(&mut self, id: ResourceId) -> Option<ObjectKind> {
        let record = self.objects.remove(&id)?;
        if let Some(Binding {
            allocation,
            owned: true,
        }) = record.binding
        {
            self.free(allocation);
        }
        Some(record.kind)
    }

    /// Objects still bound to `allocation`
    pub(super) fn users_of(&self, allocation: ResourceId) -> usize {
        self.objects
            .values()
            .filter(|r| r.binding.is_some_and(|b| b.allocation == allocation))
            .count()
    }

    pub(super) fn object(&self, id: ResourceId) -> Option<&ObjectRecord> {
        self.objects.get(&id)
    }

    /// Backing bytes of a bound object
    pub(super) fn bytes_mut(&mut self, id: ResourceId) -> Result<&mut [u8]> {
        let binding = self
            .objects
            .get(&id)
            .and_then(|r| r.binding)
            .ok_or_else(|| Error::precondition("memory access", format!("object {id} has no memory")))?;
        self.allocations
            .get_mut(&binding.allocation)
            .map(|v| v.as_mut_slice())
            .ok_or_else(|| Error::Backend(format!("allocation {} vanished", binding.allocation)))
    }

    pub(super) fn bytes_in_use(&self) -> u64 {
        self.bytes_in_use
    }

    pub(super) fn object_count(&self, kind: ObjectKind) -> usize {
        self.objects.values().filter(|r| r.kind == kind).count()
    }

    pub(super) fn allocation_count(&self) -> usize {
        self.allocations.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget() {
        let mut mem = HostMemory::new(Some(1000));
        let a = mem.allocate(600).unwrap();
        let err = mem.allocate(600).unwrap_err();
        assert!(matches!(err, Error::AllocationFailure { requested: 600, .. }));
        assert!(mem.free(a));
        assert!(mem.allocate(600).is_ok());
    }

    #[test]
    fn test_zero_allocation_rejected() {
        let mut mem = HostMemory::new(None);
        assert!(mem.allocate(0).is_err());
    }

    #[test]
    fn test_destroy_releases_owned_memory_only() {
        let mut mem = HostMemory::new(None);
        let owned = mem.allocate(64).unwrap();
        let shared = mem.allocate(64).unwrap();

        let a = ResourceId::next();
        let b = ResourceId::next();
        mem.register(a, ObjectKind::Buffer);
        mem.register(b, ObjectKind::Buffer);
        mem.bind(a, Binding { allocation: owned, owned: true }).unwrap();
        mem.bind(b, Binding { allocation: shared, owned: false }).unwrap();
        assert_eq!(mem.users_of(shared), 1);

        assert_eq!(mem.destroy(a), Some(ObjectKind::Buffer));
        assert_eq!(mem.destroy(b), Some(ObjectKind::Buffer));
        assert_eq!(mem.allocation_count(), 1);
        assert_eq!(mem.bytes_in_use(), 64);
    }
}
