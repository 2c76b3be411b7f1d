//! Identifiers for kernel objects.

use core::fmt;

/// Identifier of a thread and its scheduler object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ThreadId(pub u64);

impl ThreadId {
    /// Raw value.
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "thread#{}", self.0)
    }
}

/// Index of a logical CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CpuId(pub u32);

impl CpuId {
    /// The index as a `usize`, for table lookups.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

/// Handle to a system object.
///
/// The low 32 bits are the slot index in the handle table, the high 32 bits
/// the slot generation, so a stale handle never aliases a reused slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct HandleId(u64);

impl HandleId {
    /// Builds a handle from its slot and generation.
    pub const fn new(index: u32, generation: u32) -> Self {
        HandleId(((generation as u64) << 32) | index as u64)
    }

    /// Rebuilds a handle from its raw value.
    pub const fn from_raw(raw: u64) -> Self {
        HandleId(raw)
    }

    /// Raw value passed across the system call boundary.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Slot index.
    pub const fn index(self) -> u32 {
        self.0 as u32
    }

    /// Slot generation.
    pub const fn generation(self) -> u32 {
        (self.0 >> 32) as u32
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handle#{}.{}", self.index(), self.generation())
    }
}

/// The kind of object a handle refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum HandleType {
    /// Untyped resource.
    Generic,
    /// A thread.
    Thread,
    /// A kernel mutex.
    Mutex,
    /// A pipe.
    Pipe,
    /// A counting semaphore.
    Semaphore,
    /// An address space.
    MemorySpace,
    /// A set of handles waited on together.
    Set,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_id_parts() {
        let id = HandleId::new(7, 3);
        assert_eq!(id.index(), 7);
        assert_eq!(id.generation(), 3);
        assert_eq!(HandleId::from_raw(id.raw()), id);
        assert_ne!(HandleId::new(7, 4), id);
    }
}
