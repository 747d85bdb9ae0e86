use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Scheduling class of a task. Ordered so that `High > Normal > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Priority {
    Low = 0,
    Normal = 1,
    High = 2,
}

impl Priority {
    /// Number of priority classes.
    pub const COUNT: usize = 3;

    /// All classes, highest first (the order selection scans them in).
    pub const ALL: [Priority; Priority::COUNT] = [Priority::High, Priority::Normal, Priority::Low];

    /// Dense index suitable for per-class arrays (`Low` = 0).
    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Independent execution category. Lanes partition the ready queues; they do
/// not change priority semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Lane {
    Hardware = 0,
    Software = 1,
}

impl Lane {
    pub const COUNT: usize = 2;
    pub const ALL: [Lane; Lane::COUNT] = [Lane::Hardware, Lane::Software];

    pub fn index(self) -> usize {
        self as usize
    }
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Lane::Hardware => write!(f, "hardware"),
            Lane::Software => write!(f, "software"),
        }
    }
}

/// Identity of the component instance that submitted a task (a decoder,
/// an encoder, a VPP session). Used for owner-scoped waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OwnerId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a resource produced by one task and consumed by others.
///
/// The scheduler never dereferences a key; the caller owns whatever the key
/// stands for and is responsible for its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DependencyKey(u64);

impl DependencyKey {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Key derived from the address of a caller-owned object (a surface,
    /// a bitstream buffer). Two live objects never share a key.
    pub fn of<T: ?Sized>(resource: &T) -> Self {
        Self(resource as *const T as *const () as usize as u64)
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl From<u64> for DependencyKey {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl std::fmt::Display for DependencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}
