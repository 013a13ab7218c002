#![forbid(unsafe_code)]

use super::{Pa, Va};
use config::ObjectClass;
use std::fmt;

/// A guest kernel object selected for monitoring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetDescriptor {
    pub class: ObjectClass,
    /// Physical address of the first monitored byte.
    pub base: Pa,
    /// Number of monitored bytes starting at `base`.
    pub extent: u64,
    /// Kernel virtual address the object was discovered at.
    pub va: Va,
    /// Identifying fields read during discovery (name, pid), for logs only.
    pub label: String,
}

impl TargetDescriptor {
    /// Whether `address` falls inside `[base, base + extent)`.
    pub fn contains(&self, address: Pa) -> bool {
        address >= self.base && address.0 - self.base.0 < self.extent
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (va {}, pa {}, {:#x} bytes)",
            self.class, self.label, self.va, self.base, self.extent
        )
    }
}

/// Signal handed from the event callback to the analysis dispatcher.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum ClassificationToken {
    Process,
    Module,
    SocketInfo,
    OpenFiles,
    /// Terminal. The dispatcher stops as soon as it sees this.
    Shutdown,
}

impl ClassificationToken {
    pub fn class(self) -> Option<ObjectClass> {
        match self {
            ClassificationToken::Process => Some(ObjectClass::Process),
            ClassificationToken::Module => Some(ObjectClass::Module),
            ClassificationToken::SocketInfo => Some(ObjectClass::SocketInfo),
            ClassificationToken::OpenFiles => Some(ObjectClass::OpenFiles),
            ClassificationToken::Shutdown => None,
        }
    }
}

impl From<ObjectClass> for ClassificationToken {
    fn from(class: ObjectClass) -> Self {
        match class {
            ObjectClass::Process => ClassificationToken::Process,
            ObjectClass::Module => ClassificationToken::Module,
            ObjectClass::SocketInfo => ClassificationToken::SocketInfo,
            ObjectClass::OpenFiles => ClassificationToken::OpenFiles,
        }
    }
}
