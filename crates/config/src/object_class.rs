use serde::{Deserialize, Serialize};
use std::fmt;

/// Class of guest kernel object that can be watched.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ObjectClass {
    /// `task_struct` entries reachable from `init_task.tasks`.
    #[serde(rename = "process")]
    Process,

    /// `struct module` entries on the `modules` list.
    #[serde(rename = "module")]
    Module,

    /// `seq_afinfo` structures backing `/proc/net/{tcp,udp}*`.
    #[serde(rename = "socket")]
    SocketInfo,

    /// `files_struct` of every walked process.
    #[serde(rename = "files")]
    OpenFiles,
}

impl ObjectClass {
    pub const ALL: [ObjectClass; 4] = [
        ObjectClass::Process,
        ObjectClass::Module,
        ObjectClass::SocketInfo,
        ObjectClass::OpenFiles,
    ];

    /// Name used to identify the class to external forensic checks.
    pub fn name(self) -> &'static str {
        match self {
            ObjectClass::Process => "process",
            ObjectClass::Module => "module",
            ObjectClass::SocketInfo => "socket",
            ObjectClass::OpenFiles => "files",
        }
    }

    /// Dense index, used for per-class tallies.
    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ObjectClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
