use serde::{Deserialize, Serialize};

/// How the symbol a list walk starts from relates to the list.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ListHead {
    /// The symbol names a bare `struct list_head` that is not itself an
    /// object (e.g. `modules`). An empty list points back at itself.
    #[serde(rename = "sentinel")]
    Sentinel,

    /// The symbol names an object that is itself the first member of the
    /// list (e.g. `init_task`), its link field sits at `list_offset`.
    #[serde(rename = "embedded")]
    Embedded,
}

/// Byte offsets describing the guest kernel's data structures.
///
/// None of these can be discovered by the monitor; they must match the
/// guest kernel build exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Layout {
    pub process: ProcessLayout,
    pub module: ModuleLayout,
    pub socket: SocketLayout,
    pub files: FilesLayout,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProcessLayout {
    /// Symbol the task list walk starts from.
    pub head_symbol: String,
    pub head: ListHead,
    /// Offset of `task_struct.tasks`.
    pub list_offset: u64,
    /// Offset of `task_struct.comm`.
    pub name_offset: u64,
    /// Offset of `task_struct.pid`.
    pub pid_offset: u64,
    /// Offset of `task_struct.files`.
    pub files_offset: u64,
    /// Number of bytes of each `task_struct` treated as monitored.
    pub extent: u64,
}

impl Default for ProcessLayout {
    fn default() -> Self {
        Self {
            head_symbol: "init_task".into(),
            head: ListHead::Embedded,
            list_offset: 0x268,
            name_offset: 0x478,
            pid_offset: 0x2e4,
            files_offset: 0x4c8,
            extent: 0x950,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModuleLayout {
    pub head_symbol: String,
    pub head: ListHead,
    /// Offset of `module.list`.
    pub list_offset: u64,
    /// Offset of `module.name`.
    pub name_offset: u64,
    pub extent: u64,
}

impl Default for ModuleLayout {
    fn default() -> Self {
        Self {
            head_symbol: "modules".into(),
            head: ListHead::Sentinel,
            list_offset: 0x8,
            name_offset: 0x18,
            extent: 0x50,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SocketLayout {
    /// `seq_afinfo` symbols whose function tables are watched.
    pub symbols: Vec<String>,
    pub extent: u64,
}

impl Default for SocketLayout {
    fn default() -> Self {
        Self {
            symbols: vec![
                "tcp4_seq_afinfo".into(),
                "tcp6_seq_afinfo".into(),
                "udp4_seq_afinfo".into(),
                "udp6_seq_afinfo".into(),
            ],
            extent: 0x40,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FilesLayout {
    /// Number of bytes of each `files_struct` treated as monitored.
    pub extent: u64,
}

impl Default for FilesLayout {
    fn default() -> Self {
        Self { extent: 0x40 }
    }
}
