use crate::object_class::ObjectClass;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::time::Duration;

/// External forensic check command lines, one per object class.
///
/// The first element is the program, the rest are its arguments. A class
/// without an entry is still rescanned when it changes, but nothing is run.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Checks {
    /// Upper bound on a single check run. A check still running after this
    /// long is killed. **Measured in seconds**.
    #[serde_as(as = "serde_with::DurationSeconds<u64>")]
    pub timeout: Duration,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
}

impl Default for Checks {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            process: None,
            module: None,
            socket: None,
            files: None,
        }
    }
}

impl Checks {
    pub fn command(&self, class: ObjectClass) -> Option<&[String]> {
        let command = match class {
            ObjectClass::Process => &self.process,
            ObjectClass::Module => &self.module,
            ObjectClass::SocketInfo => &self.socket,
            ObjectClass::OpenFiles => &self.files,
        };
        command.as_deref().filter(|argv| !argv.is_empty())
    }
}
