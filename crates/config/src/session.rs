use crate::object_class::ObjectClass;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use std::path::PathBuf;
use std::time::Duration;

/// How triggered writes are matched against the watched object.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorMode {
    /// Every write on a watched page counts as a hit. Never misses events
    /// when several objects share a page.
    #[serde(rename = "coarse")]
    Coarse,

    /// Only writes inside `[base, base + extent)` of a watched object count.
    /// Everything else on the page is tallied as irrelevant.
    #[default]
    #[serde(rename = "precise")]
    Precise,
}

#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Session {
    /// Upper bound on a single blocking poll. The interruption flag is
    /// checked once per slice, so this is also the worst-case shutdown
    /// latency. **Measured in milliseconds**.
    #[serde_as(as = "serde_with::DurationMilliSeconds<u64>")]
    pub poll_timeout: Duration,

    /// Pause the guest while the initial watchpoints are installed and while
    /// they are torn down, so the walked lists cannot change underneath us.
    pub pause_during_setup: bool,

    /// Resume the guest before closing the session on exit.
    pub resume_on_exit: bool,

    /// Address filtering mode for triggered writes.
    pub mode: MonitorMode,

    /// Object classes to discover and watch.
    pub classes: Vec<ObjectClass>,

    /// Directory searched for `<guest>.toml` images by the offline backend.
    pub image_dir: PathBuf,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(500),
            pause_during_setup: true,
            resume_on_exit: true,
            mode: MonitorMode::Precise,
            classes: ObjectClass::ALL.to_vec(),
            image_dir: PathBuf::from("/var/lib/hawk/images"),
        }
    }
}
