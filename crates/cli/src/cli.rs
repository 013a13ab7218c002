#![forbid(unsafe_code)]

use clap::{Parser, ValueEnum};
use clap_verbosity_flag::{Verbosity, WarnLevel};
use config::MonitorMode;
use std::path::{Path, PathBuf};

/// hawk: kernel object write monitor for virtual machines
///
/// hawk watches a guest's process list, loaded modules, socket tables and
/// open-file tables from the hypervisor side, counts every write to them and
/// runs a forensic check whenever one of them changes.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Name of the guest to monitor.
    #[arg(value_parser = validate_guest)]
    pub guest: String,

    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/hawk/config.toml` and `/etc/hawk/config.d/*.toml`, where the
    /// latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Guest image to open instead of `<image_dir>/<GUEST>.toml`.
    #[arg(short, long, value_parser = validate_file)]
    pub image: Option<PathBuf>,

    /// How writes are matched against watched objects. Overrides the
    /// configuration file.
    #[arg(short, long, value_enum)]
    pub mode: Option<Mode>,

    #[command(flatten)]
    pub verbosity: Verbosity<WarnLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Only writes inside a watched object count.
    Precise,
    /// Every write on a watched page counts.
    Coarse,
}

impl From<Mode> for MonitorMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Precise => MonitorMode::Precise,
            Mode::Coarse => MonitorMode::Coarse,
        }
    }
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.exists() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

/// Guest names double as image file names.
#[inline(always)]
fn validate_guest(guest: &str) -> Result<String, String> {
    if guest.is_empty() {
        Err("Guest name must not be empty".to_string())
    } else if guest.contains(['/', '\0']) {
        Err(format!("`{guest}` is not a valid guest name"))
    } else {
        Ok(guest.to_string())
    }
}
