#![forbid(unsafe_code)]

mod checks;
mod error;
mod layout;
mod object_class;
mod session;

pub use checks::Checks;
pub use error::Error;
pub use layout::{FilesLayout, Layout, ListHead, ModuleLayout, ProcessLayout, SocketLayout};
pub use object_class::ObjectClass;
pub use session::{MonitorMode, Session};

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub session: Session,
    pub layout: Layout,
    pub checks: Checks,
}

impl Config {
    /// Load configuration from a TOML file. Missing fields are filled with defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let text = std::fs::read_to_string(path)?;
        let mut config: Config = toml_edit::de::from_str(&text)?;
        config.apply_defaults();
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let toml = toml_edit::ser::to_string_pretty(self)?;
        std::fs::write(path, toml)?;
        Ok(())
    }

    /// Load configuration from multiple TOML files. Later files override earlier ones.
    pub fn load_multiple<T, U>(paths: U) -> Result<Self, Error>
    where
        T: AsRef<Path>,
        U: IntoIterator<Item = T>,
    {
        let mut merged = toml_edit::DocumentMut::new();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let text = std::fs::read_to_string(path)?;
            let doc: toml_edit::DocumentMut = text.parse()?;
            merge_document(&mut merged, doc);
        }
        let mut config: Config = toml_edit::de::from_str(&merged.to_string())?;
        config.apply_defaults();
        Ok(config)
    }

    fn apply_defaults(&mut self) {
        // Each class is scanned once per pass regardless of how often it is listed.
        self.session.classes.sort();
        self.session.classes.dedup();
    }
}

fn merge_document(target: &mut toml_edit::DocumentMut, source: toml_edit::DocumentMut) {
    for (key, item) in source.iter() {
        merge_item(
            target.entry(key).or_insert(toml_edit::Item::None),
            item.clone(),
        );
    }
}

fn merge_item(target: &mut toml_edit::Item, source: toml_edit::Item) {
    use toml_edit::Item;
    match (target, source) {
        (Item::Table(target_table), Item::Table(source_table)) => {
            for (key, item) in source_table.iter() {
                merge_item(target_table.entry(key).or_insert(Item::None), item.clone());
            }
        }
        (Item::ArrayOfTables(target_array), Item::ArrayOfTables(source_array)) => {
            for table in source_array.iter() {
                target_array.push(table.clone());
            }
        }
        (target_item, source_item) => {
            *target_item = source_item;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.checks.process = Some(vec!["/usr/lib/hawk/check".into(), "--pslist".into()]);
        config.apply_defaults();
        config.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();

        assert_eq!(config, loaded);
    }

    #[test]
    fn load_multiple_merges() {
        let dir = tempdir().unwrap();
        let path1 = dir.path().join("a.toml");
        let path2 = dir.path().join("b.toml");

        std::fs::write(
            &path1,
            "[session]\npoll_timeout = 250\nmode = \"coarse\"\n[layout.process]\npid_offset = 4\n",
        )
        .unwrap();
        std::fs::write(
            &path2,
            "[layout.process]\nname_offset = 16\n[checks]\nmodule = [\"/bin/true\"]\n",
        )
        .unwrap();

        let cfg = Config::load_multiple([path1, path2]).unwrap();
        assert_eq!(cfg.session.poll_timeout, Duration::from_millis(250));
        assert_eq!(cfg.session.mode, MonitorMode::Coarse);
        assert_eq!(cfg.layout.process.pid_offset, 4);
        assert_eq!(cfg.layout.process.name_offset, 16);
        assert_eq!(cfg.layout.process.head_symbol, "init_task");
        assert_eq!(
            cfg.checks.command(ObjectClass::Module),
            Some(&["/bin/true".to_string()][..])
        );
        assert_eq!(cfg.checks.command(ObjectClass::Process), None);
        assert_eq!(cfg.checks.timeout, Duration::from_secs(30));
    }

    #[test]
    fn check_timeout_is_in_seconds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[checks]\ntimeout = 5\nfiles = [\"lsof\"]\n").unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.checks.timeout, Duration::from_secs(5));
        assert_eq!(
            cfg.checks.command(ObjectClass::OpenFiles),
            Some(&["lsof".to_string()][..])
        );
    }

    #[test]
    fn duplicate_classes_are_collapsed() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "[session]\nclasses = [\"module\", \"process\", \"module\"]\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(
            cfg.session.classes,
            vec![ObjectClass::Process, ObjectClass::Module]
        );
    }

    #[test]
    fn empty_check_command_is_ignored() {
        let checks = Checks {
            socket: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(checks.command(ObjectClass::SocketInfo), None);
    }
}
