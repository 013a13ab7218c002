#![forbid(unsafe_code)]

//! Guest images for the in-memory backend.
//!
//! An image is a TOML file describing kernel mappings, symbols, initial
//! memory contents and a script of guest writes:
//!
//! ```toml
//! [symbols]
//! init_task = "0xffffffff81e10000"
//!
//! [[mappings]]
//! va = "0xffffffff81e00000"
//! pa = "0x1e00000"
//! pages = 32
//!
//! [[memory]]
//! va = "0xffffffff81e10478"
//! str = "swapper/0"
//!
//! [[writes]]
//! vcpu = 0
//! va = "0xffffffff81e102e4"
//! u32 = 1
//! ```
//!
//! Addresses are given either as integers or as `0x`-prefixed strings, since
//! kernel addresses do not fit a TOML integer.

use super::{Connector, IntrospectionError, MemoryGuest};
use crate::domain::{Pa, Va};
use serde::{Deserialize, Deserializer};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum ImageError {
    #[error("Failed to read image {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse image: {0}")]
    Parse(#[from] toml_edit::de::Error),

    #[error("Memory entry at {0} does not set exactly one of `u64`, `u32`, `str`")]
    AmbiguousValue(Va),

    #[error("Memory entry at {0} is not covered by any mapping")]
    Unmapped(Va),
}

/// Integer accepted either natively or as a hex/decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Word(pub u64);

impl<'de> Deserialize<'de> for Word {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Int(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Int(value) => Ok(Word(value)),
            Raw::Str(text) => parse_word(&text)
                .map(Word)
                .ok_or_else(|| serde::de::Error::custom(format!("invalid address `{text}`"))),
        }
    }
}

fn parse_word(text: &str) -> Option<u64> {
    let text = text.trim().replace('_', "");
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => text.parse().ok(),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Mapping {
    pub va: Word,
    pub pa: Word,
    #[serde(default = "one_page")]
    pub pages: u64,
    /// Address space owner; kernel mappings when absent.
    pub pid: Option<u32>,
}

fn one_page() -> u64 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryCell {
    pub va: Word,
    #[serde(default)]
    pub vcpu: u32,
    pub u64: Option<Word>,
    pub u32: Option<u32>,
    pub str: Option<String>,
}

impl MemoryCell {
    fn bytes(&self) -> Result<Vec<u8>, ImageError> {
        match (&self.u64, &self.u32, &self.str) {
            (Some(word), None, None) => Ok(word.0.to_le_bytes().to_vec()),
            (None, Some(value), None) => Ok(value.to_le_bytes().to_vec()),
            (None, None, Some(text)) => {
                let mut bytes = text.as_bytes().to_vec();
                bytes.push(0);
                Ok(bytes)
            }
            _ => Err(ImageError::AmbiguousValue(Va(self.va.0))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GuestImage {
    pub name: Option<String>,
    pub symbols: BTreeMap<String, Word>,
    pub mappings: Vec<Mapping>,
    pub memory: Vec<MemoryCell>,
    pub writes: Vec<MemoryCell>,
}

impl GuestImage {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ImageError::Io {
            path: path.to_owned(),
            source,
        })?;
        Ok(toml_edit::de::from_str(&text)?)
    }

    /// Build a guest named `guest` from this image.
    pub fn into_guest(self, guest: &str) -> Result<MemoryGuest, ImageError> {
        let mut memory = MemoryGuest::new(self.name.as_deref().unwrap_or(guest));
        for mapping in &self.mappings {
            let (va, pa) = (Va(mapping.va.0), Pa(mapping.pa.0));
            match mapping.pid {
                Some(pid) => memory.map_process(pid, va, pa, mapping.pages),
                None => memory.map(va, pa, mapping.pages),
            }
        }
        for (symbol, word) in self.symbols {
            memory.define_symbol(symbol, Va(word.0));
        }
        for cell in &self.memory {
            let va = Va(cell.va.0);
            memory
                .poke(va, &cell.bytes()?)
                .map_err(|_| ImageError::Unmapped(va))?;
        }
        for cell in &self.writes {
            memory.script_write(cell.vcpu, Va(cell.va.0), cell.bytes()?);
        }
        Ok(memory)
    }
}

/// Opens sessions from `<image_dir>/<guest>.toml`, or from a fixed image.
#[derive(Debug, Clone)]
pub struct ImageConnector {
    image_dir: PathBuf,
    image: Option<PathBuf>,
}

impl ImageConnector {
    pub fn new(image_dir: impl Into<PathBuf>) -> Self {
        Self {
            image_dir: image_dir.into(),
            image: None,
        }
    }

    /// Ignore the guest name and always open `image`.
    pub fn with_image(mut self, image: impl Into<PathBuf>) -> Self {
        self.image = Some(image.into());
        self
    }

    fn path_for(&self, guest: &str) -> PathBuf {
        self.image
            .clone()
            .unwrap_or_else(|| self.image_dir.join(format!("{guest}.toml")))
    }
}

impl Connector for ImageConnector {
    type Session = MemoryGuest;

    fn connect(&self, guest: &str) -> Result<MemoryGuest, IntrospectionError> {
        let path = self.path_for(guest);
        if !path.exists() {
            return Err(IntrospectionError::NoSuchGuest(guest.to_string()));
        }
        debug!(?path, guest, "loading guest image");
        let image = GuestImage::load(&path)?;
        Ok(image.into_guest(guest)?)
    }
}
