#![forbid(unsafe_code)]

mod address;
mod target;

pub use address::{Gfn, PAGE_SHIFT, PAGE_SIZE, Pa, Va};
pub use target::{ClassificationToken, TargetDescriptor};
