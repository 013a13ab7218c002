#![forbid(unsafe_code)]

use std::fmt;
use std::ops::{Add, Sub};

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Guest virtual address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Va(pub u64);

/// Guest physical address.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Pa(pub u64);

/// Guest physical page frame number.
#[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Gfn(pub u64);

impl Va {
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Virtual page number, used by backends that keep their own page tables.
    pub fn page(self) -> u64 {
        self.0 >> PAGE_SHIFT
    }

    pub fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl Pa {
    pub fn gfn(self) -> Gfn {
        Gfn(self.0 >> PAGE_SHIFT)
    }

    pub fn page_offset(self) -> u64 {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl Gfn {
    pub fn base(self) -> Pa {
        Pa(self.0 << PAGE_SHIFT)
    }
}

macro_rules! address_ops {
    ($($ty:ident),*) => {$(
        impl Add<u64> for $ty {
            type Output = $ty;

            fn add(self, rhs: u64) -> $ty {
                $ty(self.0.wrapping_add(rhs))
            }
        }

        impl Sub<u64> for $ty {
            type Output = $ty;

            fn sub(self, rhs: u64) -> $ty {
                $ty(self.0.wrapping_sub(rhs))
            }
        }

        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($ty), "({:#x})"), self.0)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }
    )*};
}

address_ops!(Va, Pa, Gfn);
