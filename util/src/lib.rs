#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bitstream;
pub mod c64_geometry;
pub mod gcr;

#[derive(Clone, Copy, Debug)]
pub struct Bit(pub bool);

impl PartialEq<bool> for Bit {
    fn eq(&self, other: &bool) -> bool {
        self.0 == *other
    }
}
