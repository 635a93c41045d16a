#![doc = include_str!("../RUSTDOC.md")]

pub mod collection;
pub mod platform;
pub mod util;
