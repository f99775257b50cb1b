#![no_std]

extern crate alloc;

pub mod cache;
pub mod dev;
pub mod errno;
pub mod fs;
pub mod sched;
