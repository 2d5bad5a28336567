//! Data models

pub mod command;
pub mod device;

pub use command::*;
pub use device::*;
