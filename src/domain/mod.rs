//! Domain Module
//!
//! Core domain types and the trait boundaries to the operating system.

pub mod address;
pub mod ports;

pub use address::*;
pub use ports::*;
