//! Shared value types

pub mod breakpoint;

pub use breakpoint::*;
