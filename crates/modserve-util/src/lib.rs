#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Shared utilities for modserve.
//!
//! Pure helpers with no logging/tracing dependencies. The crates that own
//! long-running state decide what to log.

pub mod fs;
pub mod hash;
