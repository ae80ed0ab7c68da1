//! Centralized configuration constants.
//!
//! Constants whose values depend on each other live together in
//! [`constants`], guarded by compile-time assertions. Import from here
//! rather than redefining values locally.

mod constants;

pub use constants::*;
