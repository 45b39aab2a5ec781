#![doc = include_str!("../README.md")]

mod bits;
pub mod champ;
mod error;
mod hashing;
pub mod rrb;

pub use champ::HashMap;
pub use error::{Error, Result};
pub use rrb::Vector;
