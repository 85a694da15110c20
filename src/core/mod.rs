pub mod config;
pub mod container;
pub mod hash;

pub use config::*;
pub use container::*;
pub use hash::*;
