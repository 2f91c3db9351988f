#![doc = include_str!("../README.md")]
#![forbid(unsafe_op_in_unsafe_fn)]

mod backend;
mod cache;
mod client;
pub mod config;
mod context;
mod descriptor;
mod error;
pub mod posix;
mod provider;
mod registry;
mod types;

pub use backend::*;
pub use cache::*;
pub use client::*;
pub use config::{HeapBackendConfig, SlotBackendConfig};
pub use context::*;
pub use descriptor::*;
pub use error::*;
pub use provider::*;
pub use registry::*;
pub use types::*;
