//! Proxmox VE REST implementation of the reconciler's hypervisor API

pub mod client;
pub mod error;

pub use client::{PveClient, PveConfig};
pub use error::{PveError, Result};
