//! pveflow-core
//!
//! Canonical, typed model of a Proxmox VE instance configuration together
//! with the pieces that produce it:
//!
//! - [`normalizer`] turns a user-facing [`RawInstance`] into a
//!   [`DesiredInstance`], tagging every value with its [`Field`] provenance
//! - [`policy`] holds the provider-side defaults applied during normalization
//! - [`wire`] encodes and decodes the comma-separated property strings the
//!   remote API speaks

pub mod error;
pub mod field;
pub mod model;
pub mod normalizer;
pub mod policy;
pub mod wire;

pub use error::{CoreError, Result};
pub use field::Field;
pub use model::*;
pub use normalizer::{Normalizer, RawInstance};
pub use policy::DefaultPolicy;
