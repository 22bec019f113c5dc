//! Extension declarations.
//!
//! This module defines the manifest contract, the descriptor stored by the
//! registry and the version values used by the loader's compatibility gate.

pub mod descriptor;
pub mod manifest;
pub mod version;
