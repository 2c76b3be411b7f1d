//! Architecture-specific platforms.
//!
//! Host builds compile none of this; tests run on the host platform double.

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub mod x86_64;
