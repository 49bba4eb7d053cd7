//! # vipd-core
//!
//! `vipd-core` provides the shared types used by the `vipd` daemon and its CLI:
//! the service entry model, the line protocol spoken over the control socket,
//! the configuration schema, and the managed section of the resolution (hosts) file.
//!
//! ## Key Modules
//!
//! *   [`service`]: The [`ServiceEntry`] record and name validation.
//! *   [`protocol`]: [`Request`] and [`Response`], one line each.
//! *   [`config`]: The `config.toml` schema ([`VipdConfig`]).
//! *   [`resolution`]: Rewrites the managed lines of a hosts-style file.
//! *   [`fs`]: Write-then-rename file replacement.

// =========================================================================
//  Strict Lints: Safety, Hygiene, and Documentation
// =========================================================================

// 1. Logic & Safety
#![warn(clippy::let_underscore_must_use)] // Don't swallow errors with `let _`
#![warn(clippy::manual_let_else)] // Enforces clean "Guard Clause" style

// 2. Numeric Safety (Critical for addresses/ports)
#![warn(clippy::cast_possible_truncation)] // Warn on u64 -> u32 (potential data loss)

// 3. Observability
#![warn(clippy::print_stderr)] // Ban eprintln! (Use tracing::error!)

// 4. Import Hygiene
#![warn(clippy::shadow_unrelated)] // Ban accidental variable shadowing

pub mod config;
pub use config::VipdConfig;
pub mod fs;
pub mod protocol;
pub use protocol::{Reply, Request, Response};
pub mod resolution;
pub use resolution::ResolutionFile;
pub mod service;
pub use service::ServiceEntry;
