//! Credential management for the code-assist gateway
//!
//! Owns the on-disk token-file format (including the split IdC client
//! registration merge), the HTTP token-refresh call, and machine-id
//! derivation. This crate is a standalone library with no dependency on
//! the gateway binary or the pool core, so it can be tested and used
//! independently.
//!
//! Credential flow:
//! 1. An auth flow (external) writes the per-account token file
//! 2. `Credential::load()` reads + merges it at account construction
//! 3. The refresh path calls `token::refresh_credential()` when the token
//!    nears expiry
//! 4. The refreshed credential is persisted via `Credential::save()`

pub mod credentials;
pub mod error;
pub mod machine;
pub mod token;

pub use credentials::{AuthMethod, Credential, now_millis};
pub use error::{Error, Result};
pub use machine::{derive_machine_id, random_machine_id};
pub use token::{TokenResponse, refresh_credential};
