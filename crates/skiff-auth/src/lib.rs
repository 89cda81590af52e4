//! skiff-auth: the gate every API request passes first.
//!
//! Keys are stored only as SHA-256 digests and compared in constant time.
//! A validated key becomes a [`Principal`], the identity that owns
//! workloads and quota reservations.

pub mod error;
pub mod gate;
pub mod scope;

pub use error::{AuthError, AuthResult};
pub use gate::{ApiKeyInfo, AuthGate, IssuedKey, Principal};
pub use scope::Scope;
