//! Credential persistence for the signed-in user.
//!
//! This module provides:
//! - `CredentialStore`: key-value persistence with memory, keyring and file backends
//! - `CredentialVault`: pair-level access to the access and refresh tokens
//!
//! Tokens are stored under the `accessToken` and `refreshToken` keys.

pub mod credentials;
pub mod session;
pub mod vault;

pub use credentials::{CredentialStore, KeyringStore, MemoryStore, StoreError};
pub use session::FileStore;
pub use vault::{CredentialPair, CredentialSnapshot, CredentialVault};
