//! Device credentials: signed tokens derived from the device private key

pub mod credential;
pub mod signer;

pub use credential::{Credential, CredentialError, CredentialManager, CLAIM_LIFETIME, LOCAL_LIFETIME};
pub use signer::{Claims, JwtSigner, SigningAlgorithm, TokenSigner};
