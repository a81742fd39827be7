//! Device credentials, certificate pinning helpers and the pairing
//! verification key.

pub mod credentials;
pub mod verification;

pub use credentials::{generate_device_id, Credentials};
pub use verification::{cert_fingerprint, spki_from_cert_der, verification_key};
