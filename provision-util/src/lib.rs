/*
Shared building blocks for the provisioning tool.

Holds the value types passed between crates (registration id, device id,
ID scope), application settings loading, SAS token construction and the
trait that abstracts the TPM security provider away from the clients that
need attestation and signing.
*/

pub mod config;
pub mod crypto;
pub mod http;
pub mod sas;
pub mod security;
pub mod types;
