use crate::types::RegistrationId;

/// Attestation and signing operations backed by a TPM.
///
/// Implemented by the hardware provider; the provisioning clients only see
/// this trait so they can run against a software double in tests.
pub trait TpmSecurity {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Registration id this provider attests for
    fn registration_id(&self) -> &RegistrationId;

    /// TPM2B_PUBLIC encoding of the endorsement key
    fn endorsement_key(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// TPM2B_PUBLIC encoding of the storage root key
    fn storage_root_key(&mut self) -> Result<Vec<u8>, Self::Error>;

    /// Import the identity key carried by a DPS activation blob.
    fn activate_identity_key(&mut self, activation: &[u8]) -> Result<(), Self::Error>;

    /// HMAC-SHA256 of `data` using the activated identity key.
    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, Self::Error>;
}
