use std::str::FromStr;

use thiserror::Error;
use tracing::{debug, info, instrument};
use tss_esapi::{
    Context,
    abstraction::{DefaultKey, ek},
    attributes::ObjectAttributesBuilder,
    constants::SessionType,
    handles::{AuthHandle, KeyHandle, ObjectHandle, PersistentTpmHandle, SessionHandle, TpmHandle},
    interface_types::{
        algorithm::{AsymmetricAlgorithm, HashingAlgorithm, PublicAlgorithm},
        key_bits::RsaKeyBits,
        resource_handles::{Hierarchy, Provision},
        session_handles::{AuthSession, PolicySession},
    },
    structures::{
        Data, Digest, EncryptedSecret, IdObject, MaxBuffer, Nonce, Private, Public, PublicBuilder,
        PublicKeyRsa, PublicRsaParametersBuilder, RsaScheme, SymmetricDefinition,
        SymmetricDefinitionObject,
    },
    tcti_ldr::TctiNameConf,
    traits::{Marshall, UnMarshall},
};

use crate::activation::{ActivationBlob, InvalidActivationBlob, to_sized};
use crate::util::security::TpmSecurity;
use crate::util::types::RegistrationId;

/// Persistent handle of the endorsement key
const EK_HANDLE: u32 = 0x8101_0001;

/// Persistent handle of the storage root key
const SRK_HANDLE: u32 = 0x8100_0001;

/// Persistent handle of the identity key imported from DPS
const IDENTITY_KEY_HANDLE: u32 = 0x8100_0100;

#[derive(Debug, Error)]
pub enum SecurityError {
    #[error("invalid TCTI configuration '{tcti}': {source}")]
    Tcti {
        tcti: String,
        source: tss_esapi::Error,
    },

    #[error("TPM operation failed: {0}")]
    Tpm(#[from] tss_esapi::Error),

    #[error(transparent)]
    Activation(#[from] InvalidActivationBlob),

    #[error("TPM did not return an authorization session")]
    NoSession,

    #[error("no identity key has been activated on this TPM")]
    NoIdentityKey,
}

/// Security provider backed by a TPM 2.0 device or simulator.
///
/// The endorsement and storage root keys are created and persisted on first
/// use. Handles are cached for the lifetime of the provider and closed when
/// it is dropped.
pub struct TpmSecurityProvider {
    context: Context,
    registration_id: RegistrationId,
    ek: Option<KeyHandle>,
    srk: Option<KeyHandle>,
    identity_key: Option<ObjectHandle>,
}

impl TpmSecurityProvider {
    /// Connect to the TPM described by `tcti`, e.g. `device:/dev/tpmrm0` or
    /// `mssim:host=localhost,port=2321` for the simulator.
    pub fn open(tcti: &str, registration_id: RegistrationId) -> Result<Self, SecurityError> {
        let conf = TctiNameConf::from_str(tcti).map_err(|source| SecurityError::Tcti {
            tcti: tcti.to_owned(),
            source,
        })?;
        let context = Context::new(conf)?;
        info!("connected to TPM at {tcti}");

        Ok(Self {
            context,
            registration_id,
            ek: None,
            srk: None,
            identity_key: None,
        })
    }

    fn find_persistent(&mut self, handle: u32) -> Result<Option<ObjectHandle>, SecurityError> {
        let persistent = PersistentTpmHandle::new(handle)?;
        match self
            .context
            .tr_from_tpm_public(TpmHandle::Persistent(persistent))
        {
            Ok(object) => Ok(Some(object)),
            Err(e) => {
                debug!("no object at 0x{handle:08x}: {e}");
                Ok(None)
            }
        }
    }

    /// Move a transient key to `handle` and release the transient copy.
    fn persist(&mut self, transient: KeyHandle, handle: u32) -> Result<ObjectHandle, SecurityError> {
        let persisted = PersistentTpmHandle::new(handle).and_then(|persistent| {
            self.context.execute_with_nullauth_session(|ctx| {
                ctx.evict_control(Provision::Owner, transient.into(), persistent.into())
            })
        });
        // the transient copy goes either way
        let flushed = self.context.flush_context(transient.into());
        let object = persisted?;
        flushed?;

        debug!("persisted key at 0x{handle:08x}");
        Ok(object)
    }

    /// Release a transient object or session, logging failures.
    fn flush(&mut self, handle: ObjectHandle) {
        if let Err(e) = self.context.flush_context(handle) {
            debug!("failed to flush TPM handle: {e}");
        }
    }

    fn evict(&mut self, object: ObjectHandle, handle: u32) -> Result<(), SecurityError> {
        let persistent = PersistentTpmHandle::new(handle)?;
        self.context.execute_with_nullauth_session(|ctx| {
            ctx.evict_control(Provision::Owner, object, persistent.into())
        })?;

        debug!("evicted key at 0x{handle:08x}");
        Ok(())
    }

    fn endorsement_handle(&mut self) -> Result<KeyHandle, SecurityError> {
        if let Some(ek) = self.ek {
            return Ok(ek);
        }

        let ek = match self.find_persistent(EK_HANDLE)? {
            Some(object) => KeyHandle::from(object),
            None => {
                info!("creating endorsement key");
                #[allow(deprecated)]
                let transient =
                    ek::create_ek_object(&mut self.context, AsymmetricAlgorithm::Rsa, DefaultKey)?;
                KeyHandle::from(self.persist(transient, EK_HANDLE)?)
            }
        };

        self.ek = Some(ek);
        Ok(ek)
    }

    fn storage_root_handle(&mut self) -> Result<KeyHandle, SecurityError> {
        if let Some(srk) = self.srk {
            return Ok(srk);
        }

        let srk = match self.find_persistent(SRK_HANDLE)? {
            Some(object) => KeyHandle::from(object),
            None => {
                info!("creating storage root key");
                let template = storage_root_template()?;
                let transient = self
                    .context
                    .execute_with_nullauth_session(|ctx| {
                        ctx.create_primary(Hierarchy::Owner, template, None, None, None, None)
                    })?
                    .key_handle;
                KeyHandle::from(self.persist(transient, SRK_HANDLE)?)
            }
        };

        self.srk = Some(srk);
        Ok(srk)
    }

    fn public_area(&mut self, key: KeyHandle) -> Result<Vec<u8>, SecurityError> {
        let (public, _, _) = self.context.read_public(key)?;
        Ok(to_sized(&public.marshall()?))
    }

    /// Start a policy session satisfying `PolicySecret(TPM_RH_ENDORSEMENT)`,
    /// the authorization policy of the default EK template.
    fn endorsement_policy_session(&mut self) -> Result<AuthSession, SecurityError> {
        let session = self
            .context
            .start_auth_session(
                None,
                None,
                None,
                SessionType::Policy,
                SymmetricDefinition::AES_128_CFB,
                HashingAlgorithm::Sha256,
            )?
            .ok_or(SecurityError::NoSession)?;
        let applied = PolicySession::try_from(session).and_then(|policy_session| {
            self.context
                .execute_with_session(Some(AuthSession::Password), |ctx| {
                    ctx.policy_secret(
                        policy_session,
                        AuthHandle::Endorsement,
                        Nonce::default(),
                        Digest::default(),
                        Nonce::default(),
                        None,
                    )
                })
        });
        if let Err(e) = applied {
            self.flush(session_object(session));
            return Err(e.into());
        }

        Ok(session)
    }

    /// Remove the persisted identity key, if any, to make room for a new one.
    fn evict_identity_key(&mut self) -> Result<(), SecurityError> {
        let existing = match self.identity_key.take() {
            Some(key) => Some(key),
            None => self.find_persistent(IDENTITY_KEY_HANDLE)?,
        };
        if let Some(existing) = existing {
            self.evict(existing, IDENTITY_KEY_HANDLE)?;
        }
        Ok(())
    }

    fn identity_key_handle(&mut self) -> Result<ObjectHandle, SecurityError> {
        if let Some(key) = self.identity_key {
            return Ok(key);
        }

        let key = self
            .find_persistent(IDENTITY_KEY_HANDLE)?
            .ok_or(SecurityError::NoIdentityKey)?;
        self.identity_key = Some(key);
        Ok(key)
    }
}

impl TpmSecurity for TpmSecurityProvider {
    type Error = SecurityError;

    fn registration_id(&self) -> &RegistrationId {
        &self.registration_id
    }

    fn endorsement_key(&mut self) -> Result<Vec<u8>, Self::Error> {
        let ek = self.endorsement_handle()?;
        self.public_area(ek)
    }

    fn storage_root_key(&mut self) -> Result<Vec<u8>, Self::Error> {
        let srk = self.storage_root_handle()?;
        self.public_area(srk)
    }

    #[instrument(name = "activate_identity_key", skip_all, err)]
    fn activate_identity_key(&mut self, activation: &[u8]) -> Result<(), Self::Error> {
        let blob = ActivationBlob::parse(activation)?;
        let ek = self.endorsement_handle()?;
        let srk = self.storage_root_handle()?;

        // Recover the symmetric key wrapping the duplicated identity key. Only
        // a TPM holding both the EK and the SRK the service saw can do this.
        let credential = IdObject::try_from(blob.credential.to_vec())?;
        let secret = EncryptedSecret::try_from(blob.secret.to_vec())?;
        let session = self.endorsement_policy_session()?;
        let activated = self.context.execute_with_sessions(
            (Some(AuthSession::Password), Some(session), None),
            |ctx| ctx.activate_credential(srk, ek, credential, secret),
        );
        self.flush(session_object(session));
        let inner_wrap_key = activated?;

        let public = Public::unmarshall(blob.identity_key_public)?;
        let encryption_key = Data::try_from(inner_wrap_key.value().to_vec())?;
        let duplicate = Private::try_from(blob.duplicate.to_vec())?;
        let wrapped_seed = EncryptedSecret::try_from(blob.wrapped_seed.to_vec())?;
        let private = self.context.execute_with_nullauth_session(|ctx| {
            ctx.import(
                srk.into(),
                Some(encryption_key),
                public.clone(),
                duplicate,
                wrapped_seed,
                SymmetricDefinitionObject::AES_128_CFB,
            )
        })?;
        let loaded = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.load(srk, private, public))?;

        if let Err(e) = self.evict_identity_key() {
            self.flush(loaded.into());
            return Err(e);
        }
        self.identity_key = Some(self.persist(loaded, IDENTITY_KEY_HANDLE)?);

        info!("identity key activated");
        Ok(())
    }

    fn sign(&mut self, data: &[u8]) -> Result<Vec<u8>, Self::Error> {
        let key = self.identity_key_handle()?;
        let buffer = MaxBuffer::try_from(data.to_vec())?;
        let digest = self
            .context
            .execute_with_nullauth_session(|ctx| ctx.hmac(key, buffer, HashingAlgorithm::Sha256))?;
        Ok(digest.value().to_vec())
    }
}

impl Drop for TpmSecurityProvider {
    fn drop(&mut self) {
        let handles = [
            self.ek.take().map(ObjectHandle::from),
            self.srk.take().map(ObjectHandle::from),
            self.identity_key.take(),
        ];
        for mut handle in handles.into_iter().flatten() {
            if let Err(e) = self.context.tr_close(&mut handle) {
                debug!("failed to close TPM handle: {e}");
            }
        }
        debug!("released TPM");
    }
}

fn session_object(session: AuthSession) -> ObjectHandle {
    ObjectHandle::from(SessionHandle::from(session))
}

/// RSA-2048 restricted decryption key, the SRK template used by the Azure
/// IoT device SDKs.
fn storage_root_template() -> Result<Public, SecurityError> {
    let object_attributes = ObjectAttributesBuilder::new()
        .with_fixed_tpm(true)
        .with_fixed_parent(true)
        .with_sensitive_data_origin(true)
        .with_user_with_auth(true)
        .with_no_da(true)
        .with_decrypt(true)
        .with_restricted(true)
        .build()?;

    let rsa_params = PublicRsaParametersBuilder::new()
        .with_symmetric(SymmetricDefinitionObject::AES_128_CFB)
        .with_scheme(RsaScheme::Null)
        .with_key_bits(RsaKeyBits::Rsa2048)
        .with_exponent(Default::default())
        .with_is_signing_key(false)
        .with_is_decryption_key(true)
        .with_restricted(true)
        .build()?;

    let public = PublicBuilder::new()
        .with_public_algorithm(PublicAlgorithm::Rsa)
        .with_name_hashing_algorithm(HashingAlgorithm::Sha256)
        .with_object_attributes(object_attributes)
        .with_rsa_parameters(rsa_params)
        .with_rsa_unique_identifier(PublicKeyRsa::default())
        .build()?;

    Ok(public)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tss_esapi::constants::CapabilityType;
    use tss_esapi::constants::tss::{TPM2_LOADED_SESSION_FIRST, TPM2_TRANSIENT_FIRST};
    use tss_esapi::structures::CapabilityData;

    /// Tests that need a TPM run against the simulator named here, e.g.
    /// `mssim:host=localhost,port=2321`, and are skipped otherwise.
    const TEST_TCTI: &str = "PROVISION_TPM_TEST_TCTI";

    fn test_provider() -> Option<TpmSecurityProvider> {
        let tcti = std::env::var(TEST_TCTI).ok()?;
        Some(TpmSecurityProvider::open(&tcti, "edge-01".parse().unwrap()).unwrap())
    }

    fn count_handles(provider: &mut TpmSecurityProvider, first: u32) -> usize {
        let (data, _) = provider
            .context
            .get_capability(CapabilityType::Handles, first, 64)
            .unwrap();
        match data {
            CapabilityData::Handles(handles) => handles.into_inner().len(),
            other => panic!("unexpected capability data: {other:?}"),
        }
    }

    #[test]
    fn reads_endorsement_and_storage_root_keys() {
        let Some(mut provider) = test_provider() else {
            return;
        };

        let ek = provider.endorsement_key().unwrap();
        let srk = provider.storage_root_key().unwrap();
        assert_eq!(usize::from(u16::from_be_bytes([ek[0], ek[1]])), ek.len() - 2);
        assert_ne!(ek, srk);

        // persisted keys are found again on the next read
        assert_eq!(provider.endorsement_key().unwrap(), ek);
    }

    #[test]
    fn failed_activation_releases_handles() {
        let Some(mut provider) = test_provider() else {
            return;
        };
        provider.endorsement_key().unwrap();
        provider.storage_root_key().unwrap();

        let sessions = count_handles(&mut provider, TPM2_LOADED_SESSION_FIRST);
        let transients = count_handles(&mut provider, TPM2_TRANSIENT_FIRST);

        // well formed blob the TPM cannot decrypt
        let mut blob = Vec::new();
        blob.extend(to_sized(&[0x5a; 34]));
        blob.extend(to_sized(&[0xa5; 256]));
        blob.extend(to_sized(&[0x01; 32]));
        blob.extend(to_sized(&[0x02; 256]));
        blob.extend(to_sized(&[0x03; 16]));
        assert!(provider.activate_identity_key(&blob).is_err());

        assert_eq!(count_handles(&mut provider, TPM2_LOADED_SESSION_FIRST), sessions);
        assert_eq!(count_handles(&mut provider, TPM2_TRANSIENT_FIRST), transients);
    }
}
