use std::fmt::Debug;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use thiserror::Error;

use crate::util::crypto::hmac_sha256;
use crate::util::sas::SasToken;

const HOSTNAME_KEY: &str = "HostName";
const SHAREDACCESSKEYNAME_KEY: &str = "SharedAccessKeyName";
const SHAREDACCESSKEY_KEY: &str = "SharedAccessKey";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectionStringError {
    #[error(r#"required parameter "{0}" is missing"#)]
    Missing(&'static str),

    #[error(r#"connection string's "SharedAccessKey" parameter could not be decoded from base64: {0}"#)]
    InvalidKey(#[from] base64::DecodeError),

    #[error("shared access key cannot be used for signing")]
    Signing,
}

/// Credentials of a DPS shared access policy, as found in
/// `HostName=<host>;SharedAccessKeyName=<policy>;SharedAccessKey=<base64 key>`.
#[derive(Clone, PartialEq, Eq)]
pub struct ServiceConnectionString {
    host_name: String,
    shared_access_key_name: String,
    shared_access_key: Vec<u8>,
}

impl ServiceConnectionString {
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn shared_access_key_name(&self) -> &str {
        &self.shared_access_key_name
    }

    /// Create a service SAS token scoped to the DPS host.
    pub fn sas_token(&self, expiry: u64) -> Result<SasToken, ConnectionStringError> {
        SasToken::sign(
            &self.host_name,
            expiry,
            Some(&self.shared_access_key_name),
            |data| hmac_sha256(&self.shared_access_key, data),
        )
        .map_err(|_| ConnectionStringError::Signing)
    }
}

// the key must never end up in logs
impl Debug for ServiceConnectionString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceConnectionString")
            .field("host_name", &self.host_name)
            .field("shared_access_key_name", &self.shared_access_key_name)
            .finish_non_exhaustive()
    }
}

impl FromStr for ServiceConnectionString {
    type Err = ConnectionStringError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut host_name = None;
        let mut shared_access_key_name = None;
        let mut shared_access_key = None;

        for section in s.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            // base64 keys end in '=' so only the first one separates the value
            let (key, value) = section.split_once('=').unwrap_or((section, ""));
            match key.trim() {
                HOSTNAME_KEY => host_name = Some(value.trim()),
                SHAREDACCESSKEYNAME_KEY => shared_access_key_name = Some(value.trim()),
                SHAREDACCESSKEY_KEY => shared_access_key = Some(value.trim()),
                _ => (), // Ignore extraneous component in the connection string
            }
        }

        let host_name = host_name
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::Missing(HOSTNAME_KEY))?;
        let shared_access_key_name = shared_access_key_name
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::Missing(SHAREDACCESSKEYNAME_KEY))?;
        let shared_access_key = shared_access_key
            .filter(|v| !v.is_empty())
            .ok_or(ConnectionStringError::Missing(SHAREDACCESSKEY_KEY))?;
        let shared_access_key = STANDARD.decode(shared_access_key)?;

        Ok(Self {
            host_name: host_name.to_owned(),
            shared_access_key_name: shared_access_key_name.to_owned(),
            shared_access_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::sas::url_encode;
    use pretty_assertions::assert_eq;

    const CONNECTION_STRING: &str = "HostName=test-dps.azure-devices-provisioning.net;SharedAccessKeyName=provisioningserviceowner;SharedAccessKey=c2VjcmV0LWtleQ==";

    #[test]
    fn parses_all_sections() {
        let cs: ServiceConnectionString = CONNECTION_STRING.parse().unwrap();
        assert_eq!(cs.host_name(), "test-dps.azure-devices-provisioning.net");
        assert_eq!(cs.shared_access_key_name(), "provisioningserviceowner");
        assert_eq!(cs.shared_access_key, b"secret-key");
    }

    #[test]
    fn ignores_order_whitespace_and_unknown_sections() {
        let cs: ServiceConnectionString = " SharedAccessKey=c2VjcmV0LWtleQ== ; Foo=bar;HostName=dps.example ;SharedAccessKeyName=owner;"
            .parse()
            .unwrap();
        assert_eq!(cs.host_name(), "dps.example");
        assert_eq!(cs.shared_access_key_name(), "owner");
        assert_eq!(cs.shared_access_key, b"secret-key");
    }

    #[test]
    fn reports_missing_sections() {
        assert_eq!(
            "SharedAccessKeyName=owner;SharedAccessKey=a2V5".parse::<ServiceConnectionString>(),
            Err(ConnectionStringError::Missing("HostName"))
        );
        assert_eq!(
            "HostName=dps;SharedAccessKey=a2V5".parse::<ServiceConnectionString>(),
            Err(ConnectionStringError::Missing("SharedAccessKeyName"))
        );
        assert_eq!(
            "HostName=dps;SharedAccessKeyName=owner;SharedAccessKey="
                .parse::<ServiceConnectionString>(),
            Err(ConnectionStringError::Missing("SharedAccessKey"))
        );
    }

    #[test]
    fn rejects_key_that_is_not_base64() {
        assert!(matches!(
            "HostName=dps;SharedAccessKeyName=owner;SharedAccessKey=not base64!"
                .parse::<ServiceConnectionString>(),
            Err(ConnectionStringError::InvalidKey(_))
        ));
    }

    #[test]
    fn debug_output_hides_key() {
        let cs: ServiceConnectionString = CONNECTION_STRING.parse().unwrap();
        let debug = format!("{cs:?}");
        assert!(!debug.contains("c2VjcmV0"));
        assert!(!debug.contains("secret"));
    }

    #[test]
    fn signs_token_for_host() {
        let cs: ServiceConnectionString = CONNECTION_STRING.parse().unwrap();
        let token = cs.sas_token(1_700_000_000).unwrap().to_string();

        let signature = STANDARD.encode(
            hmac_sha256(
                b"secret-key",
                b"test-dps.azure-devices-provisioning.net\n1700000000",
            )
            .unwrap(),
        );
        assert_eq!(
            token,
            format!(
                "SharedAccessSignature sr=test-dps.azure-devices-provisioning.net&sig={}&se=1700000000&skn=provisioningserviceowner",
                url_encode(&signature)
            )
        );
    }
}
