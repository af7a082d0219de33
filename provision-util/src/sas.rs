//! Shared access signature tokens.
//!
//! DPS and IoT Hub authenticate requests with a token of the form
//!
//! ```text
//! SharedAccessSignature sr=<resource>&sig=<signature>&se=<expiry>[&skn=<key name>]
//! ```
//!
//! where the signature is an HMAC-SHA256 over the url-encoded resource URI
//! and the expiry (seconds since the UNIX epoch), separated by a newline.
//! The HMAC key may be a shared access key from a connection string or an
//! identity key that never leaves the TPM, so signing is left to the caller.
use std::fmt::Display;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

const PREFIX: &str = "SharedAccessSignature";

/// Characters left as is when url-encoding token components
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Default lifetime of a generated token
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);

/// Percent-encode a value for use in a token or request path.
pub fn url_encode(value: &str) -> String {
    utf8_percent_encode(value, COMPONENT).to_string()
}

/// Expiry timestamp `ttl` from now, in seconds since the UNIX epoch.
pub fn expiry_from_now(ttl: Duration) -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    (now + ttl).as_secs()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SasToken {
    resource: String,
    signature: String,
    expiry: u64,
    key_name: Option<String>,
}

impl SasToken {
    /// The exact bytes that must be signed for `resource_uri` and `expiry`.
    pub fn string_to_sign(resource_uri: &str, expiry: u64) -> String {
        format!("{}\n{expiry}", url_encode(resource_uri))
    }

    /// Create a token for `resource_uri` using `sign` to compute the raw
    /// HMAC over the string to sign.
    pub fn sign<F, E>(
        resource_uri: &str,
        expiry: u64,
        key_name: Option<&str>,
        sign: F,
    ) -> Result<Self, E>
    where
        F: FnOnce(&[u8]) -> Result<Vec<u8>, E>,
    {
        let to_sign = Self::string_to_sign(resource_uri, expiry);
        let signature = STANDARD.encode(sign(to_sign.as_bytes())?);

        Ok(Self {
            resource: url_encode(resource_uri),
            signature,
            expiry,
            key_name: key_name.map(str::to_owned),
        })
    }

    pub fn expiry(&self) -> u64 {
        self.expiry
    }
}

impl Display for SasToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{PREFIX} sr={}&sig={}&se={}",
            self.resource,
            url_encode(&self.signature),
            self.expiry
        )?;
        if let Some(key_name) = &self.key_name {
            write!(f, "&skn={}", url_encode(key_name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hmac_sha256;
    use std::convert::Infallible;

    #[test]
    fn encodes_reserved_characters() {
        assert_eq!(
            url_encode("0ne000/registrations/edge-01"),
            "0ne000%2Fregistrations%2Fedge-01"
        );
        assert_eq!(url_encode("a+b/c="), "a%2Bb%2Fc%3D");
    }

    #[test]
    fn signs_encoded_resource_and_expiry() {
        let mut signed = Vec::new();
        let token = SasToken::sign("hub/devices/dev", 1700000000, None, |data| {
            signed.extend_from_slice(data);
            Ok::<_, Infallible>(vec![0xff, 0xfe])
        })
        .unwrap();

        assert_eq!(signed, b"hub%2Fdevices%2Fdev\n1700000000");
        assert_eq!(
            token.to_string(),
            "SharedAccessSignature sr=hub%2Fdevices%2Fdev&sig=%2F%2F4%3D&se=1700000000"
        );
    }

    #[test]
    fn appends_key_name() {
        let key = b"secret";
        let token = SasToken::sign(
            "my-dps.azure-devices-provisioning.net",
            42,
            Some("provisioningserviceowner"),
            |data| hmac_sha256(key, data),
        )
        .unwrap();

        let expected_sig =
            STANDARD.encode(hmac_sha256(key, b"my-dps.azure-devices-provisioning.net\n42").unwrap());
        assert_eq!(
            token.to_string(),
            format!(
                "SharedAccessSignature sr=my-dps.azure-devices-provisioning.net&sig={}&se=42&skn=provisioningserviceowner",
                url_encode(&expected_sig)
            )
        );
    }

    #[test]
    fn expiry_is_in_the_future() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let expiry = expiry_from_now(DEFAULT_TTL);
        assert!(expiry >= now + 3599);
    }
}
