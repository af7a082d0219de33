/*
TPM backed security provider.

Wraps a `tss_esapi::Context` and exposes the operations needed to attest a
device with DPS: reading the endorsement and storage root keys, importing the
identity key that DPS hands out during registration, and signing SAS tokens
with that key without it ever leaving the TPM.
*/

mod activation;
mod provider;

pub use activation::{ActivationBlob, InvalidActivationBlob};
pub use provider::{SecurityError, TpmSecurityProvider};

use provision_util as util;
