use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidActivationBlob {
    #[error("activation blob is truncated: missing {0}")]
    Truncated(&'static str),

    #[error("activation blob has {0} unexpected trailing bytes")]
    TrailingBytes(usize),
}

/// Identity key activation data handed out by DPS in the `authenticationKey`
/// field of a TPM registration challenge.
///
/// The blob is a concatenation of TPM2B structures, each a big-endian `u16`
/// size followed by that many bytes. The borrowed slices hold the buffer
/// contents without the size prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationBlob<'a> {
    /// TPM2B_ID_OBJECT: credential wrapping the inner wrap key
    pub credential: &'a [u8],
    /// TPM2B_ENCRYPTED_SECRET: seed for the credential, encrypted to the EK
    pub secret: &'a [u8],
    /// TPM2B_PRIVATE: duplicated identity key
    pub duplicate: &'a [u8],
    /// TPM2B_ENCRYPTED_SECRET: seed for the duplicate, encrypted to the SRK
    pub wrapped_seed: &'a [u8],
    /// TPM2B_PUBLIC: public area of the identity key
    pub identity_key_public: &'a [u8],
    /// TPM2B_DATA: encrypted URI data, unused by the service today
    pub encrypted_uri: &'a [u8],
}

impl<'a> ActivationBlob<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self, InvalidActivationBlob> {
        let mut rest = bytes;

        let credential = take_sized(&mut rest, "credential blob")?;
        let secret = take_sized(&mut rest, "encrypted secret")?;
        let duplicate = take_sized(&mut rest, "duplicate private key")?;
        let wrapped_seed = take_sized(&mut rest, "encrypted wrap key seed")?;
        let identity_key_public = take_sized(&mut rest, "identity key public area")?;

        // older service versions omit the trailing URI data
        let encrypted_uri = if rest.is_empty() {
            &[][..]
        } else {
            take_sized(&mut rest, "encrypted uri data")?
        };

        if !rest.is_empty() {
            return Err(InvalidActivationBlob::TrailingBytes(rest.len()));
        }

        Ok(Self {
            credential,
            secret,
            duplicate,
            wrapped_seed,
            identity_key_public,
            encrypted_uri,
        })
    }
}

fn take_sized<'a>(
    rest: &mut &'a [u8],
    field: &'static str,
) -> Result<&'a [u8], InvalidActivationBlob> {
    let (size, tail) = rest
        .split_first_chunk::<2>()
        .ok_or(InvalidActivationBlob::Truncated(field))?;
    let size = u16::from_be_bytes(*size) as usize;
    if tail.len() < size {
        return Err(InvalidActivationBlob::Truncated(field));
    }
    let (value, tail) = tail.split_at(size);
    *rest = tail;
    Ok(value)
}

/// Encode `value` as a TPM2B structure.
pub(crate) fn to_sized(value: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(value.len() + 2);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
    out
}
