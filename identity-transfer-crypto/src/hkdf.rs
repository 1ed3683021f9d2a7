// SPDX-License-Identifier: MIT OR Apache-2.0

//! HMAC-based key derivation (HKDF) with SHA256.
//!
//! <https://www.rfc-editor.org/rfc/rfc5869>
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;

/// Extracts from `ikm` (salted with `salt` when it is not empty) and expands `N` bytes bound to
/// `info`.
pub fn hkdf<const N: usize>(salt: &[u8], ikm: &[u8], info: &[u8]) -> Result<[u8; N], HkdfError> {
    let salt = (!salt.is_empty()).then_some(salt);
    let mut okm = [0u8; N];
    Hkdf::<Sha256>::new(salt, ikm)
        .expand(info, &mut okm)
        .map_err(|_| HkdfError::InvalidLength(N))?;
    Ok(okm)
}

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("can not expand {0} bytes of key material with hkdf-sha256")]
    InvalidLength(usize),
}
