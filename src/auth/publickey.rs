//! Signature-algorithm compatibility and the canonical signed-data buffer
//! for the `publickey` authentication method (`spec.md` §4.4).

use ssh_key::{Algorithm, PublicKey, Signature};
use ssh_packet::{
    arch::{Ascii, Utf8},
    crypto::signature,
};

use crate::Result;

/// Whether a client-announced signature algorithm name is a legal pairing
/// for `key`'s own type.
///
/// The teacher's equivalent check (`assh-auth/src/handler/mod.rs`) compares
/// `key.algorithm().as_str().as_bytes() == algorithm.as_ref()` directly,
/// which rejects `rsa-sha2-256`/`rsa-sha2-512` signatures on an `ssh-rsa`
/// key, since `key.algorithm()` reports the key's own type, not the hash
/// variant used for this particular signature. This is the explicit
/// compatibility matrix instead.
pub fn is_compatible(key: &PublicKey, signature_algorithm: &[u8]) -> bool {
    match key.algorithm() {
        Algorithm::Ed25519 => signature_algorithm == b"ssh-ed25519",
        Algorithm::Rsa { .. } => matches!(
            signature_algorithm,
            b"ssh-rsa" | b"rsa-sha2-256" | b"rsa-sha2-512"
        ),
        _ => false,
    }
}

/// Verify a `publickey` authentication signature over the canonical
/// signed-data buffer: `session_id`, `USERAUTH_REQUEST`, `username`,
/// `service`, `"publickey"`, `true`, `algorithm`, `public_key_blob`, each
/// length-prefixed (`spec.md` §4.4).
///
/// `blob` is used verbatim, as received from the wire — for an RSA key this
/// is already the canonical `string("ssh-rsa") || string(e) || string(n)`
/// encoding, since that is the only wire representation an RSA key blob
/// ever has, regardless of which `rsa-sha2-*` signature algorithm
/// accompanies it.
pub fn verify(
    session_id: &[u8],
    username: &Utf8<'_>,
    service_name: &Ascii<'_>,
    algorithm: &Ascii<'_>,
    blob: &[u8],
    key: &PublicKey,
    sig: &Signature,
) -> Result<()> {
    if !is_compatible(key, algorithm.as_ref()) {
        return Err(crate::Error::UnsupportedMethod);
    }

    let message = signature::Publickey {
        session_id: session_id.into(),
        username: username.as_borrow(),
        service_name: service_name.as_borrow(),
        algorithm: algorithm.as_borrow(),
        blob: blob.to_vec().into(),
    };

    message.verify(key, sig).map_err(crate::Error::from)
}
