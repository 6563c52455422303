//! KEXINIT negotiation and the `curve25519-sha256` / `ssh-ed25519` exchange.
//!
//! Grounded on `assh/src/algorithm/kex/curve25519.rs`'s `as_server`, with
//! the generic `Digest`/`Cipher`/`Hmac` parameters dropped since
//! `spec.md` §4.2 fixes the suite to one choice per list.

use rand::RngCore;
use secrecy::{ExposeSecret, SecretBox};
use signature::{SignatureEncoding, Signer, Verifier};
use ssh_key::{PrivateKey, PublicKey, Signature};
use ssh_packet::{
    arch::{MpInt, NameList},
    crypto::exchange,
    trans::{KexEcdhInit, KexEcdhReply, KexInit},
    Id,
};

use crate::{Error, Result};

/// The one and only algorithm suite this server ever offers (`spec.md` §4.2).
pub const KEX_ALGORITHM: &str = "curve25519-sha256";
pub const HOST_KEY_ALGORITHM: &str = "ssh-ed25519";
pub const CIPHER_ALGORITHM: &str = "aes256-gcm@openssh.com";
pub const MAC_ALGORITHM: &str = "hmac-sha2-256";
pub const COMPRESSION_ALGORITHM: &str = "none";

/// Build the server's own `KEXINIT`, announcing exactly one choice per list.
pub fn server_kexinit() -> KexInit<'static> {
    let mut cookie = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut cookie);

    KexInit {
        cookie,
        kex_algorithms: NameList::new([KEX_ALGORITHM]),
        server_host_key_algorithms: NameList::new([HOST_KEY_ALGORITHM]),
        encryption_algorithms_client_to_server: NameList::new([CIPHER_ALGORITHM]),
        encryption_algorithms_server_to_client: NameList::new([CIPHER_ALGORITHM]),
        mac_algorithms_client_to_server: NameList::new([MAC_ALGORITHM]),
        mac_algorithms_server_to_client: NameList::new([MAC_ALGORITHM]),
        compression_algorithms_client_to_server: NameList::new([COMPRESSION_ALGORITHM]),
        compression_algorithms_server_to_client: NameList::new([COMPRESSION_ALGORITHM]),
        languages_client_to_server: NameList::default(),
        languages_server_to_client: NameList::default(),
        first_kex_packet_follows: false.into(),
    }
}

/// Confirm the client offered (among others) every algorithm we fixed on.
/// A client that did not is non-compliant: the exchange cannot proceed.
pub fn validate_client_offer(client: &KexInit<'_>, ours: &KexInit<'_>) -> Result<()> {
    let checks = [
        client
            .kex_algorithms
            .preferred_in(&ours.kex_algorithms)
            .is_some(),
        client
            .server_host_key_algorithms
            .preferred_in(&ours.server_host_key_algorithms)
            .is_some(),
        client
            .encryption_algorithms_client_to_server
            .preferred_in(&ours.encryption_algorithms_client_to_server)
            .is_some(),
        client
            .encryption_algorithms_server_to_client
            .preferred_in(&ours.encryption_algorithms_server_to_client)
            .is_some(),
        client
            .mac_algorithms_client_to_server
            .preferred_in(&ours.mac_algorithms_client_to_server)
            .is_some(),
        client
            .mac_algorithms_server_to_client
            .preferred_in(&ours.mac_algorithms_server_to_client)
            .is_some(),
    ];

    if checks.into_iter().all(|matched| matched) {
        Ok(())
    } else {
        Err(Error::KexError)
    }
}

/// The outcome of a completed (re)key exchange: the shared secret (canonical
/// mpint bytes) and the exchange hash H. The session id is pinned by the
/// caller from the *first* exchange's hash and never recomputed.
pub struct Exchange {
    pub shared_secret: Vec<u8>,
    pub exchange_hash: [u8; 32],
}

/// Run the server side of `curve25519-sha256`: consume the client's
/// ephemeral public key, generate ours, compute the shared secret, sign the
/// transcript with the host key, and produce the `KEXDH_REPLY` to send back.
///
/// `i_c_raw`/`i_s_raw` are the client's and server's KEXINIT payloads
/// verbatim, including the leading message-type byte, as `spec.md` §4.2
/// requires for the exchange-hash transcript.
pub fn server_exchange(
    v_c: &Id,
    v_s: &Id,
    i_c_raw: &[u8],
    i_s_raw: &[u8],
    host_key: &PrivateKey,
    ecdh_init: &KexEcdhInit<'_>,
) -> Result<(Exchange, KexEcdhReply<'static>)> {
    let e_s = x25519_dalek::EphemeralSecret::random_from_rng(rand::thread_rng());
    let q_s = x25519_dalek::PublicKey::from(&e_s);

    let q_c_bytes: [u8; 32] = ecdh_init
        .q_c
        .as_ref()
        .try_into()
        .map_err(|_| Error::KexError)?;
    let q_c = x25519_dalek::PublicKey::from(q_c_bytes);

    let secret = e_s.diffie_hellman(&q_c);
    let secret = SecretBox::new(Box::new(secret.to_bytes()));

    let k_s = host_key.public_key().to_bytes()?;

    let mpint_secret = MpInt::positive(secret.expose_secret());

    let hash = exchange::Ecdh {
        v_c: v_c.to_string().into_bytes().into(),
        v_s: v_s.to_string().into_bytes().into(),
        i_c: i_c_raw.to_vec().into(),
        i_s: i_s_raw.to_vec().into(),
        k_s: k_s.as_slice().into(),
        q_c: q_c.as_bytes().to_vec().into(),
        q_s: q_s.as_bytes().to_vec().into(),
        k: mpint_secret.as_borrow(),
    }
    .hash::<sha2::Sha256>();

    let signature = Signer::sign(host_key, &hash);

    let reply = KexEcdhReply {
        k_s: k_s.into(),
        q_s: q_s.as_bytes().to_vec().into(),
        signature: signature.to_vec().into(),
    };

    Ok((
        Exchange {
            shared_secret: mpint_secret.to_vec(),
            exchange_hash: hash.into(),
        },
        reply,
    ))
}

/// Verify a host key's self-signature is unnecessary on the server side
/// (we hold the private key); this helper exists for the client-facing
/// symmetry tests below, exercising the same transcript construction.
#[cfg(test)]
fn verify_signature(public: &PublicKey, hash: &[u8], signature: &Signature) -> Result<()> {
    Verifier::verify(public, hash, signature)?;
    Ok(())
}
