//! `CipherState`: packet framing, AES-256-GCM encryption and the rekey swap.
//!
//! The teacher (`assh/src/algorithm/cipher.rs`) lists `aes256-gcm@openssh.com`
//! as a cipher variant but leaves its `encrypt`/`decrypt` arms as a `TODO`;
//! this module is the implementation that was never written, built the way
//! the teacher builds its CBC/CTR arms (`assh/src/transport/mod.rs`'s
//! `OpeningCipher`/`SealingCipher` padding math), but exposed as the explicit
//! `seal`/`open`/`enable_encryption`/`prepare_rekey`/`swap_rekey` operations
//! `SPEC_FULL.md` §4.1 specifies, since the generic cipher-trait plumbing the
//! teacher builds around was never exercised against a real AEAD cipher.

mod kdf;
pub use kdf::{derive, letter};

use aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::RngCore;
use securefmt::Debug;
use ssh_packet::arch::MpInt;

use crate::{Error, Result};

const KEY_SIZE: usize = 32;
const IV_SIZE: usize = 12;
const TAG_SIZE: usize = 16;
const BLOCK_SIZE: usize = 16;
const MIN_PADDING: usize = 4;
const CLEARTEXT_ALIGN: usize = 8;

#[derive(Debug, Clone, Default)]
struct DirectionalKeys {
    #[sensitive]
    key: Vec<u8>,
    #[sensitive]
    iv: Vec<u8>,
}

impl DirectionalKeys {
    /// `base_counter + seq (mod 2^32)` folded into the IV's last four bytes,
    /// per `SPEC_FULL.md`/`spec.md` §4.1's nonce construction.
    fn nonce_for(&self, seq: u32) -> [u8; IV_SIZE] {
        let mut nonce = [0u8; IV_SIZE];
        nonce[..8].copy_from_slice(&self.iv[..8]);

        let base_counter = u32::from_be_bytes(self.iv[8..12].try_into().expect("iv is 12 bytes"));
        nonce[8..].copy_from_slice(&base_counter.wrapping_add(seq).to_be_bytes());

        nonce
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key))
    }
}

/// Tracks per-direction keys, sequence counters, and the rekey shadow slots
/// for one connection's transport. See `spec.md` §3 for the invariants.
#[derive(Debug)]
pub struct CipherState {
    encryption_active: bool,
    has_completed_initial_kex: bool,
    rekey_in_progress: bool,

    rx: DirectionalKeys,
    tx: DirectionalKeys,
    rx_shadow: Option<DirectionalKeys>,
    tx_shadow: Option<DirectionalKeys>,

    rx_seq: u64,
    tx_seq: u64,
}

impl Default for CipherState {
    fn default() -> Self {
        Self {
            encryption_active: false,
            has_completed_initial_kex: false,
            rekey_in_progress: false,
            rx: DirectionalKeys::default(),
            tx: DirectionalKeys::default(),
            rx_shadow: None,
            tx_shadow: None,
            rx_seq: 0,
            tx_seq: 0,
        }
    }
}

impl CipherState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_encryption_active(&self) -> bool {
        self.encryption_active
    }

    pub fn has_completed_initial_kex(&self) -> bool {
        self.has_completed_initial_kex
    }

    pub fn is_rekey_in_progress(&self) -> bool {
        self.rekey_in_progress
    }

    /// Derive shadow keys for both directions from a completed key exchange.
    /// Does not affect traffic until [`CipherState::swap_rekey`] is called.
    pub fn prepare_rekey(&mut self, shared_secret: &MpInt<'_>, exchange_hash: &[u8], session_id: &[u8]) {
        self.rekey_in_progress = true;

        self.rx_shadow = Some(DirectionalKeys {
            iv: derive::<sha2::Sha256>(shared_secret, exchange_hash, letter::CLIENT_TO_SERVER_IV, session_id, IV_SIZE),
            key: derive::<sha2::Sha256>(shared_secret, exchange_hash, letter::CLIENT_TO_SERVER_KEY, session_id, KEY_SIZE),
        });
        self.tx_shadow = Some(DirectionalKeys {
            iv: derive::<sha2::Sha256>(shared_secret, exchange_hash, letter::SERVER_TO_CLIENT_IV, session_id, IV_SIZE),
            key: derive::<sha2::Sha256>(shared_secret, exchange_hash, letter::SERVER_TO_CLIENT_KEY, session_id, KEY_SIZE),
        });

        tracing::debug!("Derived shadow keys for rekey");
    }

    /// Atomically swap the shadow keys into place and reset both sequence
    /// counters to zero. Must only be called once both NEWKEYS have crossed
    /// the wire (spec.md §4.1/§5: no packet may mix old and new keys).
    pub fn swap_rekey(&mut self) {
        if let Some(rx) = self.rx_shadow.take() {
            self.rx = rx;
            self.rx_seq = 0;
        }
        if let Some(tx) = self.tx_shadow.take() {
            self.tx = tx;
            self.tx_seq = 0;
        }

        self.rekey_in_progress = false;
        self.enable_encryption();

        tracing::debug!("Rekey complete, sequence counters reset");
    }

    /// Flip `encryption_active` on first NEWKEYS. A no-op afterwards.
    pub fn enable_encryption(&mut self) {
        if !self.encryption_active {
            tracing::debug!("Encryption enabled");
        }

        self.encryption_active = true;
        self.has_completed_initial_kex = true;
    }

    fn padding_for(&self, payload_len: usize) -> u8 {
        let align = if self.encryption_active { BLOCK_SIZE } else { CLEARTEXT_ALIGN };
        let fixed = 1 + payload_len;

        let mut padding = align - (fixed % align);
        if padding < MIN_PADDING {
            padding += align;
        }

        padding as u8
    }

    /// Frame and, once active, AEAD-encrypt one payload. Advances the S→C
    /// sequence counter. Returns the exact bytes to place on the wire.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        let padding = self.padding_for(payload.len());

        let mut body = Vec::with_capacity(1 + payload.len() + padding as usize);
        body.push(padding);
        body.extend_from_slice(payload);

        let start = body.len();
        body.resize(start + padding as usize, 0);
        rand::thread_rng().fill_bytes(&mut body[start..]);

        let length = body.len() as u32;
        let mut wire = Vec::with_capacity(4 + body.len() + TAG_SIZE);
        wire.extend_from_slice(&length.to_be_bytes());

        if self.encryption_active {
            let nonce = self.tx.nonce_for(self.tx_seq as u32);
            let tag = self
                .tx
                .cipher()
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &wire[..4], &mut body)
                .map_err(|_| Error::TagMismatch)?;

            wire.extend_from_slice(&body);
            wire.extend_from_slice(&tag);
        } else {
            wire.extend_from_slice(&body);
        }

        self.tx_seq = self.tx_seq.wrapping_add(1);

        Ok(wire)
    }

    /// Attempt to decrypt and unframe one packet from the front of `buffer`.
    ///
    /// Returns `Ok(None)` when `buffer` does not yet hold a complete packet
    /// (more bytes must be read from the socket); `Ok(Some((payload,
    /// consumed)))` on success; `Err` only on a fatal framing or tag failure.
    pub fn open(&mut self, buffer: &[u8]) -> Result<Option<(Vec<u8>, usize)>> {
        if buffer.len() < 4 {
            return Ok(None);
        }

        let length = u32::from_be_bytes(buffer[0..4].try_into().expect("checked above")) as usize;
        let tag_len = if self.encryption_active { TAG_SIZE } else { 0 };
        let total = 4 + length + tag_len;

        if buffer.len() < total {
            return Ok(None);
        }

        let mut body = buffer[4..4 + length].to_vec();

        if self.encryption_active {
            let tag_bytes = &buffer[4 + length..total];
            let nonce = self.rx.nonce_for(self.rx_seq as u32);

            self.rx
                .cipher()
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    &buffer[..4],
                    &mut body,
                    Tag::from_slice(tag_bytes),
                )
                .map_err(|_| Error::TagMismatch)?;
        }

        self.rx_seq = self.rx_seq.wrapping_add(1);

        let padding_length = *body
            .first()
            .ok_or_else(|| Error::Framing("empty packet body".into()))? as usize;

        if padding_length + 1 > body.len() {
            return Err(Error::Framing("padding length exceeds packet body".into()));
        }

        let payload = body[1..body.len() - padding_length].to_vec();

        Ok(Some((payload, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keyed_pair() -> (CipherState, CipherState) {
        let shared_secret = [0x42u8; 32];
        let secret = MpInt::positive(&shared_secret);
        let hash = [0x13u8; 32];
        let session_id = hash;

        let mut server = CipherState::new();
        server.prepare_rekey(&secret, &hash, &session_id);
        server.swap_rekey();

        let mut client = CipherState::new();
        client.prepare_rekey(&secret, &hash, &session_id);
        client.swap_rekey();

        // `prepare_rekey` always derives `rx` as C→S and `tx` as S→C (this
        // type only ever models the server's side of one connection). Swap
        // them for this stand-in "client" so it decrypts what the server
        // actually sent: what the server transmits on `tx` (S→C) is what
        // the peer receives on `rx`, and vice versa.
        std::mem::swap(&mut client.rx, &mut client.tx);

        (server, client)
    }

    #[test]
    fn cleartext_roundtrip_before_encryption_enabled() {
        let mut state = CipherState::new();
        let payload = b"SSH-2.0 payload bytes";

        let wire = state.seal(payload).unwrap();
        assert_eq!(wire.len() % 8, (4) % 8); // length is 4B, body is padded to a multiple of 8

        let mut opener = CipherState::new();
        let (decoded, consumed) = opener.open(&wire).unwrap().unwrap();

        assert_eq!(decoded, payload);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn encrypted_roundtrip_uses_matching_directions() {
        let (mut server, mut client) = keyed_pair();

        server.enable_encryption();
        client.enable_encryption();

        let payload = b"channel data going from server to client";
        let wire = server.seal(payload).unwrap();

        // Total on-wire size is 4 (length) + padded-plaintext + 16 (tag).
        let padded_plaintext_length = wire.len() - 4 - 16;
        assert_eq!(padded_plaintext_length % 16, 0);
        assert!(padded_plaintext_length >= 16);

        let (decoded, consumed) = client.open(&wire).unwrap().unwrap();
        assert_eq!(decoded, payload);
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn tag_tampering_is_fatal() {
        let (mut server, mut client) = keyed_pair();
        server.enable_encryption();
        client.enable_encryption();

        let mut wire = server.seal(b"hello").unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 0xff;

        assert!(client.open(&wire).is_err());
    }

    #[test]
    fn rekey_resets_sequence_counters() {
        let mut state = CipherState::new();
        state.enable_encryption();

        let secret = MpInt::positive(&[7u8; 32]);
        let hash = [0x99u8; 32];
        let session_id = [0x01u8; 32];

        state.tx_seq = 12;
        state.rx_seq = 9;

        state.prepare_rekey(&secret, &hash, &session_id);
        assert!(state.is_rekey_in_progress());

        state.swap_rekey();

        assert_eq!(state.tx_seq, 0);
        assert_eq!(state.rx_seq, 0);
        assert!(!state.is_rekey_in_progress());
    }
}
