//! End-to-end scenarios (`spec.md` §8) driven over a real loopback socket.
//!
//! `whisp` ships no client, so this test drives the wire protocol itself —
//! the way the teacher's own `tests/self.rs` drives a real
//! `assh::session::client::Client` against `tests/common::server`'s accepted
//! socket, just without a borrowed client implementation to lean on. The
//! framing/AEAD here deliberately duplicates `CipherState`'s algorithm
//! rather than reusing it: a real client is a distinct party with its own
//! key material, and `CipherState`'s directional fields are private to the
//! crate besides.

mod common;

use std::time::Duration;

use aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use async_std::io::{ReadExt, WriteExt};
use async_std::net::TcpStream;
use rand::RngCore;
use signature::Verifier;
use ssh_packet::{
    arch::MpInt,
    crypto::exchange,
    trans::{KexEcdhInit, KexEcdhReply, ServiceAccept, ServiceRequest},
    userauth, Id,
};
use test_log::test;

use whisp::cipher::{derive, letter};
use whisp::packet::{self, disconnect_reason, msg, Reader, Writer};
use whisp::{Config, Registry};

const TAG_SIZE: usize = 16;
const AEAD_BLOCK: usize = 16;
const CLEARTEXT_ALIGN: usize = 8;
const MIN_PADDING: usize = 4;

fn padding_for(encrypted: bool, payload_len: usize) -> u8 {
    let align = if encrypted { AEAD_BLOCK } else { CLEARTEXT_ALIGN };
    let fixed = 1 + payload_len;
    let mut padding = align - (fixed % align);
    if padding < MIN_PADDING {
        padding += align;
    }
    padding as u8
}

fn nonce_for(iv: &[u8], seq: u32) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[..8].copy_from_slice(&iv[..8]);
    let base = u32::from_be_bytes(iv[8..12].try_into().expect("iv is 12 bytes"));
    nonce[8..].copy_from_slice(&base.wrapping_add(seq).to_be_bytes());
    nonce
}

/// The client side of one connection's binary-packet transport: cleartext
/// framing before `NEWKEYS`, `aes256-gcm@openssh.com` after, mirroring
/// `spec.md` §4.1 from the other end of the wire.
struct ClientTransport {
    stream: TcpStream,
    encrypted: bool,
    tx_key: Vec<u8>,
    tx_iv: Vec<u8>,
    tx_seq: u32,
    rx_key: Vec<u8>,
    rx_iv: Vec<u8>,
    rx_seq: u32,
}

impl ClientTransport {
    fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            encrypted: false,
            tx_key: Vec::new(),
            tx_iv: Vec::new(),
            tx_seq: 0,
            rx_key: Vec::new(),
            rx_iv: Vec::new(),
            rx_seq: 0,
        }
    }

    fn install_keys(&mut self, tx_key: Vec<u8>, tx_iv: Vec<u8>, rx_key: Vec<u8>, rx_iv: Vec<u8>) {
        self.tx_key = tx_key;
        self.tx_iv = tx_iv;
        self.rx_key = rx_key;
        self.rx_iv = rx_iv;
    }

    async fn send(&mut self, payload: Vec<u8>) -> std::io::Result<()> {
        let padding = padding_for(self.encrypted, payload.len());

        let mut body = Vec::with_capacity(1 + payload.len() + padding as usize);
        body.push(padding);
        body.extend_from_slice(&payload);
        let start = body.len();
        body.resize(start + padding as usize, 0);
        rand::thread_rng().fill_bytes(&mut body[start..]);

        let length = body.len() as u32;
        let mut wire = Vec::with_capacity(4 + body.len() + TAG_SIZE);
        wire.extend_from_slice(&length.to_be_bytes());

        if self.encrypted {
            let nonce = nonce_for(&self.tx_iv, self.tx_seq);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.tx_key));
            let tag = cipher
                .encrypt_in_place_detached(Nonce::from_slice(&nonce), &wire[..4], &mut body)
                .expect("encryption cannot fail with a correctly sized key/nonce");
            wire.extend_from_slice(&body);
            wire.extend_from_slice(&tag);
        } else {
            wire.extend_from_slice(&body);
        }

        self.tx_seq = self.tx_seq.wrapping_add(1);
        self.stream.write_all(&wire).await?;
        self.stream.flush().await
    }

    /// Read exactly one packet's payload (message-type byte included).
    async fn recv(&mut self) -> std::io::Result<Vec<u8>> {
        let mut len_buf = [0u8; 4];
        self.stream.read_exact(&mut len_buf).await?;
        let length = u32::from_be_bytes(len_buf) as usize;

        let tag_len = if self.encrypted { TAG_SIZE } else { 0 };
        let mut body = vec![0u8; length + tag_len];
        self.stream.read_exact(&mut body).await?;

        let mut plaintext = body[..length].to_vec();

        if self.encrypted {
            let tag_bytes = &body[length..];
            let nonce = nonce_for(&self.rx_iv, self.rx_seq);
            let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.rx_key));
            cipher
                .decrypt_in_place_detached(
                    Nonce::from_slice(&nonce),
                    &len_buf,
                    &mut plaintext,
                    Tag::from_slice(tag_bytes),
                )
                .expect("the server must have encrypted with the keys we just derived");
        }

        self.rx_seq = self.rx_seq.wrapping_add(1);

        let padding_length = plaintext[0] as usize;
        Ok(plaintext[1..plaintext.len() - padding_length].to_vec())
    }

    fn enable_encryption(&mut self) {
        self.encrypted = true;
    }
}

/// Perform the version exchange, key exchange, `NEWKEYS`, and
/// `EXT_INFO`/`SERVICE_ACCEPT` handshake against a freshly accepted
/// `whisp::Connection`, leaving `transport` ready for `USERAUTH_REQUEST`s.
async fn handshake(stream: TcpStream) -> ClientTransport {
    let mut transport = ClientTransport::new(stream);

    let v_s = Id::from_async_reader(&mut transport.stream)
        .await
        .expect("server must send its identification line first");
    let v_c = Id::v2("TestClient_1.0", None::<&str>);
    v_c.to_async_writer(&mut transport.stream)
        .await
        .expect("writing our identification line");
    transport.stream.flush().await.unwrap();

    let i_s_raw = transport.recv().await.expect("server KEXINIT");
    assert_eq!(Reader::new(&i_s_raw).message_type().unwrap(), msg::KEXINIT);

    let client_kexinit = whisp::kex::server_kexinit();
    let i_c_raw = packet::encode(&client_kexinit).unwrap();
    transport.send(i_c_raw.clone()).await.unwrap();

    let e_c = x25519_dalek::EphemeralSecret::random_from_rng(rand::thread_rng());
    let q_c = x25519_dalek::PublicKey::from(&e_c);

    transport
        .send(
            packet::encode(&KexEcdhInit {
                q_c: q_c.as_bytes().to_vec().into(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let reply_raw = transport.recv().await.expect("server KEXDH_REPLY");
    assert_eq!(
        Reader::new(&reply_raw).message_type().unwrap(),
        msg::KEXDH_REPLY
    );
    let reply: KexEcdhReply = packet::decode(&reply_raw).unwrap();

    let q_s_bytes: [u8; 32] = reply.q_s.as_ref().try_into().unwrap();
    let q_s = x25519_dalek::PublicKey::from(q_s_bytes);
    let shared = e_c.diffie_hellman(&q_s);
    let shared_secret = MpInt::positive(shared.as_bytes());

    let hash: [u8; 32] = exchange::Ecdh {
        v_c: v_c.to_string().into_bytes().into(),
        v_s: v_s.to_string().into_bytes().into(),
        i_c: i_c_raw.into(),
        i_s: i_s_raw.into(),
        k_s: reply.k_s.as_ref().into(),
        q_c: q_c.as_bytes().to_vec().into(),
        q_s: q_s.as_bytes().to_vec().into(),
        k: shared_secret.as_borrow(),
    }
    .hash::<sha2::Sha256>()
    .into();

    let host_key = ssh_key::PublicKey::from_bytes(reply.k_s.as_ref())
        .expect("host key blob must parse");
    let signature = ssh_key::Signature::try_from(reply.signature.as_ref())
        .expect("signature blob must parse");
    Verifier::verify(&host_key, &hash, &signature)
        .expect("the server must sign H with its host key");

    let session_id = hash;
    transport.install_keys(
        derive::<sha2::Sha256>(&shared_secret, &hash, letter::CLIENT_TO_SERVER_KEY, &session_id, 32),
        derive::<sha2::Sha256>(&shared_secret, &hash, letter::CLIENT_TO_SERVER_IV, &session_id, 12),
        derive::<sha2::Sha256>(&shared_secret, &hash, letter::SERVER_TO_CLIENT_KEY, &session_id, 32),
        derive::<sha2::Sha256>(&shared_secret, &hash, letter::SERVER_TO_CLIENT_IV, &session_id, 12),
    );

    transport.send(vec![msg::NEWKEYS]).await.unwrap();

    let newkeys = transport.recv().await.expect("server NEWKEYS");
    assert_eq!(newkeys, vec![msg::NEWKEYS]);
    transport.enable_encryption();

    let ext_info = transport.recv().await.expect("server EXT_INFO");
    assert_eq!(Reader::new(&ext_info).message_type().unwrap(), msg::EXT_INFO);

    transport
        .send(
            packet::encode(&ServiceRequest {
                service_name: "ssh-userauth".into(),
            })
            .unwrap(),
        )
        .await
        .unwrap();

    let accept_raw = transport.recv().await.expect("SERVICE_ACCEPT");
    let _accept: ServiceAccept = packet::decode(&accept_raw).unwrap();

    transport
}

#[test(async_std::test)]
async fn shell_session_pumps_data_through_the_pty() {
    let mut registry = Registry::new();
    registry.register("default", "cat").unwrap();

    let config = Config {
        registry,
        ..Config::default()
    };

    let (addr, _handle) = common::server(config).await.unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut transport = handshake(stream).await;

    // Scenario 3: probe with `none`, then a deliberate second attempt.
    let probe = userauth::Request {
        username: "default".into(),
        service_name: "ssh-connection".into(),
        method: userauth::Method::None,
    };
    transport.send(packet::encode(&probe).unwrap()).await.unwrap();

    let probe_reply = transport.recv().await.unwrap();
    assert_eq!(
        Reader::new(&probe_reply).message_type().unwrap(),
        msg::USERAUTH_FAILURE
    );

    let attempt = userauth::Request {
        username: "default".into(),
        service_name: "ssh-connection".into(),
        method: userauth::Method::Password {
            password: "hunter2".into(),
            new: None,
        },
    };
    transport.send(packet::encode(&attempt).unwrap()).await.unwrap();

    let success = transport.recv().await.unwrap();
    assert_eq!(
        Reader::new(&success).message_type().unwrap(),
        msg::USERAUTH_SUCCESS
    );

    // Scenario 4: open a session channel, allocate a PTY, start the app.
    let local_channel = 0u32;
    transport
        .send(
            Writer::new(msg::CHANNEL_OPEN)
                .string(b"session")
                .u32(local_channel)
                .u32(2 * 1024 * 1024)
                .u32(32768)
                .into_vec(),
        )
        .await
        .unwrap();

    let open_reply = transport.recv().await.unwrap();
    let mut reader = Reader::new(&open_reply);
    assert_eq!(reader.u8().unwrap(), msg::CHANNEL_OPEN_CONFIRMATION);
    assert_eq!(reader.u32().unwrap(), local_channel);
    let server_channel = reader.u32().unwrap();

    let mut modes = Vec::new();
    modes.extend_from_slice(&[36]); // ICRNL
    modes.extend_from_slice(&1u32.to_be_bytes());
    modes.push(0); // TTY_OP_END

    transport
        .send(
            Writer::new(msg::CHANNEL_REQUEST)
                .u32(server_channel)
                .string(b"pty-req")
                .bool(true)
                .string(b"xterm-256color")
                .u32(80)
                .u32(24)
                .u32(0)
                .u32(0)
                .string(&modes)
                .into_vec(),
        )
        .await
        .unwrap();

    let pty_reply = transport.recv().await.unwrap();
    assert_eq!(
        Reader::new(&pty_reply).message_type().unwrap(),
        msg::CHANNEL_SUCCESS
    );

    transport
        .send(
            Writer::new(msg::CHANNEL_REQUEST)
                .u32(server_channel)
                .string(b"shell")
                .bool(true)
                .into_vec(),
        )
        .await
        .unwrap();

    let shell_reply = transport.recv().await.unwrap();
    assert_eq!(
        Reader::new(&shell_reply).message_type().unwrap(),
        msg::CHANNEL_SUCCESS
    );

    transport
        .send(
            Writer::new(msg::CHANNEL_DATA)
                .u32(server_channel)
                .string(b"hello\n")
                .into_vec(),
        )
        .await
        .unwrap();

    // `cat` echoes stdin to stdout through the PTY; collect CHANNEL_DATA
    // until we see it (the PTY's own line-discipline echo may arrive
    // separately from the app's copy, so don't assume a single packet).
    let mut collected = Vec::new();
    for _ in 0..10 {
        let frame = async_std::future::timeout(Duration::from_secs(5), transport.recv())
            .await
            .expect("server must keep producing channel data")
            .unwrap();

        let mut reader = Reader::new(&frame);
        if reader.message_type().unwrap() != msg::CHANNEL_DATA {
            continue;
        }
        reader.u8().unwrap();
        reader.u32().unwrap();
        collected.extend_from_slice(reader.string().unwrap());

        if collected.windows(5).any(|w| w == b"hello") {
            break;
        }
    }
    assert!(
        collected.windows(5).any(|w| w == b"hello"),
        "expected the echoed bytes to contain `hello`, got {collected:?}"
    );

    transport
        .send(Writer::new(msg::CHANNEL_CLOSE).u32(server_channel).into_vec())
        .await
        .unwrap();
}

#[test(async_std::test)]
async fn inactivity_timeout_disconnects_with_the_literal_reason() {
    let config = Config {
        inactivity_limit: Duration::from_millis(200),
        ..Config::default()
    };

    let (addr, handle) = common::server(config).await.unwrap();
    let stream = TcpStream::connect(addr).await.unwrap();

    let mut transport = ClientTransport::new(stream);
    let _v_s = Id::from_async_reader(&mut transport.stream).await.unwrap();
    Id::v2("TestClient_1.0", None::<&str>)
        .to_async_writer(&mut transport.stream)
        .await
        .unwrap();
    transport.stream.flush().await.unwrap();

    // Never send KEXINIT: just wait past the inactivity limit.
    let disconnect = async_std::future::timeout(Duration::from_secs(5), transport.recv())
        .await
        .expect("the server must disconnect once idle past its limit")
        .unwrap();

    let mut reader = Reader::new(&disconnect);
    assert_eq!(reader.u8().unwrap(), msg::DISCONNECT);
    assert_eq!(reader.u32().unwrap(), disconnect_reason::BY_APPLICATION);
    assert_eq!(reader.utf8().unwrap(), "Connection inactive for too long");

    let result = async_std::future::timeout(Duration::from_secs(5), handle)
        .await
        .expect("the connection task must finish after disconnecting");
    assert!(matches!(result, Err(whisp::Error::Inactive)));
}
