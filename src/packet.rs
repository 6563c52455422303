//! The binary-packet payload: a message-type byte plus typed extraction
//! helpers (`spec.md` §4.1's "Packet" component).
//!
//! `KexInit`/`KexEcdhInit`/`KexEcdhReply` and the `userauth` method structs
//! are decoded through `ssh_packet`'s `binrw` derives directly (see
//! `src/kex.rs`, `src/auth/mod.rs`) — those transcripts are intricate enough
//! that hand-rolling them would just be reimplementing `ssh_packet` badly.
//! The connect-layer messages (`CHANNEL_*`, `GLOBAL_REQUEST`) have no
//! counterpart in the teacher's generic multi-channel mux worth reusing
//! (`DESIGN.md`), so this module reads/writes them with the plain
//! length-prefixed cursor the spec itself calls out as a deliverable.

use std::io::Cursor;

use ssh_packet::arch::Ascii;
use ssh_packet::binrw::{
    meta::{ReadEndian, WriteEndian},
    BinRead, BinWrite,
};

use crate::{Error, Result};

/// SSH message-type numbers this server ever sends or receives (`spec.md` §6).
pub mod msg {
    pub const DISCONNECT: u8 = 1;
    pub const IGNORE: u8 = 2;
    pub const UNIMPLEMENTED: u8 = 3;
    pub const DEBUG: u8 = 4;
    pub const SERVICE_REQUEST: u8 = 5;
    pub const SERVICE_ACCEPT: u8 = 6;
    pub const EXT_INFO: u8 = 7;
    pub const KEXINIT: u8 = 20;
    pub const NEWKEYS: u8 = 21;
    pub const KEXDH_INIT: u8 = 30;
    pub const KEXDH_REPLY: u8 = 31;
    pub const USERAUTH_REQUEST: u8 = 50;
    pub const USERAUTH_FAILURE: u8 = 51;
    pub const USERAUTH_SUCCESS: u8 = 52;
    pub const USERAUTH_PK_OK: u8 = 60;
    pub const GLOBAL_REQUEST: u8 = 80;
    pub const CHANNEL_OPEN: u8 = 90;
    pub const CHANNEL_OPEN_CONFIRMATION: u8 = 91;
    pub const CHANNEL_OPEN_FAILURE: u8 = 92;
    pub const CHANNEL_WINDOW_ADJUST: u8 = 93;
    pub const CHANNEL_DATA: u8 = 94;
    pub const CHANNEL_EXTENDED_DATA: u8 = 95;
    pub const CHANNEL_EOF: u8 = 96;
    pub const CHANNEL_CLOSE: u8 = 97;
    pub const CHANNEL_REQUEST: u8 = 98;
    pub const CHANNEL_SUCCESS: u8 = 99;
    pub const CHANNEL_FAILURE: u8 = 100;
}

/// Standard RFC 4253 §11.1 disconnect reason codes this server issues.
pub mod disconnect_reason {
    pub const PROTOCOL_ERROR: u32 = 2;
    pub const KEY_EXCHANGE_FAILED: u32 = 3;
    pub const MAC_ERROR: u32 = 5;
    pub const BY_APPLICATION: u32 = 11;
}

/// Serialize a `binrw`-derived message into its raw wire bytes (message-type
/// byte included, since these structs carry their own magic).
pub fn encode<T>(message: &T) -> Result<Vec<u8>>
where
    for<'w> T: BinWrite<Args<'w> = ()> + WriteEndian,
{
    let mut buf = Vec::new();
    let mut cursor = Cursor::new(&mut buf);
    message
        .write(&mut cursor)
        .map_err(|err| Error::Framing(err.to_string()))?;

    Ok(buf)
}

/// Deserialize a `binrw`-derived message from a decrypted payload.
pub fn decode<T>(payload: &[u8]) -> Result<T>
where
    for<'r> T: BinRead<Args<'r> = ()> + ReadEndian,
{
    let mut cursor = Cursor::new(payload);

    T::read(&mut cursor).map_err(|err| Error::Framing(err.to_string()))
}

/// A cursor over one packet's payload, for the connect-layer messages this
/// server parses itself. `spec.md` §4.1: "extraction methods advance it or
/// fail with a framing error."
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// The message-type byte, without advancing the cursor.
    pub fn message_type(&self) -> Result<u8> {
        self.buf
            .first()
            .copied()
            .ok_or_else(|| Error::Framing("empty packet".into()))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(Error::Framing("packet truncated".into()));
        }

        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;

        Ok(slice)
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().expect("len 4")))
    }

    pub fn bool(&mut self) -> Result<bool> {
        Ok(self.u8()? != 0)
    }

    /// A length-prefixed byte string, as raw bytes.
    pub fn string(&mut self) -> Result<&'a [u8]> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    /// A length-prefixed byte string, interpreted as UTF-8 (lossily, like
    /// terminal names and app names the client fully controls).
    pub fn utf8(&mut self) -> Result<String> {
        Ok(String::from_utf8_lossy(self.string()?).into_owned())
    }

    /// An `mpint`: canonical leading zero stripped, returned as the
    /// non-negative magnitude's big-endian bytes.
    pub fn mpint(&mut self) -> Result<Vec<u8>> {
        let raw = self.string()?;

        Ok(match raw.first() {
            Some(0) => raw[1..].to_vec(),
            _ => raw.to_vec(),
        })
    }

    /// Whatever bytes remain, unparsed.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }
}

/// A tagged-write builder for the connect-layer messages (`spec.md` §9:
/// "replace runtime type dispatch with a tagged-write API composed
/// explicitly at each call site").
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new(message_type: u8) -> Self {
        let mut writer = Self::default();
        writer.u8(message_type);
        writer
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.push(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.extend_from_slice(&value.to_be_bytes());
        self
    }

    pub fn bool(&mut self, value: bool) -> &mut Self {
        self.u8(value as u8)
    }

    pub fn string(&mut self, bytes: &[u8]) -> &mut Self {
        self.u32(bytes.len() as u32);
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn mpint(&mut self, magnitude: &[u8]) -> &mut Self {
        let leading_zero = matches!(magnitude.first(), Some(byte) if byte & 0x80 != 0);

        if leading_zero {
            self.u32(magnitude.len() as u32 + 1);
            self.buf.push(0);
        } else {
            self.u32(magnitude.len() as u32);
        }

        self.buf.extend_from_slice(magnitude);
        self
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Build a `DISCONNECT` message (`spec.md` §7's failure taxonomy).
pub fn disconnect(reason: u32, description: &str) -> Vec<u8> {
    Writer::new(msg::DISCONNECT)
        .u32(reason)
        .string(description.as_bytes())
        .string(b"en")
        .into_vec()
}

/// Build a `USERAUTH_PK_OK` reply to a `publickey` probe. Hand-rolled rather
/// than going through `ssh_packet::userauth::PkOk` directly, since the probe
/// only hands us borrowed `algorithm`/`blob` slices.
pub fn pk_ok(algorithm: &Ascii<'_>, blob: &[u8]) -> Vec<u8> {
    Writer::new(msg::USERAUTH_PK_OK)
        .string(algorithm.to_string().as_bytes())
        .string(blob)
        .into_vec()
}

/// The one `EXT_INFO` this server ever sends, right after its first
/// `NEWKEYS` (RFC 8308): advertise the signature algorithms `publickey`
/// authentication accepts.
pub fn ext_info() -> Vec<u8> {
    Writer::new(msg::EXT_INFO)
        .u32(1)
        .string(b"server-sig-algs")
        .string(b"ssh-ed25519,rsa-sha2-256,rsa-sha2-512,ssh-rsa")
        .into_vec()
}
