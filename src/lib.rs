#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod error;
pub use error::{Error, Result};

pub mod hostkey;
pub use hostkey::HostKeyStore;

pub mod cipher;
pub mod kex;

pub mod auth;

pub mod registry;
pub use registry::Registry;

pub mod pty;
pub use pty::Pty;

pub mod channel;
pub use channel::Channel;

pub mod env;
pub mod packet;

pub mod connection;
pub use connection::{Config, Connection};
