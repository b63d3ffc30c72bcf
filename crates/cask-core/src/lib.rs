//! cask-core — wire format, cryptographic primitives, and configuration.
//! All other Cask crates depend on this one.

pub mod config;
pub mod crypto;
pub mod wire;

pub use wire::{ClientId, Request, RequestCode, Response, ResponseCode};
