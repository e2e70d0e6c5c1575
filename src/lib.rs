//! WARP transport and noize obfuscation engine.
//!
//! This crate implements the pieces of a WARP tunnel client that sit
//! between device registration (external) and the SOCKS5-fronted
//! application (external): preflight UDP obfuscation for userspace
//! WireGuard, a MASQUE/Connect-IP client with its own noize wrapper, the
//! supervisor that keeps a tunnel session alive, and the transport
//! selector that picks between WireGuard-direct and MASQUE legs.

pub mod config;
pub mod cps;
pub mod error;
pub mod masque;
pub mod preflight;
pub mod selector;
pub mod supervisor;
pub mod telemetry;
pub mod wg_bind;
