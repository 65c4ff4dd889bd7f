//! # vista-server - Remote Page Streaming Server
//!
//! Hosts remote page sessions on top of `vista-core` and streams their
//! frames to thin clients over TCP.
//!
//! Pages are rendered by an external browser driver; each session keeps
//! one connection to it (see [`driver`]). Subscribers connect to the
//! server, create or join sessions, and receive frames, quality changes
//! and input acknowledgements on the same connection (see [`service`]).
//!
//! ## Configuration
//!
//! A TOML file (`--config`, default `vista-server.toml`) overlaid with
//! `VISTA_*` environment variables. `--gen-config` prints the defaults.

pub mod config;
pub mod driver;
pub mod service;
