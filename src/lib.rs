//! `mngr`: an agent lifecycle and routing engine for long-lived AI
//! coding-agent processes distributed across local, Docker, SSH, and cloud
//! sandbox hosts.
//!
//! Module layout mirrors the component table this crate was designed
//! against: identifiers and errors at the bottom, concurrency and volume
//! primitives above those, then the store/host/provider layer, the lifecycle
//! engine, auth and backend resolution, the reverse proxy, and finally the
//! façade every front-end calls into.

pub mod auth;
pub mod backend_resolver;
pub mod concurrency;
pub mod config;
pub mod engine;
pub mod error;
pub mod facade;
pub mod host;
pub mod logging;
pub mod models;
pub mod primitives;
pub mod providers;
pub mod proxy;
pub mod store;
pub mod volume;
