//! Outbound-request gateway for a self-hosted media dashboard.
//!
//! Every URL the dashboard hands us is run through [`validator`] before any socket is
//! opened; HTTP calls go through the endpoint allowlist in [`upstream`], and Unraid's
//! GraphQL subscriptions are relayed by [`subscription`].

pub mod app;
pub mod config;
pub mod model;
pub mod security;
pub mod server;
pub mod subscription;
pub mod upstream;
pub mod validator;
