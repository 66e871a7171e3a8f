//! Navigator: a multi-tenant HTTP front-end.
//!
//! One long-lived process accepts requests for many co-located web apps,
//! starts each app's backend on demand, proxies HTTP and WebSocket traffic
//! to it, evicts backends that go idle, and can suspend or stop the whole
//! machine once everything is quiet.

pub mod auth;
pub mod child_logs;
pub mod config;
pub mod error;
pub mod fly_replay;
pub mod hooks;
pub mod idle;
pub mod logging;
pub mod port;
pub mod proxy;
pub mod rules;
pub mod server;
pub mod static_files;
pub mod tenant;
