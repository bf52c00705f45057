//! A transparent TCP/TLS interception relay: accepts NAT-redirected or
//! statically-forwarded connections, forges a leaf certificate matching
//! whatever the real upstream presents, and relays traffic through a
//! four-endpoint parent/child pair so a passive analyzer can tap the
//! decrypted stream via the mirror listener (spec.md §1-§2).

pub mod cert;
pub mod clienthello;
pub mod config;
pub mod connection;
pub mod content_log;
pub mod error;
pub mod listener;
pub mod mirror;
pub mod pipe;
pub mod relay;
pub mod resolve;
pub mod telemetry;
pub mod worker;

pub use config::Config;
pub use listener::ListenerContext;
