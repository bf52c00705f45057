//! The relay component (spec.md §4.5): HTTP header filtering, the OCSP
//! denial path, the meta-context shared between a parent and its mirror
//! children, the teardown predicates, the connect-log formatter, and the
//! two TLS role builders. `connection.rs`/`mirror.rs` own the actual byte
//! loops; this module holds the pure/stateless pieces they call into.

pub mod filter;
pub mod log;
pub mod meta;
pub mod ocsp;
pub mod teardown;
pub mod tls;

pub use meta::Meta;
