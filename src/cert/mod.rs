pub mod ca;
pub mod cache;
pub mod forge;
pub mod persist;

pub use ca::CertificateAuthority;
pub use cache::{CertRecord, SessionCaches, TargetCertDir};
pub use forge::{CertForge, PeerCertInfo};
