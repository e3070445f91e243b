//! CA material and on-demand leaf certificate issuance.
//!
//! The CA key pair and certificate are loaded once at startup and never
//! mutated; leaf certificates are minted lazily per hostname and cached for
//! the life of the process.

mod issuer;

pub use issuer::{CaError, CaMaterial, CertIssuer, IssueError};
