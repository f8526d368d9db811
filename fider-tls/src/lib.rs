//! HTTPS front for Fider: static certificates for the product's own
//! domains, on-demand ACME certificates for tenant custom domains.

pub mod config;
pub mod proxy;
pub mod tls;
