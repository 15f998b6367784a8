//! Marketplace API boundary: typed records, page envelopes, the HTTP client and the
//! egress proxy seam.

pub mod client;
pub mod proxy;
pub mod record;

pub use client::{MarketplaceClient, ProxySelection};
pub use proxy::{ProxyEndpoint, ProxyFilters, ProxyProvider, ProxyStrategy, StaticProxyPool};
pub use record::{MarketplacePage, RawRecord};
