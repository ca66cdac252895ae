//! Veilproxy - A transparent HTTP reverse proxy with HTML rewriting
//!
//! Fronts a single fixed backend origin behind a public hostname:
//! - Every request forwards to the backend with path and query preserved
//! - HTML responses are rewritten so absolute backend URLs point at the
//!   public origin, with a forced `<base>` tag for relative ones
//! - Everything else streams through untouched
//! - WebSocket upgrades are tunneled
//! - One attempt per request; failures come back as a uniform 500

pub mod headers;
pub mod proxy;
pub mod rewrite;

pub use proxy::{ProxyConfig, ProxyError, ProxyServer, DEFAULT_BACKEND_ORIGIN};
pub use rewrite::RewriteRules;
