//! Connection admission: IP allow-listing and per-IP rate limiting
//! (components F and G), applied uniformly ahead of HTTP and WebSocket
//! entry points.

mod ip_filter;
mod rate_limiter;

pub use ip_filter::{is_loopback, AllowListProvider, IpFilter};
pub use rate_limiter::RateLimiter;
