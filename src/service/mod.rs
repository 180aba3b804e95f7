//! Cloud service integration: the HTTP client, reachability tracking, and
//! the one-shot IP geolocation lookup.

pub mod client;
pub mod ipinfo;
pub mod reachability;

pub use client::{ForwardReply, ForwardRequest, ServiceClient, ServiceError};
pub use ipinfo::IpInfo;
pub use reachability::ReachabilityState;
