//! HTTP API Module
//!
//! Peer endpoints of the HTTP Distro transport and the registry REST API.

mod http;

pub use http::{AppState, HttpServer, InstanceRequest, MemberRequest, FORWARDED_HEADER};
