//! Proxy Engine (spec.md §4.5): HTTP passive proxy, WS passive proxy, WS
//! active bridge, and the file/archive upload/download streams, plus the
//! shared error-page rendering they all fall back to.

pub mod error_page;
pub mod files;
pub mod http;
pub mod websocket;
