//! Streaming JSON-RPC plumbing: the [`NodeClient`] capability trait, its
//! WebSocket implementation, and the [`Connector`] the endpoint pool dials
//! through.

mod client;
mod ws;

pub use client::{BlockData, ClientError, Connector, NodeClient, RawTransaction, Subscription};
pub use ws::{WsClient, WsConnector};
