//! Network boundary: the push channel and the REST client.

pub mod api;
pub mod channel;
