//! Client-side chat state for the realtime chat core.
//!
//! SYSTEM CONTEXT
//! ==============
//! `net::types` mirrors the server's wire schema and `state::chat` keeps the
//! local projection of the joined room, driven by inbound frames. Transport
//! (websocket, HTTP) is left to the embedding UI.

pub mod net;
pub mod state;
