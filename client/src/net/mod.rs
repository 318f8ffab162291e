//! Wire protocol shared with the chat server.

pub mod types;
