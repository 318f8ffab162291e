//! Domain services used by websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own business logic and storage calls so route handlers
//! can stay focused on protocol translation and identity plumbing. Each
//! service defines its own error enum with grepable codes for error frames.

pub mod message;
pub mod private;
pub mod reaction;
pub mod room;
pub mod session;
pub mod typing;
pub mod upload;
