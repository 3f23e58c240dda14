//! The canonical model every adapter translates to and from.
//!
//! Requests are built by callers and are read-only afterwards. Completions and
//! stream chunks are produced per invocation by the engine. None of these types
//! carry provider specific shapes; each adapter converts at its own boundary.
pub mod content;
pub mod message;
pub mod request;
pub mod response;
pub mod role;
pub mod tool;
