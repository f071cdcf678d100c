//! Utilities for testing code based on the group channel. They are used for testing the channel
//!  itself, but they are also exported for application testing, which is why this is part of the
//!  crate's regular (non-#[cfg(test)]) code.

pub mod interceptor;
pub mod listener;
pub mod member;
pub mod net;
