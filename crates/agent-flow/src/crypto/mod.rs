//! Capability tokens handed to the execution runtime.
//!
//! Sealed with AES-GCM so the runtime can present them back on side-channel
//! calls without being able to read or forge them.

pub mod token;

pub use token::{Claims, SealedTokenIssuer, TokenIssuer};
