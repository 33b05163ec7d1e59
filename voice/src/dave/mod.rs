//! DAVE (MLS-based) end-to-end encryption: binary message framing, key
//! ratchet derivation, and session lifecycle management.

pub mod parser;
pub mod ratchet;
pub mod session;
