//! Core wire types for the spindrift DEX server: message envelope,
//! request/response payloads, identifiers, and error codes.

pub mod ids;
pub mod msg;
pub mod time;
