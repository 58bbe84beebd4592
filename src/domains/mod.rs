//! Domains module containing business logic organized by bounded contexts.
//!
//! The tool runtime is currently the only domain: descriptors, the live
//! registry, hot reload and the protocol dispatcher.

pub mod tools;
