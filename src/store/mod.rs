//! Collaborator backends.
//!
//! Only the in-memory backend ships with the adapter; durable backends implement the same
//! [`crate::services`] traits.

pub mod memory;
