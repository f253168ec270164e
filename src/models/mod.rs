//! # Data Models
//!
//! Records the engine persists through a [`ProcessableObjectStore`](crate::store::ProcessableObjectStore).

pub mod processable_object;

pub use processable_object::{
    timestamp_now, LockIdentity, NewProcessableObject, ProcessableObject,
};
