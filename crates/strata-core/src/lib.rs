//! # Strata Core
//!
//! Core types shared by every Strata crate.
//!
//! ## Key Types
//!
//! - [`Event`]: An immutable signed record identified by its content hash
//! - [`EventId`], [`PublicKey`], [`Signature`]: Fixed-size byte newtypes with hex encoding
//! - [`Kind`]: Event category with replaceable/ephemeral classification
//! - [`Filter`]: Conjunctive query over ids, kinds, authors, tags and time bounds
//!
//! ## Key Traits
//!
//! - [`EventGate`]: Admission check run before an event is accepted
//! - [`EventSink`]: Destination for accepted events
//! - [`EventSource`]: Provider of stored events for a filter

pub mod error;
pub mod event;
pub mod filter;
pub mod hooks;
pub mod kind;

pub use error::*;
pub use event::*;
pub use filter::*;
pub use hooks::*;
pub use kind::*;
