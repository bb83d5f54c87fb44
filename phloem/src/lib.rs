#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![warn(unreachable_pub)]

//! phloem is the sender/receiver protocol substrate backing
//! [trellis](https://crates.io/crates/trellis).
//!
//! It defines the vocabulary the composition layer is written in:
//!
//! - the intrusive, allocation-free cancellation triple in [`stop`],
//! - the three-signal completion vocabulary ([`completion`], [`receiver`]),
//! - the lazy description/materialisation split ([`sender`], [`operation`]),
//! - in-place child-operation storage ([`slot`]),
//! - the scheduler collaborator interface ([`scheduler`]).
//!
//! # Threading Notes
//!
//! The substrate is scheduler-agnostic: completion signals run on whichever
//! thread drives them, and the only blocking anywhere is the bounded
//! spin in [`stop`]'s deregistration handshake.

pub mod completion;
pub mod operation;
pub mod receiver;
pub mod scheduler;
pub mod sender;
pub mod slot;
pub mod stop;
