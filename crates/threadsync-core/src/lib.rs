//! Core domain types for the thread synchronisation server.
//!
//! Everything here is pure data plus the [`env::Environment`] abstraction.
//! No I/O happens in this crate: storage, transport and scheduling live in
//! `threadsync-server`, which drives these types against real or simulated
//! resources.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod env;
pub mod model;

pub use env::Environment;
pub use model::{
    Account, Board, Image, ImageCommon, ImageToken, Post, Session, SpliceError, Thread,
};
