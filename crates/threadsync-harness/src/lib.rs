//! Deterministic simulation harness for threadsync server testing.
//!
//! Runs the real connection tasks, registry and append feed in-process
//! against an in-memory store and a manually advanced [`SimEnv`], with no
//! transport in between.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks properties that must hold after any
//! sequence of requests and upkeep passes: counters match the log, closes
//! are logged once, and every client feed is an exact slice of the log.
//! Use [`InvariantRegistry::standard()`] for the full set.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod sim_client;
pub mod sim_env;
pub mod world;

pub use invariants::{
    ClosedPostsLogged, FeedIsLogSlice, FeedSnapshot, ImageCounterMatchesPosts, Invariant,
    InvariantRegistry, InvariantResult, PostCounterMatchesLog, PostsBelongToThread,
    SystemSnapshot, Violation,
};
pub use sim_client::SimClient;
pub use sim_env::{SIM_EPOCH, SimEnv, SimInstant};
pub use world::{
    BOARD, IMAGE_BOARD, POST_PASSWORD, READ_ONLY_BOARD, SimHasher, SimWorld, post_common,
    thread_request, thread_request_with_image,
};
