//! Client for the quorum-replicated versioned key-value store.
//!
//! A [`ContextClient`] sends typed requests through a [`Transport`] and
//! hands out the three kinds of handles callers work with:
//!
//! * [`Entry`]: one key with its last observed version, supporting plain
//!   writes, compare-and-set and long-poll `listen`.
//! * [`Transaction`]: a leased session whose [`TransactionEntry`] writes
//!   become visible on commit. [`use_scope`] commits or rolls back for you.
//! * [`Tree`] and [`Cursor`]: ordered traversal with `next`/`prev` and
//!   bounded range scans.
//!
//! Every operation either resolves with its typed result or fails with a
//! [`KvError`]; nothing is retried internally.

mod call;
mod client;
mod config;
mod entry;
mod grpc;
mod scope;
mod task;
mod transaction;
mod transport;
mod tree;

pub use call::send_request;
pub use client::{ContextClient, EndpointBalancer};
pub use config::ClientConfig;
pub use entry::Entry;
pub use grpc::{status_code, GrpcTransport};
pub use scope::{use_scope, AsyncClose};
pub use task::{spawn_logged_loop, spawn_logged_loop_while, spawn_loop, spawn_loop_while, LoopHandle};
pub use transaction::{Transaction, TransactionEntry, TransactionQuorum};
pub use transport::{Outcome, Registration, ResponseHandler, Transport};
pub use tree::{Cursor, Tree};

pub use qkv_types::{Address, Bincode, Expire, Key, KvError, Quorum, TransactionIndex, Value, Version};
