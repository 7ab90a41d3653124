//! Line-oriented wire protocol between the foreground engine and the
//! background worker process.
//!
//! Foreground → worker: one JSON task frame per line ([`frame`]).
//! Worker → foreground: free-form text lines classified into notifications,
//! the idle sentinel, or noise ([`frame::classify_line`]).

pub mod codec;
pub mod frame;
