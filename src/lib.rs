//! Live poll session engine.
//!
//! A participant joins a room by code, receives polls pushed over a websocket,
//! watches each poll's countdown, and submits at most one answer per poll.
//! Answered polls are remembered across restarts in an [`ledger::AnswerLedger`]
//! so a redelivered broadcast is never offered twice.
//!
//! Start with [`session::RoomSession`]: build a [`session::SessionContext`],
//! call `spawn`, and drive the returned [`session::SessionHandle`].

pub mod config;
pub mod error;
pub mod frame;
pub mod ledger;
pub mod net;
pub mod poll;
pub mod resume;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod store;
pub mod submission;
