//! # framelink-node: echo node
//!
//! Small service around `framelink-core`:
//!
//! - **serve**: accept TCP sockets and answer every request with its own
//!   payload (empty requests are rejected).
//! - **call**: dial a node, issue requests and report the replies.

pub mod config;
pub mod service;
