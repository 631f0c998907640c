//! Bench assembly for `msgsim`: an ideal NIC fabric, a multi-node driver
//! and application models.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]

pub mod bench;
pub mod fabric;
pub mod helper_models;
