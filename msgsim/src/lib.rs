//! A discrete-event model of an MPI-style point-to-point message engine.
//!
//! `msgsim` models the host-side messaging layer of a simulated compute
//! node: the piece of software that sits between an application issuing
//! `send`/`recv`/`wait` calls and a network interface able to post receive
//! buffers, transmit messages and perform remote reads. It reproduces the
//! behavior and timing of such a layer: tag matching with wildcards, an
//! eager protocol for short messages, a rendezvous protocol for long ones,
//! a pool of pre-posted short buffers with NIC-driven backpressure, and a
//! loopback path between co-located ranks.
//!
//! The crate is the framework part of a two-crate workspace. The companion
//! `msgsim-util` crate provides an ideal NIC fabric, a multi-node bench
//! driver and scripted application models.
//!
//! # A practical overview
//!
//! ## The engine and its collaborators
//!
//! ```text
//!                 Call                      NIC commands
//!  ┌─────────────┐ ──────► ┌────────────┐ ──────────────► ┌───────────┐
//!  │ Application │         │   Engine   │                 │    Nic    │
//!  └─────────────┘ ◄────── └────────────┘ ◄────────────── └───────────┘
//!               CallReturn       ▲  │       Notification
//!                                │  │ Action
//!                           Step │  ▼
//!                          ┌────────────┐
//!                          │   driver   │ (event queue)
//!                          └────────────┘
//! ```
//!
//! * An [`Application`](app::Application) issues one [`Call`](app::Call) at
//!   a time and is resumed with its [`CallReturn`](app::CallReturn).
//! * The [`Engine`](engine::Engine) never blocks: each entry point receives
//!   a [`Context`](engine::Context) and leaves its continuation there as an
//!   [`Action`](engine::Action).
//! * The [`Nic`](nic::Nic) trait is the engine's view of the network
//!   interface; completions come back as [`Notification`](nic::Notification)s.
//! * The driver owns an [`EventQueue`](simulation::EventQueue) and routes
//!   steps, returns and notifications.
//!
//! ## Leaves
//!
//! * [`heap`]: addresses for NIC-visible buffers,
//! * [`timing`]: latency functions and the derived delays,
//! * [`request`] and [`wait`]: requests, headers and wait sets,
//! * [`group`]: rank to node mapping,
//! * [`config`]: engine parameters with defaults and CBOR decoding.
//!
//! # Logging
//!
//! The engine emits [`tracing`] events: `debug` for application calls,
//! `trace` for protocol steps, `info` for end-of-run statistics and `error`
//! for fatal errors.
//!
//! # Errors
//!
//! All engine errors are fatal: they denote a protocol misuse or a
//! miscomputed resource. Entry points return a
//! [`FatalError`](engine::FatalError) naming the rank, the event being
//! processed and a summary of the engine state.
#![warn(missing_docs, missing_debug_implementations, unreachable_pub)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub mod app;
pub mod config;
pub mod engine;
pub mod group;
pub mod heap;
pub mod nic;
pub mod request;
pub mod simulation;
pub mod stats;
pub mod time;
pub mod timing;
pub mod wait;
