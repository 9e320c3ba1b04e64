//! # forkd - Embedded Server Engine
//!
//! A pre-forking TCP server engine providing:
//! - A single-threaded readiness loop over listeners and worker channels
//! - Per-backend process models: iterative, fork-per-connection, pre-fork pool
//! - Bounded worker supervision with deferred reaping
//! - A parent-procedure-call (PPC) protocol for worker → parent requests
//! - Centralized log devices owned by the parent
//!
//! ## Architecture
//!
//! The parent process owns every backend, the child table and the log
//! devices. Workers talk back to it only through their PPC channel:
//! ```text
//!                    ┌──────────────────────────────────┐
//!   connections  →   │          Server (parent)         │
//!                    │  ┌──────────┐  ┌──────────────┐  │
//!                    │  │ Backends │  │  Child table │  │
//!                    │  └──────────┘  └──────────────┘  │
//!                    │  ┌──────────┐  ┌──────────────┐  │
//!                    │  │ WatchSet │  │  Log sinks   │  │
//!                    │  └──────────┘  └──────────────┘  │
//!                    └───────▲──────────────────────────┘
//!                            │ PPC (socketpair)
//!                    ┌───────┴───────┐
//!                    │    Workers    │
//!                    └───────────────┘
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod backend;
pub mod log;
pub mod ppc;
pub mod server;
pub mod supervisor;
pub mod types;

// Internal utilities
pub mod observability;

pub use server::Server;
pub use types::{Config, Error, Result};
