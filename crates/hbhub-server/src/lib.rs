// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 hbhub contributors

//! Homebrew DMR hub.
//!
//! Accepts repeaters speaking the Homebrew repeater protocol over UDP,
//! authenticates them, and routes their voice traffic between talkgroups,
//! repeaters and subscribers through a publish/subscribe bus. Calls to the
//! parrot ID are recorded and played back to the caller.
//!
//! # Example
//!
//! ```no_run
//! use hbhub_server::{HubServer, ServerConfig};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let server = HubServer::in_memory(ServerConfig::default())?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod config;
pub mod directory;
pub mod events;
pub mod models;
pub mod server;

pub use bus::{BusError, MemoryBus, PubSub, RawFrame};
pub use config::{ConfigError, ServerConfig};
pub use directory::{Directory, DirectoryError, DirectorySeed, MemoryDirectory};
pub use events::{EventBus, HubEvent};
pub use models::{Call, RepeaterConfig, Talkgroup, User};
pub use server::{HubContext, HubServer, ServerError};
