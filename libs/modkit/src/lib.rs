//! # ModKit - Module lifecycle kit
//!
//! Builds a named, versioned process out of pluggable modules and drives them
//! through one lifecycle: config → init → start → post_start → running → stop.
//!
//! ## Features
//!
//! - **Explicit capabilities**: a module fills only the slots it implements
//!   (`Configurable`, `Initializer`, `PostStarter`, `Routable`); nothing is
//!   discovered by runtime type inspection.
//! - **Ordered**: forward phases follow registration order, stop runs in reverse.
//! - **Coordinated exit**: background tasks report fatal errors through a
//!   write-once exit signal instead of crashing the process.
//! - **Typed context**: Initializers publish clients into an append-only,
//!   type-keyed context that later modules read.
//!
//! ## Example
//!
//! ```rust,ignore
//! use modkit::{Application, ModuleDef, RunOptions};
//!
//! let app = std::sync::Arc::new(Application::new("demo", "1.0.0"));
//! app.add("users", ModuleDef::builder(users).initializer().routable())?;
//! app.run(RunOptions::default()).await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

// Core module contracts and traits
pub mod contracts;
pub use crate::contracts::*;

pub mod app;
pub mod client_hub;
pub mod config;
pub mod context;
pub mod lifecycle;
pub mod registry;
pub mod runtime;

pub use app::{AppError, AppState, Application, ExitSignal};
pub use client_hub::{ClientHub, ClientHubError};
pub use config::{ConfigCell, ConfigLayer, ConfigProvider, ConfigTarget};
pub use context::{AppContext, AppContextBuilder};
pub use lifecycle::{Lifecycle, ReadySignal, Status, StopReason};
pub use registry::{Controller, ModuleBuilder, ModuleDef, ModuleEntry, RegistryError};
pub use runtime::{RunOptions, ShutdownOptions};
