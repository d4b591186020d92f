//! # arm_ecd
//!
//! Embedded controller daemon for ARM laptops whose EC sits on an I2C bus.
//!
//! The EC on these machines expects the host to report the SoC temperature
//! periodically; without it, a watchdog forces a hard power event. The daemon
//! keeps those reports flowing, pauses them across suspend, and exposes the
//! EC's fan, profile and keyboard backlight registers as bounded effects.
//!
//! ## Architecture
//!
//! - [`models`] - per-machine register maps and timing, selected by identity
//! - [`drivers::i2c_ec`] - bus transport, mailbox protocol and rate limiting
//! - [`daemon`] - the reporting loop and its suspend state machine
//! - [`effects`] - validated multi-step register writes
//! - [`SystemCoordinator`](coordinator::SystemCoordinator) - service lifecycle
//! - [`EventBus`](event::EventBus) - suspend/resume and shutdown signalling
//!
//! ## Example
//!
//! ```no_run
//! use arm_ecd::{application::Application, config::ConfigManager};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config_manager = ConfigManager::load(None).await?;
//!     Application::builder()
//!         .with_config_manager(config_manager)
//!         .build()?
//!         .run()
//!         .await
//! }
//! ```

pub mod app_context;
pub mod application;
pub mod cli;
pub mod commands;
pub mod config;
pub mod coordinator;
pub mod daemon;
pub mod drivers;
pub mod effects;
pub mod error;
pub mod event;
pub mod fan_curve;
pub mod models;
pub mod power;
pub mod providers;
pub mod sensors;
pub mod task_manager;
pub mod temperature_sensors;
