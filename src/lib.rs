//! Stathaul - Miner Telemetry Relay Library
//!
//! This crate implements a telemetry relay agent for cgminer-style mining
//! devices: it polls the device's TCP command socket on a fixed interval,
//! spools every reading to disk, and uploads spooled readings to a remote
//! collector over HTTP, retrying from disk until the collector confirms
//! each one.
//!
//! # Architecture
//!
//! - [`device`]: TCP device client and reading codec
//! - [`spool`]: disk-backed queue of pending readings (the durable core)
//! - [`uploader`]: multipart HTTP delivery to the collector
//! - [`agent`]: the poll / sweep / upload task trio and its shutdown
//! - [`config`]: YAML configuration surface
//!
//! The spool directory is the only source of truth for pending work: the
//! in-memory work queue is rebuilt from a directory listing at startup and
//! on every sweep, so crashing at any point costs at most a duplicate
//! upload, never a lost reading that was already persisted.

pub mod agent;
pub mod config;
pub mod device;
pub mod spool;
pub mod uploader;

pub use agent::{Agent, AgentHandles};
pub use config::{AgentConfig, ConfigError, expand_env_vars};
pub use device::{DeviceError, MinerClient, ParseError, Reading};
pub use spool::{SpoolEntry, SpoolError, SpoolStore};
pub use uploader::{UploadError, Uploader};
