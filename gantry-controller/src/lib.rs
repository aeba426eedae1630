//! # Gantry Controller
//!
//! Control plane that turns a fleet of message brokers into one elastic,
//! load-balanced messaging service.
//!
//! ## Core Responsibilities
//!
//! - **Fleet model**: tracks every broker, its load and which broker owns each destination
//! - **Scaling**: a prioritized rule engine that adds brokers, drains and removes
//!   idle ones, and migrates hot destinations toward idle brokers
//! - **Client distribution**: each client connection is fanned out over every broker,
//!   with producer traffic routed to the destination owner and connection state
//!   replayed onto brokers that join later
//! - **Coordination**: an optional scaling lock and shared broker registry so several
//!   controllers can run against one fleet
//!
//! ## Architecture
//!
//! The `BrokerControl` polls a `BrokerProvider` (in-process or Kubernetes),
//! reconciles the `Model`, then runs the `ScalingEngine`. Scaling actions call back
//! into the control, which migrates destinations with `DestinationWorker`s before any
//! broker is destroyed.

pub mod control;
pub mod controller;
pub mod controller_metrics;
pub mod coordination;
pub mod distribution;
pub mod endpoint;
pub mod errors;
pub mod interceptor;
pub mod listeners;
pub mod local;
pub mod management;
pub mod migration;
pub mod model;
mod resources;
pub mod scaling;
pub mod scheduler;
pub mod service_configuration;
pub mod transport;

pub use control::{BrokerControl, BrokerProvider};
pub use controller::GantryController;
pub use errors::{GantryError, Result};
pub use model::Model;
pub use service_configuration::{LoadConfiguration, ServiceConfiguration};
