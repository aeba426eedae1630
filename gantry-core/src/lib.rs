//! # Gantry Core
//!
//! Types shared by every part of the Gantry control plane:
//!
//! - **Destinations and overviews**: the value types describing what a broker hosts and
//!   how loaded it is, including the "most loaded first" ordering used for scaling decisions.
//! - **Commands**: the client-visible protocol commands the control plane routes and replays.
//! - **Wire framing**: a pluggable `WireFormat` plus the 4-byte length-prefixed frame codec.
//! - **Metadata store**: the key-value abstraction used for cluster coordination
//!   (broker registry, named locks, watches).

pub mod command;
pub mod destination;
pub mod metadata;
pub mod overview;
pub mod wire;

pub use destination::{Destination, DestinationKind};
pub use overview::{BrokerOverview, DestinationOverview};
