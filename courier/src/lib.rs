//! A publish/subscribe broker built on the courier dispatch core.
//!
//! The binary reads its destinations from a RON configuration file, serves
//! each of them with a [`DeliveryManager`](courier_delivery::DeliveryManager)
//! backed by an in-memory queue, and takes entries and operator commands from
//! stdin (see [`ingress`]).

pub mod config;
pub mod controller;
pub mod ingress;
pub mod transport;

pub use config::{CourierConfig, DestinationConfig, find_config_file};
pub use controller::{Courier, SHUTDOWN_BROADCAST};
pub use ingress::{Command, ParseError};
pub use transport::LogTransport;
