//! # Castellan
//! Cluster controller core for a partitioned, replicated, log-based
//! messaging system.
//!
//! Exactly one broker in a cluster is elected controller through a
//! ZooKeeper-like coordination service. The controller owns the
//! authoritative view of cluster membership and partition state and drives
//! all global state transitions - per-partition leader election, replica
//! lifecycle, partition reassignment, controlled shutdown, preferred-leader
//! rebalancing, and topic deletion - propagating its decisions to brokers
//! via LeaderAndIsr, StopReplica, and UpdateMetadata requests.
//!
//! This crate is the controller core: the single-threaded event loop, the
//! in-memory context cache, the partition and replica state machines, the
//! reassignment protocol, the controller-epoch fencing discipline, and the
//! broker-request batching layer. The coordination-service transport and
//! the broker-side request handlers are collaborators behind the
//! [`CoordinationClient`](coordination::CoordinationClient) and
//! [`BrokerRequestSender`](controller::BrokerRequestSender) traits.
//!
//! # Goals
//! - Total ordering of controller decisions through one event queue
//! - Epoch-fenced writes: a deposed controller cannot corrupt shared state
//! - Batched broker requests: no N^2 RPC explosion on mass transitions
//!
//! ## Getting started
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use castellan::controller::{Controller, ControllerConfig};
//! use castellan::types::BrokerId;
//!
//! # async fn run(
//! #     coordination: Arc<dyn castellan::coordination::CoordinationClient>,
//! #     sender: Arc<dyn castellan::controller::BrokerRequestSender>,
//! # ) -> castellan::error::Result<()> {
//! let handle = Controller::start(
//!     BrokerId(1),
//!     ControllerConfig::default(),
//!     coordination,
//!     sender,
//! )?;
//!
//! // ... the controller elects itself and runs until shut down ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub mod constants;
pub mod controller;
pub mod coordination;
pub mod error;
pub mod telemetry;
pub mod types;

pub mod prelude {
    //! Main exports for building on the controller core.

    pub use crate::controller::{
        BrokerRequestSender, ControlRequest, ControlResponse, Controller, ControllerConfig,
        ControllerError, ControllerEvent, ControllerHandle, ControllerResult, EventSender,
    };
    pub use crate::coordination::{
        CoordinationClient, CoordinationError, CoordinationResult,
    };
    pub use crate::error::{Error, Result};
    pub use crate::types::{
        Broker, BrokerId, LeaderAndIsr, LeaderIsrAndControllerEpoch, PartitionReplica,
        TopicPartition,
    };
}
