//! Controller-layer errors.

use thiserror::Error as ThisError;

use crate::coordination::CoordinationError;
use crate::types::{BrokerId, TopicPartition};

/// Result type for controller operations.
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Errors raised while driving cluster state.
///
/// Fatality decides the event loop's reaction: fatal errors mean this
/// controller has been superseded or its internal state is corrupt, so it
/// resigns and forces a new election; everything else is logged and the loop
/// moves on to the next event.
#[derive(Debug, ThisError)]
pub enum ControllerError {
    /// Another broker won the controllership.
    #[error("controller has moved: {0}")]
    ControllerMoved(String),

    /// Leader election found no eligible replica; the partition stays
    /// offline until a replica returns.
    #[error("no replica online for {partition}: assignment {assignment:?}, live {live:?}")]
    NoReplicaOnline {
        partition: TopicPartition,
        assignment: Vec<BrokerId>,
        live: Vec<BrokerId>,
    },

    /// A request referenced a broker that is not registered.
    #[error("broker {0} is not available")]
    BrokerNotAvailable(BrokerId),

    /// The controller's internal bookkeeping is inconsistent.
    #[error("illegal controller state: {0}")]
    IllegalState(String),

    /// A single state-machine transition failed; other transitions in the
    /// same batch proceed.
    #[error("state change failed for {partition}: {reason}")]
    StateChangeFailed {
        partition: TopicPartition,
        reason: String,
    },

    /// A coordination-service operation failed.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}

impl ControllerError {
    /// True when the error implies loss of controllership or corrupted
    /// controller state: the current reign must end.
    pub fn is_fatal(&self) -> bool {
        match self {
            ControllerError::ControllerMoved(_) | ControllerError::IllegalState(_) => true,
            ControllerError::Coordination(e) => {
                matches!(
                    e,
                    CoordinationError::ControllerMoved(_) | CoordinationError::SessionExpired
                )
            }
            _ => false,
        }
    }

    /// True for CAS races worth retrying in place.
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, ControllerError::Coordination(e) if e.is_version_conflict())
    }
}
