//! Crate-level errors.
//!
//! # Error Hierarchy
//!
//! The crate uses a two-layer error hierarchy:
//!
//! ## Controller Layer (`crate::controller`)
//!
//! - [`ControllerError`]: state-change, election, and fencing errors
//! - Carries a fatality discriminator: fatal errors force the controller to
//!   resign, non-fatal errors are logged and the event loop continues
//!
//! ## Coordination Layer (`crate::coordination`)
//!
//! - [`CoordinationError`]: versioned-node CAS conflicts, missing nodes,
//!   session expiry, epoch fencing rejections
//!
//! ## Conversion
//!
//! [`CoordinationError`] converts into [`ControllerError`] via `From`,
//! allowing coordination failures to propagate through state-change paths,
//! and both convert into the crate-level [`Error`].
//!
//! [`ControllerError`]: crate::controller::ControllerError
//! [`CoordinationError`]: crate::coordination::CoordinationError

use std::result;

use thiserror::Error as ThisError;

use crate::controller::ControllerError;
use crate::coordination::CoordinationError;

pub type Result<T> = result::Result<T, Error>;

/// Top-level error for crate entry points.
#[derive(Debug, ThisError)]
pub enum Error {
    /// An error raised by the controller core.
    #[error(transparent)]
    Controller(#[from] ControllerError),

    /// An error raised by the coordination-service client.
    #[error(transparent)]
    Coordination(#[from] CoordinationError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}
