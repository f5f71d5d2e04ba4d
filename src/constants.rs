//! Centralized controller constants.
//!
//! This module consolidates the sentinel values and initial epochs used
//! throughout the controller. Having them in one place makes it easier to:
//!
//! - Understand the epoch/version discipline
//! - Keep the coordination-service payloads consistent
//! - Document the rationale for each value

// =============================================================================
// Epoch Constants
// =============================================================================

/// Controller epoch before any controller has ever been elected.
///
/// The epoch node in the coordination service is seeded with this value; the
/// first successful election bumps it to 1. A resigned controller resets its
/// cached epoch back to this value.
pub const INITIAL_CONTROLLER_EPOCH: i32 = 0;

/// Version of the controller-epoch node before any election.
///
/// Every mutation the controller performs against shared state is conditional
/// on this version; observing a different version means another controller
/// has been elected since we last won.
pub const INITIAL_CONTROLLER_EPOCH_VERSION: i32 = 0;

/// Leader epoch assigned when a partition's leadership is first written.
pub const INITIAL_LEADER_EPOCH: i32 = 0;

/// Node version assigned when a partition's leadership is first written.
///
/// Subsequent leadership updates are compare-and-swap operations against the
/// version observed at read time.
pub const INITIAL_PARTITION_VERSION: i32 = 0;

// =============================================================================
// Payload Format Versions
// =============================================================================

/// Format version embedded in JSON payloads written to the coordination
/// service (controller registration, topic assignment, partition state).
pub const PAYLOAD_FORMAT_VERSION: i32 = 1;
