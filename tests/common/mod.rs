//! Common test utilities and helpers

#![allow(dead_code)] // Test utilities may not all be used in every test file

pub mod builders;
pub mod mock_helpers;

use std::time::Duration;

/// Upper bound for a scheduler to settle in tests
pub fn settle_timeout() -> Duration {
    Duration::from_secs(10)
}
