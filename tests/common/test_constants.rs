//! Shared constants for integration tests.
//!
//! Integration tests are compiled as separate crates (one per top-level file in
//! `tests/`). Placing shared constants under `tests/common/` avoids creating an
//! additional integration test binary while still allowing reuse via:
//!
//! ```rust
//! #[path = "common/test_constants.rs"]
//! mod test_constants;
//! ```

/// Zone every scripted subnet and instance lives in.
pub const AVAILABILITY_ZONE: &str = "us-east-1a";

/// Subnet attached to the default network.
pub const SUBNET_ID: &str = "subnet-1";

/// Machine image used by VM requests.
pub const IMAGE_ID: &str = "ami-12345678";

/// Instance type used by VM requests.
pub const INSTANCE_TYPE: &str = "m5.large";
