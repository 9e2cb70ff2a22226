//! Test doubles and fixtures for exercising a baton [`Coordinator`](baton::Coordinator)
//! without real media workers.

pub mod fixtures;
pub mod mock;

pub use fixtures::*;
pub use mock::*;
