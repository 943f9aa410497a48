//! Testing utilities: scripted capability and executor doubles.
//!
//! Used by this crate's tests and by downstream integration tests that need a
//! deterministic pipeline without an agent CLI or a test runner.

pub mod mock_backend;
pub mod scripted_executor;

pub use mock_backend::MockBackend;
pub use scripted_executor::ScriptedExecutor;
