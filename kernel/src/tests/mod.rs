//! Cross-subsystem test suite.
//!
//! Scenario and property tests that exercise the kernel through its
//! public surface: launched programs, fork/exit/wait, page faults, and
//! the synchronization primitives under contention. Per-module unit
//! tests live next to the code they cover.

mod memory_tests;
