//! Scenario tests that wire more than one component together, mirroring the teacher's
//! `src/tests/e2e.rs` placement rather than living inside any single module's own test block.
//! Single-component behavior is tested alongside the component it belongs to; this module is
//! reserved for the cases that need two or more collaborators in the same test.
