//! Scenario tests for the connection manager
//!
//! The collector is simulated in memory: [`harness::MemoryDialer`] hands the
//! transporter channel-backed streams and keeps the collector side of every
//! connection, [`harness::ScriptedResolver`] answers discovery.

pub mod harness;

mod dispatch_tests;
