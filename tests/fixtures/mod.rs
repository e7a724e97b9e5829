//! Reusable node fixtures.

mod client_server;

pub use client_server::{ClientServerFixture, FixtureBuilder, Inbox, test_registry};
