//! Process-level helpers shared by the binary and the listener.

pub mod bootstrap;
