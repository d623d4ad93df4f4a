//! Process plumbing shared by the daemon and its binary.

pub mod bootstrap;
pub mod retry;
pub mod shutdown;
