//! Integration tests for tarutil
//!
//! Every test builds its tarballs in memory or in a temporary directory, so
//! nothing here needs fixtures on disk or root privileges.

pub mod pack;
pub mod unpack;
