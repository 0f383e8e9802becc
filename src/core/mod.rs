//! Core processing module
//!
//! This module contains the packet record, the rewrite engine, the
//! capture stream processor, and the capture analyzer.

pub mod analyze;
pub mod packet;
pub mod rewrite;
pub mod stream;

#[cfg(test)]
pub(crate) mod testutil;
