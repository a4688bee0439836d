//! Core implementation
//!
//! Leaf modules first: sector types, the bitmap allocator and storage
//! folders, the sharded index, sector I/O and the metadata log. The
//! [`ContractManager`] in `manager` ties them together.

pub mod allocator;
pub mod config;
pub mod context;
pub mod error;
pub mod folder;
pub mod index;
pub mod io;
pub mod manager;
pub mod sector;
pub mod wal;

pub use manager::{ConsistencyReport, ContractManager, StoreOutcome};
