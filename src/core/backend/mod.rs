// src/core/backend/mod.rs

//! Backend-facing connection management: a `BackendSlot` owns one live
//! connection to one backend node; a `PoolSlot` bundles one slot per valid
//! backend for a `(user, database, protocol-major)` tuple; the per-worker
//! `PoolCache` keeps pool slots alive across frontend sessions.

pub mod pool;
pub mod slot;

pub use pool::{PoolCache, PoolKey, PoolSlot};
pub use slot::BackendSlot;
