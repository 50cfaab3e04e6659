//! # corral-core
//!
//! Low-level Linux isolation primitives for the Corral execution driver.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: kinds and the util-linux flags that create or join them.
//! - **Cgroups v2**: CPU, memory and cpuset limits, the freezer, accounting.
//! - **Capabilities**: bounding-set computation for least-privilege execution.
//! - **Profiles**: the default isolation configuration merged into every container.
//! - **Host information**: machine memory, process start times, interface counters.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod apparmor;
pub mod capability;
pub mod cgroup;
pub mod namespace;
pub mod proc;
pub mod profile;
