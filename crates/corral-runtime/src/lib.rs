//! Execution driver for the Corral container runtime.
//!
//! [`driver::ExecDriver`] runs a container's init process to completion and
//! serves pause, exec, kill, terminate and stats requests for it from other
//! threads. Isolation itself is delegated to a [`backend::RuntimeFactory`].

#![allow(unsafe_code)]
#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod command;
pub mod console;
pub mod driver;
pub mod error;
pub mod exit;
pub mod host;
pub mod info;
pub mod oom;
pub mod registry;
pub mod stats;
