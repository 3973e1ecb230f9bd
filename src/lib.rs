//! Boarhound library — heap-governed WiFi reconnaissance engines.
//!
//! Everything that makes the device tick lives here, portable and
//! testable on any host with `cargo test`: the heap governance core
//! (pressure levels, admission gates, active conditioning), the channel
//! scanner with its shared network table, the passive capture engine,
//! the attack engine, and the capture writers. The firmware binary
//! (`main.rs`, behind chip features) is a thin consumer that provides
//! the radio, allocator stats, storage, and delays through the traits
//! in [`platform`].
//!
//! Concurrency model: the radio driver delivers frames on its own task
//! (T_rx), which may only write into the fixed deferral buffers in
//! [`ring`]/[`capture`] under short critical sections. The main loop
//! (T_main) drains them, owns every collection, and performs all
//! storage I/O.

#![cfg_attr(not(test), no_std)]

pub mod attack;
pub mod capture;
pub mod exclusion;
pub mod frame;
pub mod heap;
pub mod platform;
pub mod policy;
pub mod recon;
pub mod ring;
pub mod writer;

#[cfg(test)]
pub(crate) mod testkit;
