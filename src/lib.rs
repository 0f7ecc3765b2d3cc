//! Parallel commit fuzzing of SMT solvers.
//!
//! A fixed pool of workers pulls seed files off a shared queue, runs an
//! external mutation fuzzer on each one against a solver and an oracle, and
//! keeps whatever bug-triggering inputs the fuzzer leaves behind.

pub mod bugs;
pub mod config;
pub mod engine;
pub mod error;
pub mod fuzzers;
pub mod runner;
pub mod shutdown;
pub mod utils;
