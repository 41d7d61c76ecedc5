//! Memory Management for ARM64
//!
//! This module handles:
//! - Page table creation and management
//! - Stage-2 address translation (IPA -> PA)
//! - Memory attribute configuration

pub mod mmu;

pub use mmu::*;
