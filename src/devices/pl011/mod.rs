//! PL011 UART Device Driver
//!
//! This module provides emulation for the ARM PL011 UART device.

mod emulator;

pub use emulator::VirtualUart;
