//! Virtual GIC: a GICv3/v4 delivery-state machine, LR scheduling, and
//! hardware-IRQ forwarding layer. Builds on the teacher's register-level
//! `devices::gic::{VirtualGicd, VirtualGicr}` emulation (and supersedes
//! its `vcpu_interrupt::VirtualInterruptState`, a single HCR_EL2.VI-bit
//! flag) with the full per-VIRQ dstate/LR state machine spec §4.4
//! describes.

pub mod deliver;
pub mod distrib;
pub mod dstate;
pub mod hwirq;
pub mod lr;
pub mod lr_owner;
pub mod phys;
pub mod sgi;
pub mod vic;
pub mod waker;

pub use deliver::DeliverOutcome;
pub use distrib::decode_gicd_write;
pub use dstate::{Dstate, DstateFlags};
pub use hwirq::{HwIrq, HwIrqAction, HwIrqState};
pub use lr::LrShadow;
pub use lr_owner::LrOwner;
pub use sgi::{decode as decode_sgi, PendingSgis, SgiWrite};
pub use vic::Vic;
pub use waker::{Waker, WakerState};
