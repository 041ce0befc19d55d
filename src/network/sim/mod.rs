//! Deterministic single-threaded simulation of many peers over an in-memory substrate.

mod event;
mod hub;
mod substrate;

pub use event::{EventQueue, SimEvent};
pub use hub::SimHub;
pub use substrate::{MemorySubstrate, SubstrateView};
