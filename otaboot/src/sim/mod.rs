//! In-memory target for tests and dry runs.

mod device;
mod flash;

pub use {
    device::{Fault, SimSystem, SimulatedDevice},
    flash::SimFlash,
};
