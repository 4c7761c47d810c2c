//! Hardware backends for the MPPT controller.
//!
//! Only the simulated plant ships today; it implements the same
//! `mppt_traits` seams a board support crate would.
pub mod error;
pub mod sim;

pub use sim::{ChannelScale, OperatingPoint, PlantParams, PvPlant, SimFrontEnd, SimPowerStage};
