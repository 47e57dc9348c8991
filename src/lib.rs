//! droid-mirror - low-latency Android screen mirroring
//!
//! A signaling relay pairs one device with one viewer, a supervised capture
//! pipeline turns device screen output into media chunks, and a playout
//! buffer feeds received chunks to a media sink near the live edge.

pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod playout;
pub mod relay;
pub mod state;
pub mod transport;
pub mod utils;
pub mod web;

pub use error::{AppError, Result};
