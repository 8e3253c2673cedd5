//! Phase-coherent capture across several SDR nodes, and estimation of the phase and timing
//! offsets between their receive channels.
//!
//! A node locks to a shared 10 MHz reference, zeroes its hardware clock on a PPS edge and retunes
//! all LOs with timed commands. Nodes meet at a rendezvous barrier to agree on a start time, then
//! transmit a loopback tone while capturing IQ samples:
//!
//!  - `scheduler`, `rendezvous` and `stream` run a capture against the traits in `radio`
//!  - `phase`, `circular` and `aggregate` estimate the phase difference between two channels
//!  - `align` and `channel_est` locate Zadoff-Chu frames and estimate per-subcarrier channels

pub mod aggregate;
pub mod align;
pub mod args;
pub mod bus;
pub mod channel_est;
pub mod circular;
pub mod config;
pub mod error;
pub mod iq_buffer;
pub mod node;
pub mod phase;
pub mod quality;
pub mod radio;
pub mod rendezvous;
pub mod scheduler;
pub mod session;
pub mod sim;
pub mod stream;
pub mod zadoff_chu;

pub use align::{align, PeakPolicy};
pub use channel_est::estimate_channel;
pub use circular::{CircularAccumulator, CircularStatistic};
pub use config::Config;
pub use error::SyncError;
pub use iq_buffer::IqBuffer;
pub use zadoff_chu::{generate, ReferenceSequence};
