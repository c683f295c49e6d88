//! Layer-parallel training of residual and recurrent networks via MGRIT
//! (multigrid-reduction-in-time): each rank owns a contiguous slice of
//! layers/time-steps and trades ghost state with its neighbors instead of
//! running the network's full depth on every rank.
//!
//! Module map (SPEC_FULL.md component IDs in parens):
//! - [`error`] — the crate-wide error enum (all fallible paths funnel here).
//! - [`comm`] — the communication boundary (`mpi`-backed and in-process
//!   `FakeComm` for tests), C3.
//! - [`timer`] — named timing spans around the solve, A5.
//! - [`serialize`] — the tensor/gradient wire codec shared by `comm` and
//!   `vector`, C5.
//! - [`layer`] — the `Layer` capability set and its kind-tagged byte codec.
//! - [`vector`] — `BraidVector`, the multigrid solver's state representation.
//! - [`braid`] — the MGRIT callback contract and reference driver, C4.
//! - [`resnet`] — the ResNet-as-ODE forward/backward apps and block layer.
//! - [`rnn`] — the LSTM-cell forward/backward apps and cell layer.
//! - [`module`] — `LayerParallel`/`RnnParallel`, the user-facing modules, C8.
//! - [`autograd`] — the `candle` custom-op bridge onto the reverse-mode
//!   tape, C9.
//! - [`config`] — the CLI options shared by the two training binaries, A4.
//! - [`checkpoint`] — model (not solver-state) persistence, ambient stack.

pub mod autograd;
pub mod braid;
pub mod checkpoint;
pub mod comm;
pub mod config;
pub mod error;
pub mod layer;
pub mod module;
pub mod resnet;
pub mod rnn;
pub mod serialize;
pub mod timer;
pub mod vector;

pub use error::{BraidError, BraidResult};
pub use module::{LayerParallel, RnnParallel};
