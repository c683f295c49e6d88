//! C4 + the reference multigrid driver (A5 of SPEC_FULL.md): the callback
//! contract an MGRIT solver needs from an application, and a minimal
//! correct (if unoptimized) driver implementing it in-crate, standing in
//! for the external multigrid library named in §1.

pub mod core;

use crate::error::BraidResult;
use crate::vector::BraidVector;

/// Observation hook passed to `BraidApp::access` (§4.4). The reference
/// driver only calls it at the finest level, and only at the points the
/// app actually cares about (construction wires this narrowly rather than
/// exposing the full solver-internal status object).
pub struct AccessStatus {
    pub t: f64,
    pub level: usize,
    pub done: bool,
    pub iteration: usize,
}

/// The callback table `BraidAppBase` exposes to the driver (§4.4). Forward
/// and backward applications for both network variants implement this.
pub trait BraidApp {
    fn init(&mut self, t: f64) -> BraidResult<BraidVector>;
    fn clone_vector(&self, v: &BraidVector) -> BraidResult<BraidVector>;
    fn sum(&self, alpha: f64, x: &BraidVector, beta: f64, y: &mut BraidVector) -> BraidResult<()>;
    fn spatial_norm(&self, v: &BraidVector) -> BraidResult<f64>;
    fn access(&mut self, v: &BraidVector, status: &AccessStatus) -> BraidResult<()>;
    fn buf_size(&self) -> usize;
    fn buf_pack(&self, v: &BraidVector, buf: &mut crate::serialize::SerializationBuffer) -> BraidResult<()>;
    fn buf_unpack(&self, buf: &mut crate::serialize::SerializationBuffer, level: usize) -> BraidResult<BraidVector>;
    fn step(&mut self, u: &mut BraidVector, tstart: f64, tstop: f64, level: usize) -> BraidResult<()>;
}

/// Options an app construction passes to the driver core (§4.8, §6).
#[derive(Clone, Debug)]
pub struct BraidOptions {
    pub max_levels: usize,
    pub max_iters: usize,
    pub print_level: u8,
    pub cfactor: u32,
    pub nrelax: Vec<(i32, usize)>,
    pub skip_downcycle: bool,
    pub abs_tol: f64,
    pub reverted_ranks: bool,
    pub final_relax: bool,
}

impl Default for BraidOptions {
    fn default() -> Self {
        Self {
            max_levels: 1,
            max_iters: 1,
            print_level: 0,
            cfactor: 2,
            nrelax: Vec::new(),
            skip_downcycle: false,
            abs_tol: 1e-9,
            reverted_ranks: false,
            final_relax: false,
        }
    }
}

impl BraidOptions {
    /// Relaxation sweep count at `level`, honoring a `-1` ("all levels")
    /// override and falling back to 1 sweep (§4.8's `setNumRelax`).
    pub fn nrelax_at(&self, level: usize) -> usize {
        for (l, n) in &self.nrelax {
            if *l == -1 || *l as usize == level {
                return *n;
            }
        }
        1
    }
}
