//! A4: ambient CLI configuration, mirroring the original's
//! `argparse`-based `Options` (`examples/scaling/backward_scaling.py`) with
//! `clap`'s derive API in place of hand-rolled argument parsing.

use clap::Parser;

/// Command-line options shared by the ResNet and RNN training binaries.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Options {
    /// Multigrid level count cap.
    #[arg(long, default_value_t = 1)]
    pub levels: usize,

    /// Multigrid iteration count cap.
    #[arg(long, default_value_t = 1)]
    pub iters: usize,

    /// Coarsening factor (must be >= 2 whenever `levels > 1`).
    #[arg(long, default_value_t = 2)]
    pub cfactor: u32,

    /// Relaxation sweeps at the finest level (0 = F-relaxation only).
    #[arg(long, default_value_t = 1)]
    pub nrelax: u32,

    /// Final simulated time (the "depth" axis's upper bound).
    #[arg(long, default_value_t = 1.0)]
    pub tf: f64,

    /// Run with a single rank regardless of how many ranks MPI reports
    /// (fatal if more than one rank is actually present — see
    /// `BraidError::SerialRequiresOneRank`).
    #[arg(long, default_value_t = false)]
    pub serial: bool,

    /// 0=quiet .. 3=trace (`LayerParallel::set_print_level`).
    #[arg(long, default_value_t = 0)]
    pub verbosity: u8,

    /// Number of residual/LSTM layers (ResNet: blocks; RNN: input length).
    #[arg(long, default_value_t = 8)]
    pub steps: usize,

    /// Feature width for ResNet blocks, or the LSTM hidden size.
    #[arg(long, default_value_t = 16)]
    pub channels: usize,

    /// Batch size of the synthetic input the example binaries generate.
    #[arg(long, default_value_t = 1)]
    pub batch: usize,

    /// PRNG seed for the synthetic input / weight initialization.
    #[arg(long, default_value_t = 20)]
    pub seed: u64,
}

impl Options {
    /// Configuration-time invariants (§7 of SPEC_FULL.md): these are
    /// reported and the process exits non-zero, never silently corrected.
    pub fn validate(&self, world_size: usize) -> crate::error::BraidResult<()> {
        if self.serial && world_size > 1 {
            return Err(crate::error::BraidError::SerialRequiresOneRank(world_size));
        }
        if self.levels > 1 && self.cfactor < 2 {
            return Err(crate::error::BraidError::InvalidCFactor(self.cfactor));
        }
        if self.steps % world_size != 0 {
            return Err(crate::error::BraidError::StepsNotDivisible {
                steps: self.steps,
                ranks: world_size,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for Options {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "levels={} iters={} cfactor={} nrelax={} tf={} serial={} verbosity={} steps={} channels={} batch={} seed={}",
            self.levels, self.iters, self.cfactor, self.nrelax, self.tf, self.serial, self.verbosity, self.steps, self.channels, self.batch, self.seed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_with_multiple_ranks_is_rejected() {
        let opts = Options::parse_from(["bin", "--serial"]);
        assert!(opts.validate(2).is_err());
        assert!(opts.validate(1).is_ok());
    }

    #[test]
    fn non_divisible_steps_is_rejected() {
        let opts = Options::parse_from(["bin", "--steps", "7"]);
        assert!(opts.validate(2).is_err());
        assert!(opts.validate(7).is_ok());
    }
}
