//! Run configuration, validation, and error types.
//!
//! [`RunConfig`] is the input to [`Context::new`](crate::Context::new).
//! [`validate()`](RunConfig::validate) checks every structural invariant
//! before any memory is reserved.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use ember_arena::{ArenaConfig, ArenaError};
use ember_bank::RefillPolicy;
use ember_core::Species;
use ember_domain::TerminationConfig;

// ── ConfigError ────────────────────────────────────────────────────

/// Errors detected during [`RunConfig::validate()`].
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    /// Arena configuration is invalid.
    Arena(ArenaError),
    /// `particles_per_worker` is zero.
    NoParticles,
    /// No species are configured.
    NoSpecies,
    /// A species is listed twice.
    DuplicateSpecies {
        /// The repeated species.
        species: Species,
    },
    /// A batch or budget setting is zero.
    ZeroSize {
        /// Name of the offending setting.
        setting: &'static str,
    },
    /// `refill_threshold` or `refill_fraction` is outside `(0, 1]`.
    InvalidRefill {
        /// Description of which bound was violated.
        reason: String,
    },
    /// `termination.confirmation_rounds` is zero.
    InvalidTermination,
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Arena(e) => write!(f, "arena: {e}"),
            Self::NoParticles => write!(f, "particles_per_worker must be at least 1"),
            Self::NoSpecies => write!(f, "at least one species must be configured"),
            Self::DuplicateSpecies { species } => {
                write!(f, "species {species} is listed more than once")
            }
            Self::ZeroSize { setting } => write!(f, "{setting} must be at least 1"),
            Self::InvalidRefill { reason } => write!(f, "invalid refill policy: {reason}"),
            Self::InvalidTermination => {
                write!(f, "termination.confirmation_rounds must be at least 1")
            }
        }
    }
}

impl Error for ConfigError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Arena(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ArenaError> for ConfigError {
    fn from(e: ArenaError) -> Self {
        Self::Arena(e)
    }
}

// ── RunConfig ──────────────────────────────────────────────────────

/// Complete configuration of one rank's tracking run.
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Worker threads per rank. `None` = auto-detect
    /// (`available_parallelism / 2`, clamped to `[2, 16]`).
    pub workers: Option<usize>,
    /// Particle records preallocated per worker and species. Default: 4096.
    pub particles_per_worker: usize,
    /// Species tracked in this run. Default: neutrons only.
    pub species: Vec<Species>,
    /// Particles per migration message. Default: 100.
    pub dd_batch_size: usize,
    /// Termination detection settings.
    pub termination: TerminationConfig,
    /// Values per message in score reductions. Default: 65536.
    pub collective_batch_size: usize,
    /// Histories a worker tracks before the rank loop services the
    /// exchange again. Default: 1024.
    pub round_budget: usize,
    /// Append the bank to this file at the end of every batch.
    pub checkpoint: Option<PathBuf>,
    /// Fraction of `particles_per_worker` below which any one worker's
    /// low-water mark triggers a top-up. Default: 0.2.
    pub refill_threshold: f64,
    /// Fraction of `particles_per_worker * workers` added per top-up.
    /// Default: 0.2.
    pub refill_fraction: f64,
    /// Arena sizing.
    pub arena: ArenaConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        let refill = RefillPolicy::default();
        Self {
            workers: None,
            particles_per_worker: 4096,
            species: vec![Species::Neutron],
            dd_batch_size: 100,
            termination: TerminationConfig::default(),
            collective_batch_size: 1 << 16,
            round_budget: 1024,
            checkpoint: None,
            refill_threshold: refill.threshold,
            refill_fraction: refill.fraction,
            arena: ArenaConfig::default(),
        }
    }
}

impl RunConfig {
    /// Resolve the actual worker count, applying auto-detection if `None`.
    ///
    /// Explicit values are clamped to `[1, 64]`.
    pub fn resolved_worker_count(&self) -> usize {
        match self.workers {
            Some(n) => n.clamp(1, 64),
            None => {
                let cpus = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(4);
                (cpus / 2).clamp(2, 16)
            }
        }
    }

    /// The stack refill policy described by this configuration.
    pub fn refill_policy(&self) -> RefillPolicy {
        RefillPolicy {
            threshold: self.refill_threshold,
            fraction: self.refill_fraction,
        }
    }

    /// Validate all structural invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.arena.validate()?;
        if self.particles_per_worker == 0 {
            return Err(ConfigError::NoParticles);
        }
        if self.species.is_empty() {
            return Err(ConfigError::NoSpecies);
        }
        for (i, s) in self.species.iter().enumerate() {
            if self.species[..i].contains(s) {
                return Err(ConfigError::DuplicateSpecies { species: *s });
            }
        }
        for (setting, value) in [
            ("dd_batch_size", self.dd_batch_size),
            ("collective_batch_size", self.collective_batch_size),
            ("round_budget", self.round_budget),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroSize { setting });
            }
        }
        for (name, value) in [
            ("refill_threshold", self.refill_threshold),
            ("refill_fraction", self.refill_fraction),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(ConfigError::InvalidRefill {
                    reason: format!("{name} must be in (0.0, 1.0], got {value}"),
                });
            }
        }
        if self.termination.confirmation_rounds == 0 {
            return Err(ConfigError::InvalidTermination);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(RunConfig::default().validate().is_ok());
    }

    #[test]
    fn explicit_workers_are_clamped() {
        let mut cfg = RunConfig::default();
        cfg.workers = Some(0);
        assert_eq!(cfg.resolved_worker_count(), 1);
        cfg.workers = Some(500);
        assert_eq!(cfg.resolved_worker_count(), 64);
        cfg.workers = None;
        let n = cfg.resolved_worker_count();
        assert!((2..=16).contains(&n));
    }

    #[test]
    fn zero_particles_rejected() {
        let cfg = RunConfig {
            particles_per_worker: 0,
            ..RunConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::NoParticles));
    }

    #[test]
    fn duplicate_species_rejected() {
        let cfg = RunConfig {
            species: vec![Species::Neutron, Species::Photon, Species::Neutron],
            ..RunConfig::default()
        };
        assert_eq!(
            cfg.validate(),
            Err(ConfigError::DuplicateSpecies {
                species: Species::Neutron
            })
        );
    }

    #[test]
    fn zero_sizes_name_the_setting() {
        let cfg = RunConfig {
            round_budget: 0,
            ..RunConfig::default()
        };
        match cfg.validate() {
            Err(e @ ConfigError::ZeroSize { setting: "round_budget" }) => {
                assert_eq!(e.to_string(), "round_budget must be at least 1");
            }
            other => panic!("expected ZeroSize(round_budget), got {other:?}"),
        }
    }

    #[test]
    fn refill_fraction_bounds() {
        for bad in [0.0, -0.1, 1.5, f64::NAN] {
            let cfg = RunConfig {
                refill_fraction: bad,
                ..RunConfig::default()
            };
            assert!(matches!(
                cfg.validate(),
                Err(ConfigError::InvalidRefill { .. })
            ));
        }
    }

    #[test]
    fn zero_confirmation_rounds_rejected() {
        let cfg = RunConfig {
            termination: TerminationConfig {
                confirmation_rounds: 0,
            },
            ..RunConfig::default()
        };
        assert_eq!(cfg.validate(), Err(ConfigError::InvalidTermination));
    }

    #[test]
    fn bad_arena_wraps_source() {
        let cfg = RunConfig {
            arena: ArenaConfig {
                initial_capacity: 10,
                max_size: 5,
            },
            ..RunConfig::default()
        };
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Arena(_)));
        assert!(err.source().is_some());
    }
}
