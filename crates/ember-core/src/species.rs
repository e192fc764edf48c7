//! Particle species tags.

use std::fmt;

/// Species of a transported particle.
///
/// The discriminant is the value stored in the record's
/// [`SPECIES`](crate::record::particle::SPECIES) field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Species {
    /// Neutron.
    Neutron = 1,
    /// Photon (gamma).
    Photon = 2,
    /// Delayed-neutron precursor.
    Precursor = 3,
}

impl Species {
    /// Every species, in tag order.
    pub const ALL: [Species; 3] = [Species::Neutron, Species::Photon, Species::Precursor];

    /// Number of species.
    pub const COUNT: usize = Self::ALL.len();

    /// Decode a species tag read from a record.
    ///
    /// Returns `None` for any value that is not an exact species tag,
    /// including the zero left behind by a cleared record.
    pub fn from_tag(tag: f64) -> Option<Species> {
        match tag {
            t if t == 1.0 => Some(Species::Neutron),
            t if t == 2.0 => Some(Species::Photon),
            t if t == 3.0 => Some(Species::Precursor),
            _ => None,
        }
    }

    /// The value written into the record's species field.
    pub fn tag(self) -> f64 {
        self as u8 as f64
    }

    /// Dense index `0..COUNT`, used to address per-species tables.
    pub fn index(self) -> usize {
        self as usize - 1
    }
}

impl fmt::Display for Species {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Species::Neutron => "neutron",
            Species::Photon => "photon",
            Species::Precursor => "precursor",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_round_trip() {
        for s in Species::ALL {
            assert_eq!(Species::from_tag(s.tag()), Some(s));
        }
    }

    #[test]
    fn cleared_tag_is_not_a_species() {
        assert_eq!(Species::from_tag(0.0), None);
        assert_eq!(Species::from_tag(1.5), None);
        assert_eq!(Species::from_tag(f64::NAN), None);
    }

    #[test]
    fn indices_are_dense() {
        let idx: Vec<_> = Species::ALL.iter().map(|s| s.index()).collect();
        assert_eq!(idx, vec![0, 1, 2]);
    }
}
