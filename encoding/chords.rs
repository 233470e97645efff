//! # Chord Catalogue and Feature Designs
//!
//! The 31 non-empty subsets of the five fingers are enumerated once, in a fixed
//! canonical order: by number of stimulated fingers, then lexicographically by the
//! stimulated finger indices (thumb = 1 .. little = 5). Chord ids are 1-based
//! positions in that order, so ids 1..=5 are the single fingers and id 31 is the
//! full five-finger chord.
//!
//! Every design matrix built here has one row per chord in canonical order. A
//! feature is itself a finger subset, and a chord loads on a feature when it
//! stimulates every finger of that subset (the interaction coding), except for the
//! per-condition basis where each chord only loads on itself.

use itertools::Itertools;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

pub const NUM_FINGERS: usize = 5;
pub const NUM_CHORDS: usize = 31;

const FINGER_NAMES: [&str; NUM_FINGERS] = ["thumb", "index", "middle", "ring", "little"];

static CHORDS: LazyLock<Vec<Chord>> = LazyLock::new(|| {
    (1..=NUM_FINGERS)
        .flat_map(|size| (0..NUM_FINGERS).combinations(size))
        .enumerate()
        .map(|(i, fingers)| Chord {
            id: (i + 1) as u8,
            mask: fingers.iter().fold(0u8, |acc, &f| acc | (1 << f)),
        })
        .collect()
});

/// One finger-combination condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Chord {
    id: u8,
    mask: u8,
}

impl Chord {
    /// Looks a chord up by its 1-based id.
    pub fn from_id(id: i64) -> Option<Chord> {
        if (1..=NUM_CHORDS as i64).contains(&id) {
            Some(CHORDS[(id - 1) as usize])
        } else {
            None
        }
    }

    pub fn id(self) -> u8 {
        self.id
    }

    /// Row of this chord in every chord-indexed matrix.
    pub fn index(self) -> usize {
        self.id as usize - 1
    }

    /// Bit `i` is set when finger `i` (0 = thumb) is stimulated.
    pub fn mask(self) -> u8 {
        self.mask
    }

    /// 0/1 stimulation vector, thumb first.
    pub fn stimulation(self) -> [u8; NUM_FINGERS] {
        let mut out = [0; NUM_FINGERS];
        for (f, slot) in out.iter_mut().enumerate() {
            *slot = (self.mask >> f) & 1;
        }
        out
    }

    pub fn digit_count(self) -> usize {
        self.mask.count_ones() as usize
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let digits: String = self
            .stimulation()
            .iter()
            .map(|&b| if b == 1 { '1' } else { '0' })
            .collect();
        write!(f, "{digits}")
    }
}

/// All chords in canonical order.
pub fn all_chords() -> &'static [Chord] {
    &CHORDS
}

/// Families of finger-subset features.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FeatureSet {
    Singles,
    Pairs,
    Triplets,
    Quadruplets,
    /// Pairs of neighbouring fingers on the thumb-to-little axis.
    AdjacentPairs,
    /// Pairs with at least one finger between them.
    DistantPairs,
    /// One feature per chord.
    Conditions,
}

impl FeatureSet {
    /// Finger masks of the features in this family, in canonical chord order.
    pub fn masks(self) -> Vec<u8> {
        let of_size = |size: usize| {
            all_chords()
                .iter()
                .filter(move |c| c.digit_count() == size)
                .map(|c| c.mask)
        };
        match self {
            FeatureSet::Singles => of_size(1).collect(),
            FeatureSet::Pairs => of_size(2).collect(),
            FeatureSet::Triplets => of_size(3).collect(),
            FeatureSet::Quadruplets => of_size(4).collect(),
            FeatureSet::AdjacentPairs => of_size(2).filter(|&m| is_adjacent_pair(m)).collect(),
            FeatureSet::DistantPairs => of_size(2).filter(|&m| !is_adjacent_pair(m)).collect(),
            FeatureSet::Conditions => all_chords().iter().map(|c| c.mask).collect(),
        }
    }

    fn loads(self, chord: Chord, feature_mask: u8) -> bool {
        match self {
            FeatureSet::Conditions => chord.mask == feature_mask,
            _ => chord.mask & feature_mask == feature_mask,
        }
    }
}

/// A pair mask is adjacent when its two fingers are consecutive.
fn is_adjacent_pair(mask: u8) -> bool {
    mask.count_ones() == 2 && {
        let low = mask.trailing_zeros();
        mask >> low == 0b11
    }
}

/// Human-readable name of a finger-subset feature, e.g. `thumb+middle`.
pub fn feature_label(mask: u8) -> String {
    (0..NUM_FINGERS)
        .filter(|&f| mask & (1 << f) != 0)
        .map(|f| FINGER_NAMES[f])
        .join("+")
}

/// A chord-indexed design matrix together with its name and feature labels.
#[derive(Clone, Debug)]
pub struct FeatureDesign {
    pub name: String,
    pub matrix: Array2<f64>,
    pub feature_labels: Vec<String>,
}

impl FeatureDesign {
    /// Concatenates the columns of the given feature families.
    pub fn from_sets(name: &str, sets: &[FeatureSet]) -> Self {
        let columns: Vec<(FeatureSet, u8)> = sets
            .iter()
            .flat_map(|&set| set.masks().into_iter().map(move |m| (set, m)))
            .collect();

        let matrix = Array2::from_shape_fn((NUM_CHORDS, columns.len()), |(row, col)| {
            let (set, mask) = columns[col];
            if set.loads(all_chords()[row], mask) {
                1.0
            } else {
                0.0
            }
        });
        let feature_labels = columns
            .iter()
            .map(|&(set, mask)| match set {
                FeatureSet::Conditions => format!("chord{}", chord_with_mask(mask)),
                _ => feature_label(mask),
            })
            .collect();

        Self {
            name: name.to_string(),
            matrix,
            feature_labels,
        }
    }

    /// Singles plus every interaction order up to `order`.
    pub fn interactions(name: &str, order: usize) -> Self {
        let sets = [
            FeatureSet::Singles,
            FeatureSet::Pairs,
            FeatureSet::Triplets,
            FeatureSet::Quadruplets,
        ];
        Self::from_sets(name, &sets[..order.clamp(1, sets.len())])
    }

    pub fn num_features(&self) -> usize {
        self.matrix.ncols()
    }
}

fn chord_with_mask(mask: u8) -> Chord {
    all_chords()
        .iter()
        .copied()
        .find(|c| c.mask == mask)
        .unwrap_or(all_chords()[0])
}

/// Chord row indices grouped by digit count; entry `k` holds the `k + 1`-finger chords.
pub fn digit_groups() -> [Vec<usize>; NUM_FINGERS] {
    let mut groups: [Vec<usize>; NUM_FINGERS] = Default::default();
    for chord in all_chords() {
        groups[chord.digit_count() - 1].push(chord.index());
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Axis;

    #[test]
    fn canonical_order_starts_with_singles_and_ends_with_full_chord() {
        let chords = all_chords();
        assert_eq!(chords.len(), NUM_CHORDS);
        for (i, chord) in chords.iter().take(5).enumerate() {
            assert_eq!(chord.digit_count(), 1);
            assert_eq!(chord.mask(), 1 << i);
        }
        assert_eq!(chords[5].to_string(), "11000");
        assert_eq!(chords[30].to_string(), "11111");
        assert!(chords.windows(2).all(|w| w[0].digit_count() <= w[1].digit_count()));
        assert_eq!(Chord::from_id(31).map(|c| c.digit_count()), Some(5));
        assert!(Chord::from_id(0).is_none());
        assert!(Chord::from_id(32).is_none());
    }

    #[test]
    fn single_finger_design_is_the_stimulation_matrix() {
        let design = FeatureDesign::interactions("1finger", 1);
        assert_eq!(design.matrix.dim(), (31, 5));
        for chord in all_chords() {
            let row = design.matrix.row(chord.index());
            for (f, &bit) in chord.stimulation().iter().enumerate() {
                assert_eq!(row[f], bit as f64);
            }
        }
    }

    #[test]
    fn interaction_designs_have_expected_widths() {
        assert_eq!(FeatureDesign::interactions("2finger", 2).num_features(), 15);
        assert_eq!(FeatureDesign::interactions("3finger", 3).num_features(), 25);
        assert_eq!(FeatureDesign::interactions("4finger", 4).num_features(), 30);
        let conditions = FeatureDesign::from_sets("noise_ceiling", &[FeatureSet::Conditions]);
        assert_eq!(conditions.matrix, Array2::<f64>::eye(31));
    }

    #[test]
    fn pair_feature_loads_on_every_superset_chord() {
        let design = FeatureDesign::interactions("2finger", 2);
        // thumb+index pair is column 5; it is present in 8 of the 31 chords.
        assert_eq!(design.feature_labels[5], "thumb+index");
        assert_eq!(design.matrix.column(5).sum(), 8.0);
        assert_eq!(design.matrix.sum_axis(Axis(1))[30], 15.0);
    }

    #[test]
    fn adjacency_partitions_the_pairs() {
        let adjacent = FeatureSet::AdjacentPairs.masks();
        let distant = FeatureSet::DistantPairs.masks();
        assert_eq!(adjacent.len(), 4);
        assert_eq!(distant.len(), 6);
        assert_eq!(adjacent.len() + distant.len(), 10);
        assert!(adjacent.iter().all(|m| !distant.contains(m)));
        assert_eq!(
            adjacent.iter().map(|&m| feature_label(m)).collect::<Vec<_>>(),
            vec!["thumb+index", "index+middle", "middle+ring", "ring+little"]
        );
    }

    #[test]
    fn digit_groups_cover_binomial_counts() {
        let sizes: Vec<usize> = digit_groups().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![5, 10, 10, 5, 1]);
    }
}
