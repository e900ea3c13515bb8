//! Measurement records decoded from the scale and the report built from them.
//!
//! Records are plain values compared structurally; the aggregator relies on
//! that equality for deduplication.

use serde::{Deserialize, Serialize};

/// Gender flag carried in the person characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    /// Flag value `1`.
    Male,
    /// Any other flag value.
    Female,
}

/// Activity level carried in the person characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityLevel {
    /// Any flag value other than `3`.
    Normal,
    /// Flag value `3`.
    High,
}

/// User profile stored on the scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonRecord {
    /// Whether the magic byte matched.
    pub valid: bool,
    /// Index of the user slot on the scale.
    pub person_index: u8,
    /// Gender of the user.
    pub gender: Gender,
    /// Age in years.
    pub age: u8,
    /// Height in centimetres.
    pub height_cm: u8,
    /// Activity level of the user.
    pub activity: ActivityLevel,
}

/// A single weighing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeightRecord {
    /// Whether the magic byte matched.
    pub valid: bool,
    /// Weight in kilograms, two decimal places.
    pub weight_kg: f64,
    /// Normalized epoch seconds.
    pub timestamp: u64,
    /// Index of the user slot on the scale.
    pub person_index: u8,
    /// Body mass index, attached when the session is finalized.
    pub bmi: f64,
}

/// Body-composition analysis taken alongside a weighing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BodyRecord {
    /// Whether the magic byte matched.
    pub valid: bool,
    /// Normalized epoch seconds.
    pub timestamp: u64,
    /// Index of the user slot on the scale.
    pub person_index: u8,
    /// Basal metabolic rate estimate.
    pub kcal: u16,
    /// Body fat percentage.
    pub fat_pct: f64,
    /// Total body water percentage.
    pub tbw_pct: f64,
    /// Muscle percentage.
    pub muscle_pct: f64,
    /// Bone mass percentage.
    pub bone_pct: f64,
}

/// Any decoded record, tagged by the characteristic that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Measurement {
    /// From the person characteristic.
    Person(PersonRecord),
    /// From the weight characteristic.
    Weight(WeightRecord),
    /// From the body characteristic.
    Body(BodyRecord),
}

impl Measurement {
    /// Returns the `valid` flag of the wrapped record.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        match self {
            Self::Person(p) => p.valid,
            Self::Weight(w) => w.valid,
            Self::Body(b) => b.valid,
        }
    }
}

/// The finished output of one measurement session.
///
/// Weights and bodies are ordered newest first; persons keep arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    /// Person records in arrival order.
    pub persons: Vec<PersonRecord>,
    /// Weight records, timestamp descending, with `bmi` attached.
    pub weights: Vec<WeightRecord>,
    /// Body records, timestamp descending.
    pub bodies: Vec<BodyRecord>,
}

impl Report {
    /// The most recent weighing, if any.
    #[must_use]
    pub fn latest_weight(&self) -> Option<&WeightRecord> {
        self.weights.first()
    }
}
