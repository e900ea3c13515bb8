//! Per-session accumulation of decoded records.
//!
//! The aggregator keeps one insertion-ordered collection per record kind and
//! rejects structural duplicates (the scale re-sends its history on every
//! connection). Derived fields and ordering are only computed in
//! [`Aggregator::finalize`], after the listening window has closed.

use crate::types::{BodyRecord, Measurement, PersonRecord, Report, WeightRecord};

/// Number of records held per collection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordCounts {
    /// Person records.
    pub persons: usize,
    /// Weight records.
    pub weights: usize,
    /// Body records.
    pub bodies: usize,
}

/// Deduplicating record store for a single session.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
    persons: Vec<PersonRecord>,
    weights: Vec<WeightRecord>,
    bodies: Vec<BodyRecord>,
}

fn push_unique<T: PartialEq>(records: &mut Vec<T>, record: T) -> bool {
    if records.contains(&record) {
        return false;
    }
    records.push(record);
    true
}

/// Round a non-negative value to one decimal, half to even, on its exact
/// binary value.
///
/// A double sits exactly halfway between two tenths only when it ends in
/// `.25` or `.75`; every other value is correctly rounded by the exact
/// decimal formatter.
fn round_tenth(x: f64) -> f64 {
    let quarters = x * 4.0;
    if quarters.fract() == 0.0 && quarters % 2.0 != 0.0 {
        let tenth = if quarters % 4.0 == 1.0 { 2 } else { 8 };
        return format!("{}.{tenth}", x.trunc()).parse().unwrap_or(x);
    }
    format!("{x:.1}").parse().unwrap_or(x)
}

/// `round(weight / height², 1)`, or `0` for an unknown height.
fn body_mass_index(weight_kg: f64, height_cm: u8) -> f64 {
    if height_cm == 0 {
        return 0.0;
    }
    let height_m = f64::from(height_cm) / 100.0;
    round_tenth(weight_kg / (height_m * height_m))
}

impl Aggregator {
    /// Create an empty aggregator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a person record unless an identical one is present.
    pub fn add_person(&mut self, record: PersonRecord) -> bool {
        push_unique(&mut self.persons, record)
    }

    /// Insert a weight record unless an identical one is present.
    pub fn add_weight(&mut self, record: WeightRecord) -> bool {
        push_unique(&mut self.weights, record)
    }

    /// Insert a body record unless an identical one is present.
    pub fn add_body(&mut self, record: BodyRecord) -> bool {
        push_unique(&mut self.bodies, record)
    }

    /// Route a tagged record to its collection.
    ///
    /// Returns `false` if the record was a duplicate.
    pub fn add(&mut self, measurement: Measurement) -> bool {
        match measurement {
            Measurement::Person(p) => self.add_person(p),
            Measurement::Weight(w) => self.add_weight(w),
            Measurement::Body(b) => self.add_body(b),
        }
    }

    /// Whether every collection holds at least one record.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !self.persons.is_empty() && !self.weights.is_empty() && !self.bodies.is_empty()
    }

    /// Current collection sizes.
    #[must_use]
    pub fn counts(&self) -> RecordCounts {
        RecordCounts {
            persons: self.persons.len(),
            weights: self.weights.len(),
            bodies: self.bodies.len(),
        }
    }

    /// Attach BMI and order the collections for reporting.
    ///
    /// BMI uses `height_cm_override` when given, otherwise the height of the
    /// first person record; a height of zero yields a BMI of zero. Weights
    /// and bodies are sorted newest first with a stable sort, so records
    /// sharing a timestamp keep their arrival order.
    #[must_use]
    pub fn finalize(self, height_cm_override: Option<u8>) -> Report {
        let Self {
            persons,
            mut weights,
            mut bodies,
        } = self;

        let height_cm = height_cm_override
            .or_else(|| persons.first().map(|p| p.height_cm))
            .unwrap_or(0);

        if !persons.is_empty() || height_cm_override.is_some() {
            for weight in &mut weights {
                weight.bmi = body_mass_index(weight.weight_kg, height_cm);
            }
        }

        weights.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        bodies.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        Report {
            persons,
            weights,
            bodies,
        }
    }
}
