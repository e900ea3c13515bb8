//! Wire format of the scale's GATT characteristics.
//!
//! The scale pushes three kinds of fixed-layout indications (person, weight,
//! body) and accepts a single time-sync command. All multi-byte fields are
//! little-endian.
//!
//! ```text
//! person  (9)  : magic 0x84 | pad | person | pad | gender | age | height | pad | activity
//! weight  (14) : magic 0x1D | weight u16 | pad 2 | timestamp u32 | pad 4 | person
//! body    (16) : magic 0x6F | timestamp u32 | person | kcal u16 | fat u16 | tbw u16 | muscle u16 | bone u16
//! command (5)  : 0x02 | epoch - offset as u32
//! ```

use thiserror::Error;
use uuid::Uuid;

use crate::types::{ActivityLevel, BodyRecord, Gender, Measurement, PersonRecord, WeightRecord};

/// Person characteristic UUID.
pub const PERSON_UUID: Uuid = Uuid::from_u128(0x0000_8a82_0000_1000_8000_0080_5f9b_34fb);
/// Weight characteristic UUID.
pub const WEIGHT_UUID: Uuid = Uuid::from_u128(0x0000_8a21_0000_1000_8000_0080_5f9b_34fb);
/// Body-composition characteristic UUID.
pub const BODY_UUID: Uuid = Uuid::from_u128(0x0000_8a22_0000_1000_8000_0080_5f9b_34fb);
/// Command characteristic UUID.
pub const COMMAND_UUID: Uuid = Uuid::from_u128(0x0000_8a81_0000_1000_8000_0080_5f9b_34fb);

/// Length of a person payload.
pub const PERSON_LEN: usize = 9;
/// Length of a weight payload.
pub const WEIGHT_LEN: usize = 14;
/// Length of a body payload.
pub const BODY_LEN: usize = 16;

const PERSON_MAGIC: u8 = 0x84;
const WEIGHT_MAGIC: u8 = 0x1d;
const BODY_MAGIC: u8 = 0x6f;

/// Opcode of the time-sync command.
pub const TIME_SYNC_OPCODE: u8 = 0x02;

/// Only the low 12 bits of a composition field carry the value.
const COMPOSITION_MASK: u16 = 0x0fff;

/// Upper bound used by [`normalize_timestamp`].
pub const TIMESTAMP_LIMIT: u64 = i64::MAX as u64;

/// Errors produced while decoding a payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// The payload is shorter than the characteristic's layout.
    #[error("malformed {kind} payload: expected at least {expected} bytes, got {actual}")]
    MalformedPayload {
        /// Characteristic the payload came from.
        kind: CharacteristicKind,
        /// Required layout length.
        expected: usize,
        /// Received length.
        actual: usize,
    },

    /// The characteristic does not carry measurements.
    #[error("{0} characteristic carries no measurements")]
    NotAMeasurement(CharacteristicKind),
}

/// The four characteristics the scale exposes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicKind {
    /// User profile indications.
    Person,
    /// Weighing indications.
    Weight,
    /// Body-composition indications.
    Body,
    /// Command register (write only).
    Command,
}

impl CharacteristicKind {
    /// All kinds in handle-resolution order.
    pub const ALL: [Self; 4] = [Self::Person, Self::Weight, Self::Body, Self::Command];

    /// The GATT UUID of this characteristic.
    #[must_use]
    pub const fn uuid(self) -> Uuid {
        match self {
            Self::Person => PERSON_UUID,
            Self::Weight => WEIGHT_UUID,
            Self::Body => BODY_UUID,
            Self::Command => COMMAND_UUID,
        }
    }
}

impl std::fmt::Display for CharacteristicKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Person => "person",
            Self::Weight => "weight",
            Self::Body => "body",
            Self::Command => "command",
        };
        f.write_str(name)
    }
}

/// Result type for codec operations.
pub type CodecResult<T> = std::result::Result<T, CodecError>;

fn check_len(kind: CharacteristicKind, buf: &[u8], expected: usize) -> CodecResult<()> {
    if buf.len() < expected {
        return Err(CodecError::MalformedPayload {
            kind,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn le_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn le_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

fn composition(raw: u16) -> f64 {
    f64::from(raw & COMPOSITION_MASK) / 10.0
}

/// Shift a device timestamp by the model's epoch offset.
///
/// The sum is used unless it would reach [`TIMESTAMP_LIMIT`] (or go
/// negative), in which case the unshifted value is kept. A raw value at or
/// above the limit yields `0`.
///
/// This clamp guards against corrupt timestamps rather than converting
/// between epochs. A `u32` from the wire can never reach the limit, so the
/// zero branch is effectively unreachable from [`decode_weight`] and
/// [`decode_body`]; it is kept so the normalization stays total.
#[must_use]
pub fn normalize_timestamp(raw: u64, offset_secs: i64) -> u64 {
    if raw >= TIMESTAMP_LIMIT {
        return 0;
    }
    match raw.checked_add_signed(offset_secs) {
        Some(shifted) if shifted < TIMESTAMP_LIMIT => shifted,
        _ => raw,
    }
}

/// Decode a person payload.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] if `buf` is shorter than 9 bytes.
pub fn decode_person(buf: &[u8]) -> CodecResult<PersonRecord> {
    check_len(CharacteristicKind::Person, buf, PERSON_LEN)?;
    Ok(PersonRecord {
        valid: buf[0] == PERSON_MAGIC,
        person_index: buf[2],
        gender: if buf[4] == 1 {
            Gender::Male
        } else {
            Gender::Female
        },
        age: buf[5],
        height_cm: buf[6],
        activity: if buf[8] == 3 {
            ActivityLevel::High
        } else {
            ActivityLevel::Normal
        },
    })
}

/// Decode a weight payload.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] if `buf` is shorter than 14 bytes.
pub fn decode_weight(buf: &[u8], offset_secs: i64) -> CodecResult<WeightRecord> {
    check_len(CharacteristicKind::Weight, buf, WEIGHT_LEN)?;
    Ok(WeightRecord {
        valid: buf[0] == WEIGHT_MAGIC,
        weight_kg: f64::from(le_u16(buf, 1)) / 100.0,
        timestamp: normalize_timestamp(u64::from(le_u32(buf, 5)), offset_secs),
        person_index: buf[13],
        bmi: 0.0,
    })
}

/// Decode a body-composition payload.
///
/// # Errors
///
/// Returns [`CodecError::MalformedPayload`] if `buf` is shorter than 16 bytes.
pub fn decode_body(buf: &[u8], offset_secs: i64) -> CodecResult<BodyRecord> {
    check_len(CharacteristicKind::Body, buf, BODY_LEN)?;
    Ok(BodyRecord {
        valid: buf[0] == BODY_MAGIC,
        timestamp: normalize_timestamp(u64::from(le_u32(buf, 1)), offset_secs),
        person_index: buf[5],
        kcal: le_u16(buf, 6),
        fat_pct: composition(le_u16(buf, 8)),
        tbw_pct: composition(le_u16(buf, 10)),
        muscle_pct: composition(le_u16(buf, 12)),
        bone_pct: composition(le_u16(buf, 14)),
    })
}

/// Decode an indication according to the characteristic that produced it.
///
/// # Errors
///
/// Returns [`CodecError::NotAMeasurement`] for the command characteristic and
/// [`CodecError::MalformedPayload`] for short payloads.
pub fn decode(kind: CharacteristicKind, buf: &[u8], offset_secs: i64) -> CodecResult<Measurement> {
    match kind {
        CharacteristicKind::Person => decode_person(buf).map(Measurement::Person),
        CharacteristicKind::Weight => decode_weight(buf, offset_secs).map(Measurement::Weight),
        CharacteristicKind::Body => decode_body(buf, offset_secs).map(Measurement::Body),
        CharacteristicKind::Command => Err(CodecError::NotAMeasurement(kind)),
    }
}

/// Build the time-sync command for the given wall-clock time.
///
/// The device clock value is `epoch_secs - offset_secs`, saturated into the
/// `u32` range.
#[must_use]
pub fn encode_time_sync(epoch_secs: i64, offset_secs: i64) -> [u8; 5] {
    let device_secs = epoch_secs.saturating_sub(offset_secs);
    let device_secs = u32::try_from(device_secs.max(0)).unwrap_or(u32::MAX);
    let [a, b, c, d] = device_secs.to_le_bytes();
    [TIME_SYNC_OPCODE, a, b, c, d]
}
