//! Numeric scalar with optional unit
//!
//! Units are validated once, at construction, so encoding, duration
//! conversion and equality never re-check them.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{HaystackError, Result, parse};

/// Legal unit characters, indexed by ASCII code. Built at compile time.
static UNIT_CHARS: [bool; 128] = build_unit_chars();

const fn build_unit_chars() -> [bool; 128] {
    let mut table = [false; 128];
    let mut c = b'a';
    while c <= b'z' {
        table[c as usize] = true;
        table[(c - b'a' + b'A') as usize] = true;
        c += 1;
    }
    table[b'_' as usize] = true;
    table[b'$' as usize] = true;
    table[b'%' as usize] = true;
    table[b'/' as usize] = true;
    table
}

#[inline]
pub(crate) fn is_unit_char(c: char) -> bool {
    (c as u32) < 128 && UNIT_CHARS[c as usize]
}

/// Return true if `unit` is absent or a non-empty run of legal unit chars.
///
/// This does not check the name against a unit database.
pub fn is_unit_name(unit: Option<&str>) -> bool {
    match unit {
        None => true,
        Some(u) => !u.is_empty() && u.chars().all(is_unit_char),
    }
}

/// Text form selector for [`Num::encode`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumFormat {
    /// `<number>[ <unit>]`
    Plain,
    /// `n:<number>[<unit>]`
    Tagged,
}

/// A 64-bit float with an optional unit name.
///
/// Equality requires identical units and treats NaN as equal to NaN.
/// Ordering ([`Num::compare`]) looks at the value only, which is why
/// `Num` has no `PartialOrd` impl.
#[derive(Debug, Clone)]
pub struct Num {
    val: f64,
    unit: Option<Arc<str>>,
}

impl Num {
    pub const ZERO: Num = Num {
        val: 0.0,
        unit: None,
    };
    pub const POS_INF: Num = Num {
        val: f64::INFINITY,
        unit: None,
    };
    pub const NEG_INF: Num = Num {
        val: f64::NEG_INFINITY,
        unit: None,
    };
    pub const NAN: Num = Num {
        val: f64::NAN,
        unit: None,
    };

    /// Construct a unitless number, returning the shared constant for
    /// zero, infinities and NaN.
    pub fn new(val: f64) -> Num {
        if val == 0.0 {
            Num::ZERO
        } else if val.is_nan() {
            Num::NAN
        } else if val == f64::INFINITY {
            Num::POS_INF
        } else if val == f64::NEG_INFINITY {
            Num::NEG_INF
        } else {
            Num { val, unit: None }
        }
    }

    /// Construct a number with a unit
    pub fn with_unit(val: f64, unit: &str) -> Result<Num> {
        Self::make(val, Some(unit))
    }

    /// Construct from a value and optional unit.
    ///
    /// Fails with [`HaystackError::InvalidUnit`] when the unit is empty or
    /// contains a character outside `A-Z a-z _ $ % /`.
    pub fn make(val: f64, unit: Option<&str>) -> Result<Num> {
        match unit {
            None => Ok(Num::new(val)),
            Some(u) if is_unit_name(Some(u)) => Ok(Num {
                // one NaN bit pattern keeps hashing consistent
                val: if val.is_nan() { f64::NAN } else { val },
                unit: Some(Arc::from(u)),
            }),
            Some(u) => Err(HaystackError::InvalidUnit(u.to_string())),
        }
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn unit(&self) -> Option<&str> {
        self.unit.as_deref()
    }

    /// Order by numeric value only. NaN sorts after every number and
    /// compares equal to NaN.
    pub fn compare(&self, other: &Num) -> Ordering {
        self.val
            .partial_cmp(&other.val)
            .unwrap_or_else(|| self.val.is_nan().cmp(&other.val.is_nan()))
    }

    /// Encode in the requested text form
    pub fn encode(&self, format: NumFormat) -> String {
        let mut out = String::with_capacity(16);
        if format == NumFormat::Tagged {
            out.push_str("n:");
        }
        self.write_text(&mut out, format == NumFormat::Plain);
        out
    }

    /// Plain form: `72.5 kW`
    pub fn to_zinc(&self) -> String {
        self.encode(NumFormat::Plain)
    }

    /// Tagged form used in JSON documents: `n:72.5kW`
    pub fn to_json(&self) -> String {
        self.encode(NumFormat::Tagged)
    }

    fn write_text(&self, out: &mut String, space_before_unit: bool) {
        if self.val == f64::INFINITY {
            out.push_str("INF");
        } else if self.val == f64::NEG_INFINITY {
            out.push_str("-INF");
        } else if self.val.is_nan() {
            out.push_str("NaN");
        } else {
            out.push_str(&format_decimal(self.val));
            if let Some(unit) = &self.unit {
                if space_before_unit {
                    out.push(' ');
                }
                out.push_str(unit);
            }
        }
    }

    /// Decode the tagged form (`n:72.5kW`)
    pub fn from_tagged(s: &str) -> Result<Num> {
        parse::parse_tagged_num(s)
    }

    /// Interpret the unit as a time unit and convert to milliseconds.
    ///
    /// Accepts `ms`/`millisecond`, `s`/`sec`, `min`/`minute` and `h`/`hr`;
    /// anything else, including no unit, is [`HaystackError::NotDuration`].
    pub fn as_duration_millis(&self) -> Result<i64> {
        let factor = match self.unit.as_deref().map(str::trim) {
            Some("ms" | "millisecond") => 1.0,
            Some("s" | "sec") => 1_000.0,
            Some("min" | "minute") => 60_000.0,
            Some("h" | "hr") => 3_600_000.0,
            _ => return Err(HaystackError::NotDuration(self.unit().map(String::from))),
        };
        Ok((self.val * factor) as i64)
    }

    /// Duration view of this number; negative values clamp to zero
    pub fn as_duration(&self) -> Result<Duration> {
        let millis = self.as_duration_millis()?;
        Ok(Duration::from_millis(millis.max(0) as u64))
    }

    /// Express a duration in the coarsest of `hr`, `min`, `s`, `ms` that
    /// represents it exactly (sub-millisecond precision is dropped)
    pub fn from_duration(d: Duration) -> Num {
        let millis = d.as_millis() as f64;
        let (val, unit) = if millis % 3_600_000.0 == 0.0 && millis > 0.0 {
            (millis / 3_600_000.0, "hr")
        } else if millis % 60_000.0 == 0.0 && millis > 0.0 {
            (millis / 60_000.0, "min")
        } else if millis % 1_000.0 == 0.0 {
            (millis / 1_000.0, "s")
        } else {
            (millis, "ms")
        };
        Num {
            val,
            unit: Some(Arc::from(unit)),
        }
    }

    /// Bits used for hashing: every NaN and both zeros collapse so equal
    /// values hash alike.
    fn hash_bits(&self) -> u64 {
        if self.val.is_nan() {
            f64::NAN.to_bits()
        } else if self.val == 0.0 {
            0
        } else {
            self.val.to_bits()
        }
    }
}

/// Invariant decimal point, at most 4 fractional digits, no trailing zeros
fn format_decimal(val: f64) -> String {
    let mut s = format!("{val:.4}");
    if s.contains('.') {
        let trimmed = s.trim_end_matches('0').trim_end_matches('.').len();
        s.truncate(trimmed);
    }
    if s == "-0" {
        s.remove(0);
    }
    s
}

impl PartialEq for Num {
    fn eq(&self, other: &Self) -> bool {
        let same_val = if self.val.is_nan() {
            other.val.is_nan()
        } else {
            self.val == other.val
        };
        same_val && self.unit == other.unit
    }
}

impl Eq for Num {}

impl Hash for Num {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.hash_bits());
        self.unit.hash(state);
    }
}

impl fmt::Display for Num {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_zinc())
    }
}

impl FromStr for Num {
    type Err = HaystackError;

    /// Decode the plain form (`72.5 kW`)
    fn from_str(s: &str) -> Result<Num> {
        parse::parse_num(s)
    }
}

impl From<f64> for Num {
    fn from(val: f64) -> Self {
        Num::new(val)
    }
}

impl From<i64> for Num {
    fn from(val: i64) -> Self {
        Num::new(val as f64)
    }
}

impl From<i32> for Num {
    fn from(val: i32) -> Self {
        Num::new(val as f64)
    }
}

impl Serialize for Num {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_json())
    }
}

impl<'de> Deserialize<'de> for Num {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct NumVisitor;

        impl Visitor<'_> for NumVisitor {
            type Value = Num;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a number or an \"n:\" tagged string")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Num, E> {
                Num::from_tagged(v).map_err(E::custom)
            }

            fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<Num, E> {
                Ok(Num::new(v))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<Num, E> {
                Ok(Num::from(v))
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<Num, E> {
                Ok(Num::new(v as f64))
            }
        }

        deserializer.deserialize_any(NumVisitor)
    }
}
