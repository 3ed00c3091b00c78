//! The `Measurement` value type: an exact-decimal quantity tagged with a
//! physical base unit and a power-of-ten exponent.
//!
//! `value = quantity x 10^exponent baseUnit`. Two measurements are equal when
//! their base units match and their normalised values match, regardless of
//! how the quantity/exponent pair happens to be split. Arithmetic never
//! silently rescales base units: addition of mismatched units is a checked
//! operation that returns [`crate::error::SymphonyError::UnitMismatch`].

pub mod registry;

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::error::{SymphonyError, SymphonyResult};

#[derive(Debug)]
struct MeasurementInner {
    quantity: Decimal,
    base_unit: Arc<str>,
    exponent: i32,
}

/// A physical quantity: `quantity x 10^exponent baseUnit`.
///
/// Cheaply cloneable (`Arc` handle) so that acquisition streams, which
/// produce millions of samples, don't pay a per-sample allocation once a
/// value has been interned through [`registry::UnitRegistry::intern`].
#[derive(Debug, Clone)]
pub struct Measurement(Arc<MeasurementInner>);

fn pow10(exponent: i32) -> Decimal {
    let mut d = Decimal::ONE;
    if exponent >= 0 {
        for _ in 0..exponent {
            d *= Decimal::TEN;
        }
    } else {
        for _ in 0..(-exponent) {
            d /= Decimal::TEN;
        }
    }
    d
}

impl Measurement {
    /// Construct a new (non-pooled) measurement. Prefer
    /// [`registry::UnitRegistry::intern`] on hot paths.
    pub fn new(quantity: Decimal, base_unit: impl Into<Arc<str>>, exponent: i32) -> Self {
        Self(Arc::new(MeasurementInner {
            quantity,
            base_unit: base_unit.into(),
            exponent,
        }))
    }

    /// Convenience constructor for an exponent-0 value, e.g. `Measurement::of(8.0, "V")`.
    pub fn of(quantity: f64, base_unit: impl Into<Arc<str>>) -> Self {
        Self::new(Decimal::try_from(quantity).unwrap_or_default(), base_unit, 0)
    }

    /// The raw quantity component (before the `10^exponent` scale factor).
    pub fn quantity(&self) -> Decimal {
        self.0.quantity
    }

    /// The power-of-ten exponent.
    pub fn exponent(&self) -> i32 {
        self.0.exponent
    }

    /// Physical base unit, e.g. `"V"`, `"Hz"`, `"AI_COUNTS"`.
    pub fn base_unit(&self) -> &str {
        &self.0.base_unit
    }

    /// Normalised value: `quantity x 10^exponent`.
    pub fn value(&self) -> Decimal {
        self.0.quantity * pow10(self.0.exponent)
    }

    /// `value()` as `f64`, for interop with drivers/plotting that want floats.
    pub fn to_f64(&self) -> f64 {
        self.value().try_into().unwrap_or(f64::NAN)
    }

    /// Add two measurements of the same base unit. Fails loudly
    /// (`UnitMismatch`) rather than silently rescaling.
    pub fn checked_add(&self, other: &Measurement) -> SymphonyResult<Measurement> {
        if self.base_unit() != other.base_unit() {
            return Err(SymphonyError::UnitMismatch {
                expected: self.base_unit().to_string(),
                actual: other.base_unit().to_string(),
            });
        }
        Ok(Measurement::new(self.value() + other.value(), self.base_unit().to_string(), 0))
    }

    /// Scalar multiplication; preserves the base unit.
    pub fn scale(&self, factor: Decimal) -> Measurement {
        Measurement::new(self.0.quantity * factor, self.0.base_unit.clone(), self.0.exponent)
    }
}

impl PartialEq for Measurement {
    fn eq(&self, other: &Self) -> bool {
        self.base_unit() == other.base_unit() && self.value() == other.value()
    }
}

impl Eq for Measurement {}

impl std::fmt::Display for Measurement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.value(), self.base_unit())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_normalised_value() {
        let a = Measurement::new(Decimal::new(8, 0), "V", 0);
        let b = Measurement::new(Decimal::new(800, 0), "V", -2);
        assert_eq!(a, b);
    }

    #[test]
    fn different_base_units_never_compare_equal() {
        let a = Measurement::of(8.0, "V");
        let b = Measurement::of(8.0, "A");
        assert_ne!(a, b);
    }

    #[test]
    fn addition_requires_identical_base_unit() {
        let v = Measurement::of(1.0, "V");
        let a = Measurement::of(1.0, "A");
        assert!(v.checked_add(&a).is_err());
        let sum = v.checked_add(&Measurement::of(2.0, "V")).unwrap();
        assert_eq!(sum.value(), Decimal::new(3, 0));
    }

    #[test]
    fn scale_preserves_unit() {
        let v = Measurement::of(2.0, "V");
        let scaled = v.scale(Decimal::new(5, 1)); // x0.5
        assert_eq!(scaled.base_unit(), "V");
        assert_eq!(scaled.value(), Decimal::new(1, 0));
    }
}
