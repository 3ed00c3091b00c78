//! Process-wide unit-conversion registry and the `Measurement` interning pool.
//!
//! Lookup is keyed on the exact `(fromUnit, toUnit)` string pair; there is no
//! transitive search. A single [`UnitRegistry`] instance is constructed at
//! startup and shared (via `Arc`) across every `Stream`/`ExternalDevice` that
//! needs conversions or interning — "process-wide" describes how the crate
//! uses it, not a hidden global.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;

use super::Measurement;
use crate::error::{SymphonyError, SymphonyResult};

type ConverterFn = Arc<dyn Fn(&Measurement) -> Measurement + Send + Sync>;

#[derive(Hash, PartialEq, Eq, Clone)]
struct InternKey {
    quantity: Decimal,
    base_unit: Arc<str>,
    exponent: i32,
}

/// Registered unit converters plus the `Measurement` interning pool.
///
/// Acquisition produces millions of structurally-identical measurements
/// (zero-voltage background fill, recurring preload blocks); `intern` pools
/// them so the hot path is a single shared allocation plus an `Arc::clone`.
pub struct UnitRegistry {
    converters: RwLock<HashMap<(String, String), ConverterFn>>,
    pool: RwLock<HashMap<InternKey, Measurement>>,
}

impl Default for UnitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl UnitRegistry {
    /// Construct an empty registry with no converters registered.
    pub fn new() -> Self {
        Self {
            converters: RwLock::new(HashMap::new()),
            pool: RwLock::new(HashMap::new()),
        }
    }

    /// Register a conversion function for the exact `(from, to)` pair.
    /// Overwrites any previously registered converter for that pair.
    pub fn register(
        &self,
        from: impl Into<String>,
        to: impl Into<String>,
        f: impl Fn(&Measurement) -> Measurement + Send + Sync + 'static,
    ) {
        let mut converters = self.converters.write().unwrap_or_else(|e| e.into_inner());
        converters.insert((from.into(), to.into()), Arc::new(f));
    }

    /// Register a simple linear scale converter: `to = from x factor`, and
    /// its exact inverse, so that round-tripping through both directions is
    /// the identity -- conversion is injective on its domain.
    pub fn register_linear(&self, from: impl Into<String>, to: impl Into<String>, factor: Decimal) {
        let from = from.into();
        let to = to.into();
        let to_unit = to.clone();
        self.register(from.clone(), to.clone(), move |m| m.scale(factor).with_base_unit(to_unit.clone()));
        let from_unit = from.clone();
        self.register(to, from, move |m| m.scale(Decimal::ONE / factor).with_base_unit(from_unit.clone()));
    }

    /// Convert `m` to `target_unit`. Idempotent when `target_unit` already
    /// equals `m.base_unit()`.
    pub fn convert(&self, m: &Measurement, target_unit: &str) -> SymphonyResult<Measurement> {
        if m.base_unit() == target_unit {
            return Ok(m.clone());
        }
        let converters = self.converters.read().unwrap_or_else(|e| e.into_inner());
        if let Some(f) = converters.get(&(m.base_unit().to_string(), target_unit.to_string())) {
            return Ok(f(m));
        }
        let registered_from = converters
            .keys()
            .find(|(_, to)| to == target_unit)
            .map(|(from, _)| from.clone());
        drop(converters);
        match registered_from {
            Some(expected) => Err(SymphonyError::UnitMismatch {
                expected,
                actual: m.base_unit().to_string(),
            }),
            None => Err(SymphonyError::NoConverter {
                from: m.base_unit().to_string(),
                to: target_unit.to_string(),
            }),
        }
    }

    /// Return a pooled `Measurement`, allocating only on first use of a
    /// given `(quantity, baseUnit, exponent)` tuple.
    pub fn intern(&self, quantity: Decimal, base_unit: impl Into<Arc<str>>, exponent: i32) -> Measurement {
        let base_unit = base_unit.into();
        let key = InternKey {
            quantity,
            base_unit: base_unit.clone(),
            exponent,
        };
        if let Some(existing) = self.pool.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return existing.clone();
        }
        let mut pool = self.pool.write().unwrap_or_else(|e| e.into_inner());
        pool.entry(key)
            .or_insert_with(|| Measurement::new(quantity, base_unit, exponent))
            .clone()
    }

    /// Number of distinct values currently pooled (diagnostic / test hook).
    pub fn pool_len(&self) -> usize {
        self.pool.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Measurement {
    /// Internal helper used by `register_linear`: rebuild with a new base
    /// unit after a scale, since `scale` alone preserves the original unit.
    fn with_base_unit(&self, base_unit: impl Into<Arc<str>>) -> Measurement {
        Measurement::new(self.quantity(), base_unit, self.exponent())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unregistered_pair_fails_with_no_converter() {
        let registry = UnitRegistry::new();
        let m = Measurement::of(1.0, "V");
        let err = registry.convert(&m, "A").unwrap_err();
        assert!(matches!(err, SymphonyError::NoConverter { .. }));
    }

    #[test]
    fn wrong_source_unit_fails_with_unit_mismatch() {
        let registry = UnitRegistry::new();
        registry.register_linear("AI_COUNTS", "V", Decimal::new(1, 4)); // 1 count = 0.0001 V
        let m = Measurement::of(1.0, "A");
        let err = registry.convert(&m, "V").unwrap_err();
        match err {
            SymphonyError::UnitMismatch { expected, actual } => {
                assert_eq!(expected, "AI_COUNTS");
                assert_eq!(actual, "A");
            }
            other => panic!("expected UnitMismatch, got {other:?}"),
        }
    }

    #[test]
    fn convert_is_idempotent_when_target_equals_current() {
        let registry = UnitRegistry::new();
        let m = Measurement::of(3.3, "V");
        let converted = registry.convert(&m, "V").unwrap();
        assert_eq!(converted, m);
    }

    #[test]
    fn round_trip_through_inverse_pair_is_identity() {
        let registry = UnitRegistry::new();
        registry.register_linear("AI_COUNTS", "V", Decimal::new(3125, 7)); // 1 count = 3.125e-4 V
        let original = Measurement::of(1000.0, "AI_COUNTS");
        let volts = registry.convert(&original, "V").unwrap();
        let back = registry.convert(&volts, "AI_COUNTS").unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn interning_pools_structurally_identical_values() {
        let registry = UnitRegistry::new();
        let a = registry.intern(Decimal::ZERO, "V", 0);
        let b = registry.intern(Decimal::ZERO, "V", 0);
        assert_eq!(registry.pool_len(), 1);
        assert_eq!(a, b);
    }
}
