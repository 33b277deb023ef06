//! [`DatarefRegistry`] – process-wide dataref name → type table and factory.
//!
//! Panels announce the datarefs they care about by registering a name with a
//! [`DatarefType`].  The first registration of a name wins; later
//! registrations of the same name are ignored, whatever type they carry.
//! Every transport then builds typed [`Dataref`] values through
//! [`DatarefRegistry::factory`], which coerces the raw wire value according to
//! the registered type.
//!
//! The registry is created once by the process wiring and shared by
//! reference (`Arc<DatarefRegistry>`) with every panel driver and the
//! exchange.  It is never torn down before process exit.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::{BridgeError, CommandPhase, Dataref, DatarefType, DatarefValue, RawValue};

/// Name → type table guarded by a mutex so that registration is an atomic
/// check-then-set from any worker.
#[derive(Debug, Default)]
pub struct DatarefRegistry {
    types: Mutex<HashMap<String, DatarefType>>,
}

impl DatarefRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` with `data_type`.
    ///
    /// Returns `true` when this call created the entry and `false` when the
    /// name was already registered (the existing type is kept).
    pub fn register(&self, name: &str, data_type: DatarefType) -> bool {
        let mut types = self.lock();
        if types.contains_key(name) {
            return false;
        }
        debug!(dataref = name, data_type = %data_type, "registered dataref");
        types.insert(name.to_string(), data_type);
        true
    }

    /// The registered type of `name`, if any.
    pub fn data_type(&self, name: &str) -> Option<DatarefType> {
        self.lock().get(name).copied()
    }

    /// Number of registered names.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Build a [`Dataref`] for `name` from a raw transport value.
    ///
    /// # Errors
    ///
    /// * [`BridgeError::UnknownDataref`] – `name` was never registered.
    /// * [`BridgeError::UnsupportedType`] – the registered type has no
    ///   constructor for this kind of raw value (e.g. a number for a command).
    /// * [`BridgeError::ProtocolParse`] – numeric coercion failed.
    pub fn factory<'a>(
        &self,
        name: &str,
        raw: impl Into<RawValue<'a>>,
    ) -> Result<Dataref, BridgeError> {
        let data_type = self
            .data_type(name)
            .ok_or_else(|| BridgeError::UnknownDataref(name.to_string()))?;
        let value = coerce(name, data_type, raw.into())?;
        Ok(Dataref::from_parts(name, data_type, value))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, DatarefType>> {
        // A panicking writer cannot leave the map half-updated.
        self.types.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn coerce(
    name: &str,
    data_type: DatarefType,
    raw: RawValue<'_>,
) -> Result<Option<DatarefValue>, BridgeError> {
    if raw == RawValue::Absent {
        return Ok(None);
    }
    let value = match data_type {
        DatarefType::Integer => DatarefValue::Integer(coerce_integer(name, raw)?),
        DatarefType::Float => DatarefValue::Float(coerce_float(name, raw)?),
        DatarefType::Command => DatarefValue::Command(coerce_command(name, raw)?),
    };
    Ok(Some(value))
}

fn coerce_integer(name: &str, raw: RawValue<'_>) -> Result<i32, BridgeError> {
    let out_of_range =
        || BridgeError::ProtocolParse(format!("value for {name} is out of integer range"));
    match raw {
        RawValue::Text(text) => text.trim().parse::<i32>().map_err(|e| {
            BridgeError::ProtocolParse(format!("'{text}' is not an integer for {name}: {e}"))
        }),
        RawValue::Integer(v) => i32::try_from(v).map_err(|_| out_of_range()),
        RawValue::Float(v) => {
            let truncated = v.trunc();
            if truncated.is_finite()
                && truncated >= f64::from(i32::MIN)
                && truncated <= f64::from(i32::MAX)
            {
                Ok(truncated as i32)
            } else {
                Err(out_of_range())
            }
        }
        RawValue::Bool(b) => Ok(i32::from(b)),
        RawValue::Command(_) | RawValue::Absent => Err(unsupported(name, DatarefType::Integer)),
    }
}

fn coerce_float(name: &str, raw: RawValue<'_>) -> Result<f32, BridgeError> {
    match raw {
        RawValue::Text(text) => text.trim().parse::<f32>().map_err(|e| {
            BridgeError::ProtocolParse(format!("'{text}' is not a real number for {name}: {e}"))
        }),
        RawValue::Integer(v) => Ok(v as f32),
        RawValue::Float(v) => Ok(v as f32),
        RawValue::Bool(b) => Ok(if b { 1.0 } else { 0.0 }),
        RawValue::Command(_) | RawValue::Absent => Err(unsupported(name, DatarefType::Float)),
    }
}

fn coerce_command(name: &str, raw: RawValue<'_>) -> Result<CommandPhase, BridgeError> {
    let phase = match raw {
        RawValue::Command(phase) => Some(phase),
        RawValue::Text(text) => CommandPhase::from_keyword(text.trim()),
        RawValue::Integer(code) => CommandPhase::from_code(code),
        RawValue::Float(_) | RawValue::Bool(_) | RawValue::Absent => None,
    };
    phase.ok_or_else(|| unsupported(name, DatarefType::Command))
}

fn unsupported(name: &str, data_type: DatarefType) -> BridgeError {
    BridgeError::UnsupportedType {
        name: name.to_string(),
        data_type: data_type.to_string(),
    }
}
