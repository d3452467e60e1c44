//! Instrumentation variables and the decoder seam.
//!
//! A decoder turns an attached buffer into a view that can be sampled
//! repeatedly; each sample yields the variables currently published, keyed
//! by name. Change detection only looks at the key set.

pub mod decoder;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::Serialize;

use vw_common::{InstanceId, Result};

use crate::attach::AttachedBuffer;

pub use decoder::PerfDataDecoder;

/// Unit of a variable's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Units {
    None,
    Bytes,
    Ticks,
    Events,
    String,
    Hertz,
}

impl Units {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Units::None),
            2 => Some(Units::Bytes),
            3 => Some(Units::Ticks),
            4 => Some(Units::Events),
            5 => Some(Units::String),
            6 => Some(Units::Hertz),
            _ => None,
        }
    }
}

/// How a variable's value may change over time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Variability {
    Constant,
    Monotonic,
    Variable,
}

impl Variability {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Variability::Constant),
            2 => Some(Variability::Monotonic),
            3 => Some(Variability::Variable),
            _ => None,
        }
    }
}

/// Storage type of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    Long,
    ByteArray,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum VariableValue {
    Long(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// One named variable read from an instrumentation region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VariableHandle {
    pub name: String,
    pub kind: VariableKind,
    pub units: Units,
    pub variability: Variability,
    pub value: VariableValue,
}

impl VariableHandle {
    /// A constant text variable, handy for fixtures and stubs.
    pub fn text(name: impl Into<String>, value: impl Into<String>) -> Self {
        VariableHandle {
            name: name.into(),
            kind: VariableKind::ByteArray,
            units: Units::String,
            variability: Variability::Constant,
            value: VariableValue::Text(value.into()),
        }
    }

    /// A variable long counter.
    pub fn long(name: impl Into<String>, value: i64) -> Self {
        VariableHandle {
            name: name.into(),
            kind: VariableKind::Long,
            units: Units::Events,
            variability: Variability::Variable,
            value: VariableValue::Long(value),
        }
    }
}

/// Decoded state of a buffer at one tick.
pub type VariableSnapshot = BTreeMap<String, VariableHandle>;

/// A decoded, re-sampleable view of one instance.
pub trait InstrumentationView: Send {
    fn snapshot(&self) -> Result<VariableSnapshot>;

    fn current_keys(&self) -> Result<BTreeSet<String>> {
        Ok(self.snapshot()?.into_keys().collect())
    }
}

/// Turns an attached buffer into an instrumentation view.
pub trait Decoder: Send + Sync {
    fn decode(
        &self,
        buffer: Arc<AttachedBuffer>,
        id: InstanceId,
    ) -> Result<Box<dyn InstrumentationView>>;
}
