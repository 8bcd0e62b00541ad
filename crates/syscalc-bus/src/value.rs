//! ---
//! ems_section: "02-messaging-ipc-data-model"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Bus data model and client boundary."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;

use serde::{Deserialize, Serialize};

/// A single item value as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BusValue {
    Int(i64),
    Float(f64),
    Text(String),
    Bytes(Vec<u8>),
}

impl BusValue {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            BusValue::Int(v) => Some(*v as f64),
            BusValue::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer view; floats qualify only when they carry no fraction.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            BusValue::Int(v) => Some(*v),
            BusValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            BusValue::Text(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BusValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

impl fmt::Display for BusValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusValue::Int(v) => write!(f, "{}", v),
            BusValue::Float(v) => write!(f, "{}", v),
            BusValue::Text(v) => write!(f, "{}", v),
            BusValue::Bytes(v) => write!(f, "{:02x?}", v),
        }
    }
}

impl From<i64> for BusValue {
    fn from(value: i64) -> Self {
        BusValue::Int(value)
    }
}

impl From<i32> for BusValue {
    fn from(value: i32) -> Self {
        BusValue::Int(i64::from(value))
    }
}

impl From<u32> for BusValue {
    fn from(value: u32) -> Self {
        BusValue::Int(i64::from(value))
    }
}

impl From<bool> for BusValue {
    fn from(value: bool) -> Self {
        BusValue::Int(i64::from(value))
    }
}

impl From<f64> for BusValue {
    fn from(value: f64) -> Self {
        BusValue::Float(value)
    }
}

impl From<&str> for BusValue {
    fn from(value: &str) -> Self {
        BusValue::Text(value.to_owned())
    }
}

impl From<String> for BusValue {
    fn from(value: String) -> Self {
        BusValue::Text(value)
    }
}

impl From<Vec<u8>> for BusValue {
    fn from(value: Vec<u8>) -> Self {
        BusValue::Bytes(value)
    }
}
