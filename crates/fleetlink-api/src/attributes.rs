//! Device attribute values read over the field-bus

use std::fmt;

use serde::{Deserialize, Serialize};

/// Attribute names exposed by every production device
pub mod names {
    pub const PRODUCTION_STATUS: &str = "ProductionStatus";
    pub const PRODUCTION_RATE: &str = "ProductionRate";
    pub const WORKORDER_ID: &str = "WorkorderId";
    pub const TEMPERATURE: &str = "Temperature";
    pub const GOOD_COUNT: &str = "GoodCount";
    pub const BAD_COUNT: &str = "BadCount";
    pub const DEVICE_ERROR: &str = "DeviceError";

    /// Read order of a full device poll
    pub const POLL_ORDER: [&str; 7] = [
        PRODUCTION_STATUS,
        PRODUCTION_RATE,
        WORKORDER_ID,
        TEMPERATURE,
        GOOD_COUNT,
        BAD_COUNT,
        DEVICE_ERROR,
    ];
}

/// Value of a single device attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl AttributeValue {
    /// Integer view; floats are accepted when they carry no fraction
    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Int(v) => Some(*v),
            AttributeValue::Bool(b) => Some(i64::from(*b)),
            #[allow(clippy::cast_possible_truncation)]
            AttributeValue::Float(v) if v.fract() == 0.0 && v.is_finite() => Some(*v as i64),
            _ => None,
        }
    }

    /// Floating point view
    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Float(v) => Some(*v),
            #[allow(clippy::cast_precision_loss)]
            AttributeValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// Text view
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(v) => write!(f, "{v}"),
            AttributeValue::Int(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Text(v) => f.write_str(v),
        }
    }
}

impl From<i64> for AttributeValue {
    fn from(v: i64) -> Self {
        AttributeValue::Int(v)
    }
}

impl From<f64> for AttributeValue {
    fn from(v: f64) -> Self {
        AttributeValue::Float(v)
    }
}

impl From<bool> for AttributeValue {
    fn from(v: bool) -> Self {
        AttributeValue::Bool(v)
    }
}

impl From<&str> for AttributeValue {
    fn from(v: &str) -> Self {
        AttributeValue::Text(v.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(v: String) -> Self {
        AttributeValue::Text(v)
    }
}

/// Display name and value of one attribute
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    pub value: AttributeValue,
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<AttributeValue>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_views() {
        assert_eq!(AttributeValue::Float(12.0).as_i64(), Some(12));
        assert_eq!(AttributeValue::Float(12.5).as_i64(), None);
        assert_eq!(AttributeValue::Int(7).as_f64(), Some(7.0));
        assert_eq!(AttributeValue::from("x").as_i64(), None);
    }

    #[test]
    fn test_untagged_deserialize() {
        let values: Vec<AttributeValue> =
            serde_json::from_str(r#"[1, 2.5, "wo-1", true]"#).unwrap();
        assert_eq!(
            values,
            vec![
                AttributeValue::Int(1),
                AttributeValue::Float(2.5),
                AttributeValue::Text("wo-1".to_string()),
                AttributeValue::Bool(true),
            ]
        );
    }
}
