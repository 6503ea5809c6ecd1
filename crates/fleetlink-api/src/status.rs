//! Device fault flags

use std::fmt;

bitflags::bitflags! {
    /// Set of fault conditions a machine reports at the same time.
    ///
    /// The empty set means the machine is nominal.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct StatusBitmask: u32 {
        /// Emergency stop engaged
        const EMERGENCY_STOP = 1;
        /// Power supply failure
        const POWER_FAILURE = 1 << 1;
        /// Sensor failure
        const SENSOR_FAILURE = 1 << 2;
        /// Unclassified fault
        const UNKNOWN = 1 << 3;
    }
}

/// Fault names as they appear in twin properties, in bit order.
const FAULT_NAMES: [(StatusBitmask, &str); 4] = [
    (StatusBitmask::EMERGENCY_STOP, "EmergencyStop"),
    (StatusBitmask::POWER_FAILURE, "PowerFailure"),
    (StatusBitmask::SENSOR_FAILURE, "SensorFailure"),
    (StatusBitmask::UNKNOWN, "Unknown"),
];

impl StatusBitmask {
    /// Build a status from a raw device value, dropping bits outside the
    /// known fault set. Negative values carry no known fault.
    #[must_use]
    pub fn from_raw(raw: i64) -> Self {
        u32::try_from(raw)
            .map(Self::from_bits_truncate)
            .unwrap_or_default()
    }

    /// Whether a raw device value carries bits outside the known fault set
    #[must_use]
    pub fn has_foreign_bits(raw: i64) -> bool {
        match u32::try_from(raw) {
            Ok(bits) => Self::from_bits(bits).is_none(),
            Err(_) => true,
        }
    }

    /// Look up a single fault by its twin name
    #[must_use]
    pub fn from_fault_name(name: &str) -> Option<Self> {
        FAULT_NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(flag, _)| *flag)
    }

    /// Parse a list of fault names, ignoring names that are not known faults
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        names
            .into_iter()
            .filter_map(|name| Self::from_fault_name(name.as_ref()))
            .fold(Self::empty(), |acc, flag| acc | flag)
    }

    /// Names of the set faults, in bit order
    #[must_use]
    pub fn fault_names(self) -> Vec<&'static str> {
        FAULT_NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect()
    }

    /// Owned variant of [`StatusBitmask::fault_names`] for twin properties
    #[must_use]
    pub fn to_names(self) -> Vec<String> {
        self.fault_names().into_iter().map(str::to_string).collect()
    }

    /// Bits set in `self` that were not set in `previous`
    #[must_use]
    pub fn newly_set(self, previous: Self) -> Self {
        self & !previous
    }

    /// No fault is active
    #[must_use]
    pub fn is_nominal(self) -> bool {
        self.is_empty()
    }
}

impl fmt::Display for StatusBitmask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_nominal() {
            return f.write_str("None");
        }
        f.write_str(&self.fault_names().join(", "))
    }
}
