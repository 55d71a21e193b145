//! Opaque packet payload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An encoded packet as handed over by the hosting socket framework.
///
/// The bus never inspects the payload; it is carried losslessly through the
/// stream and handed back to the host's send primitive on the far side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet(pub Value);

impl Packet {
    /// Borrow the raw payload.
    #[must_use]
    pub fn payload(&self) -> &Value {
        &self.0
    }
}

impl From<Value> for Packet {
    fn from(value: Value) -> Self {
        Packet(value)
    }
}
