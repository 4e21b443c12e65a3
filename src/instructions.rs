use log::warn;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{AgentError, Result};

pub const SUCCESS_STATUS: &str = "0";
pub const ERROR_STATUS: &str = "1";
pub const TIMEOUT_STATUS: &str = "124";
pub const SUCCESS_PID: &str = "0";
pub const ERROR_PID: &str = "1";

/// One unit of work handed down by the C2.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Instruction {
    pub id: Value,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub executor: String,
    #[serde(default)]
    pub timeout: u64,
    #[serde(default)]
    pub payloads: Vec<String>,
    #[serde(default)]
    pub sleep: u64,
    #[serde(default)]
    pub deadman: bool,
}

/// Parsed beacon response. `instructions` stays encoded here; the server
/// nests a JSON document inside the outer JSON body.
#[derive(Debug, Clone, Deserialize)]
pub struct Beacon {
    #[serde(default)]
    pub paw: String,
    #[serde(default)]
    pub sleep: u64,
    #[serde(default)]
    pub watchdog: i64,
    #[serde(default)]
    pub instructions: String,
    #[serde(default)]
    pub new_contact: Option<String>,
}

impl Beacon {
    pub fn parse(raw: &[u8]) -> Result<Self> {
        serde_json::from_slice(raw).map_err(|e| AgentError::MalformedBeacon(e.to_string()))
    }

    /// Decodes the nested instruction list. The server sends an array of
    /// JSON-encoded strings; plain objects are accepted too. Elements that
    /// fail to parse are skipped.
    pub fn decode_instructions(&self) -> Result<Vec<Instruction>> {
        if self.instructions.is_empty() {
            return Ok(Vec::new());
        }
        let elements: Vec<Value> = serde_json::from_str(&self.instructions)
            .map_err(|e| AgentError::MalformedInstructions(e.to_string()))?;

        let mut instructions = Vec::with_capacity(elements.len());
        for element in elements {
            let parsed = match element {
                Value::String(inner) => serde_json::from_str::<Instruction>(&inner),
                other => serde_json::from_value::<Instruction>(other),
            };
            match parsed {
                Ok(instruction) => instructions.push(instruction),
                Err(e) => warn!("Error unpacking instruction: {}", e),
            }
        }
        Ok(instructions)
    }
}

/// Outcome of one instruction, sent back to the C2. `output` carries raw
/// bytes and crosses the wire base64-encoded.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub id: Value,
    #[serde(with = "base64_output")]
    pub output: Vec<u8>,
    pub status: String,
    pub pid: String,
}

mod base64_output {
    use base64::prelude::*;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        bytes: &[u8],
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64_STANDARD
            .decode(encoded)
            .map_err(serde::de::Error::custom)
    }
}
