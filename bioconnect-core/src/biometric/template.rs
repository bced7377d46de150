//! Face templates and their versioned storage encoding.

use crate::{BioConnectError, DatabaseError, Result};
use serde::{Deserialize, Serialize};

/// Template length produced by the 128-d face descriptor model.
pub const DEFAULT_TEMPLATE_LENGTH: usize = 128;

/// Version of the on-disk template encoding.
pub const TEMPLATE_FORMAT_VERSION: u16 = 1;

/// Fixed-length descriptor summarizing a captured face.
///
/// Immutable once built: re-enrollment swaps in a new template rather than
/// editing this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct BiometricTemplate {
    values: Vec<f32>,
}

/// Stored form: `bincode({format_version, length, values})`.
#[derive(Serialize, Deserialize)]
struct TemplateRecord {
    format_version: u16,
    length: u32,
    values: Vec<f32>,
}

impl BiometricTemplate {
    /// Build a template, rejecting empty vectors and non-finite components.
    pub fn new(values: Vec<f32>) -> Result<Self> {
        if values.is_empty() {
            return Err(BioConnectError::InvalidTemplate(
                "template has no components".to_string(),
            ));
        }
        if let Some(index) = values.iter().position(|v| !v.is_finite()) {
            return Err(BioConnectError::InvalidTemplate(format!(
                "component {} is not a finite number",
                index
            )));
        }
        Ok(Self { values })
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }

    /// Encode for storage in the `identities.template` column.
    pub fn to_blob(&self) -> Result<Vec<u8>> {
        let record = TemplateRecord {
            format_version: TEMPLATE_FORMAT_VERSION,
            length: self.values.len() as u32,
            values: self.values.clone(),
        };
        bincode::serialize(&record).map_err(|e| DatabaseError::Serialization(e.to_string()).into())
    }

    /// Decode a stored template, checking format version and declared length.
    pub fn from_blob(blob: &[u8]) -> Result<Self> {
        let record: TemplateRecord = bincode::deserialize(blob).map_err(|e| {
            BioConnectError::InvalidTemplate(format!("undecodable template blob: {}", e))
        })?;

        if record.format_version != TEMPLATE_FORMAT_VERSION {
            return Err(BioConnectError::InvalidTemplate(format!(
                "unsupported template format version {}",
                record.format_version
            )));
        }
        if record.length as usize != record.values.len() {
            return Err(BioConnectError::InvalidTemplate(format!(
                "declared length {} but found {} components",
                record.length,
                record.values.len()
            )));
        }

        Self::new(record.values)
    }
}

impl TryFrom<Vec<f32>> for BiometricTemplate {
    type Error = BioConnectError;

    fn try_from(values: Vec<f32>) -> Result<Self> {
        Self::new(values)
    }
}

impl From<BiometricTemplate> for Vec<f32> {
    fn from(template: BiometricTemplate) -> Self {
        template.values
    }
}
