//! Typed output values and the schema that declares them.
//!
//! A task declares its outputs as a [`VariableMap`]. After upload each output
//! becomes a [`Literal`], and all literals of one invocation are collected in
//! a [`LiteralMap`] that gets serialized next to the uploaded data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Metadata key under which the data loading format is recorded on a literal
pub const LOADING_FORMAT_KEY: &str = "loading_format";

/// Shape of a blob output: one file or a directory tree
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlobDimensionality {
    #[default]
    Single,
    Multipart,
}

impl fmt::Display for BlobDimensionality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Single => write!(f, "SINGLE"),
            Self::Multipart => write!(f, "MULTIPART"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobType {
    /// Free-form format tag (e.g. "csv"), may be empty
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub dimensionality: BlobDimensionality,
}

impl BlobType {
    pub fn single() -> Self {
        Self {
            format: String::new(),
            dimensionality: BlobDimensionality::Single,
        }
    }

    pub fn multipart() -> Self {
        Self {
            format: String::new(),
            dimensionality: BlobDimensionality::Multipart,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimpleType {
    Integer,
    Float,
    String,
    Boolean,
    Datetime,
    Duration,
}

impl fmt::Display for SimpleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Integer => "integer",
            Self::Float => "float",
            Self::String => "string",
            Self::Boolean => "boolean",
            Self::Datetime => "datetime",
            Self::Duration => "duration",
        };
        f.write_str(name)
    }
}

/// Declared type of one output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LiteralType {
    Simple(SimpleType),
    Blob(BlobType),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variable {
    #[serde(rename = "type")]
    pub ty: LiteralType,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl Variable {
    pub fn new(ty: LiteralType) -> Self {
        Self {
            ty,
            description: String::new(),
        }
    }
}

/// Output schema: output name to declared type
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VariableMap {
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
}

impl VariableMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, ty: LiteralType) -> Self {
        self.variables.insert(name.into(), Variable::new(ty));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    #[serde(rename = "type")]
    pub ty: BlobType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blob {
    pub uri: String,
    pub metadata: BlobMetadata,
}

impl Blob {
    pub fn dimensionality(&self) -> BlobDimensionality {
        self.metadata.ty.dimensionality
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Primitive {
    Integer(i64),
    Float(f64),
    String(String),
    Boolean(bool),
    Datetime(DateTime<Utc>),
    Duration(Duration),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scalar {
    Primitive(Primitive),
    Blob(Blob),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Literal {
    pub scalar: Scalar,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Literal {
    pub fn blob(uri: impl Into<String>, ty: BlobType) -> Self {
        Self {
            scalar: Scalar::Blob(Blob {
                uri: uri.into(),
                metadata: BlobMetadata { ty },
            }),
            metadata: BTreeMap::new(),
        }
    }

    pub fn primitive(value: Primitive) -> Self {
        Self {
            scalar: Scalar::Primitive(value),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn as_blob(&self) -> Option<&Blob> {
        match &self.scalar {
            Scalar::Blob(blob) => Some(blob),
            Scalar::Primitive(_) => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&Primitive> {
        match &self.scalar {
            Scalar::Primitive(value) => Some(value),
            Scalar::Blob(_) => None,
        }
    }
}

/// The output record of one task invocation
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LiteralMap {
    #[serde(default)]
    pub literals: BTreeMap<String, Literal>,
}

impl LiteralMap {
    pub fn get(&self, name: &str) -> Option<&Literal> {
        self.literals.get(name)
    }

    pub fn len(&self) -> usize {
        self.literals.len()
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }
}

/// Format the task expects its inputs and outputs to be loaded in.
/// Recorded on literals, never interpreted by the uploader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataLoadingFormat {
    #[default]
    Json,
    Yaml,
    Proto,
}

impl fmt::Display for DataLoadingFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Json => write!(f, "JSON"),
            Self::Yaml => write!(f, "YAML"),
            Self::Proto => write!(f, "PROTO"),
        }
    }
}

/// When the caller triggers uploads relative to task exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IoStrategy {
    #[default]
    UploadOnExit,
    UploadEager,
    DoNotUpload,
}

impl fmt::Display for IoStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UploadOnExit => write!(f, "UPLOAD_ON_EXIT"),
            Self::UploadEager => write!(f, "UPLOAD_EAGER"),
            Self::DoNotUpload => write!(f, "DO_NOT_UPLOAD"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_from_json() {
        let json = r#"{
            "variables": {
                "x": {"type": {"blob": {"dimensionality": "SINGLE"}}},
                "y": {"type": {"blob": {"format": "csv", "dimensionality": "MULTIPART"}}},
                "n": {"type": {"simple": "integer"}}
            }
        }"#;

        let vars: VariableMap = serde_json::from_str(json).unwrap();
        assert_eq!(vars.variables.len(), 3);
        assert_eq!(
            vars.variables["x"].ty,
            LiteralType::Blob(BlobType::single())
        );
        assert_eq!(
            vars.variables["y"].ty,
            LiteralType::Blob(BlobType {
                format: "csv".to_string(),
                dimensionality: BlobDimensionality::Multipart,
            })
        );
        assert_eq!(
            vars.variables["n"].ty,
            LiteralType::Simple(SimpleType::Integer)
        );
    }

    #[test]
    fn test_schema_from_yaml() {
        let yaml = "variables:\n  out:\n    type: !blob\n      dimensionality: MULTIPART\n";
        let vars: VariableMap = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(
            vars.variables["out"].ty,
            LiteralType::Blob(BlobType::multipart())
        );
    }

    #[test]
    fn test_dimensionality_lives_in_metadata() {
        let literal = Literal::blob("s3://bucket/out", BlobType::multipart());
        let value = serde_json::to_value(&literal).unwrap();

        assert_eq!(value["scalar"]["blob"]["uri"], "s3://bucket/out");
        assert_eq!(
            value["scalar"]["blob"]["metadata"]["type"]["dimensionality"],
            "MULTIPART"
        );
        assert!(value.get("metadata").is_none());
    }

    #[test]
    fn test_literal_accessors() {
        let blob = Literal::blob("mem://a", BlobType::single());
        assert!(blob.as_primitive().is_none());
        assert_eq!(
            blob.as_blob().map(Blob::dimensionality),
            Some(BlobDimensionality::Single)
        );

        let value = Literal::primitive(Primitive::Boolean(true));
        assert!(value.as_blob().is_none());
        assert_eq!(value.as_primitive(), Some(&Primitive::Boolean(true)));
    }
}
