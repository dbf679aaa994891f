//! Node input/output contracts
//!
//! A [`Signature`] lists the named, typed input and output fields of a
//! program. Flows use signatures for two things: describing their own
//! aggregate contract and splicing extra fields into a node's base contract
//! with [`Signature::extend`].
//!
//! Signatures can be written in a compact text form:
//!
//! ```rust
//! use flowcraft_core::Signature;
//!
//! let sig: Signature = "question:string, context?:string[] -> answer:string, score:number"
//!     .parse()
//!     .unwrap();
//!
//! assert_eq!(sig.inputs().len(), 2);
//! assert!(sig.inputs()[1].optional);
//! assert_eq!(sig.to_string(), "question:string, context?:string[] -> answer:string, score:number");
//! ```
//!
//! Field syntax is `name[?][!][:type]`, where `?` marks an optional field and
//! `!` an internal one. Types are `string` (the default), `number`,
//! `boolean`, `json`, `image`, `audio`, `file`, `url`, `date`, `datetime`,
//! `code` and `class(a|b|c)`, each optionally suffixed with `[]`.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{FlowError, Result};

/// Value type of a signature field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Json,
    Image,
    Audio,
    File,
    Url,
    Date,
    DateTime,
    Code,
    /// One of a fixed set of labels
    Class(Vec<String>),
    Array(Box<FieldType>),
}

impl FieldType {
    /// Short type name, without array or class decoration
    pub fn name(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Number => "number",
            Self::Boolean => "boolean",
            Self::Json => "json",
            Self::Image => "image",
            Self::Audio => "audio",
            Self::File => "file",
            Self::Url => "url",
            Self::Date => "date",
            Self::DateTime => "datetime",
            Self::Code => "code",
            Self::Class(_) => "class",
            Self::Array(inner) => inner.name(),
        }
    }

    fn element(&self) -> &FieldType {
        match self {
            Self::Array(inner) => inner.element(),
            other => other,
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        if let Some(inner) = text.strip_suffix("[]") {
            return Ok(Self::Array(Box::new(Self::parse(inner)?)));
        }
        if let Some(options) = text
            .strip_prefix("class(")
            .and_then(|rest| rest.strip_suffix(')'))
        {
            let labels: Vec<String> = options
                .split('|')
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect();
            if labels.is_empty() {
                return Err(FlowError::construction("class type needs at least one option"));
            }
            return Ok(Self::Class(labels));
        }
        let ty = match text {
            "" | "string" => Self::String,
            "number" => Self::Number,
            "boolean" => Self::Boolean,
            "json" => Self::Json,
            "image" => Self::Image,
            "audio" => Self::Audio,
            "file" => Self::File,
            "url" => Self::Url,
            "date" => Self::Date,
            "datetime" => Self::DateTime,
            "code" => Self::Code,
            other => {
                return Err(FlowError::construction(format!(
                    "unknown field type '{}'",
                    other
                )))
            }
        };
        Ok(ty)
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Class(labels) => write!(f, "class({})", labels.join("|")),
            Self::Array(inner) => write!(f, "{}[]", inner),
            other => f.write_str(other.name()),
        }
    }
}

/// A named, typed signature field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: FieldType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub optional: bool,
    /// Produced for the program's own use and hidden from callers
    #[serde(default)]
    pub internal: bool,
}

impl Field {
    pub fn new(name: impl Into<String>, ty: FieldType) -> Self {
        Self {
            name: name.into(),
            ty,
            description: None,
            optional: false,
            internal: false,
        }
    }

    pub fn string(name: impl Into<String>) -> Self {
        Self::new(name, FieldType::String)
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn internal(mut self) -> Self {
        self.internal = true;
        self
    }

    fn renamed(&self, name: String) -> Self {
        Self {
            name,
            ..self.clone()
        }
    }

    fn parse(text: &str) -> Result<Self> {
        let (head, ty) = match text.split_once(':') {
            Some((head, ty)) => (head.trim(), FieldType::parse(ty)?),
            None => (text.trim(), FieldType::String),
        };
        let mut name = head;
        let mut optional = false;
        let mut internal = false;
        loop {
            if let Some(rest) = name.strip_suffix('?') {
                optional = true;
                name = rest;
            } else if let Some(rest) = name.strip_suffix('!') {
                internal = true;
                name = rest;
            } else {
                break;
            }
        }
        validate_field_name(name)?;
        Ok(Self {
            name: name.to_string(),
            ty,
            description: None,
            optional,
            internal,
        })
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.optional {
            f.write_str("?")?;
        }
        if self.internal {
            f.write_str("!")?;
        }
        write!(f, ":{}", self.ty)
    }
}

fn validate_field_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
    if valid {
        Ok(())
    } else {
        Err(FlowError::construction(format!(
            "invalid field name '{}'",
            name
        )))
    }
}

/// Fields spliced around a node's base signature by `node_extended`
#[derive(Debug, Clone, Default)]
pub struct NodeExtension {
    pub prepend_inputs: Vec<Field>,
    pub append_inputs: Vec<Field>,
    pub prepend_outputs: Vec<Field>,
    pub append_outputs: Vec<Field>,
}

impl NodeExtension {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prepend_input(mut self, field: Field) -> Self {
        self.prepend_inputs.push(field);
        self
    }

    pub fn append_input(mut self, field: Field) -> Self {
        self.append_inputs.push(field);
        self
    }

    pub fn prepend_output(mut self, field: Field) -> Self {
        self.prepend_outputs.push(field);
        self
    }

    pub fn append_output(mut self, field: Field) -> Self {
        self.append_outputs.push(field);
        self
    }
}

/// Input/output contract of a program or flow
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    inputs: Vec<Field>,
    outputs: Vec<Field>,
}

impl Signature {
    /// Build a signature, rejecting duplicate field names
    pub fn new(inputs: Vec<Field>, outputs: Vec<Field>) -> Result<Self> {
        check_unique(&inputs, "input")?;
        check_unique(&outputs, "output")?;
        Ok(Self {
            description: None,
            inputs,
            outputs,
        })
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn inputs(&self) -> &[Field] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[Field] {
        &self.outputs
    }

    pub fn input(&self, name: &str) -> Option<&Field> {
        self.inputs.iter().find(|field| field.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&Field> {
        self.outputs.iter().find(|field| field.name == name)
    }

    /// Splice extra fields before and after the base fields
    ///
    /// Class types are rejected on inputs and image types on outputs; the
    /// error names the offending field. The combined field lists must stay
    /// free of duplicates.
    pub fn extend(&self, extension: &NodeExtension) -> Result<Signature> {
        for field in extension
            .prepend_inputs
            .iter()
            .chain(&extension.append_inputs)
        {
            if matches!(field.ty.element(), FieldType::Class(_)) {
                return Err(FlowError::construction(format!(
                    "Class type is not supported in input fields: '{}'",
                    field.name
                )));
            }
        }
        for field in extension
            .prepend_outputs
            .iter()
            .chain(&extension.append_outputs)
        {
            if matches!(field.ty.element(), FieldType::Image) {
                return Err(FlowError::construction(format!(
                    "image type is not supported in output fields: '{}'",
                    field.name
                )));
            }
        }

        let inputs = extension
            .prepend_inputs
            .iter()
            .chain(&self.inputs)
            .chain(&extension.append_inputs)
            .cloned()
            .collect();
        let outputs = extension
            .prepend_outputs
            .iter()
            .chain(&self.outputs)
            .chain(&extension.append_outputs)
            .cloned()
            .collect();

        let mut extended = Signature::new(inputs, outputs)?;
        extended.description = self.description.clone();
        Ok(extended)
    }

    /// Rename every field to `{prefix}{Name}`
    pub fn prefixed(&self, prefix: &str) -> Signature {
        let rename = |field: &Field| field.renamed(prefixed_name(prefix, &field.name));
        Signature {
            description: self.description.clone(),
            inputs: self.inputs.iter().map(rename).collect(),
            outputs: self.outputs.iter().map(rename).collect(),
        }
    }

    /// Append fields, skipping names that are already present
    pub(crate) fn absorb(&mut self, other: &Signature) {
        for field in &other.inputs {
            if self.input(&field.name).is_none() {
                self.inputs.push(field.clone());
            }
        }
        for field in &other.outputs {
            if self.output(&field.name).is_none() {
                self.outputs.push(field.clone());
            }
        }
    }
}

/// `("reasoner", "answer")` becomes `reasonerAnswer`
pub fn prefixed_name(prefix: &str, name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => {
            let mut out = String::with_capacity(prefix.len() + name.len());
            out.push_str(prefix);
            out.extend(first.to_uppercase());
            out.push_str(chars.as_str());
            out
        }
        None => prefix.to_string(),
    }
}

fn check_unique(fields: &[Field], kind: &str) -> Result<()> {
    let mut seen = HashSet::new();
    for field in fields {
        if !seen.insert(field.name.as_str()) {
            return Err(FlowError::construction(format!(
                "Duplicate {} field name: '{}'",
                kind, field.name
            )));
        }
    }
    Ok(())
}

fn parse_fields(text: &str) -> Result<Vec<Field>> {
    text.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(Field::parse)
        .collect()
}

impl FromStr for Signature {
    type Err = FlowError;

    fn from_str(text: &str) -> Result<Self> {
        let (inputs, outputs) = text.split_once("->").ok_or_else(|| {
            FlowError::construction(format!("signature '{}' is missing '->'", text))
        })?;
        let outputs = parse_fields(outputs)?;
        if outputs.is_empty() {
            return Err(FlowError::construction(format!(
                "signature '{}' declares no output fields",
                text
            )));
        }
        Signature::new(parse_fields(inputs)?, outputs)
    }
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |fields: &[Field]| {
            fields
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(f, "{} -> {}", join(&self.inputs), join(&self.outputs))
    }
}

/// Anything that can be turned into a [`Signature`]
pub trait IntoSignature {
    fn into_signature(self) -> Result<Signature>;
}

impl IntoSignature for Signature {
    fn into_signature(self) -> Result<Signature> {
        Ok(self)
    }
}

impl IntoSignature for &Signature {
    fn into_signature(self) -> Result<Signature> {
        Ok(self.clone())
    }
}

impl IntoSignature for &str {
    fn into_signature(self) -> Result<Signature> {
        self.parse()
    }
}

impl IntoSignature for String {
    fn into_signature(self) -> Result<Signature> {
        self.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_markers_and_types() {
        let sig: Signature = "userInput:string, tags?:string[] -> reasoning!:string, label:class(a|b)"
            .parse()
            .unwrap();

        assert_eq!(sig.inputs()[1].ty, FieldType::Array(Box::new(FieldType::String)));
        assert!(sig.outputs()[0].internal);
        assert_eq!(sig.outputs()[1].ty.name(), "class");
        assert!(sig.to_string().contains("reasoning!:string"));
    }

    #[test]
    fn test_parse_errors() {
        assert!("a:string".parse::<Signature>().is_err());
        assert!("a -> ".parse::<Signature>().is_err());
        assert!("a:widget -> b".parse::<Signature>().is_err());
        assert!("1a -> b".parse::<Signature>().is_err());
    }

    #[test]
    fn test_extend_keeps_order() {
        let base: Signature = "userInput -> analysis".parse().unwrap();
        let ext = NodeExtension::new()
            .prepend_input(Field::string("priority"))
            .append_input(Field::string("context").optional())
            .prepend_output(Field::new(
                "category",
                FieldType::Class(vec!["urgent".into(), "low".into()]),
            ))
            .append_output(Field::new("confidence", FieldType::Number));

        let extended = base.extend(&ext).unwrap().prefixed("analyzer");
        let inputs: Vec<_> = extended.inputs().iter().map(|f| f.name.as_str()).collect();
        let outputs: Vec<_> = extended.outputs().iter().map(|f| f.name.as_str()).collect();

        assert_eq!(inputs, ["analyzerPriority", "analyzerUserInput", "analyzerContext"]);
        assert_eq!(outputs, ["analyzerCategory", "analyzerAnalysis", "analyzerConfidence"]);
        assert!(extended.inputs()[2].optional);
    }

    #[test]
    fn test_extend_rejects_invalid_categories() {
        let base: Signature = "userInput -> analysis".parse().unwrap();

        let class_input = NodeExtension::new()
            .append_input(Field::new("category", FieldType::Class(vec!["a".into()])));
        let err = base.extend(&class_input).unwrap_err().to_string();
        assert!(err.contains("Class type is not supported in input fields"));
        assert!(err.contains("category"));

        let image_output = NodeExtension::new().append_output(Field::new("outputImage", FieldType::Image));
        let err = base.extend(&image_output).unwrap_err().to_string();
        assert!(err.contains("image type is not supported in output fields"));

        let duplicate = NodeExtension::new().append_input(Field::string("userInput"));
        let err = base.extend(&duplicate).unwrap_err().to_string();
        assert!(err.contains("Duplicate input field name"));
    }

    #[test]
    fn test_prefixed_name() {
        assert_eq!(prefixed_name("reasoner", "reasoning"), "reasonerReasoning");
        assert_eq!(prefixed_name("contextual", "userInput"), "contextualUserInput");
    }
}
