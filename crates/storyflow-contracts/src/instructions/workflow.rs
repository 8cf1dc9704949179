use std::path::Path;

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

use super::{Instruction, InstructionKind};

/// An ordered instruction list as exchanged with the surrounding application.
///
/// Accepts either a bare JSON array of single-key instruction objects or an
/// object with an `instructions` array. Ids are assigned on load and are not
/// part of the document.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Workflow {
    pub instructions: Vec<Instruction>,
}

impl Workflow {
    pub fn new(kinds: Vec<InstructionKind>) -> Self {
        Self {
            instructions: kinds.into_iter().map(Instruction::new).collect(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading workflow {}", path.display()))?;
        Self::from_json(&raw).with_context(|| format!("invalid workflow {}", path.display()))
    }

    pub fn from_json(raw: &str) -> Result<Self> {
        let parsed: Value = serde_json::from_str(raw).context("workflow is not valid JSON")?;
        let rows = match parsed {
            Value::Array(rows) => rows,
            Value::Object(mut obj) => match obj.remove("instructions") {
                Some(Value::Array(rows)) => rows,
                Some(_) => bail!("`instructions` must be an array"),
                None => bail!("workflow object has no `instructions` array"),
            },
            _ => bail!("workflow must be an array or an object with `instructions`"),
        };

        let mut kinds = Vec::with_capacity(rows.len());
        for (idx, mut row) in rows.into_iter().enumerate() {
            if let Value::Object(obj) = &mut row {
                // `{"end": null}` reads the same as `{"end": {}}`.
                for value in obj.values_mut().filter(|value| value.is_null()) {
                    *value = Value::Object(Map::new());
                }
            }
            let label = row
                .as_object()
                .and_then(|obj| obj.keys().next().cloned())
                .unwrap_or_else(|| "?".to_string());
            let kind: InstructionKind = serde_json::from_value(row)
                .with_context(|| format!("instruction #{idx} ('{label}') is malformed"))?;
            kinds.push(kind);
        }
        Ok(Self::new(kinds))
    }

    pub fn to_json(&self) -> Result<String> {
        let rows = self
            .instructions
            .iter()
            .map(|instruction| serde_json::to_value(&instruction.kind))
            .collect::<serde_json::Result<Vec<Value>>>()?;
        let mut root = Map::new();
        root.insert("instructions".to_string(), Value::Array(rows));
        Ok(serde_json::to_string_pretty(&Value::Object(root))?)
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
