//! Process variables and their tag rules.

use crate::error::{ProcessError, ProcessResult};
use crate::types::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableTag {
    /// Must be set at start and at completion.
    Required,
    /// Cannot be changed from outside once the instance has started with a value.
    Readonly,
    /// Hidden from the externally exposed variable view.
    Internal,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableType {
    #[default]
    Any,
    String,
    Number,
    Boolean,
    Object,
    Array,
}

impl VariableType {
    fn accepts(&self, value: &Value) -> bool {
        match self {
            VariableType::Any => true,
            _ if value.is_null() => true,
            VariableType::String => value.is_string(),
            VariableType::Number => value.is_number(),
            VariableType::Boolean => value.is_boolean(),
            VariableType::Object => value.is_object(),
            VariableType::Array => value.is_array(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VariableDeclaration {
    pub name: String,
    #[serde(default)]
    pub data_type: VariableType,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<VariableTag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
}

impl VariableDeclaration {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: VariableType::Any,
            tags: Vec::new(),
            default: None,
        }
    }

    pub fn typed(mut self, data_type: VariableType) -> Self {
        self.data_type = data_type;
        self
    }

    pub fn tag(mut self, tag: VariableTag) -> Self {
        if !self.tags.contains(&tag) {
            self.tags.push(tag);
        }
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn has_tag(&self, tag: VariableTag) -> bool {
        self.tags.contains(&tag)
    }
}

/// One variable change, as applied.
#[derive(Clone, Debug, PartialEq)]
pub struct VariableChange {
    pub name: String,
    pub old: Option<Value>,
    pub new: Value,
}

/// The variable set of a single process instance.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct VariableScope {
    values: BTreeMap<String, Value>,
}

impl VariableScope {
    /// Build the initial scope: declared defaults first, then supplied values.
    pub fn initial(
        process_id: &str,
        declarations: &[VariableDeclaration],
        supplied: BTreeMap<String, Value>,
    ) -> ProcessResult<Self> {
        let mut values: BTreeMap<String, Value> = declarations
            .iter()
            .filter_map(|d| d.default.clone().map(|v| (d.name.clone(), v)))
            .collect();
        for (name, value) in supplied {
            if let Some(decl) = declarations.iter().find(|d| d.name == name) {
                check_type(process_id, decl, &value)?;
            }
            values.insert(name, value);
        }
        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.get(name).is_some_and(|v| !v.is_null())
    }

    pub fn as_map(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    /// Variables visible outside the engine (internal ones stripped).
    pub fn exposed(&self, declarations: &[VariableDeclaration]) -> BTreeMap<String, Value> {
        self.values
            .iter()
            .filter(|(name, _)| {
                !declarations
                    .iter()
                    .any(|d| &d.name == *name && d.has_tag(VariableTag::Internal))
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Engine-internal write (data mappings, actions, event payloads).
    /// Only the declared type is checked.
    pub fn set(
        &mut self,
        process_id: &str,
        declarations: &[VariableDeclaration],
        name: &str,
        value: Value,
    ) -> ProcessResult<Option<VariableChange>> {
        if let Some(decl) = declarations.iter().find(|d| d.name == name) {
            check_type(process_id, decl, &value)?;
        }
        let old = self.values.insert(name.to_string(), value.clone());
        if old.as_ref() == Some(&value) {
            return Ok(None);
        }
        Ok(Some(VariableChange {
            name: name.to_string(),
            old,
            new: value,
        }))
    }

    /// External update. Every entry is validated before any is applied.
    pub fn update(
        &mut self,
        process_id: &str,
        declarations: &[VariableDeclaration],
        started: bool,
        updates: BTreeMap<String, Value>,
    ) -> ProcessResult<Vec<VariableChange>> {
        for (name, value) in &updates {
            let Some(decl) = declarations.iter().find(|d| &d.name == name) else {
                continue;
            };
            if decl.has_tag(VariableTag::Readonly) && started && self.is_set(name) {
                return Err(ProcessError::variable(process_id, name, "is readonly"));
            }
            if decl.has_tag(VariableTag::Required) && value.is_null() {
                return Err(ProcessError::variable(process_id, name, "is required"));
            }
            check_type(process_id, decl, value)?;
        }

        let mut changes = Vec::new();
        for (name, value) in updates {
            let old = self.values.insert(name.clone(), value.clone());
            if old.as_ref() != Some(&value) {
                changes.push(VariableChange {
                    name,
                    old,
                    new: value,
                });
            }
        }
        Ok(changes)
    }

    /// Fails on the first `required` variable that is unset.
    pub fn check_required(
        &self,
        process_id: &str,
        declarations: &[VariableDeclaration],
    ) -> ProcessResult<()> {
        for decl in declarations {
            if decl.has_tag(VariableTag::Required) && !self.is_set(&decl.name) {
                return Err(ProcessError::variable(process_id, &decl.name, "is required but unset"));
            }
        }
        Ok(())
    }
}

fn check_type(process_id: &str, decl: &VariableDeclaration, value: &Value) -> ProcessResult<()> {
    if decl.data_type.accepts(value) {
        Ok(())
    } else {
        Err(ProcessError::variable(
            process_id,
            &decl.name,
            format!("expected {:?}, got {value}", decl.data_type),
        ))
    }
}
