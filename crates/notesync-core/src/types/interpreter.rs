use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An interpreter setting as seen by the gateway
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterpreterSetting {
    pub id: String,
    pub name: String,
    pub group: String,
    #[serde(default)]
    pub interpreter_infos: Vec<Value>,
    /// Users or roles allowed to use the setting. Empty means everyone.
    #[serde(default)]
    pub owners: Vec<String>,
}

impl InterpreterSetting {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: id.into(),
            group: name.clone(),
            name,
            interpreter_infos: Vec::new(),
            owners: Vec::new(),
        }
    }

    pub fn is_user_authorized(&self, user_and_roles: &HashSet<String>) -> bool {
        self.owners.is_empty() || self.owners.iter().any(|owner| user_and_roles.contains(owner))
    }
}

/// One entry of the `INTERPRETER_BINDINGS` reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterBinding {
    pub id: String,
    pub name: String,
    pub interpreters: Vec<Value>,
    pub selected: bool,
}

impl From<&InterpreterSetting> for InterpreterBinding {
    fn from(setting: &InterpreterSetting) -> Self {
        Self {
            id: setting.id.clone(),
            name: setting.name.clone(),
            interpreters: setting.interpreter_infos.clone(),
            selected: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterpreterCompletion {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub meta: String,
}

impl InterpreterCompletion {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            meta: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn authorization_with_owner_list() {
        let mut setting = InterpreterSetting::new("spark_1", "spark");
        let alice: HashSet<String> = ["alice".to_string()].into();
        assert!(setting.is_user_authorized(&alice));

        setting.owners = vec!["admin".to_string()];
        assert!(!setting.is_user_authorized(&alice));

        let admin: HashSet<String> = ["bob".to_string(), "admin".to_string()].into();
        assert!(setting.is_user_authorized(&admin));
    }
}
