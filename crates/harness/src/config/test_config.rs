//! Per-test and per-argument configuration.
//!
//! Grounded on `original_source/system_config/SystemConfig.py::TestConfig`
//! and `TestArgConfig`.

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{HarnessError, Result};

/// Raw `Tests[]` entry shape, as it appears in the settings file.
#[derive(Debug, Deserialize)]
struct RawTest {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Binary")]
    binary: String,
    #[serde(rename = "Args", default)]
    args: Vec<serde_json::Map<String, Value>>,
}

/// One argument slot for a test binary.
#[derive(Debug, Clone)]
pub struct TestArgConfig {
    pub name: String,
    pub cmdline_option: String,
    pub is_constant: bool,
    pub is_flag: bool,
    pub values: Vec<Value>,
}

impl TestArgConfig {
    fn parse(raw: serde_json::Map<String, Value>) -> Result<Self> {
        let (name, arg_data) = raw.into_iter().next().ok_or_else(|| {
            HarnessError::ConfigInvalid("test argument entry has no name key".into())
        })?;
        let arg_data = arg_data.as_object().cloned().ok_or_else(|| {
            HarnessError::ConfigInvalid(format!("argument '{name}' is not an object"))
        })?;

        let is_constant = arg_data
            .get("Constant")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let is_flag = arg_data
            .get("Flag")
            .map(|v| v.as_bool().unwrap_or(false))
            .unwrap_or(false);
        let cmdline_option = arg_data
            .get("Option")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                HarnessError::ConfigInvalid(format!("argument '{name}' missing 'Option'"))
            })?
            .to_string();

        let values = if is_flag {
            Vec::new()
        } else {
            match arg_data.get("Values") {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    return Err(HarnessError::ConfigInvalid(format!(
                        "argument '{name}': 'Values' must be a list, even for a constant argument"
                    )))
                }
                None => {
                    return Err(HarnessError::ConfigInvalid(format!(
                        "argument '{name}' missing 'Values'"
                    )))
                }
            }
        };

        if is_constant && values.len() > 1 {
            return Err(HarnessError::ConfigInvalid(format!(
                "argument '{name}' is constant but specifies multiple values: {values:?}"
            )));
        }
        if is_flag {
            if let Some(Value::Array(items)) = arg_data.get("Values") {
                if !items.is_empty() {
                    return Err(HarnessError::ConfigInvalid(format!(
                        "argument '{name}' is a flag but also specifies values"
                    )));
                }
            }
        }

        Ok(TestArgConfig {
            name,
            cmdline_option,
            is_constant,
            is_flag,
            values,
        })
    }
}

/// One `Tests[]` entry.
#[derive(Debug, Clone)]
pub struct TestConfig {
    pub name: String,
    pub binary: String,
    pub arguments: Vec<TestArgConfig>,
}

impl TestConfig {
    pub fn parse(value: &Value) -> Result<Self> {
        let raw: RawTest = serde_json::from_value(value.clone()).map_err(|e| {
            HarnessError::ConfigInvalid(format!("malformed test entry: {e}"))
        })?;

        let binary = shellexpand_env(&raw.binary);
        if !Path::new(&binary).is_file() && which(&binary).is_none() {
            return Err(HarnessError::ConfigInvalid(format!(
                "binary path '{binary}' specified for '{}' does not exist",
                raw.name
            )));
        }

        let mut arguments = Vec::with_capacity(raw.args.len());
        for arg in raw.args {
            arguments.push(TestArgConfig::parse(arg)?);
        }

        Ok(TestConfig {
            name: raw.name,
            binary,
            arguments,
        })
    }
}

/// Minimal `$VAR`/`${VAR}` environment expansion, mirroring
/// `os.path.expandvars`.
fn shellexpand_env(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        let braced = chars.peek() == Some(&'{');
        if braced {
            chars.next();
        }
        let mut name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                name.push(c);
                chars.next();
            } else {
                break;
            }
        }
        if braced && chars.peek() == Some(&'}') {
            chars.next();
        }
        if name.is_empty() {
            out.push('$');
        } else if let Ok(val) = std::env::var(&name) {
            out.push_str(&val);
        }
    }
    out
}

/// Searches `$PATH` for an executable named `name`, mirroring
/// `shutil.which`.
fn which(name: &str) -> Option<String> {
    let path_var = std::env::var_os("PATH")?;
    for dir in std::env::split_paths(&path_var) {
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate.to_string_lossy().into_owned());
        }
    }
    None
}
