//! Settings loading.
//!
//! Auto-detects YAML, JSON, or an inline JSON string depending on whether
//! the given path points at a real file and what extension it carries,
//! then validates the `Tests` and `Core_Config` sections. Grounded on
//! `original_source/system_config/SystemConfig.py::SystemConfig`.

pub mod core_config;
pub mod test_config;

pub use core_config::{CoreConfig, PartitionRequest};
pub use test_config::{TestArgConfig, TestConfig};

use std::path::Path;

use serde_json::Value;

use crate::error::{HarnessError, Result};
use crate::topology::Topology;

/// Verbosity level for the debug log sink, mirroring the original's
/// `Bare`/`All`/`Excess`/`Debug` levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Bare,
    All,
    Excess,
    Debug,
}

impl LogLevel {
    fn parse(raw: &str) -> Self {
        match raw {
            "Bare" => LogLevel::Bare,
            "All" => LogLevel::All,
            "Excess" => LogLevel::Excess,
            "Debug" => LogLevel::Debug,
            _ => LogLevel::Debug,
        }
    }

    /// `tracing_subscriber::EnvFilter` directive this level maps to.
    pub fn as_filter_directive(self) -> &'static str {
        match self {
            LogLevel::Bare => "warn",
            LogLevel::All => "info",
            LogLevel::Excess => "debug",
            LogLevel::Debug => "trace",
        }
    }
}

/// Fully validated run settings.
#[derive(Debug, Clone)]
pub struct Settings {
    pub log_directory: String,
    pub log_level: LogLevel,
    pub run_directory: String,
    pub constant_mce_checking: bool,
    pub tests: Vec<TestConfig>,
    pub core_config: CoreConfig,
}

impl Settings {
    /// Load and validate a settings document.
    ///
    /// `config_path` may be a path to a `.json`/`.yaml`/`.yml` file, or a
    /// raw JSON string passed directly on the command line. `run_dir`/
    /// `log_dir` override the corresponding document fields when set,
    /// matching the CLI's precedence over the file.
    pub fn load(
        config_path: &str,
        run_dir: Option<String>,
        log_dir: Option<String>,
        topology: &Topology,
    ) -> Result<Self> {
        let raw = load_document(config_path)?;
        let obj = raw.as_object().ok_or_else(|| {
            HarnessError::ConfigInvalid("settings document must be a JSON/YAML object".into())
        })?;

        let log_directory = log_dir
            .or_else(|| obj.get("Log_Directory").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| HarnessError::ConfigInvalid("'Log_Directory' is required".into()))?;

        let log_level = obj
            .get("Log_Level")
            .and_then(Value::as_str)
            .map(LogLevel::parse)
            .unwrap_or(LogLevel::All);

        let run_directory = run_dir
            .or_else(|| obj.get("Run_Directory").and_then(Value::as_str).map(str::to_string))
            .ok_or_else(|| HarnessError::ConfigInvalid("'Run_Directory' is required".into()))?;

        let constant_mce_checking = obj
            .get("Constant_MCE_Checking")
            .and_then(Value::as_bool)
            .unwrap_or(true);

        let tests_val = obj
            .get("Tests")
            .and_then(Value::as_array)
            .ok_or_else(|| HarnessError::ConfigInvalid("'Tests' is required and must be a list".into()))?;
        if tests_val.is_empty() {
            return Err(HarnessError::ConfigInvalid(
                "no tests found in configuration".into(),
            ));
        }
        let mut tests = Vec::with_capacity(tests_val.len());
        for entry in tests_val {
            tests.push(TestConfig::parse(entry)?);
        }

        let core_config_val = obj
            .get("Core_Config")
            .ok_or_else(|| HarnessError::ConfigInvalid("missing 'Core_Config' section".into()))?;
        let core_config = CoreConfig::parse(core_config_val, topology)?;

        Ok(Settings {
            log_directory,
            log_level,
            run_directory,
            constant_mce_checking,
            tests,
            core_config,
        })
    }
}

/// Parses `config_path` as a YAML/JSON file path, or as an inline JSON
/// string when the path doesn't exist on disk.
fn load_document(config_path: &str) -> Result<Value> {
    let path = Path::new(config_path);
    if path.is_file() {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str(&text)
                .map_err(|e| HarnessError::ConfigInvalid(format!("failed to parse JSON settings file: {e}"))),
            Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
                .map_err(|e| HarnessError::ConfigInvalid(format!("failed to parse YAML settings file: {e}"))),
            _ => Err(HarnessError::ConfigInvalid(format!(
                "settings file must be .json, .yaml, or .yml; got {config_path}"
            ))),
        }
    } else {
        serde_json::from_str(config_path)
            .map_err(|e| HarnessError::ConfigInvalid(format!("failed to parse inline JSON settings: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn topo() -> Topology {
        Topology {
            num_sockets: 1,
            ccds_per_socket: 1,
            cores_per_ccd: 4,
            num_physical_cores: 4,
            num_logical_cores: 4,
            smt_enabled: false,
        }
    }

    fn sample_doc(binary: &str) -> String {
        format!(
            r#"{{
                "Log_Directory": "/tmp/logs",
                "Log_Level": "Debug",
                "Run_Directory": "/tmp/run",
                "Constant_MCE_Checking": false,
                "Tests": [
                    {{"Name": "stress", "Binary": "{binary}", "Args": []}}
                ],
                "Core_Config": {{"SMT": false, "All": true}}
            }}"#
        )
    }

    fn make_executable() -> tempfile::NamedTempFile {
        use std::os::unix::fs::PermissionsExt;
        let f = tempfile::NamedTempFile::new().unwrap();
        writeln!(&f, "#!/bin/sh\nexit 0").unwrap();
        let mut perms = f.as_file().metadata().unwrap().permissions();
        perms.set_mode(0o755);
        f.as_file().set_permissions(perms).unwrap();
        f
    }

    #[test]
    fn inline_json_string_is_parsed_when_path_does_not_exist() {
        let bin = make_executable();
        let doc = sample_doc(bin.path().to_str().unwrap());
        let settings = Settings::load(&doc, None, None, &topo()).unwrap();
        assert_eq!(settings.log_directory, "/tmp/logs");
        assert_eq!(settings.log_level, LogLevel::Debug);
        assert!(!settings.constant_mce_checking);
        assert_eq!(settings.tests.len(), 1);
    }

    #[test]
    fn json_file_extension_is_detected() {
        let bin = make_executable();
        let doc = sample_doc(bin.path().to_str().unwrap());
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(file, "{doc}").unwrap();
        let settings = Settings::load(file.path().to_str().unwrap(), None, None, &topo()).unwrap();
        assert_eq!(settings.run_directory, "/tmp/run");
    }

    #[test]
    fn run_dir_override_takes_precedence_over_document_value() {
        let bin = make_executable();
        let doc = sample_doc(bin.path().to_str().unwrap());
        let settings =
            Settings::load(&doc, Some("/override/run".into()), None, &topo()).unwrap();
        assert_eq!(settings.run_directory, "/override/run");
    }

    #[test]
    fn empty_tests_list_is_rejected() {
        let doc = r#"{
            "Log_Directory": "/tmp/logs",
            "Run_Directory": "/tmp/run",
            "Tests": [],
            "Core_Config": {"SMT": false, "All": true}
        }"#;
        let err = Settings::load(doc, None, None, &topo()).unwrap_err();
        assert!(matches!(err, HarnessError::ConfigInvalid(_)));
    }

    #[test]
    fn unsupported_file_extension_is_rejected() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        write!(file, "not json").unwrap();
        let err = Settings::load(file.path().to_str().unwrap(), None, None, &topo()).unwrap_err();
        assert!(matches!(err, HarnessError::ConfigInvalid(_)));
    }
}
