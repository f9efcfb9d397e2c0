//! Host environment probes.
//!
//! Environment variables are read once into a [`HostEnv`] snapshot so that
//! capability checks stay pure and tests can supply their own values.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

use thiserror::Error;

/// Proxy variables forwarded into the tool's environment by proxy scenarios.
pub const PROXY_VARS: [&str; 3] = ["HTTP_PROXY", "HTTPS_PROXY", "NO_PROXY"];

/// Runner-specific variables whose mere presence marks a CI host.
const CI_MARKERS: [&str; 3] = ["GITHUB_ACTIONS", "GITLAB_CI", "JENKINS_HOME"];

/// Errors that can occur during environment variable parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvError {
    /// Invalid value for a variable.
    #[error("Invalid value for {var}: expected {expected}, got '{value}'")]
    InvalidValue {
        var: String,
        expected: String,
        value: String,
    },
}

/// Parse a boolean environment value.
///
/// Accepts: 1, true, yes, on (for true)
///          0, false, no, off, "" (for false)
pub fn parse_bool(var: &str, value: &str) -> Result<bool, EnvError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(EnvError::InvalidValue {
            var: var.to_string(),
            expected: "boolean (true/false/1/0/yes/no)".to_string(),
            value: value.to_string(),
        }),
    }
}

/// Snapshot of the environment variables the harness cares about.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    vars: HashMap<String, String>,
}

impl HostEnv {
    /// Capture the current process environment.
    pub fn capture() -> Self {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Build a snapshot from an arbitrary lookup, e.g. a map in tests.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let names = ["CI", "WSL_DISTRO_NAME", "WSLPATH", "MINIKUBE_HOME"]
            .into_iter()
            .chain(CI_MARKERS)
            .chain(PROXY_VARS);

        let vars = names
            .filter_map(|name| lookup(name).map(|value| (name.to_string(), value)))
            .collect();
        Self { vars }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    fn non_empty(&self, name: &str) -> bool {
        self.get(name).is_some_and(|v| !v.is_empty())
    }

    /// Whether the host looks like a CI runner.
    ///
    /// `CI` is parsed as a boolean; an unparsable but non-empty value still
    /// counts as set. Known runner markers count when present.
    pub fn is_ci(&self) -> bool {
        if let Some(value) = self.get("CI") {
            match parse_bool("CI", value) {
                Ok(true) => return true,
                Ok(false) => {}
                Err(_) => return true,
            }
        }
        if self.get("GITHUB_ACTIONS") == Some("true") {
            return true;
        }
        CI_MARKERS[1..].iter().any(|name| self.non_empty(name))
    }

    /// Whether the process runs inside Windows Subsystem for Linux.
    pub fn is_wsl(&self) -> bool {
        self.non_empty("WSL_DISTRO_NAME") || self.non_empty("WSLPATH")
    }

    /// Proxy settings present in the environment, in a fixed order.
    pub fn proxy_vars(&self) -> Vec<(String, String)> {
        PROXY_VARS
            .iter()
            .filter_map(|name| self.get(name).map(|v| (name.to_string(), v.to_string())))
            .collect()
    }

    /// The tool's state directory: `$MINIKUBE_HOME/.minikube`, or
    /// `~/.minikube` when unset. A `MINIKUBE_HOME` already ending in
    /// `.minikube` is used as-is.
    pub fn mini_path(&self) -> Option<PathBuf> {
        match self.get("MINIKUBE_HOME").filter(|v| !v.is_empty()) {
            Some(home) => {
                let home = PathBuf::from(home);
                if home.file_name().is_some_and(|n| n == ".minikube") {
                    Some(home)
                } else {
                    Some(home.join(".minikube"))
                }
            }
            None => dirs::home_dir().map(|h| h.join(".minikube")),
        }
    }
}

#[cfg(test)]
#[allow(unsafe_code)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn host(pairs: &[(&str, &str)]) -> HostEnv {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HostEnv::from_lookup(|name| map.get(name).cloned())
    }

    #[test]
    fn test_parse_bool_accepts_common_spellings() {
        for value in ["1", "true", "YES", "on"] {
            assert_eq!(parse_bool("X", value), Ok(true), "{value}");
        }
        for value in ["0", "false", "No", "off", ""] {
            assert_eq!(parse_bool("X", value), Ok(false), "{value}");
        }
        assert!(parse_bool("X", "maybe").is_err());
    }

    #[test]
    fn test_is_ci() {
        assert!(!host(&[]).is_ci());
        assert!(host(&[("CI", "true")]).is_ci());
        assert!(!host(&[("CI", "false")]).is_ci());
        assert!(host(&[("CI", "woodpecker")]).is_ci());
        assert!(host(&[("GITHUB_ACTIONS", "true")]).is_ci());
        assert!(!host(&[("GITHUB_ACTIONS", "")]).is_ci());
        assert!(host(&[("JENKINS_HOME", "/var/jenkins")]).is_ci());
    }

    #[test]
    fn test_is_wsl() {
        assert!(host(&[("WSL_DISTRO_NAME", "Ubuntu")]).is_wsl());
        assert!(host(&[("WSLPATH", "/mnt/c")]).is_wsl());
        assert!(!host(&[("WSL_DISTRO_NAME", "")]).is_wsl());
    }

    #[test]
    fn test_proxy_vars_in_fixed_order() {
        let env = host(&[("NO_PROXY", "localhost"), ("HTTP_PROXY", "http://p:3128")]);
        assert_eq!(
            env.proxy_vars(),
            vec![
                ("HTTP_PROXY".to_string(), "http://p:3128".to_string()),
                ("NO_PROXY".to_string(), "localhost".to_string()),
            ]
        );
    }

    #[test]
    fn test_mini_path_from_minikube_home() {
        let env = host(&[("MINIKUBE_HOME", "/data/home")]);
        assert_eq!(env.mini_path(), Some(PathBuf::from("/data/home/.minikube")));

        let env = host(&[("MINIKUBE_HOME", "/data/home/.minikube")]);
        assert_eq!(env.mini_path(), Some(PathBuf::from("/data/home/.minikube")));
    }

    #[test]
    fn test_unrelated_variables_are_not_captured() {
        let env = HostEnv::from_lookup(|name| (name == "PATH").then(|| "/bin".to_string()));
        assert_eq!(env.get("PATH"), None);
    }

    #[test]
    #[serial(process_env)]
    fn test_capture_reads_process_environment() {
        // SAFETY: serialized with every other test touching the environment
        unsafe { env::set_var("MINIKUBE_HOME", "/tmp/mkit-capture") };
        let captured = HostEnv::capture();
        // SAFETY: as above
        unsafe { env::remove_var("MINIKUBE_HOME") };

        assert_eq!(captured.get("MINIKUBE_HOME"), Some("/tmp/mkit-capture"));
        assert_eq!(
            captured.mini_path(),
            Some(PathBuf::from("/tmp/mkit-capture/.minikube"))
        );
    }
}
