//! Capability predicates derived from the start arguments and the host.
//!
//! Tests gate their skip decisions on these. Everything here is computed
//! once into a [`CapabilitySet`] and never mutated.

use std::fmt;

use crate::config::{HostEnv, InvocationConfig};

/// Backend providing the node's execution environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverFamily {
    None,
    Docker,
    Podman,
    HyperV,
    Kvm2,
    VirtualBox,
    Other,
}

impl DriverFamily {
    fn from_name(name: &str) -> Self {
        match name {
            "none" => DriverFamily::None,
            "docker" => DriverFamily::Docker,
            "podman" => DriverFamily::Podman,
            "hyperv" => DriverFamily::HyperV,
            "kvm2" => DriverFamily::Kvm2,
            "virtualbox" => DriverFamily::VirtualBox,
            _ => DriverFamily::Other,
        }
    }

    /// Drivers whose node is itself a container on the host.
    pub fn is_kic(self) -> bool {
        matches!(self, DriverFamily::Docker | DriverFamily::Podman)
    }

    /// The driver-native CLI usable for inspecting the node container.
    pub fn native_cli(self) -> Option<&'static str> {
        match self {
            DriverFamily::Docker => Some("docker"),
            DriverFamily::Podman => Some("podman"),
            _ => None,
        }
    }
}

/// Container runtime requested with `--container-runtime=`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ContainerRuntime {
    Docker,
    Containerd,
    Crio,
    Other(String),
    Unset,
}

impl ContainerRuntime {
    fn from_name(name: &str) -> Self {
        match name {
            "docker" => ContainerRuntime::Docker,
            "containerd" => ContainerRuntime::Containerd,
            "crio" | "cri-o" => ContainerRuntime::Crio,
            "" => ContainerRuntime::Unset,
            other => ContainerRuntime::Other(other.to_string()),
        }
    }

    /// Tag as passed to the tool; empty when unset.
    pub fn as_str(&self) -> &str {
        match self {
            ContainerRuntime::Docker => "docker",
            ContainerRuntime::Containerd => "containerd",
            ContainerRuntime::Crio => "crio",
            ContainerRuntime::Other(name) => name,
            ContainerRuntime::Unset => "",
        }
    }

    /// The runtime the tool actually uses, which defaults to docker.
    pub fn effective(&self) -> ContainerRuntime {
        match self {
            ContainerRuntime::Unset => ContainerRuntime::Docker,
            other => other.clone(),
        }
    }
}

impl fmt::Display for ContainerRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    Amd64,
    Arm64,
    Other,
}

impl Arch {
    pub fn from_target(arch: &str) -> Self {
        match arch {
            "x86_64" => Arch::Amd64,
            "aarch64" => Arch::Arm64,
            _ => Arch::Other,
        }
    }

    pub fn host() -> Self {
        Self::from_target(std::env::consts::ARCH)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostOs {
    Linux,
    MacOs,
    Windows,
    Other,
}

impl HostOs {
    pub fn from_target(os: &str) -> Self {
        match os {
            "linux" => HostOs::Linux,
            "macos" => HostOs::MacOs,
            "windows" => HostOs::Windows,
            _ => HostOs::Other,
        }
    }

    pub fn host() -> Self {
        Self::from_target(std::env::consts::OS)
    }
}

/// Facts about the driver, runtime and host for one test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilitySet {
    pub driver: DriverFamily,
    pub runtime: ContainerRuntime,
    pub rootless: bool,
    pub kic_base_image: bool,
    pub os: HostOs,
    pub arch: Arch,
    pub wsl: bool,
    pub ci: bool,
}

impl CapabilitySet {
    /// Derive capabilities for the current host.
    pub fn detect(config: &InvocationConfig) -> Self {
        Self::derive(&config.start_args, &config.host, HostOs::host(), Arch::host())
    }

    /// Derive capabilities from explicit inputs.
    pub fn derive(start_args: &str, host: &HostEnv, os: HostOs, arch: Arch) -> Self {
        let tokens: Vec<&str> = start_args.split_whitespace().collect();

        let driver = tokens
            .iter()
            .filter_map(|t| {
                t.strip_prefix("--driver=")
                    .or_else(|| t.strip_prefix("--vm-driver="))
            })
            .last()
            .map(DriverFamily::from_name)
            .unwrap_or(DriverFamily::Other);

        let runtime = tokens
            .iter()
            .find_map(|t| t.strip_prefix("--container-runtime="))
            .map(ContainerRuntime::from_name)
            .unwrap_or(ContainerRuntime::Unset);

        Self {
            driver,
            runtime,
            rootless: tokens.iter().any(|t| t.starts_with("--rootless")),
            kic_base_image: start_args.contains("base-image"),
            os,
            arch,
            wsl: host.is_wsl(),
            ci: host.is_ci(),
        }
    }

    pub fn none_driver(&self) -> bool {
        self.driver == DriverFamily::None
    }

    pub fn docker_driver(&self) -> bool {
        self.driver == DriverFamily::Docker
    }

    pub fn podman_driver(&self) -> bool {
        self.driver == DriverFamily::Podman
    }

    pub fn hyperv_driver(&self) -> bool {
        self.driver == DriverFamily::HyperV
    }

    pub fn virtualbox_driver(&self) -> bool {
        self.driver == DriverFamily::VirtualBox
    }

    pub fn kic_driver(&self) -> bool {
        self.driver.is_kic()
    }

    /// Neither a container-based driver nor `none`.
    pub fn vm_driver(&self) -> bool {
        !self.kic_driver() && !self.none_driver()
    }

    pub fn rootless_driver(&self) -> bool {
        self.rootless
    }

    /// Whether cluster endpoints are only reachable through 127.0.0.1 port
    /// forwards: KIC drivers on Windows or macOS, WSL, or rootless KIC.
    pub fn needs_port_forward(&self) -> bool {
        (self.kic_driver() && matches!(self.os, HostOs::Windows | HostOs::MacOs))
            || self.wsl
            || self.rootless
    }

    pub fn container_runtime(&self) -> &ContainerRuntime {
        &self.runtime
    }

    pub fn arm64_platform(&self) -> bool {
        self.arch == Arch::Arm64
    }

    pub fn is_ci(&self) -> bool {
        self.ci
    }

    /// Whether the run overrides the KIC base image.
    pub fn testing_kic_base_image(&self) -> bool {
        self.kic_base_image
    }
}
