//! Sandbox wrapper abstraction: shapes a subprocess command for resource isolation
//! (SPEC_FULL.md §4.6), mirroring the polymorphic provider pattern this runtime uses
//! elsewhere for pluggable external collaborators.

use std::time::Duration;

use tracing::{instrument, warn};

/// Isolation strength, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SandboxLevel {
    None,
    Ulimit,
    Docker,
}

impl std::fmt::Display for SandboxLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Ulimit => write!(f, "ulimit"),
            Self::Docker => write!(f, "docker"),
        }
    }
}

/// Shapes `(binary, args)` into the command actually handed to `tokio::process::Command`.
pub trait SandboxWrapper: Send + Sync {
    fn level(&self) -> SandboxLevel;
    fn wrap(&self, binary: &str, args: &[String]) -> (String, Vec<String>);
}

/// No isolation: runs the binary directly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoSandbox;

impl SandboxWrapper for NoSandbox {
    fn level(&self) -> SandboxLevel {
        SandboxLevel::None
    }

    fn wrap(&self, binary: &str, args: &[String]) -> (String, Vec<String>) {
        (binary.to_string(), args.to_vec())
    }
}

/// Single-quotes a shell word, escaping embedded single quotes as `'\''`.
fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', "'\\''"))
}

/// Resource-limits the child via `ulimit` in a wrapping `sh -c`.
pub struct UlimitSandbox {
    pub virtual_mem_kb: u64,
    pub cpu_seconds: u64,
    pub file_size_kb: u64,
}

impl Default for UlimitSandbox {
    fn default() -> Self {
        Self {
            virtual_mem_kb: 2 * 1024 * 1024, // 2 GB
            cpu_seconds: 300,
            file_size_kb: 100 * 1024, // 100 MB
        }
    }
}

impl SandboxWrapper for UlimitSandbox {
    fn level(&self) -> SandboxLevel {
        SandboxLevel::Ulimit
    }

    fn wrap(&self, binary: &str, args: &[String]) -> (String, Vec<String>) {
        let mut command = format!(
            "ulimit -v {} -t {} -f {}; exec {}",
            self.virtual_mem_kb,
            self.cpu_seconds,
            self.file_size_kb,
            shell_quote(binary)
        );
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        ("sh".to_string(), vec!["-c".to_string(), command])
    }
}

/// Runs the child inside an ephemeral, network-isolated Docker container.
pub struct DockerSandbox {
    pub image: String,
    pub memory: String,
    pub cpus: String,
    pub workdir: String,
}

impl Default for DockerSandbox {
    fn default() -> Self {
        Self {
            image: "ubuntu:22.04".to_string(),
            memory: "2g".to_string(),
            cpus: "2".to_string(),
            workdir: ".".to_string(),
        }
    }
}

impl SandboxWrapper for DockerSandbox {
    fn level(&self) -> SandboxLevel {
        SandboxLevel::Docker
    }

    fn wrap(&self, binary: &str, args: &[String]) -> (String, Vec<String>) {
        let mut docker_args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--network=none".to_string(),
            format!("--memory={}", self.memory),
            format!("--cpus={}", self.cpus),
            "-v".to_string(),
            format!("{}:/workspace:ro", self.workdir),
            "-w".to_string(),
            "/workspace".to_string(),
            self.image.clone(),
            binary.to_string(),
        ];
        docker_args.extend(args.iter().cloned());
        ("docker".to_string(), docker_args)
    }
}

/// Probes for the strongest available isolation, preferring Docker, then Ulimit,
/// falling back to no isolation. The Docker probe is capped at 50ms.
#[instrument]
pub async fn detect() -> Box<dyn SandboxWrapper> {
    let probe = tokio::process::Command::new("docker")
        .arg("info")
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status();

    match tokio::time::timeout(Duration::from_millis(50), probe).await {
        Ok(Ok(status)) if status.success() => Box::new(DockerSandbox::default()),
        Ok(Ok(_)) => {
            warn!("docker info returned non-zero, falling back to ulimit sandbox");
            Box::new(UlimitSandbox::default())
        }
        Ok(Err(e)) => {
            warn!(error = %e, "docker probe failed to spawn, falling back to ulimit sandbox");
            Box::new(UlimitSandbox::default())
        }
        Err(_) => {
            warn!("docker probe timed out after 50ms, falling back to ulimit sandbox");
            Box::new(UlimitSandbox::default())
        }
    }
}
