//! Container runtime backed by a docker-compatible CLI.

use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use crate::error::SandboxError;
use crate::runtime::{
    ContainerRuntime, ContainerSpec, ContainerStats, ExecOutput, ExecRequest, NetworkInspection,
    NetworkSpec,
};
use crate::utils::process::{run_tool, run_tool_checked, ToolOutput};

/// Budget for short management commands (create, start, inspect...).
const COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Shells out to `docker` (or `podman`, which accepts the same arguments).
#[derive(Debug, Clone)]
pub struct CliRuntime {
    binary: String,
}

impl CliRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    async fn run(&self, args: &[String]) -> Result<ToolOutput, SandboxError> {
        let output = run_tool(&self.binary, args, Some(COMMAND_TIMEOUT)).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(classify_failure(&self.binary, &output))
        }
    }
}

/// Build the `create` arguments for a container spec.
pub fn create_args(spec: &ContainerSpec) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        spec.name.clone(),
        format!("--cpus={}", spec.cpu),
        format!("--memory={}m", spec.memory_mb),
        // No swap on top of the memory limit.
        format!("--memory-swap={}m", spec.memory_mb),
        format!("--pids-limit={}", spec.pids_limit),
        format!("--ulimit=nofile={}:{}", spec.nofile_limit, spec.nofile_limit),
        format!("--restart={}", spec.restart_policy.as_runtime_arg()),
    ];

    match spec.network {
        Some(ref attachment) => {
            args.push(format!("--network={}", attachment.network));
            if let Some(ref ip) = attachment.ip {
                args.push(format!("--ip={}", ip));
            }
        }
        None => args.push(format!("--network={}", spec.network_mode.as_runtime_arg())),
    }

    if spec.read_only_root {
        args.push("--read-only".to_string());
        // A read-only root still needs somewhere to write scratch files.
        args.push("--tmpfs=/tmp:rw,noexec,nosuid,size=64m".to_string());
    }

    if spec.no_new_privileges {
        args.push("--security-opt=no-new-privileges".to_string());
        args.push("--cap-drop=ALL".to_string());
    }

    for (key, value) in &spec.labels {
        args.push(format!("--label={}={}", key, value));
    }

    for (key, value) in &spec.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }

    for volume in &spec.volumes {
        let ro = if volume.read_only { ",readonly" } else { "" };
        args.push(format!(
            "--mount=type=bind,source={},target={}{}",
            volume.host_path, volume.container_path, ro
        ));
    }

    if let Some(ref dir) = spec.working_dir {
        args.push(format!("--workdir={}", dir));
    }

    if let Some(ref user) = spec.user {
        args.push(format!("--user={}", user));
    }

    args.push(spec.image.clone());
    args.extend(spec.command.iter().cloned());
    args
}

/// Build the `exec` arguments for a request.
pub fn exec_args(handle: &str, request: &ExecRequest) -> Vec<String> {
    let mut args = vec!["exec".to_string()];

    for (key, value) in &request.environment {
        args.push("-e".to_string());
        args.push(format!("{}={}", key, value));
    }
    if let Some(ref dir) = request.working_dir {
        args.push(format!("--workdir={}", dir));
    }
    if let Some(ref user) = request.user {
        args.push(format!("--user={}", user));
    }

    args.push(handle.to_string());
    args.extend(request.command.iter().cloned());
    args
}

/// Map a failed invocation onto the error taxonomy.
fn classify_failure(binary: &str, output: &ToolOutput) -> SandboxError {
    let stderr = output.stderr.trim();
    if is_missing_container(stderr) {
        SandboxError::ContainerNotFound(stderr.to_string())
    } else if stderr.is_empty() {
        SandboxError::tool_failure(binary, format!("exited with code {}", output.exit_code))
    } else {
        SandboxError::tool_failure(binary, stderr)
    }
}

fn is_missing_container(stderr: &str) -> bool {
    let lower = stderr.to_lowercase();
    lower.contains("no such container") || lower.contains("no such object")
}

/// Row printed by `stats --no-stream --format '{{json .}}'`.
#[derive(Debug, Deserialize)]
struct StatsRow {
    #[serde(rename = "CPUPerc", default)]
    cpu_perc: String,
    #[serde(rename = "MemUsage", default)]
    mem_usage: String,
    #[serde(rename = "NetIO", default)]
    net_io: String,
}

static SIZE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*([0-9]+(?:\.[0-9]+)?)\s*([A-Za-z]*)\s*$").expect("valid regex"));

/// Parse a human size such as `1.5MiB` or `12kB` into bytes.
pub fn parse_size(text: &str) -> Option<u64> {
    let caps = SIZE_RE.captures(text)?;
    let value: f64 = caps.get(1)?.as_str().parse().ok()?;
    let multiplier: f64 = match caps.get(2).map(|m| m.as_str()).unwrap_or("") {
        "" | "B" => 1.0,
        "kB" | "KB" => 1e3,
        "MB" => 1e6,
        "GB" => 1e9,
        "TB" => 1e12,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "TiB" => 1024.0 * 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    Some((value * multiplier).round() as u64)
}

/// Parse one `stats` JSON line.
pub fn parse_stats(line: &str) -> Result<ContainerStats, SandboxError> {
    let row: StatsRow = serde_json::from_str(line.trim())?;

    let cpu_percent = row
        .cpu_perc
        .trim()
        .trim_end_matches('%')
        .parse::<f64>()
        .unwrap_or(0.0);

    let memory_bytes = row
        .mem_usage
        .split('/')
        .next()
        .and_then(parse_size)
        .unwrap_or(0);

    let mut net = row.net_io.split('/').map(parse_size);
    let net_bytes_in = net.next().flatten().unwrap_or(0);
    let net_bytes_out = net.next().flatten().unwrap_or(0);

    Ok(ContainerStats {
        cpu_percent,
        memory_bytes,
        net_bytes_in,
        net_bytes_out,
    })
}

#[async_trait]
impl ContainerRuntime for CliRuntime {
    fn name(&self) -> &str {
        &self.binary
    }

    async fn is_available(&self) -> bool {
        run_tool(&self.binary, &["version"], Some(Duration::from_secs(10)))
            .await
            .map(|o| o.success())
            .unwrap_or(false)
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, SandboxError> {
        let output = self.run(&create_args(spec)).await?;
        let handle = output.stdout.trim().to_string();
        if handle.is_empty() {
            return Err(SandboxError::tool_failure(
                &self.binary,
                "create returned no container id",
            ));
        }
        Ok(handle)
    }

    async fn start_container(&self, handle: &str) -> Result<(), SandboxError> {
        self.run(&["start".to_string(), handle.to_string()]).await?;
        Ok(())
    }

    async fn stop_container(&self, handle: &str, grace: Duration) -> Result<(), SandboxError> {
        self.run(&[
            "stop".to_string(),
            format!("--time={}", grace.as_secs()),
            handle.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove_container(&self, handle: &str) -> Result<(), SandboxError> {
        self.run(&[
            "rm".to_string(),
            "--force".to_string(),
            "--volumes".to_string(),
            handle.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn pause_container(&self, handle: &str) -> Result<(), SandboxError> {
        self.run(&["pause".to_string(), handle.to_string()]).await?;
        Ok(())
    }

    async fn unpause_container(&self, handle: &str) -> Result<(), SandboxError> {
        self.run(&["unpause".to_string(), handle.to_string()]).await?;
        Ok(())
    }

    async fn container_pid(&self, handle: &str) -> Result<Option<u32>, SandboxError> {
        let output = self
            .run(&[
                "inspect".to_string(),
                "--format={{.State.Pid}}".to_string(),
                handle.to_string(),
            ])
            .await?;
        Ok(output
            .stdout
            .trim()
            .parse::<u32>()
            .ok()
            .filter(|pid| *pid != 0))
    }

    async fn exec(&self, handle: &str, request: &ExecRequest) -> Result<ExecOutput, SandboxError> {
        let output = run_tool(&self.binary, &exec_args(handle, request), Some(request.timeout)).await?;
        if !output.success() && is_missing_container(&output.stderr) {
            return Err(SandboxError::ContainerNotFound(output.stderr.trim().to_string()));
        }
        Ok(output)
    }

    async fn stats(&self, handle: &str) -> Result<ContainerStats, SandboxError> {
        let output = self
            .run(&[
                "stats".to_string(),
                "--no-stream".to_string(),
                "--format={{json .}}".to_string(),
                handle.to_string(),
            ])
            .await?;
        let line = output.stdout.lines().next().unwrap_or_default();
        parse_stats(line)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> Result<String, SandboxError> {
        let mut args = vec![
            "network".to_string(),
            "create".to_string(),
            "--driver=bridge".to_string(),
            format!("--subnet={}", spec.subnet),
            format!("--gateway={}", spec.gateway),
        ];
        if spec.internal {
            args.push("--internal".to_string());
        }
        for (key, value) in &spec.labels {
            args.push(format!("--label={}={}", key, value));
        }
        args.push(spec.name.clone());

        let output = self.run(&args).await?;
        Ok(output.stdout.trim().to_string())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        ip: Option<&str>,
    ) -> Result<(), SandboxError> {
        let mut args = vec!["network".to_string(), "connect".to_string()];
        if let Some(ip) = ip {
            args.push(format!("--ip={}", ip));
        }
        args.push(network.to_string());
        args.push(container.to_string());
        self.run(&args).await?;
        Ok(())
    }

    async fn disconnect_network(&self, network: &str, container: &str) -> Result<(), SandboxError> {
        self.run(&[
            "network".to_string(),
            "disconnect".to_string(),
            "--force".to_string(),
            network.to_string(),
            container.to_string(),
        ])
        .await?;
        Ok(())
    }

    async fn remove_network(&self, network: &str) -> Result<(), SandboxError> {
        run_tool_checked(&self.binary, &["network", "rm", network], Some(COMMAND_TIMEOUT)).await?;
        Ok(())
    }

    async fn inspect_network(&self, network: &str) -> Result<NetworkInspection, SandboxError> {
        let output = self
            .run(&[
                "network".to_string(),
                "inspect".to_string(),
                "--format={{len .Containers}}".to_string(),
                network.to_string(),
            ])
            .await?;
        Ok(NetworkInspection {
            connected_containers: output.stdout.trim().parse().unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::types::{NetworkMode, SandboxConfig, VolumeMount};
    use crate::runtime::NetworkAttachment;

    #[test]
    fn test_create_args() {
        let config = SandboxConfig::new("t1", "alpine:3.19")
            .with_env("LANG", "C")
            .with_volume(VolumeMount::read_only("/srv/data", "/data"));
        let args = create_args(&ContainerSpec::from_config(&config));

        assert_eq!(&args[..3], &["create", "--name", "sbx-t1"]);
        assert!(args.contains(&"--cpus=1".to_string()));
        assert!(args.contains(&"--memory=512m".to_string()));
        assert!(args.contains(&"--network=none".to_string()));
        assert!(args.contains(&"--read-only".to_string()));
        assert!(args.contains(&"--cap-drop=ALL".to_string()));
        assert!(args.contains(&"LANG=C".to_string()));
        assert!(args.contains(&"--mount=type=bind,source=/srv/data,target=/data,readonly".to_string()));

        let image_pos = args.iter().position(|a| a == "alpine:3.19").unwrap();
        assert_eq!(&args[image_pos + 1..], &["sleep", "infinity"]);
    }

    #[test]
    fn test_create_args_join_sandbox_network() {
        let config = SandboxConfig::new("t2", "alpine:3.19").with_network_mode(NetworkMode::Isolated);
        let spec = ContainerSpec::from_config(&config).with_network(Some(NetworkAttachment {
            network: "sbx-net-t2".to_string(),
            ip: Some("10.200.1.2".to_string()),
        }));
        let args = create_args(&spec);

        assert!(args.contains(&"--network=sbx-net-t2".to_string()));
        assert!(args.contains(&"--ip=10.200.1.2".to_string()));
        assert!(!args.contains(&"--network=none".to_string()));
    }

    #[test]
    fn test_exec_args() {
        let request = ExecRequest {
            command: vec!["sh".into(), "-c".into(), "echo hi".into()],
            environment: vec![("X".into(), "1".into())],
            working_dir: Some("/workspace".into()),
            user: None,
            timeout: Duration::from_secs(5),
        };
        let args = exec_args("abc123", &request);
        assert_eq!(
            args,
            vec!["exec", "-e", "X=1", "--workdir=/workspace", "abc123", "sh", "-c", "echo hi"]
        );
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("0B"), Some(0));
        assert_eq!(parse_size("12kB"), Some(12_000));
        assert_eq!(parse_size(" 1.5MiB "), Some(1_572_864));
        assert_eq!(parse_size("2GiB"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_size("lots"), None);
        assert_eq!(parse_size("3XB"), None);
    }

    #[test]
    fn test_parse_stats_line() {
        let line = r#"{"BlockIO":"0B / 0B","CPUPerc":"37.50%","Container":"abc","MemUsage":"256MiB / 512MiB","NetIO":"1.2kB / 648B","PIDs":"3"}"#;
        let stats = parse_stats(line).unwrap();
        assert_eq!(stats.cpu_percent, 37.5);
        assert_eq!(stats.memory_bytes, 256 * 1024 * 1024);
        assert_eq!(stats.net_bytes_in, 1200);
        assert_eq!(stats.net_bytes_out, 648);
    }

    #[test]
    fn test_classify_missing_container() {
        let output = ToolOutput {
            stdout: String::new(),
            stderr: "Error response from daemon: No such container: sbx-x".to_string(),
            exit_code: 1,
        };
        assert!(classify_failure("docker", &output).is_container_gone());

        let output = ToolOutput {
            stdout: String::new(),
            stderr: "permission denied".to_string(),
            exit_code: 1,
        };
        assert!(matches!(
            classify_failure("docker", &output),
            SandboxError::ExternalToolFailure { .. }
        ));
    }
}
