//! Container daemon integration
//!
//! The orchestrator reaches the daemon through the [`DockerClient`] trait so
//! the scheduler and extender can be exercised against fakes. The production
//! implementation, [`CliDocker`], shells out to the `docker` CLI (or any
//! CLI-compatible runtime such as podman) from blocking tasks, streaming
//! long-running output line by line into the log.

use crate::errors::{DockerError, Result};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Options for a daemon-side image build.
#[derive(Debug, Clone, Default)]
pub struct ImageBuildOptions {
    /// Dockerfile name inside the build context
    pub dockerfile: String,
    /// Tags applied to the result
    pub tags: Vec<String>,
    /// Remove intermediate containers
    pub remove: bool,
    /// Build arguments
    pub build_args: HashMap<String, String>,
}

/// Options for creating a phase container.
#[derive(Debug, Clone, Default)]
pub struct ContainerCreateOptions {
    pub image: String,
    pub cmd: Vec<String>,
    /// KEY=VALUE pairs
    pub env: Vec<String>,
    /// source:target bind specs
    pub binds: Vec<String>,
    /// network mode; empty for the daemon default
    pub network: String,
    /// container user; None keeps the image default
    pub user: Option<String>,
}

/// Container daemon client abstraction.
#[allow(async_fn_in_trait)]
pub trait DockerClient {
    /// Health check for daemon availability
    async fn ping(&self) -> Result<()>;

    /// Remove a named volume; a missing volume is not an error
    async fn volume_remove(&self, name: &str, force: bool) -> Result<()>;

    /// Build an image from a tar build context, streaming daemon output to
    /// the log. The output stream is fully drained before this returns.
    async fn image_build(&self, context: Vec<u8>, options: ImageBuildOptions) -> Result<()>;

    /// Operating system the image was built for
    async fn image_os(&self, image: &str) -> Result<String>;

    /// Content digest of a daemon-side image
    async fn image_digest(&self, image: &str) -> Result<String>;

    /// Topmost diff ID of the image's layer stack
    async fn image_top_layer(&self, image: &str) -> Result<String>;

    /// Config labels of an image
    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>>;

    /// Export an image as a tar stream
    async fn image_save(&self, image: &str) -> Result<Vec<u8>>;

    /// Remove an image; a missing image is not an error when forced
    async fn image_remove(&self, image: &str, force: bool) -> Result<()>;

    /// Create a container, returning its id
    async fn container_create(&self, options: &ContainerCreateOptions) -> Result<String>;

    /// Copy a tar stream into a container directory
    async fn copy_to_container(&self, id: &str, dest: &str, tar: Vec<u8>) -> Result<()>;

    /// Copy a container path out as a tar stream
    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>>;

    /// Start a created container, stream its output with the given log
    /// prefix, and return its exit code
    async fn container_run(&self, id: &str, log_prefix: &str) -> Result<i64>;

    /// Remove a container; a missing container is not an error when forced
    async fn container_remove(&self, id: &str, force: bool) -> Result<()>;
}

/// CLI-backed daemon client.
#[derive(Debug, Clone)]
pub struct CliDocker {
    runtime_path: String,
}

impl CliDocker {
    pub fn new() -> Self {
        Self {
            runtime_path: "docker".to_string(),
        }
    }

    pub fn with_runtime_path(runtime_path: String) -> Self {
        Self { runtime_path }
    }

    /// Run a docker command to completion, capturing stdout.
    fn exec_capture(runtime_path: &str, args: &[String]) -> Result<Vec<u8>> {
        debug!("executing: {} {}", runtime_path, args.join(" "));
        let output = Command::new(runtime_path)
            .args(args)
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DockerError::NotInstalled,
                _ => DockerError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(DockerError::CliError(stderr).into());
        }
        Ok(output.stdout)
    }

    /// Run a docker command, optionally feeding stdin, streaming stdout and
    /// stderr lines through the log. Returns the child's exit code.
    fn exec_streaming(
        runtime_path: &str,
        args: &[String],
        stdin: Option<Vec<u8>>,
        log_prefix: &str,
    ) -> Result<i64> {
        debug!("executing: {} {}", runtime_path, args.join(" "));
        let mut command = Command::new(runtime_path);
        command
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if stdin.is_some() {
            command.stdin(Stdio::piped());
        }

        let mut child = command.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DockerError::NotInstalled,
            _ => DockerError::Io(e),
        })?;

        // feed stdin from a separate thread so a chatty child cannot
        // deadlock against a full pipe
        let writer = stdin.map(|bytes| {
            let mut handle = child.stdin.take().expect("stdin was requested");
            std::thread::spawn(move || {
                let _ = handle.write_all(&bytes);
            })
        });

        let stderr = child.stderr.take().expect("stderr was requested");
        let stderr_prefix = log_prefix.to_string();
        let stderr_reader = std::thread::spawn(move || {
            let mut tail = String::new();
            for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                info!("[{}] {}", stderr_prefix, line);
                tail = line;
            }
            tail
        });

        let stdout = child.stdout.take().expect("stdout was requested");
        for line in BufReader::new(stdout).lines().map_while(|l| l.ok()) {
            info!("[{}] {}", log_prefix, line);
        }

        if let Some(writer) = writer {
            let _ = writer.join();
        }
        let stderr_tail = stderr_reader.join().unwrap_or_default();

        let status = child.wait().map_err(DockerError::Io)?;
        let code = i64::from(status.code().unwrap_or(-1));
        if code != 0 && !stderr_tail.is_empty() {
            debug!("[{}] exited {}: {}", log_prefix, code, stderr_tail);
        }
        Ok(code)
    }

    async fn capture(&self, args: Vec<String>) -> Result<Vec<u8>> {
        let runtime_path = self.runtime_path.clone();
        tokio::task::spawn_blocking(move || Self::exec_capture(&runtime_path, &args))
            .await
            .map_err(|e| DockerError::CliError(format!("task join error: {}", e)))?
    }

    async fn streaming(
        &self,
        args: Vec<String>,
        stdin: Option<Vec<u8>>,
        log_prefix: String,
    ) -> Result<i64> {
        let runtime_path = self.runtime_path.clone();
        tokio::task::spawn_blocking(move || {
            Self::exec_streaming(&runtime_path, &args, stdin, &log_prefix)
        })
        .await
        .map_err(|e| DockerError::CliError(format!("task join error: {}", e)))?
    }

    fn inspect_format(image: &str, format: &str) -> Vec<String> {
        vec![
            "image".to_string(),
            "inspect".to_string(),
            "--format".to_string(),
            format.to_string(),
            image.to_string(),
        ]
    }
}

impl Default for CliDocker {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) fn is_not_found(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("no such") || lower.contains("not found") || lower.contains("could not find")
}

impl DockerClient for CliDocker {
    async fn ping(&self) -> Result<()> {
        self.capture(vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ])
        .await
        .map(|_| ())
    }

    async fn volume_remove(&self, name: &str, force: bool) -> Result<()> {
        let mut args = vec!["volume".to_string(), "rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(name.to_string());

        match self.capture(args).await {
            Ok(_) => Ok(()),
            Err(crate::errors::KilnError::Docker(DockerError::CliError(msg)))
                if is_not_found(&msg) =>
            {
                debug!("volume {} already removed", name);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn image_build(&self, context: Vec<u8>, options: ImageBuildOptions) -> Result<()> {
        let mut args = vec!["build".to_string()];
        if !options.dockerfile.is_empty() {
            args.push("--file".to_string());
            args.push(options.dockerfile.clone());
        }
        for tag in &options.tags {
            args.push("--tag".to_string());
            args.push(tag.clone());
        }
        if options.remove {
            args.push("--force-rm".to_string());
        }
        let mut build_args: Vec<_> = options.build_args.iter().collect();
        build_args.sort();
        for (key, value) in build_args {
            args.push("--build-arg".to_string());
            args.push(format!("{}={}", key, value));
        }
        // read the build context from stdin
        args.push("-".to_string());

        let code = self
            .streaming(args, Some(context), "extender".to_string())
            .await?;
        if code != 0 {
            return Err(DockerError::CliError(format!("image build exited {}", code)).into());
        }
        Ok(())
    }

    async fn image_os(&self, image: &str) -> Result<String> {
        let out = self.capture(Self::inspect_format(image, "{{.Os}}")).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn image_digest(&self, image: &str) -> Result<String> {
        let out = self.capture(Self::inspect_format(image, "{{.Id}}")).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn image_top_layer(&self, image: &str) -> Result<String> {
        let out = self
            .capture(Self::inspect_format(image, "{{json .RootFS.Layers}}"))
            .await?;
        let layers: Vec<String> = serde_json::from_slice(&out)
            .map_err(|e| DockerError::CliError(format!("parsing image layers: {}", e)))?;
        layers.last().cloned().ok_or_else(|| {
            DockerError::CliError(format!("image {} has no layers", image)).into()
        })
    }

    async fn image_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        let out = self
            .capture(Self::inspect_format(image, "{{json .Config.Labels}}"))
            .await?;
        let labels: Option<HashMap<String, String>> = serde_json::from_slice(&out)
            .map_err(|e| DockerError::CliError(format!("parsing image labels: {}", e)))?;
        Ok(labels.unwrap_or_default())
    }

    async fn image_save(&self, image: &str) -> Result<Vec<u8>> {
        self.capture(vec!["save".to_string(), image.to_string()])
            .await
    }

    async fn image_remove(&self, image: &str, force: bool) -> Result<()> {
        let mut args = vec!["rmi".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(image.to_string());

        match self.capture(args).await {
            Ok(_) => Ok(()),
            Err(crate::errors::KilnError::Docker(DockerError::CliError(msg)))
                if force && is_not_found(&msg) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn container_create(&self, options: &ContainerCreateOptions) -> Result<String> {
        let mut args = vec!["create".to_string()];
        for bind in &options.binds {
            args.push("--volume".to_string());
            args.push(bind.clone());
        }
        for env in &options.env {
            args.push("--env".to_string());
            args.push(env.clone());
        }
        if !options.network.is_empty() {
            args.push("--network".to_string());
            args.push(options.network.clone());
        }
        if let Some(ref user) = options.user {
            args.push("--user".to_string());
            args.push(user.clone());
        }
        args.push(options.image.clone());
        args.extend(options.cmd.iter().cloned());

        let out = self.capture(args).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn copy_to_container(&self, id: &str, dest: &str, tar: Vec<u8>) -> Result<()> {
        let args = vec![
            "cp".to_string(),
            "-".to_string(),
            format!("{}:{}", id, dest),
        ];
        let code = self.streaming(args, Some(tar), "copy".to_string()).await?;
        if code != 0 {
            return Err(DockerError::CliError(format!("copy into {} exited {}", id, code)).into());
        }
        Ok(())
    }

    async fn copy_from_container(&self, id: &str, path: &str) -> Result<Vec<u8>> {
        self.capture(vec![
            "cp".to_string(),
            format!("{}:{}", id, path),
            "-".to_string(),
        ])
        .await
    }

    async fn container_run(&self, id: &str, log_prefix: &str) -> Result<i64> {
        // start --attach forwards the container's exit code
        let args = vec![
            "start".to_string(),
            "--attach".to_string(),
            id.to_string(),
        ];
        self.streaming(args, None, log_prefix.to_string()).await
    }

    async fn container_remove(&self, id: &str, force: bool) -> Result<()> {
        let mut args = vec!["rm".to_string()];
        if force {
            args.push("--force".to_string());
        }
        args.push(id.to_string());

        match self.capture(args).await {
            Ok(_) => Ok(()),
            Err(crate::errors::KilnError::Docker(DockerError::CliError(msg)))
                if force && is_not_found(&msg) =>
            {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_not_found() {
        assert!(is_not_found("Error: No such volume: pack-cache-abc"));
        assert!(is_not_found("Error response from daemon: no such container"));
        assert!(!is_not_found("permission denied"));
    }

    #[test]
    fn test_build_args_are_deterministic() {
        let mut options = ImageBuildOptions {
            dockerfile: "Dockerfile".to_string(),
            tags: vec!["t".to_string()],
            remove: true,
            build_args: HashMap::new(),
        };
        options
            .build_args
            .insert("base_image".to_string(), "builder".to_string());
        // exercised indirectly; the sort in image_build keeps repeated
        // invocations byte-identical for the daemon cache
        let mut entries: Vec<_> = options.build_args.iter().collect();
        entries.sort();
        assert_eq!(entries[0].0, "base_image");
    }

    #[test]
    fn test_inspect_format_shape() {
        let args = CliDocker::inspect_format("app:latest", "{{.Os}}");
        assert_eq!(
            args,
            vec!["image", "inspect", "--format", "{{.Os}}", "app:latest"]
        );
    }
}
