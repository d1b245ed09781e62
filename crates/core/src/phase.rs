//! Phase configuration and execution
//!
//! Each lifecycle phase runs in its own container described by an immutable
//! [`PhaseConfig`]. Configs are assembled by applying a sequence of
//! composable [`PhaseOp`]s; conditional wiring uses [`if_op`], which yields
//! the operation or a no-op. The [`PhaseFactory`] seam turns a finished
//! config into something runnable, so the scheduler can be exercised with
//! recording fakes.

use crate::archive;
use crate::archive::FileFilter;
use crate::auth::REGISTRY_AUTH_ENV;
use crate::docker::{is_not_found, ContainerCreateOptions, DockerClient};
use crate::errors::{DockerError, KilnError, PhaseError, Result};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::debug;

/// Default location of the daemon socket bound for daemon-access phases.
const DEFAULT_DOCKER_SOCKET: &str = "/var/run/docker.sock";

/// A file operation performed inside the container before it starts.
#[derive(Clone)]
pub enum ContainerOp {
    /// Archive a host directory and unpack it at `dest`, owned `uid:gid`.
    CopyDir {
        src: PathBuf,
        dest: String,
        uid: u64,
        gid: u64,
        filter: Option<FileFilter>,
    },
    /// Write a file at `path` with the given contents, owned `uid:gid`.
    WriteFile {
        path: String,
        contents: String,
        uid: u64,
        gid: u64,
    },
    /// Normalize ownership of the named mounted directories.
    EnsureVolumeAccess {
        dirs: Vec<String>,
        uid: u64,
        gid: u64,
    },
}

impl std::fmt::Debug for ContainerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerOp::CopyDir { src, dest, .. } => f
                .debug_struct("CopyDir")
                .field("src", src)
                .field("dest", dest)
                .finish_non_exhaustive(),
            ContainerOp::WriteFile { path, .. } => {
                f.debug_struct("WriteFile").field("path", path).finish_non_exhaustive()
            }
            ContainerOp::EnsureVolumeAccess { dirs, .. } => f
                .debug_struct("EnsureVolumeAccess")
                .field("dirs", dirs)
                .finish_non_exhaustive(),
        }
    }
}

/// An operation performed after the container exited successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostOp {
    /// Normalize ownership of mounted directories; must precede copy-outs
    /// that read from the managed volumes.
    EnsureVolumeAccess {
        dirs: Vec<String>,
        uid: u64,
        gid: u64,
    },
    /// Copy `src` out into host directory `dest`; missing source is fatal.
    CopyOutTo { src: String, dest: PathBuf },
    /// Copy `src` out into host directory `dest`; missing source is skipped.
    CopyOutToMaybe { src: String, dest: PathBuf },
}

/// Immutable description of one phase container.
#[derive(Debug, Clone, Default)]
pub struct PhaseConfig {
    /// lifecycle binary name, e.g. "creator"
    pub name: String,
    pub log_prefix: String,
    pub image: String,
    pub flags: Vec<String>,
    pub args: Vec<String>,
    /// KEY=VALUE pairs; later writers win per key
    pub env: Vec<String>,
    pub binds: Vec<String>,
    pub network: String,
    /// container user; None keeps the image default
    pub user: Option<String>,
    pub pre_ops: Vec<ContainerOp>,
    pub post_ops: Vec<PostOp>,
}

/// A composable transformation of a [`PhaseConfig`].
#[derive(Debug, Clone)]
pub enum PhaseOp {
    Null,
    Flags(Vec<String>),
    Args(Vec<String>),
    Env(Vec<String>),
    Binds(Vec<String>),
    Network(String),
    Image(String),
    LogPrefix(String),
    /// run the phase as root
    Root,
    /// run the phase as an explicit unprivileged user
    User(String),
    /// root plus access to the daemon the orchestrator talks to
    DaemonAccess(String),
    /// registry credentials serialized for the lifecycle
    RegistryAccess(String),
    ContainerOps(Vec<ContainerOp>),
    PostOps(Vec<PostOp>),
}

/// The conditional combinator: the operation when `pred` holds, else a no-op.
pub fn if_op(pred: bool, op: PhaseOp) -> PhaseOp {
    if pred {
        op
    } else {
        PhaseOp::Null
    }
}

impl PhaseConfig {
    pub fn new(name: impl Into<String>, image: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            log_prefix: name.clone(),
            name,
            image: image.into(),
            ..Default::default()
        }
    }

    /// Apply operations in order. Lists append; scalars are last-writer-wins.
    pub fn apply(mut self, ops: Vec<PhaseOp>) -> Self {
        for op in ops {
            match op {
                PhaseOp::Null => {}
                PhaseOp::Flags(flags) => self.flags.extend(flags),
                PhaseOp::Args(args) => self.args.extend(args),
                PhaseOp::Env(env) => self.env.extend(env),
                PhaseOp::Binds(binds) => self.binds.extend(binds),
                PhaseOp::Network(network) => self.network = network,
                PhaseOp::Image(image) => self.image = image,
                PhaseOp::LogPrefix(prefix) => self.log_prefix = prefix,
                PhaseOp::Root => self.user = Some("root".to_string()),
                PhaseOp::User(user) => self.user = Some(user),
                PhaseOp::DaemonAccess(docker_host) => {
                    self.user = Some("root".to_string());
                    if docker_host.is_empty() || docker_host == "inherit" {
                        self.binds.push(format!(
                            "{}:{}",
                            DEFAULT_DOCKER_SOCKET, DEFAULT_DOCKER_SOCKET
                        ));
                    } else if let Some(path) = docker_host.strip_prefix("unix://") {
                        self.binds
                            .push(format!("{}:{}", path, DEFAULT_DOCKER_SOCKET));
                    } else {
                        self.env.push(format!("DOCKER_HOST={}", docker_host));
                    }
                }
                PhaseOp::RegistryAccess(value) => {
                    self.env.push(format!("{}={}", REGISTRY_AUTH_ENV, value));
                }
                PhaseOp::ContainerOps(ops) => self.pre_ops.extend(ops),
                PhaseOp::PostOps(ops) => self.post_ops.extend(ops),
            }
        }
        self
    }

    /// The container command: lifecycle binary, then flags, then args.
    pub fn command(&self) -> Vec<String> {
        let mut cmd = vec![format!("/cnb/lifecycle/{}", self.name)];
        cmd.extend(self.flags.iter().cloned());
        cmd.extend(self.args.iter().cloned());
        cmd
    }

    /// Environment with duplicate keys resolved last-writer-wins, original
    /// first-seen order preserved.
    pub fn env_resolved(&self) -> Vec<String> {
        let mut order: Vec<String> = Vec::new();
        let mut values: std::collections::HashMap<String, String> = Default::default();
        for entry in &self.env {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            if !values.contains_key(key) {
                order.push(key.to_string());
            }
            values.insert(key.to_string(), value.to_string());
        }
        order
            .into_iter()
            .map(|key| {
                let value = &values[&key];
                format!("{}={}", key, value)
            })
            .collect()
    }

    /// Whether an env entry with this exact KEY=VALUE is present after
    /// resolution.
    pub fn has_env(&self, entry: &str) -> bool {
        self.env_resolved().iter().any(|e| e == entry)
    }
}

/// Runs one configured phase to completion.
#[allow(async_fn_in_trait)]
pub trait PhaseRunner {
    async fn run(&self) -> Result<()>;
    /// Idempotent resource teardown.
    async fn cleanup(&self) -> Result<()>;
}

/// Turns a finished config into a runnable phase.
pub trait PhaseFactory {
    type Runner: PhaseRunner;
    fn new_phase(&self, config: PhaseConfig) -> Self::Runner;
}

/// Production factory backed by the container daemon.
#[derive(Debug, Clone)]
pub struct ContainerPhaseFactory<D> {
    docker: D,
}

impl<D: DockerClient + Clone> ContainerPhaseFactory<D> {
    pub fn new(docker: D) -> Self {
        Self { docker }
    }
}

impl<D: DockerClient + Clone> PhaseFactory for ContainerPhaseFactory<D> {
    type Runner = ContainerPhase<D>;

    fn new_phase(&self, config: PhaseConfig) -> Self::Runner {
        ContainerPhase {
            docker: self.docker.clone(),
            config,
            container_id: Mutex::new(None),
        }
    }
}

/// A phase bound to a daemon container.
#[derive(Debug)]
pub struct ContainerPhase<D> {
    docker: D,
    config: PhaseConfig,
    container_id: Mutex<Option<String>>,
}

impl<D: DockerClient> ContainerPhase<D> {
    async fn execute_pre_op(&self, id: &str, op: &ContainerOp) -> Result<()> {
        match op {
            ContainerOp::CopyDir {
                src,
                dest,
                uid,
                gid,
                filter,
            } => {
                let tar = archive::tar_directory(src, *uid, *gid, filter.as_ref())?;
                self.docker.copy_to_container(id, dest, tar).await
            }
            ContainerOp::WriteFile {
                path,
                contents,
                uid,
                gid,
            } => {
                let (dir, file) = split_container_path(path);
                let tar = archive::tar_file(&file, contents.as_bytes(), *uid, *gid, 0o644)?;
                self.docker.copy_to_container(id, &dir, tar).await
            }
            ContainerOp::EnsureVolumeAccess { dirs, uid, gid } => {
                let names: Vec<&str> = dirs
                    .iter()
                    .map(|d| d.trim_start_matches("c:").trim_start_matches(['/', '\\']))
                    .collect();
                let tar = archive::tar_dir_entries(&names, *uid, *gid)?;
                self.docker.copy_to_container(id, "/", tar).await
            }
        }
    }

    async fn execute_post_op(&self, id: &str, op: &PostOp) -> Result<()> {
        let (src, dest, required) = match op {
            PostOp::EnsureVolumeAccess { dirs, uid, gid } => {
                let names: Vec<&str> = dirs
                    .iter()
                    .map(|d| d.trim_start_matches("c:").trim_start_matches(['/', '\\']))
                    .collect();
                let tar = archive::tar_dir_entries(&names, *uid, *gid)?;
                return self.docker.copy_to_container(id, "/", tar).await;
            }
            PostOp::CopyOutTo { src, dest } => (src, dest, true),
            PostOp::CopyOutToMaybe { src, dest } => (src, dest, false),
        };
        match self.docker.copy_from_container(id, src).await {
            Ok(tar) => {
                archive::untar_to_dir(&tar, dest).map_err(|e| {
                    KilnError::from(PhaseError::CopyOut {
                        phase: self.config.name.clone(),
                        path: src.clone(),
                        message: e.to_string(),
                    })
                })
            }
            Err(KilnError::Docker(DockerError::CliError(msg)))
                if !required && is_not_found(&msg) =>
            {
                debug!("[{}] skipping copy-out of absent {}", self.config.log_prefix, src);
                Ok(())
            }
            Err(e) => Err(KilnError::from(PhaseError::CopyOut {
                phase: self.config.name.clone(),
                path: src.clone(),
                message: e.to_string(),
            })),
        }
    }
}

impl<D: DockerClient> PhaseRunner for ContainerPhase<D> {
    async fn run(&self) -> Result<()> {
        let options = ContainerCreateOptions {
            image: self.config.image.clone(),
            cmd: self.config.command(),
            env: self.config.env_resolved(),
            binds: self.config.binds.clone(),
            network: self.config.network.clone(),
            user: self.config.user.clone(),
        };
        let id = self.docker.container_create(&options).await?;
        *self.container_id.lock().expect("container id lock") = Some(id.clone());

        for op in &self.config.pre_ops {
            self.execute_pre_op(&id, op).await?;
        }

        let code = self
            .docker
            .container_run(&id, &self.config.log_prefix)
            .await?;
        if code != 0 {
            return Err(PhaseError::ExitCode {
                phase: self.config.name.clone(),
                code,
            }
            .into());
        }

        // post-run artifacts only exist after a successful phase
        for op in &self.config.post_ops {
            self.execute_post_op(&id, op).await?;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let id = self.container_id.lock().expect("container id lock").take();
        match id {
            Some(id) => self.docker.container_remove(&id, true).await,
            None => Ok(()),
        }
    }
}

// container paths are not host paths; split on the last separator of either
// flavor
fn split_container_path(path: &str) -> (String, String) {
    match path.rfind(['/', '\\']) {
        Some(idx) => (path[..idx].to_string(), path[idx + 1..].to_string()),
        None => ("/".to_string(), path.to_string()),
    }
}
