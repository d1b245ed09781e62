//! Lifecycle execution
//!
//! The scheduler that drives a build to completion. Given the negotiated
//! platform API, cache configuration, publish mode, and the extension state
//! discovered by detect, it sequences the phase containers (detect,
//! analyze, restore, build/extend, export), wiring each with the flags,
//! mounts, environment, and credentials its contract requires. The build and
//! run extension steps run concurrently and are joined before export.

use crate::api::{self, PlatformVersion};
use crate::archive::FileFilter;
use crate::auth::{self, Keychain};
use crate::cache::{resolve_build_cache, resolve_launch_cache, Cache, CacheFormat, CacheOpts};
use crate::docker::DockerClient;
use crate::errors::{ConfigError, KilnError, Result, ResultExt};
use crate::extend;
use crate::extensions;
use crate::metadata::{self, ProjectMetadata, RunImageEntry, RunMetadata, StackMetadata};
use crate::paths::{filter_reserved_names, mount_paths_for_os, MountPaths};
use crate::phase::{
    if_op, ContainerOp, PhaseConfig, PhaseFactory, PhaseOp, PhaseRunner, PostOp,
};
use crate::refs::ImageRef;
use rand::Rng;
use std::path::PathBuf;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info};

const DEFAULT_PROCESS_TYPE: &str = "web";
const SOURCE_DATE_EPOCH_ENV: &str = "SOURCE_DATE_EPOCH";
const EXPERIMENTAL_MODE_ENV: &str = "CNB_EXPERIMENTAL_MODE=warn";

const API_0_4: PlatformVersion = PlatformVersion::new(0, 4);
const API_0_6: PlatformVersion = PlatformVersion::new(0, 6);
const API_0_7: PlatformVersion = PlatformVersion::new(0, 7);
const API_0_9: PlatformVersion = PlatformVersion::new(0, 9);
const API_0_10: PlatformVersion = PlatformVersion::new(0, 10);
const API_0_12: PlatformVersion = PlatformVersion::new(0, 12);

/// Static facts about the builder image, read from its metadata before the
/// run starts.
#[derive(Debug, Clone, Default)]
pub struct BuilderInfo {
    pub uid: u32,
    pub gid: u32,
    /// container OS of the builder image (linux or windows)
    pub os: String,
    pub stack: StackMetadata,
    pub run_images: Vec<String>,
    /// extension ids the builder declares in its order
    pub order_extensions: Vec<String>,
    pub supported_apis: Vec<PlatformVersion>,
    pub deprecated_apis: Vec<PlatformVersion>,
}

/// Callback that makes a run image available locally before export.
pub type FetchRunImageFn = Box<dyn Fn(&str) -> Result<()> + Send + Sync>;

/// Everything a single build run needs; immutable once constructed.
pub struct LifecycleOptions {
    pub image: ImageRef,
    pub previous_image: Option<String>,
    pub run_image: String,
    pub builder_image: String,
    pub lifecycle_image: String,
    /// platform APIs advertised by a custom lifecycle image, if any
    pub lifecycle_apis: Vec<String>,
    pub builder: BuilderInfo,
    pub cache: CacheOpts,
    pub cache_image: Option<String>,
    pub additional_tags: Vec<String>,
    pub publish: bool,
    pub clear_cache: bool,
    pub use_creator: bool,
    pub interactive: bool,
    pub verbose: bool,
    pub layout: bool,
    pub gid: Option<u32>,
    pub default_process_type: String,
    pub sbom_destination_dir: Option<PathBuf>,
    pub report_destination_dir: Option<PathBuf>,
    pub network: String,
    pub docker_host: String,
    /// extra host binds applied to every phase
    pub volumes: Vec<String>,
    pub app_path: PathBuf,
    pub file_filter: Option<FileFilter>,
    pub project_metadata: ProjectMetadata,
    pub creation_time: Option<SystemTime>,
    pub workspace: Option<String>,
    pub keychain: Keychain,
    pub fetch_run_image: Option<FetchRunImageFn>,
}

impl LifecycleOptions {
    /// Options with everything optional defaulted.
    pub fn new(image: ImageRef, builder_image: &str, run_image: &str) -> Self {
        Self {
            image,
            previous_image: None,
            run_image: run_image.to_string(),
            builder_image: builder_image.to_string(),
            lifecycle_image: builder_image.to_string(),
            lifecycle_apis: Vec::new(),
            builder: BuilderInfo {
                os: "linux".to_string(),
                ..Default::default()
            },
            cache: CacheOpts::default(),
            cache_image: None,
            additional_tags: Vec::new(),
            publish: false,
            clear_cache: false,
            use_creator: false,
            interactive: false,
            verbose: false,
            layout: false,
            gid: None,
            default_process_type: String::new(),
            sbom_destination_dir: None,
            report_destination_dir: None,
            network: String::new(),
            docker_host: String::new(),
            volumes: Vec::new(),
            app_path: PathBuf::from("."),
            file_filter: None,
            project_metadata: ProjectMetadata::default(),
            creation_time: None,
            workspace: None,
            keychain: Keychain::new(),
            fetch_run_image: None,
        }
    }
}

/// One build run: scratch volumes, negotiated API, and the phase schedule.
pub struct LifecycleExecution<D> {
    docker: D,
    platform_api: PlatformVersion,
    layers_volume: String,
    app_volume: String,
    os: String,
    mount_paths: MountPaths,
    opts: LifecycleOptions,
    tmp_dir: PathBuf,
}

impl<D: DockerClient> LifecycleExecution<D> {
    /// Negotiate the platform API and reserve scratch volume names.
    pub fn new(docker: D, tmp_dir: impl Into<PathBuf>, opts: LifecycleOptions) -> Result<Self> {
        let mut builder_apis = opts.builder.deprecated_apis.clone();
        builder_apis.extend(opts.builder.supported_apis.iter().copied());
        let platform_api = api::find_latest_supported(&builder_apis, &opts.lifecycle_apis)?;

        let os = opts.builder.os.clone();
        let mount_paths = mount_paths_for_os(&os, opts.workspace.as_deref());
        Ok(Self {
            docker,
            platform_api,
            layers_volume: filter_reserved_names(&format!("pack-layers-{}", rand_suffix(10))),
            app_volume: filter_reserved_names(&format!("pack-app-{}", rand_suffix(10))),
            os,
            mount_paths,
            opts,
            tmp_dir: tmp_dir.into(),
        })
    }

    pub fn platform_api(&self) -> PlatformVersion {
        self.platform_api
    }

    pub fn layers_volume(&self) -> &str {
        &self.layers_volume
    }

    pub fn app_volume(&self) -> &str {
        &self.app_volume
    }

    pub fn app_dir(&self) -> String {
        self.mount_paths.app_dir()
    }

    pub fn builder_os(&self) -> &str {
        &self.os
    }

    pub fn image_name(&self) -> &ImageRef {
        &self.opts.image
    }

    pub fn previous_image_name(&self) -> Option<&str> {
        self.opts.previous_image.as_deref()
    }

    pub fn tmp_dir(&self) -> &std::path::Path {
        &self.tmp_dir
    }

    /// Drive the full schedule: caches, phases, parallel extension steps,
    /// export. Callers invoke [`Self::cleanup`] when this returns.
    pub async fn run<F: PhaseFactory>(&self, factory: &F) -> Result<()> {
        let build_cache = resolve_build_cache(
            &self.opts.image,
            &self.opts.cache,
            self.opts.cache_image.as_deref(),
        )?;
        if self.opts.clear_cache {
            build_cache
                .clear(&self.docker)
                .await
                .err_context("clearing build cache")?;
            debug!("Build cache {} cleared", build_cache.name());
        }
        let launch_cache = resolve_launch_cache(&self.opts.image, &self.opts.cache);

        if self.opts.use_creator {
            if self.platform_api.at_least(API_0_10) && self.has_extensions() {
                return Err(ConfigError::CreatorWithExtensions.into());
            }
            return self.create(&build_cache, &launch_cache, factory).await;
        }

        if self.platform_api.less_than(API_0_7) {
            info!("DETECTING");
            self.detect(factory).await?;
            info!("ANALYZING");
            self.analyze(&build_cache, &launch_cache, factory).await?;
        } else {
            info!("ANALYZING");
            self.analyze(&build_cache, &launch_cache, factory).await?;
            info!("DETECTING");
            self.detect(factory).await?;
        }

        info!("RESTORING");
        if self.opts.clear_cache && self.platform_api.less_than(API_0_10) {
            info!("Skipping 'restore' due to clearing cache");
        } else {
            self.restore(&build_cache, factory).await?;
        }

        // the run extender reads the analyzed run image, so the fetch runs
        // on the scheduler before the parallel steps start
        let current_run_image = self.run_image_after_extensions();
        if !current_run_image.is_empty() && current_run_image != self.opts.run_image {
            if let Some(fetch) = &self.opts.fetch_run_image {
                fetch(&current_run_image)?;
            }
        }

        let build_step = async {
            if self.platform_api.at_least(API_0_10) && self.has_extensions_for_build() {
                if self.opts.publish {
                    info!("EXTENDING (BUILD)");
                    self.extend_build(&build_cache, factory).await
                } else {
                    info!("EXTENDING (BUILD) BY DAEMON");
                    let started = Instant::now();
                    extend::extend_build_by_daemon(
                        &self.docker,
                        &self.tmp_dir,
                        &self.opts.builder_image,
                    )
                    .await?;
                    self.build(factory).await?;
                    debug!("EXTENDING (BUILD) took {:?}", started.elapsed());
                    Ok(())
                }
            } else {
                info!("BUILDING");
                self.build(factory).await
            }
        };

        let run_extend_step = async {
            if self.platform_api.at_least(API_0_12) && self.has_extensions_for_run() {
                if self.opts.publish {
                    info!("EXTENDING (RUN)");
                    self.extend_run(&build_cache, factory).await
                } else {
                    info!("EXTENDING (RUN) BY DAEMON");
                    extend::extend_run_by_daemon(&self.docker, &self.tmp_dir, &current_run_image)
                        .await
                        .map(|_| ())
                }
            } else {
                Ok(())
            }
        };

        // barrier: a failure on either side cancels the other and export
        tokio::try_join!(build_step, run_extend_step)?;

        info!("EXPORTING");
        self.export(&build_cache, &launch_cache, factory).await
    }

    /// Remove the scratch volumes and directory. Every removal is attempted;
    /// the last failure wins. Already-removed resources are not errors.
    pub async fn cleanup(&self) -> Result<()> {
        let mut result = Ok(());
        if let Err(e) = self.docker.volume_remove(&self.layers_volume, true).await {
            result = Err(e.context(format!(
                "failed to clean up layers volume {}",
                self.layers_volume
            )));
        }
        if let Err(e) = self.docker.volume_remove(&self.app_volume, true).await {
            result = Err(e.context(format!("failed to clean up app volume {}", self.app_volume)));
        }
        if self.tmp_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&self.tmp_dir) {
                result = Err(KilnError::from(e).context(format!(
                    "failed to clean up working directory {}",
                    self.tmp_dir.display()
                )));
            }
        }
        result
    }

    async fn run_phase<F: PhaseFactory>(&self, factory: &F, config: PhaseConfig) -> Result<()> {
        let phase = factory.new_phase(config);
        let result = phase.run().await;
        if let Err(e) = phase.cleanup().await {
            debug!("phase cleanup: {}", e);
        }
        result
    }

    /// Base config shared by every phase: builder image, scratch volume
    /// binds, and the negotiated API in the environment.
    fn base_config(&self, name: &str) -> PhaseConfig {
        PhaseConfig::new(name, &self.opts.builder_image).apply(vec![
            PhaseOp::Binds(vec![
                format!("{}:{}", self.layers_volume, self.mount_paths.layers_dir()),
                format!("{}:{}", self.app_volume, self.mount_paths.app_dir()),
            ]),
            PhaseOp::Env(vec![format!("CNB_PLATFORM_API={}", self.platform_api)]),
        ])
    }

    fn with_log_level(&self, args: Vec<String>) -> Vec<String> {
        if self.opts.verbose {
            let mut out = vec!["-log-level".to_string(), "debug".to_string()];
            out.extend(args);
            out
        } else {
            args
        }
    }

    fn uid_gid_env(&self) -> PhaseOp {
        PhaseOp::Env(vec![
            format!("CNB_UID={}", self.opts.builder.uid),
            format!("CNB_GID={}", self.opts.builder.gid),
        ])
    }

    fn gid_flags(&self, flags: &mut Vec<String>) {
        if let Some(gid) = self.opts.gid {
            flags.push("-gid".to_string());
            flags.push(gid.to_string());
        }
    }

    fn epoch_env(&self) -> PhaseOp {
        match self.opts.creation_time {
            Some(time) if self.platform_api.at_least(API_0_9) => {
                let secs = time
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                PhaseOp::Env(vec![format!("{}={}", SOURCE_DATE_EPOCH_ENV, secs)])
            }
            _ => PhaseOp::Null,
        }
    }

    fn registry_auth(&self, references: &[&str]) -> Result<String> {
        auth::build_env_var(&self.opts.keychain, references)
    }

    fn target_auth(&self) -> Result<String> {
        self.registry_auth(&[
            self.opts.image.name(),
            &self.opts.run_image,
            self.opts.cache_image.as_deref().unwrap_or(""),
            self.opts.previous_image.as_deref().unwrap_or(""),
        ])
    }

    /// Registry equality constraint for publish mode with a previous image.
    fn check_previous_image(&self) -> Result<()> {
        let Some(previous) = self.opts.previous_image.as_deref() else {
            return Ok(());
        };
        let previous_ref = ImageRef::parse(previous)?;
        if self.opts.publish && self.opts.image.registry() != previous_ref.registry() {
            return Err(ConfigError::RegistryMismatch {
                image_registry: self.opts.image.registry().to_string(),
                previous_registry: previous_ref.registry().to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn has_extensions(&self) -> bool {
        !self.opts.builder.order_extensions.is_empty()
    }

    fn has_extensions_for_build(&self) -> bool {
        extensions::has_extensions_for_build(&self.tmp_dir)
    }

    fn has_extensions_for_run(&self) -> bool {
        extensions::has_extensions_for_run(&self.tmp_dir)
    }

    fn run_image_after_extensions(&self) -> String {
        extensions::run_image_after_extensions(&self.tmp_dir, &self.opts.run_image)
    }

    fn run_metadata(&self) -> RunMetadata {
        RunMetadata {
            images: self
                .opts
                .builder
                .run_images
                .iter()
                .map(|image| RunImageEntry {
                    image: image.clone(),
                })
                .collect(),
        }
    }

    fn copy_app_op(&self) -> ContainerOp {
        ContainerOp::CopyDir {
            src: self.opts.app_path.clone(),
            dest: self.mount_paths.app_dir(),
            uid: u64::from(self.opts.builder.uid),
            gid: u64::from(self.opts.builder.gid),
            filter: self.opts.file_filter.clone(),
        }
    }

    fn ensure_access_op(&self) -> PostOp {
        PostOp::EnsureVolumeAccess {
            dirs: vec![self.mount_paths.layers_dir(), self.mount_paths.app_dir()],
            uid: u64::from(self.opts.builder.uid),
            gid: u64::from(self.opts.builder.gid),
        }
    }

    /// The consolidated creator phase: detect+analyze+restore+build+export
    /// in one container.
    async fn create<F: PhaseFactory>(
        &self,
        build_cache: &Cache,
        launch_cache: &Cache,
        factory: &F,
    ) -> Result<()> {
        let mut flags = vec![
            "-app".to_string(),
            self.mount_paths.app_dir(),
            "-cache-dir".to_string(),
            self.mount_paths.cache_dir(),
            "-run-image".to_string(),
            self.opts.run_image.clone(),
        ];
        for tag in &self.opts.additional_tags {
            flags.push("-tag".to_string());
            flags.push(tag.clone());
        }
        if self.opts.clear_cache {
            flags.push("-skip-restore".to_string());
        }
        self.gid_flags(&mut flags);

        if let Some(previous) = self.opts.previous_image.as_deref() {
            self.check_previous_image()?;
            flags.push("-previous-image".to_string());
            flags.push(previous.to_string());
        }

        let process_type =
            determine_default_process_type(self.platform_api, &self.opts.default_process_type);
        if !process_type.is_empty() {
            flags.push("-process-type".to_string());
            flags.push(process_type);
        }

        let cache_bind_op = match build_cache.cache_type() {
            CacheFormat::Image => {
                flags.push("-cache-image".to_string());
                flags.push(build_cache.name());
                PhaseOp::Binds(self.opts.volumes.clone())
            }
            CacheFormat::Volume | CacheFormat::Bind => {
                let mut binds = self.opts.volumes.clone();
                binds.push(format!(
                    "{}:{}",
                    build_cache.name(),
                    self.mount_paths.cache_dir()
                ));
                PhaseOp::Binds(binds)
            }
        };

        let mut ops = vec![
            PhaseOp::Flags(self.with_log_level(flags)),
            PhaseOp::Args(vec![self.opts.image.name().to_string()]),
            PhaseOp::Network(self.opts.network.clone()),
            cache_bind_op,
            PhaseOp::ContainerOps(vec![
                ContainerOp::WriteFile {
                    path: self.mount_paths.project_path(),
                    contents: metadata::to_toml(&self.opts.project_metadata)?,
                    uid: 0,
                    gid: 0,
                },
                self.copy_app_op(),
            ]),
            if_op(
                self.opts.sbom_destination_dir.is_some(),
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.sbom_dir(),
                        dest: self.opts.sbom_destination_dir.clone().unwrap_or_default(),
                    },
                ]),
            ),
            if_op(
                self.opts.report_destination_dir.is_some(),
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.report_path(),
                        dest: self.opts.report_destination_dir.clone().unwrap_or_default(),
                    },
                ]),
            ),
            if_op(
                self.opts.interactive,
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.layers_dir(),
                        dest: self.tmp_dir.clone(),
                    },
                    PostOp::CopyOutTo {
                        src: self.mount_paths.app_dir(),
                        dest: self.tmp_dir.clone(),
                    },
                ]),
            ),
            self.epoch_env(),
        ];

        if self.opts.layout {
            ops.push(PhaseOp::Env(vec![
                "CNB_USE_LAYOUT=true".to_string(),
                format!("CNB_LAYOUT_DIR={}", self.mount_paths.layout_dir()),
                EXPERIMENTAL_MODE_ENV.to_string(),
            ]));
        }

        if self.opts.publish || self.opts.layout {
            let auth_config = self.target_auth()?;
            ops.push(PhaseOp::Root);
            ops.push(PhaseOp::RegistryAccess(auth_config));
        } else {
            ops.push(PhaseOp::DaemonAccess(self.opts.docker_host.clone()));
            ops.push(PhaseOp::Flags(vec![
                "-daemon".to_string(),
                "-launch-cache".to_string(),
                self.mount_paths.launch_cache_dir(),
            ]));
            ops.push(PhaseOp::Binds(vec![format!(
                "{}:{}",
                launch_cache.name(),
                self.mount_paths.launch_cache_dir()
            )]));
        }

        let config = self.base_config("creator").apply(ops);
        self.run_phase(factory, config).await
    }

    async fn detect<F: PhaseFactory>(&self, factory: &F) -> Result<()> {
        let env_op = if_op(
            self.platform_api.at_least(API_0_10) && self.has_extensions(),
            PhaseOp::Env(vec![EXPERIMENTAL_MODE_ENV.to_string()]),
        );

        let generated_dest = self.tmp_dir.join("generated");
        let config = self.base_config("detector").apply(vec![
            PhaseOp::LogPrefix("detector".to_string()),
            PhaseOp::Args(self.with_log_level(Vec::new())),
            PhaseOp::Network(self.opts.network.clone()),
            PhaseOp::Binds(self.opts.volumes.clone()),
            PhaseOp::ContainerOps(vec![
                ContainerOp::EnsureVolumeAccess {
                    dirs: vec![self.mount_paths.layers_dir(), self.mount_paths.app_dir()],
                    uid: u64::from(self.opts.builder.uid),
                    gid: u64::from(self.opts.builder.gid),
                },
                self.copy_app_op(),
            ]),
            PhaseOp::Flags(vec!["-app".to_string(), self.mount_paths.app_dir()]),
            if_op(
                self.has_extensions(),
                PhaseOp::PostOps(vec![
                    PostOp::CopyOutToMaybe {
                        src: self.mount_paths.analyzed_path(),
                        dest: self.tmp_dir.clone(),
                    },
                    PostOp::CopyOutToMaybe {
                        src: self.mount_paths.generated_kind_dir("build"),
                        dest: generated_dest.clone(),
                    },
                    PostOp::CopyOutToMaybe {
                        src: self.mount_paths.generated_kind_dir("run"),
                        dest: generated_dest,
                    },
                    PostOp::CopyOutToMaybe {
                        src: self.mount_paths.group_path(),
                        dest: self.tmp_dir.clone(),
                    },
                ]),
            ),
            env_op,
        ]);

        self.run_phase(factory, config).await
    }

    async fn restore<F: PhaseFactory>(&self, build_cache: &Cache, factory: &F) -> Result<()> {
        let mut flags = Vec::new();
        if self.opts.clear_cache {
            flags.push("-skip-layers".to_string());
        }
        let mut registry_images: Vec<String> = Vec::new();

        let cache_bind_op = match build_cache.cache_type() {
            CacheFormat::Image => {
                flags.push("-cache-image".to_string());
                flags.push(build_cache.name());
                registry_images.push(build_cache.name());
                PhaseOp::Null
            }
            CacheFormat::Volume => {
                flags.push("-cache-dir".to_string());
                flags.push(self.mount_paths.cache_dir());
                PhaseOp::Binds(vec![format!(
                    "{}:{}",
                    build_cache.name(),
                    self.mount_paths.cache_dir()
                )])
            }
            CacheFormat::Bind => PhaseOp::Null,
        };

        self.gid_flags(&mut flags);

        let extensions_apply = (self.platform_api.at_least(API_0_10)
            && self.has_extensions_for_build())
            || (self.platform_api.at_least(API_0_12)
                && (self.has_extensions_for_build() || self.has_extensions_for_run()));
        let kaniko_bind_op = if extensions_apply {
            if self.has_extensions_for_build() {
                flags.push("-build-image".to_string());
                flags.push(self.opts.builder_image.clone());
                registry_images.push(self.opts.builder_image.clone());
            }
            match build_cache.cache_type() {
                CacheFormat::Volume => PhaseOp::Binds(vec![format!(
                    "{}:{}",
                    build_cache.name(),
                    self.mount_paths.kaniko_cache_dir()
                )]),
                _ => return Err(ConfigError::CacheNotVolume.into()),
            }
        } else {
            PhaseOp::Null
        };

        let registry_op = if registry_images.is_empty() {
            PhaseOp::Null
        } else {
            let references: Vec<&str> = registry_images.iter().map(String::as_str).collect();
            PhaseOp::RegistryAccess(self.registry_auth(&references)?)
        };

        let config = self.base_config("restorer").apply(vec![
            PhaseOp::LogPrefix("restorer".to_string()),
            PhaseOp::Image(self.opts.lifecycle_image.clone()),
            self.uid_gid_env(),
            PhaseOp::Root,
            PhaseOp::Args(self.with_log_level(Vec::new())),
            PhaseOp::Network(self.opts.network.clone()),
            if_op(
                self.has_extensions_for_run(),
                PhaseOp::PostOps(vec![PostOp::CopyOutToMaybe {
                    src: self.mount_paths.cnb_dir(),
                    dest: self.tmp_dir.clone(),
                }]),
            ),
            PhaseOp::Flags(flags),
            cache_bind_op,
            registry_op,
            kaniko_bind_op,
        ]);

        self.run_phase(factory, config).await
    }

    async fn analyze<F: PhaseFactory>(
        &self,
        build_cache: &Cache,
        launch_cache: &Cache,
        factory: &F,
    ) -> Result<()> {
        let legacy = self.platform_api.less_than(API_0_7);
        let mut flags = Vec::new();
        let mut args = vec![self.opts.image.name().to_string()];
        let mut cache_bind_op = PhaseOp::Null;

        if self.opts.clear_cache {
            if legacy || self.platform_api.at_least(API_0_9) {
                prepend(&mut args, &["-skip-layers".to_string()]);
            }
        } else {
            match build_cache.cache_type() {
                CacheFormat::Image => {
                    flags.push("-cache-image".to_string());
                    flags.push(build_cache.name());
                }
                CacheFormat::Volume => {
                    if legacy {
                        prepend(
                            &mut args,
                            &["-cache-dir".to_string(), self.mount_paths.cache_dir()],
                        );
                        cache_bind_op = PhaseOp::Binds(vec![format!(
                            "{}:{}",
                            build_cache.name(),
                            self.mount_paths.cache_dir()
                        )]);
                    }
                }
                CacheFormat::Bind => {}
            }
        }

        let mut launch_cache_bind_op = PhaseOp::Null;
        if self.platform_api.at_least(API_0_9) && !self.opts.publish {
            prepend(
                &mut args,
                &[
                    "-launch-cache".to_string(),
                    self.mount_paths.launch_cache_dir(),
                ],
            );
            launch_cache_bind_op = PhaseOp::Binds(vec![format!(
                "{}:{}",
                launch_cache.name(),
                self.mount_paths.launch_cache_dir()
            )]);
        }

        self.gid_flags(&mut flags);

        if let Some(previous) = self.opts.previous_image.as_deref() {
            self.check_previous_image()?;
            if legacy {
                // old analyzers take no flag; the target argument itself is
                // swapped for the previous image
                if let Some(target) = args.last_mut() {
                    *target = previous.to_string();
                }
            } else {
                prepend(
                    &mut args,
                    &["-previous-image".to_string(), previous.to_string()],
                );
            }
        }

        let mut stack_op = PhaseOp::Null;
        let mut run_op = PhaseOp::Null;
        if !legacy {
            for tag in &self.opts.additional_tags {
                prepend(&mut args, &["-tag".to_string(), tag.clone()]);
            }
            if !self.opts.run_image.is_empty() {
                prepend(
                    &mut args,
                    &["-run-image".to_string(), self.opts.run_image.clone()],
                );
            }
            prepend(
                &mut args,
                &["-stack".to_string(), self.mount_paths.stack_path()],
            );
            stack_op = PhaseOp::ContainerOps(vec![ContainerOp::WriteFile {
                path: self.mount_paths.stack_path(),
                contents: metadata::to_toml(&self.opts.builder.stack)?,
                uid: 0,
                gid: 0,
            }]);
            run_op = PhaseOp::ContainerOps(vec![ContainerOp::WriteFile {
                path: self.mount_paths.run_path(),
                contents: metadata::to_toml(&self.run_metadata())?,
                uid: 0,
                gid: 0,
            }]);
        }

        let ops = if self.opts.publish {
            vec![
                PhaseOp::LogPrefix("analyzer".to_string()),
                PhaseOp::Image(self.opts.lifecycle_image.clone()),
                self.uid_gid_env(),
                PhaseOp::RegistryAccess(self.target_auth()?),
                PhaseOp::Root,
                PhaseOp::Args(self.with_log_level(args)),
                PhaseOp::Network(self.opts.network.clone()),
                PhaseOp::Flags(flags),
                cache_bind_op,
                stack_op,
                run_op,
            ]
        } else {
            vec![
                PhaseOp::LogPrefix("analyzer".to_string()),
                PhaseOp::Image(self.opts.lifecycle_image.clone()),
                self.uid_gid_env(),
                PhaseOp::DaemonAccess(self.opts.docker_host.clone()),
                launch_cache_bind_op,
                PhaseOp::Flags(self.with_log_level(vec!["-daemon".to_string()])),
                PhaseOp::Args(args),
                PhaseOp::Flags(flags),
                PhaseOp::Network(self.opts.network.clone()),
                cache_bind_op,
                stack_op,
                run_op,
            ]
        };

        let config = self.base_config("analyzer").apply(ops);
        self.run_phase(factory, config).await
    }

    async fn build<F: PhaseFactory>(&self, factory: &F) -> Result<()> {
        let extended = !self.opts.publish && self.has_extensions_for_build();
        let config = self.base_config("builder").apply(vec![
            PhaseOp::LogPrefix("builder".to_string()),
            PhaseOp::Args(self.with_log_level(Vec::new())),
            PhaseOp::Network(self.opts.network.clone()),
            PhaseOp::Binds(self.opts.volumes.clone()),
            PhaseOp::Flags(vec!["-app".to_string(), self.mount_paths.app_dir()]),
            if_op(
                extended,
                PhaseOp::Image(format!("{}:latest", extend::BUILD_EXTENSION_TAG)),
            ),
            if_op(
                extended,
                PhaseOp::User(format!(
                    "{}:{}",
                    self.opts.builder.uid, self.opts.builder.gid
                )),
            ),
        ]);

        self.run_phase(factory, config).await
    }

    fn kaniko_bind_op(&self, build_cache: &Cache) -> Result<PhaseOp> {
        match build_cache.cache_type() {
            CacheFormat::Volume => Ok(PhaseOp::Binds(vec![format!(
                "{}:{}",
                build_cache.name(),
                self.mount_paths.kaniko_cache_dir()
            )])),
            _ => Err(ConfigError::CacheNotVolume.into()),
        }
    }

    async fn extend_build<F: PhaseFactory>(
        &self,
        build_cache: &Cache,
        factory: &F,
    ) -> Result<()> {
        let kaniko_bind_op = self.kaniko_bind_op(build_cache)?;
        let config = self.base_config("extender").apply(vec![
            PhaseOp::LogPrefix("extender (build)".to_string()),
            PhaseOp::Args(self.with_log_level(Vec::new())),
            PhaseOp::Binds(self.opts.volumes.clone()),
            PhaseOp::Env(vec![EXPERIMENTAL_MODE_ENV.to_string()]),
            PhaseOp::Flags(vec!["-app".to_string(), self.mount_paths.app_dir()]),
            PhaseOp::Network(self.opts.network.clone()),
            PhaseOp::Root,
            kaniko_bind_op,
        ]);

        self.run_phase(factory, config).await
    }

    async fn extend_run<F: PhaseFactory>(&self, build_cache: &Cache, factory: &F) -> Result<()> {
        let kaniko_bind_op = self.kaniko_bind_op(build_cache)?;
        let config = self.base_config("extender").apply(vec![
            PhaseOp::LogPrefix("extender (run)".to_string()),
            PhaseOp::Args(self.with_log_level(Vec::new())),
            PhaseOp::Binds(self.opts.volumes.clone()),
            PhaseOp::Env(vec![EXPERIMENTAL_MODE_ENV.to_string()]),
            PhaseOp::Flags(vec![
                "-app".to_string(),
                self.mount_paths.app_dir(),
                "-kind".to_string(),
                "run".to_string(),
            ]),
            PhaseOp::Network(self.opts.network.clone()),
            PhaseOp::Root,
            PhaseOp::Image(self.run_image_after_extensions()),
            PhaseOp::Binds(vec![format!(
                "{}:{}",
                self.tmp_dir.join("cnb").display(),
                self.mount_paths.cnb_dir()
            )]),
            kaniko_bind_op,
        ]);

        self.run_phase(factory, config).await
    }

    async fn export<F: PhaseFactory>(
        &self,
        build_cache: &Cache,
        launch_cache: &Cache,
        factory: &F,
    ) -> Result<()> {
        let mut flags = vec![
            "-app".to_string(),
            self.mount_paths.app_dir(),
            "-cache-dir".to_string(),
            self.mount_paths.cache_dir(),
        ];

        let mut experimental_env = PhaseOp::Null;
        if self.platform_api.less_than(API_0_12) {
            flags.push("-stack".to_string());
            flags.push(self.mount_paths.stack_path());
        } else {
            flags.push("-run".to_string());
            flags.push(self.mount_paths.run_path());
            if self.has_extensions_for_run() {
                experimental_env = PhaseOp::Env(vec![EXPERIMENTAL_MODE_ENV.to_string()]);
            }
        }

        // daemon-side run extension leaves its layers on disk for the
        // exporter to pick up
        let mut extended_dir_op = PhaseOp::Null;
        let mut extended_bind_op = PhaseOp::Null;
        if !self.opts.publish {
            extended_dir_op = PhaseOp::Env(vec![format!(
                "CNB_EXTENDED_DIR={}",
                self.mount_paths.extended_dir()
            )]);
            extended_bind_op = PhaseOp::Binds(vec![format!(
                "{}:{}",
                self.tmp_dir.join("extended-new").display(),
                self.mount_paths.extended_dir()
            )]);
        }

        if self.platform_api.less_than(API_0_7) {
            flags.push("-run-image".to_string());
            flags.push(self.opts.run_image.clone());
        }
        let process_type =
            determine_default_process_type(self.platform_api, &self.opts.default_process_type);
        if !process_type.is_empty() {
            flags.push("-process-type".to_string());
            flags.push(process_type);
        }
        self.gid_flags(&mut flags);

        let cache_bind_op = match build_cache.cache_type() {
            CacheFormat::Image => {
                flags.push("-cache-image".to_string());
                flags.push(build_cache.name());
                PhaseOp::Null
            }
            CacheFormat::Volume => PhaseOp::Binds(vec![format!(
                "{}:{}",
                build_cache.name(),
                self.mount_paths.cache_dir()
            )]),
            CacheFormat::Bind => PhaseOp::Null,
        };

        let mut args = vec![self.opts.image.name().to_string()];
        args.extend(self.opts.additional_tags.iter().cloned());

        let mut ops = vec![
            PhaseOp::LogPrefix("exporter".to_string()),
            PhaseOp::Image(self.opts.lifecycle_image.clone()),
            self.uid_gid_env(),
            PhaseOp::Flags(self.with_log_level(flags)),
            PhaseOp::Args(args),
            PhaseOp::Root,
            extended_bind_op,
            PhaseOp::Network(self.opts.network.clone()),
            cache_bind_op,
            PhaseOp::ContainerOps(vec![
                ContainerOp::WriteFile {
                    path: self.mount_paths.stack_path(),
                    contents: metadata::to_toml(&self.opts.builder.stack)?,
                    uid: 0,
                    gid: 0,
                },
                ContainerOp::WriteFile {
                    path: self.mount_paths.run_path(),
                    contents: metadata::to_toml(&self.run_metadata())?,
                    uid: 0,
                    gid: 0,
                },
                ContainerOp::WriteFile {
                    path: self.mount_paths.project_path(),
                    contents: metadata::to_toml(&self.opts.project_metadata)?,
                    uid: 0,
                    gid: 0,
                },
            ]),
            if_op(
                self.opts.sbom_destination_dir.is_some(),
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.sbom_dir(),
                        dest: self.opts.sbom_destination_dir.clone().unwrap_or_default(),
                    },
                ]),
            ),
            if_op(
                self.opts.report_destination_dir.is_some(),
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.report_path(),
                        dest: self.opts.report_destination_dir.clone().unwrap_or_default(),
                    },
                ]),
            ),
            if_op(
                self.opts.interactive,
                PhaseOp::PostOps(vec![
                    self.ensure_access_op(),
                    PostOp::CopyOutTo {
                        src: self.mount_paths.layers_dir(),
                        dest: self.tmp_dir.clone(),
                    },
                    PostOp::CopyOutTo {
                        src: self.mount_paths.app_dir(),
                        dest: self.tmp_dir.clone(),
                    },
                ]),
            ),
            self.epoch_env(),
            experimental_env,
            extended_dir_op,
        ];

        if self.opts.publish {
            ops.push(PhaseOp::RegistryAccess(self.target_auth()?));
            ops.push(PhaseOp::Root);
        } else {
            ops.push(PhaseOp::DaemonAccess(self.opts.docker_host.clone()));
            ops.push(PhaseOp::Flags(vec![
                "-daemon".to_string(),
                "-launch-cache".to_string(),
                self.mount_paths.launch_cache_dir(),
            ]));
            ops.push(PhaseOp::Binds(vec![format!(
                "{}:{}",
                launch_cache.name(),
                self.mount_paths.launch_cache_dir()
            )]));
        }

        let config = self.base_config("exporter").apply(ops);
        self.run_phase(factory, config).await
    }
}

/// Default process type rules: only the 0.4 ≤ api < 0.6 window forces "web"
/// when nothing was provided.
pub fn determine_default_process_type(
    platform_api: PlatformVersion,
    provided_value: &str,
) -> String {
    let force_default = platform_api.at_least(API_0_4) && platform_api.less_than(API_0_6);
    if provided_value.is_empty() && force_default {
        DEFAULT_PROCESS_TYPE.to_string()
    } else {
        provided_value.to_string()
    }
}

fn prepend(args: &mut Vec<String>, items: &[String]) {
    for item in items.iter().rev() {
        args.insert(0, item.clone());
    }
}

fn rand_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range('a'..='z')).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(major: u32, minor: u32) -> PlatformVersion {
        PlatformVersion::new(major, minor)
    }

    #[test]
    fn test_default_process_type_forced_in_window() {
        assert_eq!(determine_default_process_type(v(0, 4), ""), "web");
        assert_eq!(determine_default_process_type(v(0, 5), ""), "web");
    }

    #[test]
    fn test_default_process_type_not_forced_outside_window() {
        assert_eq!(determine_default_process_type(v(0, 3), ""), "");
        assert_eq!(determine_default_process_type(v(0, 6), ""), "");
        assert_eq!(determine_default_process_type(v(0, 12), ""), "");
    }

    #[test]
    fn test_default_process_type_provided_passes_through() {
        assert_eq!(determine_default_process_type(v(0, 5), "worker"), "worker");
        assert_eq!(determine_default_process_type(v(0, 12), "worker"), "worker");
    }

    #[test]
    fn test_rand_suffix_is_lowercase_and_sized() {
        let s = rand_suffix(10);
        assert_eq!(s.len(), 10);
        assert!(s.chars().all(|c| c.is_ascii_lowercase()));
    }
}
