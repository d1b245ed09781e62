//! The build command: wire CLI options into a lifecycle execution.

use crate::cli::BuildArgs;
use anyhow::{Context, Result};
use kiln_core::api::PlatformVersion;
use kiln_core::auth::Keychain;
use kiln_core::docker::{CliDocker, DockerClient};
use kiln_core::lifecycle::{BuilderInfo, LifecycleExecution, LifecycleOptions};
use kiln_core::metadata::{StackMetadata, StackRunImage};
use kiln_core::phase::ContainerPhaseFactory;
use kiln_core::refs::ImageRef;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::{debug, warn};

/// Label carrying the builder's stack and lifecycle metadata.
const BUILDER_METADATA_LABEL: &str = "io.buildpacks.builder.metadata";
/// Label carrying the builder's extension order.
const ORDER_EXTENSIONS_LABEL: &str = "io.buildpacks.buildpack.order-extensions";

#[derive(Debug, Default, Deserialize)]
struct BuilderMetadata {
    #[serde(default)]
    stack: Option<StackEntry>,
    #[serde(default)]
    lifecycle: Option<LifecycleEntry>,
}

#[derive(Debug, Deserialize)]
struct StackEntry {
    #[serde(rename = "runImage")]
    run_image: RunImageEntry,
}

#[derive(Debug, Deserialize)]
struct RunImageEntry {
    image: String,
    #[serde(default)]
    mirrors: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct LifecycleEntry {
    #[serde(default)]
    apis: Option<ApisEntry>,
}

#[derive(Debug, Deserialize)]
struct ApisEntry {
    #[serde(default)]
    platform: Option<PlatformApisEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct PlatformApisEntry {
    #[serde(default)]
    deprecated: Vec<String>,
    #[serde(default)]
    supported: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct OrderEntry {
    #[serde(default)]
    group: Vec<GroupEntry>,
}

#[derive(Debug, Deserialize)]
struct GroupEntry {
    id: String,
}

pub async fn execute(args: BuildArgs, verbose: bool) -> Result<()> {
    let docker = CliDocker::new();
    docker
        .ping()
        .await
        .context("the docker daemon is not reachable")?;

    let labels = docker
        .image_labels(&args.builder)
        .await
        .with_context(|| format!("inspecting builder {}", args.builder))?;
    let os = docker
        .image_os(&args.builder)
        .await
        .with_context(|| format!("inspecting builder {}", args.builder))?;

    let metadata = parse_builder_metadata(&labels);
    let order_extensions = parse_order_extensions(&labels);

    let stack_run_image = metadata
        .stack
        .as_ref()
        .map(|s| s.run_image.image.clone())
        .unwrap_or_default();
    let run_image = args
        .run_image
        .clone()
        .or_else(|| (!stack_run_image.is_empty()).then(|| stack_run_image.clone()))
        .context("builder has no stack run image; pass --run-image")?;

    let image = ImageRef::parse(&args.image)?;
    let mut opts = LifecycleOptions::new(image, &args.builder, &run_image);
    opts.lifecycle_image = args
        .lifecycle_image
        .clone()
        .unwrap_or_else(|| args.builder.clone());
    opts.builder = builder_info(&metadata, order_extensions, &os, &args);
    opts.previous_image = args.previous_image.clone();
    opts.cache_image = args.cache_image.clone();
    opts.additional_tags = args.tags.clone();
    opts.publish = args.publish;
    opts.clear_cache = args.clear_cache;
    opts.use_creator = args.creator;
    opts.verbose = verbose;
    opts.gid = args.gid;
    opts.default_process_type = args.default_process.clone();
    opts.sbom_destination_dir = args.sbom_output_dir.clone();
    opts.report_destination_dir = args.report_output_dir.clone();
    opts.network = args.network.clone();
    opts.docker_host = args.docker_host.clone();
    opts.volumes = args.volumes.clone();
    opts.app_path = args.path.clone();
    opts.workspace = args.workspace.clone();
    opts.keychain = Keychain::from_env_and_docker_config();
    opts.fetch_run_image = Some(Box::new(pull_image));

    let tmp_dir = tempfile::Builder::new()
        .prefix("kiln.build.")
        .tempdir()
        .context("creating scratch directory")?
        .into_path();

    let execution = LifecycleExecution::new(docker.clone(), tmp_dir, opts)?;
    debug!(
        "negotiated platform API {} with builder {}",
        execution.platform_api(),
        args.builder
    );

    let factory = ContainerPhaseFactory::new(docker);
    let result = execution.run(&factory).await;
    if let Err(cleanup_err) = execution.cleanup().await {
        warn!("{}", cleanup_err);
    }
    result.map_err(Into::into)
}

/// Make a run image available to the daemon before export.
fn pull_image(image: &str) -> kiln_core::errors::Result<()> {
    debug!("pulling run image {}", image);
    let status = std::process::Command::new("docker")
        .args(["pull", image])
        .status()
        .map_err(kiln_core::errors::DockerError::Io)?;
    if !status.success() {
        return Err(kiln_core::errors::DockerError::CliError(format!(
            "pulling {} exited {}",
            image,
            status.code().unwrap_or(-1)
        ))
        .into());
    }
    Ok(())
}

fn parse_builder_metadata(labels: &HashMap<String, String>) -> BuilderMetadata {
    labels
        .get(BUILDER_METADATA_LABEL)
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn parse_order_extensions(labels: &HashMap<String, String>) -> Vec<String> {
    labels
        .get(ORDER_EXTENSIONS_LABEL)
        .and_then(|raw| serde_json::from_str::<Vec<OrderEntry>>(raw).ok())
        .map(|order| {
            order
                .into_iter()
                .flat_map(|entry| entry.group.into_iter().map(|g| g.id))
                .collect()
        })
        .unwrap_or_default()
}

fn builder_info(
    metadata: &BuilderMetadata,
    order_extensions: Vec<String>,
    os: &str,
    args: &BuildArgs,
) -> BuilderInfo {
    let (supported, deprecated) = metadata
        .lifecycle
        .as_ref()
        .and_then(|l| l.apis.as_ref())
        .and_then(|a| a.platform.as_ref())
        .map(|p| (parse_versions(&p.supported), parse_versions(&p.deprecated)))
        .unwrap_or_default();

    let (stack, run_images) = match metadata.stack.as_ref() {
        Some(entry) => {
            let mut run_images = vec![entry.run_image.image.clone()];
            run_images.extend(entry.run_image.mirrors.iter().cloned());
            (
                StackMetadata {
                    run_image: StackRunImage {
                        image: entry.run_image.image.clone(),
                        mirrors: entry.run_image.mirrors.clone(),
                    },
                },
                run_images,
            )
        }
        None => Default::default(),
    };

    BuilderInfo {
        uid: args.uid,
        gid: args.build_gid,
        os: os.to_string(),
        stack,
        run_images,
        order_extensions,
        supported_apis: supported,
        deprecated_apis: deprecated,
    }
}

fn parse_versions(raw: &[String]) -> Vec<PlatformVersion> {
    raw.iter().filter_map(|v| v.parse().ok()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(metadata: &str) -> HashMap<String, String> {
        let mut labels = HashMap::new();
        labels.insert(BUILDER_METADATA_LABEL.to_string(), metadata.to_string());
        labels
    }

    #[test]
    fn test_parse_builder_metadata() {
        let labels = labels(
            r#"{"stack":{"runImage":{"image":"cnbs/run:base","mirrors":["mirror.example/run"]}},
                "lifecycle":{"apis":{"platform":{"supported":["0.7","0.12"],"deprecated":["0.3"]}}}}"#,
        );
        let metadata = parse_builder_metadata(&labels);
        assert_eq!(
            metadata.stack.as_ref().unwrap().run_image.image,
            "cnbs/run:base"
        );
        let apis = metadata.lifecycle.unwrap().apis.unwrap().platform.unwrap();
        assert_eq!(apis.supported, vec!["0.7", "0.12"]);
        assert_eq!(apis.deprecated, vec!["0.3"]);
    }

    #[test]
    fn test_parse_builder_metadata_missing_label() {
        let metadata = parse_builder_metadata(&HashMap::new());
        assert!(metadata.stack.is_none());
    }

    #[test]
    fn test_parse_order_extensions() {
        let mut labels = HashMap::new();
        labels.insert(
            ORDER_EXTENSIONS_LABEL.to_string(),
            r#"[{"group":[{"id":"acme/curl","version":"1.0"}]},{"group":[{"id":"acme/tz"}]}]"#
                .to_string(),
        );
        assert_eq!(parse_order_extensions(&labels), vec!["acme/curl", "acme/tz"]);
    }
}
