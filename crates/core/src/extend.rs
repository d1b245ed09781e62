//! Daemon-side image extension
//!
//! When a build runs against the local daemon (no publish), extension
//! Dockerfiles are applied directly through the daemon's image build instead
//! of an in-container extender phase. Build-kind Dockerfiles produce the
//! derived builder image; run-kind Dockerfiles produce the derived run
//! image, whose added layers are then exported as an OCI layout for the
//! exporter phase to consume.

use crate::archive;
use crate::docker::{DockerClient, ImageBuildOptions};
use crate::errors::{DockerError, KilnError, Result, ResultExt};
use crate::extensions::{DockerfileKind, DockerfileSpec, Extensions};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::debug;

/// Tag of the derived builder image produced by build-kind extensions.
pub const BUILD_EXTENSION_TAG: &str = "newbuilder-image";
/// Tag of the derived run image produced by run-kind extensions.
pub const RUN_EXTENSION_TAG: &str = "run-image";

/// Apply build-kind extension Dockerfiles against the daemon, producing
/// `newbuilder-image:latest` layered on the builder image.
pub async fn extend_build_by_daemon<D: DockerClient>(
    docker: &D,
    tmp_dir: &Path,
    builder_image: &str,
) -> Result<()> {
    let started = Instant::now();
    let mut extensions = Extensions::default();
    extensions.set_extensions(tmp_dir);
    let dockerfiles = extensions
        .dockerfiles(DockerfileKind::Build, tmp_dir)
        .err_context("getting build.Dockerfiles")?;

    apply_dockerfiles(docker, &dockerfiles, builder_image, BUILD_EXTENSION_TAG).await?;
    debug!("build extension took {:?}", started.elapsed());
    Ok(())
}

/// Apply run-kind extension Dockerfiles against the daemon and export the
/// layers added above the original run image as an OCI layout under
/// `<tmp_dir>/extended-new/run/<digest>`. Returns the export destination.
///
/// The original image's top-layer hash is computed concurrently with the
/// Dockerfile applications; both must finish before the export starts.
pub async fn extend_run_by_daemon<D: DockerClient>(
    docker: &D,
    tmp_dir: &Path,
    current_run_image: &str,
) -> Result<PathBuf> {
    debug!("extending run image {}", current_run_image);
    let mut extensions = Extensions::default();
    extensions.set_extensions(tmp_dir);
    let dockerfiles = extensions
        .dockerfiles(DockerfileKind::Run, tmp_dir)
        .err_context("getting run.Dockerfiles")?;

    let (orig_top_layer, ()) = tokio::try_join!(
        async {
            let started = Instant::now();
            let hash = docker
                .image_top_layer(current_run_image)
                .await
                .err_context("getting top layer hash of run image")?;
            debug!("top layer hash took {:?}", started.elapsed());
            Ok::<_, KilnError>(hash)
        },
        apply_dockerfiles(docker, &dockerfiles, current_run_image, RUN_EXTENSION_TAG),
    )?;

    let extended = format!("{}:latest", RUN_EXTENSION_TAG);
    let digest = docker.image_digest(&extended).await?;
    let dest = tmp_dir.join("extended-new").join("run").join(&digest);
    save_layers(docker, &extended, &orig_top_layer, &dest)
        .await
        .err_context("copying selective image to output directory")?;
    Ok(dest)
}

/// Apply each Dockerfile in order as a daemon image build tagged `tag`.
///
/// Dockerfiles without an explicit base receive `base_image` pointing at the
/// current base. Each build's output stream is fully drained before the next
/// starts.
async fn apply_dockerfiles<D: DockerClient>(
    docker: &D,
    dockerfiles: &[DockerfileSpec],
    base_image: &str,
    tag: &str,
) -> Result<()> {
    let started = Instant::now();
    for dockerfile in dockerfiles {
        if !dockerfile.extend {
            continue;
        }
        let context_dir = dockerfile
            .path
            .parent()
            .expect("generated Dockerfile has a parent directory");
        let context = archive::tar_directory(context_dir, 0, 0, None)?;

        let mut build_args = HashMap::new();
        if dockerfile.with_base.is_none() {
            build_args.insert("base_image".to_string(), base_image.to_string());
        }

        docker
            .image_build(
                context,
                ImageBuildOptions {
                    dockerfile: "Dockerfile".to_string(),
                    tags: vec![tag.to_string()],
                    remove: true,
                    build_args,
                },
            )
            .await?;
    }
    debug!("applying {} dockerfiles took {:?}", dockerfiles.len(), started.elapsed());
    Ok(())
}

/// Persist the layers of `image` stacked above `orig_top_layer` as an OCI
/// layout rooted at `dest`.
///
/// The daemon export is read once; layers at or below the original top layer
/// are dropped, the remainder becomes the layout's blobs together with a
/// minimal config and manifest.
pub async fn save_layers<D: DockerClient>(
    docker: &D,
    image: &str,
    orig_top_layer: &str,
    dest: &Path,
) -> Result<()> {
    let started = Instant::now();
    let saved = docker.image_save(image).await?;
    let entries = archive::read_tar_entries(&saved)?;

    let manifest_raw = entries
        .get(Path::new("manifest.json"))
        .ok_or_else(|| DockerError::CliError(format!("image export of {} has no manifest", image)))?;
    let manifests: Vec<SavedManifest> = serde_json::from_slice(manifest_raw)
        .map_err(|e| DockerError::CliError(format!("parsing image export manifest: {}", e)))?;
    let manifest = manifests
        .first()
        .ok_or_else(|| DockerError::CliError(format!("image export of {} is empty", image)))?;

    let config_raw = entries.get(Path::new(&manifest.config)).ok_or_else(|| {
        DockerError::CliError(format!("image export of {} is missing its config", image))
    })?;
    let config: SavedConfig = serde_json::from_slice(config_raw)
        .map_err(|e| DockerError::CliError(format!("parsing image export config: {}", e)))?;

    // layers at or below the original top layer already exist on the run
    // image; everything after it was added by the extensions
    let keep_from = config
        .rootfs
        .diff_ids
        .iter()
        .position(|id| id == orig_top_layer)
        .map(|idx| idx + 1)
        .unwrap_or(0);

    let blobs_dir = dest.join("blobs").join("sha256");
    std::fs::create_dir_all(&blobs_dir)?;

    let mut layer_descriptors = Vec::new();
    let mut kept_diff_ids = Vec::new();
    for (layer_path, diff_id) in manifest.layers.iter().zip(&config.rootfs.diff_ids).skip(keep_from)
    {
        let blob = entries.get(Path::new(layer_path)).ok_or_else(|| {
            DockerError::CliError(format!("image export of {} is missing layer {}", image, layer_path))
        })?;
        let digest = hex_digest(blob);
        std::fs::write(blobs_dir.join(&digest), blob)?;
        layer_descriptors.push(json!({
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": format!("sha256:{}", digest),
            "size": blob.len(),
        }));
        kept_diff_ids.push(diff_id.clone());
    }

    let config_blob = serde_json::to_vec(&json!({
        "architecture": config.architecture,
        "os": config.os,
        "config": {},
        "rootfs": { "type": "layers", "diff_ids": kept_diff_ids },
    }))
    .expect("config serialization cannot fail");
    let config_digest = hex_digest(&config_blob);
    std::fs::write(blobs_dir.join(&config_digest), &config_blob)?;

    let manifest_blob = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": format!("sha256:{}", config_digest),
            "size": config_blob.len(),
        },
        "layers": layer_descriptors,
    }))
    .expect("manifest serialization cannot fail");
    let manifest_digest = hex_digest(&manifest_blob);
    std::fs::write(blobs_dir.join(&manifest_digest), &manifest_blob)?;

    let index = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "manifests": [{
            "mediaType": "application/vnd.oci.image.manifest.v1+json",
            "digest": format!("sha256:{}", manifest_digest),
            "size": manifest_blob.len(),
        }],
    }))
    .expect("index serialization cannot fail");
    std::fs::write(dest.join("index.json"), index)?;
    std::fs::write(dest.join("oci-layout"), br#"{"imageLayoutVersion":"1.0.0"}"#)?;

    debug!("saving extended layers took {:?}", started.elapsed());
    Ok(())
}

#[derive(Debug, serde::Deserialize)]
struct SavedManifest {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct SavedConfig {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
    rootfs: SavedRootFs,
}

#[derive(Debug, serde::Deserialize)]
struct SavedRootFs {
    diff_ids: Vec<String>,
}

fn hex_digest(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Result;
    use std::sync::Mutex;

    /// Daemon fake recording build calls and serving a canned image export.
    #[derive(Default)]
    struct FakeDaemon {
        builds: Mutex<Vec<ImageBuildOptions>>,
        top_layer: String,
        digest: String,
        saved: Vec<u8>,
    }

    #[allow(clippy::unused_async)]
    impl DockerClient for FakeDaemon {
        async fn ping(&self) -> Result<()> {
            Ok(())
        }
        async fn volume_remove(&self, _name: &str, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn image_build(&self, _context: Vec<u8>, options: ImageBuildOptions) -> Result<()> {
            self.builds.lock().unwrap().push(options);
            Ok(())
        }
        async fn image_os(&self, _image: &str) -> Result<String> {
            Ok("linux".to_string())
        }
        async fn image_digest(&self, _image: &str) -> Result<String> {
            Ok(self.digest.clone())
        }
        async fn image_top_layer(&self, _image: &str) -> Result<String> {
            Ok(self.top_layer.clone())
        }
        async fn image_labels(
            &self,
            _image: &str,
        ) -> Result<std::collections::HashMap<String, String>> {
            Ok(Default::default())
        }
        async fn image_save(&self, _image: &str) -> Result<Vec<u8>> {
            Ok(self.saved.clone())
        }
        async fn image_remove(&self, _image: &str, _force: bool) -> Result<()> {
            Ok(())
        }
        async fn container_create(
            &self,
            _options: &crate::docker::ContainerCreateOptions,
        ) -> Result<String> {
            unimplemented!("extender never creates containers")
        }
        async fn copy_to_container(&self, _id: &str, _dest: &str, _tar: Vec<u8>) -> Result<()> {
            unimplemented!()
        }
        async fn copy_from_container(&self, _id: &str, _path: &str) -> Result<Vec<u8>> {
            unimplemented!()
        }
        async fn container_run(&self, _id: &str, _log_prefix: &str) -> Result<i64> {
            unimplemented!()
        }
        async fn container_remove(&self, _id: &str, _force: bool) -> Result<()> {
            Ok(())
        }
    }

    fn write_extension(tmp: &Path, kind: &str, id: &str, dockerfile: &str) {
        std::fs::write(
            tmp.join("group.toml"),
            format!("[[group-extensions]]\nid = \"{}\"\nversion = \"1.0\"\n", id),
        )
        .unwrap();
        let dir = tmp.join("generated").join(kind).join(id.replace('/', "_"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), dockerfile).unwrap();
    }

    /// A daemon export with two uncompressed layers.
    fn fake_saved_image(layers: &[&[u8]]) -> (Vec<u8>, Vec<String>) {
        let mut diff_ids = Vec::new();
        let mut builder = tar::Builder::new(Vec::new());
        let mut layer_paths = Vec::new();
        for (i, blob) in layers.iter().enumerate() {
            diff_ids.push(format!("sha256:{}", hex_digest(blob)));
            let path = format!("layer{}/layer.tar", i);
            append_entry(&mut builder, &path, blob);
            layer_paths.push(path);
        }
        let config = serde_json::to_vec(&json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": diff_ids},
        }))
        .unwrap();
        append_entry(&mut builder, "cfg.json", &config);
        let manifest = serde_json::to_vec(&json!([
            {"Config": "cfg.json", "Layers": layer_paths}
        ]))
        .unwrap();
        append_entry(&mut builder, "manifest.json", &manifest);
        (builder.into_inner().unwrap(), diff_ids)
    }

    fn append_entry(builder: &mut tar::Builder<Vec<u8>>, name: &str, contents: &[u8]) {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        builder.append_data(&mut header, name, contents).unwrap();
    }

    #[tokio::test]
    async fn test_extend_build_tags_newbuilder_image() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(
            tmp.path(),
            "build",
            "ext/a",
            "ARG base_image\nFROM ${base_image}\nRUN true\n",
        );

        let daemon = FakeDaemon::default();
        extend_build_by_daemon(&daemon, tmp.path(), "builder:latest")
            .await
            .unwrap();

        let builds = daemon.builds.lock().unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(builds[0].tags, vec![BUILD_EXTENSION_TAG]);
        assert_eq!(
            builds[0].build_args.get("base_image").map(String::as_str),
            Some("builder:latest")
        );
        assert!(builds[0].remove);
    }

    #[tokio::test]
    async fn test_apply_skips_base_switch_dockerfiles() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("group.toml"),
            "[[group-extensions]]\nid = \"ext/switch\"\nversion = \"1.0\"\n\n\
             [[group-extensions]]\nid = \"ext/mutate\"\nversion = \"1.0\"\n",
        )
        .unwrap();
        let switch_dir = tmp.path().join("generated/build/ext_switch");
        std::fs::create_dir_all(&switch_dir).unwrap();
        std::fs::write(switch_dir.join("Dockerfile"), "FROM alpine:3.19\n").unwrap();
        let mutate_dir = tmp.path().join("generated/build/ext_mutate");
        std::fs::create_dir_all(&mutate_dir).unwrap();
        std::fs::write(
            mutate_dir.join("Dockerfile"),
            "ARG base_image\nFROM ${base_image}\nRUN apk add curl\n",
        )
        .unwrap();

        let daemon = FakeDaemon::default();
        extend_build_by_daemon(&daemon, tmp.path(), "builder:latest")
            .await
            .unwrap();

        // the FROM-only Dockerfile switches the base; only the mutating one
        // reaches the daemon
        let builds = daemon.builds.lock().unwrap();
        assert_eq!(builds.len(), 1);
        assert_eq!(
            builds[0].build_args.get("base_image").map(String::as_str),
            Some("builder:latest")
        );
    }

    #[tokio::test]
    async fn test_extend_build_explicit_base_skips_build_arg() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(tmp.path(), "build", "ext/a", "FROM alpine:3.19\nRUN true\n");

        let daemon = FakeDaemon::default();
        extend_build_by_daemon(&daemon, tmp.path(), "builder:latest")
            .await
            .unwrap();
        assert!(daemon.builds.lock().unwrap()[0].build_args.is_empty());
    }

    #[tokio::test]
    async fn test_extend_run_exports_to_digest_directory() {
        let tmp = tempfile::tempdir().unwrap();
        write_extension(
            tmp.path(),
            "run",
            "ext/a",
            "ARG base_image\nFROM ${base_image}\nRUN true\n",
        );

        let (saved, diff_ids) = fake_saved_image(&[b"layer-one", b"layer-two"]);
        let daemon = FakeDaemon {
            top_layer: diff_ids[0].clone(),
            digest: "sha256:feed".to_string(),
            saved,
            ..Default::default()
        };

        let dest = extend_run_by_daemon(&daemon, tmp.path(), "run-base:latest")
            .await
            .unwrap();
        assert_eq!(
            dest,
            tmp.path().join("extended-new").join("run").join("sha256:feed")
        );

        let builds = daemon.builds.lock().unwrap();
        assert_eq!(builds[0].tags, vec![RUN_EXTENSION_TAG]);
        assert_eq!(
            builds[0].build_args.get("base_image").map(String::as_str),
            Some("run-base:latest")
        );

        assert!(dest.join("oci-layout").is_file());
        assert!(dest.join("index.json").is_file());
    }

    #[tokio::test]
    async fn test_save_layers_keeps_only_layers_above_original_top() {
        let (saved, diff_ids) = fake_saved_image(&[b"layer-one", b"layer-two"]);
        let daemon = FakeDaemon {
            saved,
            ..Default::default()
        };
        let dest = tempfile::tempdir().unwrap();

        save_layers(&daemon, "run-image:latest", &diff_ids[0], dest.path())
            .await
            .unwrap();

        let kept = hex_digest(b"layer-two");
        let dropped = hex_digest(b"layer-one");
        let blobs = dest.path().join("blobs").join("sha256");
        assert!(blobs.join(kept).is_file());
        assert!(!blobs.join(dropped).exists());

        let index: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dest.path().join("index.json")).unwrap())
                .unwrap();
        assert_eq!(index["manifests"].as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_save_layers_unknown_top_keeps_everything() {
        let (saved, _) = fake_saved_image(&[b"layer-one", b"layer-two"]);
        let daemon = FakeDaemon {
            saved,
            ..Default::default()
        };
        let dest = tempfile::tempdir().unwrap();

        save_layers(&daemon, "run-image:latest", "sha256:unknown", dest.path())
            .await
            .unwrap();

        let blobs = dest.path().join("blobs").join("sha256");
        assert!(blobs.join(hex_digest(b"layer-one")).is_file());
        assert!(blobs.join(hex_digest(b"layer-two")).is_file());
    }
}
