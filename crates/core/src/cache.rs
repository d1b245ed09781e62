//! Build and launch cache backends
//!
//! A run carries two independent caches: the build cache (layer metadata
//! reused across builds) and the launch cache (OCI blobs reused when
//! exporting to the local daemon). Each materializes as one of three
//! backends: a registry image, a daemon volume, or a host directory.

use crate::docker::DockerClient;
use crate::errors::Result;
use crate::paths::filter_reserved_names;
use crate::refs::ImageRef;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tracing::debug;

/// Cache backend kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheFormat {
    Image,
    Volume,
    Bind,
}

impl std::str::FromStr for CacheFormat {
    type Err = crate::errors::ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "image" => Ok(Self::Image),
            "volume" => Ok(Self::Volume),
            "bind" => Ok(Self::Bind),
            _ => Err(crate::errors::ConfigError::Validation {
                message: format!(
                    "unsupported cache format: '{}'. Supported formats: image, volume, bind",
                    s
                ),
            }),
        }
    }
}

impl std::fmt::Display for CacheFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Volume => write!(f, "volume"),
            Self::Bind => write!(f, "bind"),
        }
    }
}

/// User configuration for one cache.
#[derive(Debug, Clone)]
pub struct CacheInfo {
    pub format: CacheFormat,
    /// image reference, volume name, or host path; empty means derived
    pub source: String,
}

impl Default for CacheInfo {
    fn default() -> Self {
        Self {
            format: CacheFormat::Volume,
            source: String::new(),
        }
    }
}

/// Per-run cache configuration.
#[derive(Debug, Clone, Default)]
pub struct CacheOpts {
    pub build: CacheInfo,
    pub launch: CacheInfo,
}

/// A materialized cache backend.
#[derive(Debug, Clone)]
pub enum Cache {
    Image { reference: ImageRef },
    Volume { name: String },
    Bind { path: PathBuf },
}

impl Cache {
    /// Materialize a volume cache for `image`, deriving a stable name from
    /// the image reference unless the configuration names one explicitly.
    pub fn volume(image: &ImageRef, info: &CacheInfo, suffix: &str) -> Self {
        let name = if info.source.is_empty() {
            let digest = Sha256::digest(image.name().as_bytes());
            let short = hex_prefix(&digest, 12);
            filter_reserved_names(&format!("pack-cache-{}.{}", short, suffix))
        } else {
            filter_reserved_names(&info.source)
        };
        Cache::Volume { name }
    }

    pub fn bind(info: &CacheInfo) -> Self {
        Cache::Bind {
            path: PathBuf::from(&info.source),
        }
    }

    pub fn image(reference: ImageRef) -> Self {
        Cache::Image { reference }
    }

    /// Backend name: image reference, volume name, or host path.
    pub fn name(&self) -> String {
        match self {
            Cache::Image { reference } => reference.name().to_string(),
            Cache::Volume { name } => name.clone(),
            Cache::Bind { path } => path.display().to_string(),
        }
    }

    pub fn cache_type(&self) -> CacheFormat {
        match self {
            Cache::Image { .. } => CacheFormat::Image,
            Cache::Volume { .. } => CacheFormat::Volume,
            Cache::Bind { .. } => CacheFormat::Bind,
        }
    }

    /// Drop the cache's contents. Missing backends are treated as already
    /// cleared.
    pub async fn clear<D: DockerClient>(&self, docker: &D) -> Result<()> {
        match self {
            Cache::Image { reference } => docker.image_remove(reference.name(), true).await,
            Cache::Volume { name } => docker.volume_remove(name, true).await,
            Cache::Bind { path } => {
                if path.exists() {
                    std::fs::remove_dir_all(path)?;
                }
                std::fs::create_dir_all(path)?;
                Ok(())
            }
        }
    }
}

fn hex_prefix(digest: &[u8], chars: usize) -> String {
    let mut out = String::with_capacity(chars);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
        if out.len() >= chars {
            break;
        }
    }
    out.truncate(chars);
    out
}

/// Select the build cache from the run options.
///
/// An explicit cache image (flag or build-cache format) wins; otherwise the
/// configured format decides between volume and bind.
pub fn resolve_build_cache(
    image: &ImageRef,
    cache: &CacheOpts,
    cache_image: Option<&str>,
) -> Result<Cache> {
    let explicit_image = cache_image.filter(|s| !s.is_empty());
    if explicit_image.is_some() || cache.build.format == CacheFormat::Image {
        let source = explicit_image.unwrap_or(cache.build.source.as_str());
        let reference = ImageRef::parse(source)?;
        return Ok(Cache::image(reference));
    }

    let selected = match cache.build.format {
        CacheFormat::Volume => {
            let cache = Cache::volume(image, &cache.build, "build");
            debug!("Using build cache volume {}", cache.name());
            cache
        }
        CacheFormat::Bind => {
            let cache = Cache::bind(&cache.build);
            debug!("Using build cache dir {}", cache.name());
            cache
        }
        CacheFormat::Image => unreachable!("image format handled above"),
    };
    Ok(selected)
}

/// The launch cache is always a volume derived from the target image.
pub fn resolve_launch_cache(image: &ImageRef, cache: &CacheOpts) -> Cache {
    Cache::volume(image, &cache.launch, "launch")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str) -> ImageRef {
        ImageRef::parse(name).unwrap()
    }

    #[test]
    fn test_volume_name_is_stable_and_suffixed() {
        let img = image("registry.example/app:latest");
        let build = Cache::volume(&img, &CacheInfo::default(), "build");
        let launch = Cache::volume(&img, &CacheInfo::default(), "launch");
        assert!(build.name().starts_with("pack-cache-"));
        assert!(build.name().ends_with(".build"));
        assert!(launch.name().ends_with(".launch"));
        assert_eq!(build.name(), Cache::volume(&img, &CacheInfo::default(), "build").name());
        assert_ne!(build.name(), launch.name());
    }

    #[test]
    fn test_volume_name_differs_per_image() {
        let a = Cache::volume(&image("app-a"), &CacheInfo::default(), "build");
        let b = Cache::volume(&image("app-b"), &CacheInfo::default(), "build");
        assert_ne!(a.name(), b.name());
    }

    #[test]
    fn test_explicit_volume_name_wins() {
        let info = CacheInfo {
            format: CacheFormat::Volume,
            source: "my-cache".to_string(),
        };
        let cache = Cache::volume(&image("app"), &info, "build");
        assert_eq!(cache.name(), "my-cache");
    }

    #[test]
    fn test_resolve_build_cache_image_flag_wins() {
        let cache = resolve_build_cache(
            &image("app"),
            &CacheOpts::default(),
            Some("registry.example/cache:img"),
        )
        .unwrap();
        assert_eq!(cache.cache_type(), CacheFormat::Image);
        assert_eq!(cache.name(), "registry.example/cache:img");
    }

    #[test]
    fn test_resolve_build_cache_image_format() {
        let opts = CacheOpts {
            build: CacheInfo {
                format: CacheFormat::Image,
                source: "cache-img".to_string(),
            },
            ..Default::default()
        };
        let cache = resolve_build_cache(&image("app"), &opts, None).unwrap();
        assert_eq!(cache.cache_type(), CacheFormat::Image);
    }

    #[test]
    fn test_resolve_build_cache_invalid_image_name() {
        let err = resolve_build_cache(&image("app"), &CacheOpts::default(), Some("has space"))
            .unwrap_err();
        assert!(err.to_string().contains("invalid image name"));
    }

    #[test]
    fn test_resolve_build_cache_bind() {
        let opts = CacheOpts {
            build: CacheInfo {
                format: CacheFormat::Bind,
                source: "/tmp/cache".to_string(),
            },
            ..Default::default()
        };
        let cache = resolve_build_cache(&image("app"), &opts, None).unwrap();
        assert_eq!(cache.cache_type(), CacheFormat::Bind);
        assert_eq!(cache.name(), "/tmp/cache");
    }

    #[test]
    fn test_launch_cache_is_always_volume() {
        let opts = CacheOpts {
            launch: CacheInfo {
                format: CacheFormat::Bind,
                source: String::new(),
            },
            ..Default::default()
        };
        let cache = resolve_launch_cache(&image("app"), &opts);
        assert_eq!(cache.cache_type(), CacheFormat::Volume);
    }

    #[test]
    fn test_cache_format_parse() {
        assert_eq!("volume".parse::<CacheFormat>().unwrap(), CacheFormat::Volume);
        assert_eq!("IMAGE".parse::<CacheFormat>().unwrap(), CacheFormat::Image);
        assert!("disk".parse::<CacheFormat>().is_err());
    }
}
