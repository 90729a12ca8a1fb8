use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use base64::prelude::{Engine as _, BASE64_STANDARD};
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;
use tracing::{debug, warn};

use fab_domain::BuildError;

use crate::cache::{collect_file_dependencies, CacheKey};
use crate::process::RunOutput;
use crate::project::{Artifact, ProjectNode, Target};
use crate::registry::{resolve_chain, Producer};
use crate::resolver::Resolver;

const ARTIFACT_BLOB: &str = "artifact";
const DEFAULT_RUNTIME_VERSION: &str = "3.11";

/// Payload handed to a build worker on stdin.
#[derive(Debug, Serialize)]
pub struct BuildRequest<'a> {
    pub object: &'a str,
    pub category: &'a str,
    pub config: serde_json::Value,
    /// Absolute paths of the object's source files.
    pub files: Vec<String>,
}

/// The worker's reply on stdout.
#[derive(Debug, Deserialize)]
pub struct BuildResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Base64-encoded artifact bytes.
    #[serde(default)]
    pub artifact: Option<String>,
}

/// Realizes a target's artifact: in-memory slot, then the blob cache,
/// then the concrete producer.
pub(crate) async fn realize(
    resolver: &Arc<Resolver>,
    target: &Arc<Target>,
    timeout: Option<Duration>,
) -> Result<Arc<Artifact>> {
    if let Some(cached) = target.cached_artifact() {
        return Ok(cached);
    }

    let resolved = resolve_chain(resolver, target).await?;
    let concrete = resolved.target.clone();
    if let Some(cached) = concrete.cached_artifact() {
        target.store_artifact(cached.clone());
        return Ok(cached);
    }
    let node = concrete.project().ok_or_else(|| {
        anyhow!("{}: owning package was discarded", concrete.full_name())
    })?;

    let artifact = match &concrete.producer {
        Producer::File { path } => realize_file(resolver, node.path.join(path)).await?,
        Producer::Worker {
            command,
            files,
            requirements,
        } => {
            realize_worker(
                resolver,
                &concrete,
                &resolved.config,
                &node,
                command.clone(),
                files,
                requirements.clone(),
                timeout,
            )
            .await?
        }
        Producer::Alias { .. } | Producer::Enrich { .. } => {
            return Err(anyhow!(
                "{}: unresolved indirection survived chain resolution",
                concrete.full_name()
            ))
        }
    };

    let artifact = Arc::new(artifact);
    concrete.store_artifact(artifact.clone());
    if !Arc::ptr_eq(target, &concrete) {
        // Aliases share the source's artifact.
        target.store_artifact(artifact.clone());
    }
    Ok(artifact)
}

async fn realize_file(resolver: &Arc<Resolver>, path: PathBuf) -> Result<Artifact> {
    let content = resolver
        .bridge()
        .run_detached(move || std::fs::read(&path))
        .await??;
    Ok(Artifact { content })
}

#[allow(clippy::too_many_arguments)]
async fn realize_worker(
    resolver: &Arc<Resolver>,
    concrete: &Arc<Target>,
    config: &Mapping,
    node: &Arc<ProjectNode>,
    command: Vec<String>,
    files: &[String],
    requirements: Vec<String>,
    timeout: Option<Duration>,
) -> Result<Artifact> {
    let full_name = concrete.full_name();

    let mut file_paths: Vec<PathBuf> = Vec::new();
    for file in files {
        file_paths.extend(collect_file_dependencies(&node.path.join(file)));
    }
    let key = match CacheKey::new(&full_name, config, &file_paths) {
        Ok(key) => Some(key),
        // An unreadable dependency just means no caching for this build.
        Err(err) => {
            warn!("no cache key for {full_name}: {err:#}");
            None
        }
    };
    if let Some(key) = &key {
        let mut read = resolver.artifact_cache().read(key, &[ARTIFACT_BLOB]).await;
        if let Some(Some(content)) = read.remove(ARTIFACT_BLOB) {
            debug!("cache hit for {full_name}");
            return Ok(Artifact { content });
        }
    }

    let version = node
        .manifest
        .runtime_version
        .clone()
        .unwrap_or_else(|| DEFAULT_RUNTIME_VERSION.to_string());
    let runtime = resolver.runtime().get_runtime(&version, None);
    let session = runtime.session(&full_name);

    let request = BuildRequest {
        object: &full_name,
        category: concrete.category.as_str(),
        config: serde_json::to_value(config)?,
        files: file_paths
            .iter()
            .map(|path| path.display().to_string())
            .collect(),
    };
    let stdin = serde_json::to_string(&request)?;

    let worker_node = node.clone();
    let output: RunOutput = resolver
        .bridge()
        .run(move || -> Result<RunOutput> {
            runtime.prepare_for_package(&worker_node, Some(&session))?;
            for spec in &requirements {
                runtime.ensure(spec, Some(&session))?;
            }
            runtime.run(
                &command,
                Some(&stdin),
                Some(&worker_node.path),
                Some(&session),
                timeout,
            )
        })
        .await??;

    let response: BuildResponse = serde_json::from_str(output.stdout.trim()).map_err(|err| {
        BuildError::new(
            &full_name,
            format!(
                "unintelligible producer output: {err}; stderr: {}",
                output.stderr.trim()
            ),
        )
    })?;
    if !response.success {
        let message = response
            .error
            .unwrap_or_else(|| output.stderr.trim().to_string());
        return Err(BuildError::new(&full_name, message).into());
    }
    let content = match response.artifact {
        Some(encoded) => BASE64_STANDARD.decode(encoded.trim()).map_err(|err| {
            BuildError::new(&full_name, format!("undecodable artifact payload: {err}"))
        })?,
        None => Vec::new(),
    };

    if let Some(key) = &key {
        let mut items = HashMap::new();
        items.insert(ARTIFACT_BLOB.to_string(), content.clone());
        resolver.artifact_cache().write(key, items).await;
    }
    Ok(Artifact { content })
}
