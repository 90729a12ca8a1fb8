use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, error, info_span, warn, Instrument};

use fab_domain::{
    ConfigError, EngineConfig, ImportDescriptor, ImportKind, ObjectCategory, PackagePath,
    MANIFEST_FILENAME,
};

use crate::bridge::WorkerBridge;
use crate::cache::BlobCache;
use crate::effects::Effects;
use crate::fetch::{FetchStats, Fetchers};
use crate::project::{Artifact, ProjectNode, Target};
use crate::registry::FactoryRegistry;
use crate::runtime::RuntimeManager;
use crate::worker;

/// Resolution counters exposed for status reporting and tests.
#[derive(Debug, Default)]
pub struct ResolverStats {
    packages_resolved: AtomicU64,
}

impl ResolverStats {
    #[must_use]
    pub fn packages_resolved(&self) -> u64 {
        self.packages_resolved.load(Ordering::Relaxed)
    }
}

/// Owns the map of all resolved packages and materializes the dependency
/// graph on demand.
///
/// All engine state (nodes, locks, runtimes, caches) lives here; there
/// are no module-level singletons, so independent resolvers coexist in
/// one process.
pub struct Resolver {
    config: EngineConfig,
    registry: FactoryRegistry,
    bridge: WorkerBridge,
    runtime: RuntimeManager,
    artifacts: BlobCache,
    fetchers: Fetchers,
    current: PackagePath,
    projects: RwLock<HashMap<PackagePath, Arc<ProjectNode>>>,
    /// One mutex per package name, created on first use; holders fetch and
    /// register that one package without blocking unrelated ones.
    package_locks: Mutex<HashMap<PackagePath, Arc<tokio::sync::Mutex<()>>>>,
    /// In-flight imports, to catch recursive loading.
    loading: Mutex<HashSet<PackagePath>>,
    stats: ResolverStats,
}

impl Resolver {
    /// Creates a resolver rooted at `root_path` and imports the root
    /// package.
    ///
    /// # Errors
    ///
    /// Returns an error when the root package cannot be registered.
    pub async fn new(
        root_path: impl Into<PathBuf>,
        config: EngineConfig,
        effects: &dyn Effects,
    ) -> Result<Arc<Self>> {
        Self::with_registry(root_path, config, effects, FactoryRegistry::builtin()).await
    }

    /// Like [`Resolver::new`], with a caller-assembled factory registry.
    ///
    /// # Errors
    ///
    /// Returns an error when the root package cannot be registered.
    pub async fn with_registry(
        root_path: impl Into<PathBuf>,
        config: EngineConfig,
        effects: &dyn Effects,
        registry: FactoryRegistry,
    ) -> Result<Arc<Self>> {
        let root_path = root_path.into();
        let resolver = Arc::new(Self {
            bridge: WorkerBridge::new(config.threads_max),
            runtime: RuntimeManager::new(&config, effects.runner()),
            artifacts: BlobCache::new(&config, "objects"),
            fetchers: Fetchers::new(&config, effects.git()),
            config,
            registry,
            current: PackagePath::root(),
            projects: RwLock::new(HashMap::new()),
            package_locks: Mutex::new(HashMap::new()),
            loading: Mutex::new(HashSet::new()),
            stats: ResolverStats::default(),
        });

        let descriptor =
            ImportDescriptor::local(PackagePath::root(), root_path.display().to_string());
        resolver
            .import_project(None, descriptor)
            .await
            .context("failed to register the root package")?;
        Ok(resolver)
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn registry(&self) -> &FactoryRegistry {
        &self.registry
    }

    #[must_use]
    pub fn bridge(&self) -> &WorkerBridge {
        &self.bridge
    }

    #[must_use]
    pub fn runtime(&self) -> &RuntimeManager {
        &self.runtime
    }

    #[must_use]
    pub fn artifact_cache(&self) -> &BlobCache {
        &self.artifacts
    }

    #[must_use]
    pub fn stats(&self) -> &ResolverStats {
        &self.stats
    }

    #[must_use]
    pub fn fetch_stats(&self) -> Arc<FetchStats> {
        self.fetchers.stats().clone()
    }

    fn lookup(&self, name: &PackagePath) -> Option<Arc<ProjectNode>> {
        self.projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// All currently-registered packages, in no particular order.
    #[must_use]
    pub fn packages(&self) -> Vec<Arc<ProjectNode>> {
        self.projects
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    fn package_lock(&self, name: &PackagePath) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self
            .package_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks
            .entry(name.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Resolves `reference` relative to the current package.
    ///
    /// Walks the path one segment at a time: an already-registered child
    /// wins, then a same-named subfolder carrying a manifest, then an
    /// explicit dependency entry dispatched to the matching fetcher.
    /// `Ok(None)` means not found; broken packages are still returned.
    ///
    /// # Errors
    ///
    /// Returns an error when a fetch along the walk fails hard.
    pub async fn get_project(
        self: &Arc<Self>,
        reference: &str,
    ) -> Result<Option<Arc<ProjectNode>>> {
        let path = PackagePath::resolve(&self.current, reference);
        self.get_project_at(&path).await
    }

    /// See [`Resolver::get_project`].
    ///
    /// # Errors
    ///
    /// Returns an error when a fetch along the walk fails hard.
    pub async fn get_project_at(
        self: &Arc<Self>,
        path: &PackagePath,
    ) -> Result<Option<Arc<ProjectNode>>> {
        let Some(mut current) = self.lookup(&PackagePath::root()) else {
            return Ok(None);
        };
        for segment in path.segments() {
            let child_path = current.name.child(segment);
            if let Some(registered) = self.lookup(&child_path) {
                current = registered;
                continue;
            }
            if current.has_package_subfolder(segment) {
                debug!("importing a subfolder: {child_path}");
                let descriptor = ImportDescriptor::local(child_path, segment);
                current = self.import_project(Some(current.clone()), descriptor).await?;
                continue;
            }
            if let Some(dep) = current.manifest.dependencies.get(segment) {
                let name = if dep.only_in_root {
                    PackagePath::root().child(segment)
                } else {
                    child_path
                };
                debug!("loading the dependency: {name}");
                let descriptor = ImportDescriptor::from_dependency(name, dep);
                current = self.import_project(Some(current.clone()), descriptor).await?;
                continue;
            }
            return Ok(None);
        }
        Ok(Some(current))
    }

    /// Fetches and registers one package under its per-name lock.
    ///
    /// A second concurrent requester blocks until the first completes and
    /// then observes the already-registered node: no duplicate fetch, no
    /// duplicate node.
    ///
    /// # Errors
    ///
    /// Returns an error when the fetch fails hard or the manifest's
    /// version gate is unsatisfied.
    pub async fn import_project(
        self: &Arc<Self>,
        parent: Option<Arc<ProjectNode>>,
        descriptor: ImportDescriptor,
    ) -> Result<Arc<ProjectNode>> {
        let name = descriptor.name.clone();
        let lock = self.package_lock(&name);
        let _guard = lock.lock().await;

        if let Some(existing) = self.lookup(&name) {
            return Ok(existing);
        }
        {
            let mut loading = self
                .loading
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if !loading.insert(name.clone()) {
                bail!("recursive package loading detected ({name}), aborting");
            }
        }

        let result = self
            .import_locked(parent, &descriptor)
            .instrument(info_span!("import", package = %name))
            .await;
        self.loading
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&name);
        result
    }

    async fn import_locked(
        self: &Arc<Self>,
        parent: Option<Arc<ProjectNode>>,
        descriptor: &ImportDescriptor,
    ) -> Result<Arc<ProjectNode>> {
        let name = descriptor.name.clone();
        let parent_dir = parent
            .as_ref()
            .map(|node| node.path.clone())
            .unwrap_or_default();

        let path = match descriptor.kind {
            ImportKind::Local => {
                let this = self.clone();
                let descriptor = descriptor.clone();
                let dir = parent_dir.clone();
                self.bridge
                    .run_detached(move || this.fetchers.fetch(&dir, &descriptor))
                    .await??
            }
            ImportKind::Git | ImportKind::Archive => {
                let this = self.clone();
                let descriptor = descriptor.clone();
                let dir = parent_dir.clone();
                self.bridge
                    .run(move || this.fetchers.fetch(&dir, &descriptor))
                    .await?
                    .with_context(|| format!("failed to fetch {name}"))?
            }
        };

        let inherited = if descriptor.inherited.is_empty() {
            parent
                .as_ref()
                .map(|node| node.inherited.clone())
                .unwrap_or_default()
        } else {
            descriptor.inherited.clone()
        };

        // Only the root package may legitimately have no manifest at all.
        let allow_missing = name.is_root();
        let node = ProjectNode::load(name.clone(), path, inherited, allow_missing)?;
        if node.broken {
            error!("failed to parse the package configuration: {name}");
        }

        self.projects
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(name, node.clone());
        self.stats.packages_resolved.fetch_add(1, Ordering::Relaxed);
        Ok(node)
    }

    /// Asynchronously materializes the whole subtree under `root`
    /// (default: the graph root).
    ///
    /// Fans out breadth-first with a task-accumulation loop interleaving
    /// iterate-children and import-one-package work until both drain.
    /// Declared dependencies are scheduled before subfolder scans so a
    /// long network fetch cannot block discovery of local children. A
    /// failed or broken branch is logged and skipped; unrelated branches
    /// continue.
    ///
    /// # Errors
    ///
    /// Returns an error only when `root` itself is unknown.
    pub async fn import_all(self: &Arc<Self>, root: Option<&PackagePath>) -> Result<()> {
        let start = root.cloned().unwrap_or_else(PackagePath::root);
        let Some(project) = self.lookup(&start) else {
            return Err(ConfigError::PackageNotFound(start.to_string()).into());
        };

        let mut iterate_queue: Vec<Arc<ProjectNode>> = vec![project];
        let mut iterated: HashSet<PackagePath> = HashSet::new();
        let mut imports: JoinSet<Result<Arc<ProjectNode>>> = JoinSet::new();

        loop {
            for project in iterate_queue.drain(..) {
                if !iterated.insert(project.name.clone()) {
                    continue;
                }
                for (parent, descriptor) in self.children_to_import(&project) {
                    let this = self.clone();
                    imports.spawn(async move {
                        this.import_project(Some(parent), descriptor).await
                    });
                }
            }
            let Some(joined) = imports.join_next().await else {
                break;
            };
            match joined.context("import task failed")? {
                Ok(node) => iterate_queue.push(node),
                // One unreachable package must not abort the others.
                Err(err) => warn!("import failed: {err:#}"),
            }
        }
        Ok(())
    }

    /// The imports one package fans out to: declared dependencies first,
    /// then on-disk subfolders carrying a manifest.
    fn children_to_import(
        self: &Arc<Self>,
        project: &Arc<ProjectNode>,
    ) -> Vec<(Arc<ProjectNode>, ImportDescriptor)> {
        let mut out = Vec::new();
        if project.broken {
            warn!("ignoring the broken package: {}", project.name);
            return out;
        }

        for (dep_name, dep) in &project.manifest.dependencies {
            if dep.only_in_root && !project.name.is_root() {
                continue;
            }
            let name = if dep.only_in_root {
                PackagePath::root().child(dep_name)
            } else {
                project.name.child(dep_name)
            };
            // A dependency pointing back at the root would cycle; skip it.
            if name.is_root() {
                continue;
            }
            out.push((
                project.clone(),
                ImportDescriptor::from_dependency(name, dep),
            ));
        }

        let Ok(entries) = std::fs::read_dir(&project.path) else {
            return out;
        };
        let mut subfolders: Vec<String> = entries
            .filter_map(Result::ok)
            .filter(|entry| entry.path().join(MANIFEST_FILENAME).is_file())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .collect();
        subfolders.sort();
        for subfolder in subfolders {
            let name = project.name.child(&subfolder);
            out.push((
                project.clone(),
                ImportDescriptor::local(name, subfolder),
            ));
        }
        out
    }

    /// Resolves an object reference (`"<pkg>:<name>"` or a bare name in
    /// the current package) to its build object, instantiating it through
    /// the factory registry on first request.
    ///
    /// # Errors
    ///
    /// `PackageNotFound`/`BrokenPackage`/`BadObject` configuration errors,
    /// or a hard fetch failure along the package walk.
    pub async fn get_object(
        self: &Arc<Self>,
        category: ObjectCategory,
        spec: &str,
    ) -> Result<Arc<Target>> {
        let (package, name) = fab_domain::split_object_spec(&self.current, spec);
        let node = self
            .get_project_at(&package)
            .await?
            .ok_or_else(|| ConfigError::PackageNotFound(package.to_string()))?;
        Ok(self.registry.construct(&node, category, &name)?)
    }

    /// Realizes the target's artifact: cache first, then the producer,
    /// inside the sandboxed runtime for worker producers.
    ///
    /// # Errors
    ///
    /// `BuildError` when the producer reports failure; configuration
    /// errors for invalid alias/enrich chains.
    pub async fn realize(self: &Arc<Self>, target: &Arc<Target>) -> Result<Arc<Artifact>> {
        worker::realize(self, target, None).await
    }

    /// [`Resolver::realize`] with a per-call deadline for the producer
    /// subprocess.
    ///
    /// # Errors
    ///
    /// See [`Resolver::realize`]; additionally fails when the deadline
    /// expires.
    pub async fn realize_with_deadline(
        self: &Arc<Self>,
        target: &Arc<Target>,
        timeout: std::time::Duration,
    ) -> Result<Arc<Artifact>> {
        worker::realize(self, target, Some(timeout)).await
    }
}

/// Finds the topmost enclosing package: walks up from `start` while the
/// parent directory also carries a manifest.
#[must_use]
pub fn discover_root(start: &Path) -> PathBuf {
    let mut root = start.to_path_buf();
    while let Some(parent) = root.parent() {
        if parent.join(MANIFEST_FILENAME).is_file() {
            root = parent.to_path_buf();
        } else {
            break;
        }
    }
    root
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    use crate::effects::SystemEffects;

    fn config_for(dir: &Path) -> EngineConfig {
        EngineConfig {
            state_dir: dir.join("state"),
            ..EngineConfig::default()
        }
    }

    fn write_manifest(dir: &Path, text: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(MANIFEST_FILENAME), text).unwrap();
    }

    #[tokio::test]
    async fn resolves_subfolder_packages_on_demand() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        write_manifest(&root, "desc: root\n");
        write_manifest(
            &root.join("sub"),
            "parts:\n  cube:\n    type: file\n    path: cube.stl\n",
        );

        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        let sub = resolver.get_project("//sub").await?.expect("sub resolves");
        assert!(!sub.broken);
        assert_eq!(sub.name.as_str(), "//sub");
        assert!(sub
            .object_entry(ObjectCategory::Part, "cube")
            .is_some());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_packages_are_not_found() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        write_manifest(&root, "");
        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        assert!(resolver.get_project("//missing").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn broken_manifest_registers_a_broken_node() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        write_manifest(&root, "");
        write_manifest(&root.join("bad"), ":\n  - not yaml");

        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        let bad = resolver.get_project("//bad").await?.expect("registered");
        assert!(bad.broken);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_resolution_yields_one_node() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        write_manifest(&root, "");
        write_manifest(&root.join("sub"), "desc: sub\n");

        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        let mut tasks = JoinSet::new();
        for _ in 0..8 {
            let resolver = resolver.clone();
            tasks.spawn(async move { resolver.get_project("//sub").await });
        }
        let mut nodes = Vec::new();
        while let Some(result) = tasks.join_next().await {
            nodes.push(result??.expect("resolved"));
        }
        for node in &nodes[1..] {
            assert!(Arc::ptr_eq(&nodes[0], node));
        }
        // The root plus exactly one child registration.
        assert_eq!(resolver.stats().packages_resolved(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn import_all_walks_dependencies_and_subfolders() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        write_manifest(&root, "dependencies:\n  lib:\n    path: ../lib\n");
        write_manifest(&root.join("sub"), "desc: sub\n");
        write_manifest(&root.join("sub/inner"), "desc: inner\n");
        write_manifest(&dir.path().join("lib"), "desc: lib\n");

        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        resolver.import_all(None).await?;

        let names: HashSet<String> = resolver
            .packages()
            .iter()
            .map(|node| node.name.to_string())
            .collect();
        assert!(names.contains("//"));
        assert!(names.contains("//lib"));
        assert!(names.contains("//sub"));
        assert!(names.contains("//sub/inner"));
        Ok(())
    }

    #[tokio::test]
    async fn import_all_skips_root_cycle() -> Result<()> {
        let dir = tempdir()?;
        let root = dir.path().join("root");
        // A dependency resolving back to the root package is skipped, not
        // an error.
        write_manifest(
            &root,
            "dependencies:\n  '..':\n    path: .\n  sub:\n    path: sub\n",
        );
        write_manifest(&root.join("sub"), "desc: sub\n");

        let resolver =
            Resolver::new(&root, config_for(dir.path()), &SystemEffects::new()).await?;
        resolver.import_all(None).await?;
        // Root and `sub`; the back-edge never became a third registration.
        assert_eq!(resolver.stats().packages_resolved(), 2);
        Ok(())
    }

    #[test]
    fn discover_root_walks_up_to_the_topmost_manifest() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("top");
        write_manifest(&root, "");
        write_manifest(&root.join("mid"), "");
        write_manifest(&root.join("mid/leaf"), "");
        assert_eq!(discover_root(&root.join("mid/leaf")), root);
        assert_eq!(discover_root(&root), root);
    }
}
