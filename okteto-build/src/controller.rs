use anyhow::anyhow;
use futures::{
    future,
    stream::{self, StreamExt},
};
use indexmap::IndexMap;
use log::{debug, info, warn};
use std::{
    collections::{BTreeMap as Map, HashMap},
    fs,
    future::Future,
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};
use tokio::sync::watch;

use crate::{
    checker::{CacheHit, ImageChecker},
    config::BuilderConfig,
    environment::{service_env_var, BuildEnvironment, ServiceEnvVarsSetter, IMAGE_SUFFIX},
    error::{BuildError, RegistryError, ValidationError},
    graph::{BuildGraph, GraphBuilder},
    hasher::ServiceHasher,
    metadata::{BuildMetadata, CompletionHook, MetadataCollector},
    models::{
        BuildArg, BuildInfo, BuildOptions, BuildPolicy, Manifest, ManifestKind, VolumeMount,
        GLOBAL_REGISTRY,
    },
    services::{BuildRunner, RegistryClient, RepositoryInfo},
    tagger::ImageTagger,
};

/// What the caller asked for on top of the manifest.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BuildRequest {
    /// Services to build. Empty means every declared service.
    pub services: Vec<String>,
    pub policy: BuildPolicy,
    pub tag: Option<String>,
    pub target: Option<String>,
    pub cache_from: Vec<String>,
    pub secrets: Map<String, String>,
}

impl Default for BuildRequest {
    fn default() -> Self {
        BuildRequest {
            services: Vec::new(),
            policy: BuildPolicy::IfChanged,
            tag: None,
            target: None,
            cache_from: Vec::new(),
            secrets: Map::new(),
        }
    }
}

impl BuildRequest {
    fn has_single_image_overrides(&self) -> bool {
        self.tag.is_some()
            || self.target.is_some()
            || !self.cache_from.is_empty()
            || !self.secrets.is_empty()
    }
}

/// Result of the cache check for one service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CacheStatus {
    /// An image built from the same inputs exists and will be reused.
    Hit(String),
    Miss,
    /// Nothing to build: the service only references an image, or declares
    /// neither a Dockerfile nor volumes.
    NotBuildable,
}

impl CacheStatus {
    fn satisfies_dependents(&self) -> bool {
        !matches!(self, CacheStatus::Miss)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PlannedService {
    pub service: String,
    pub hash: String,
    pub status: CacheStatus,
}

/// Output of a successful build run.
#[derive(Clone, Debug, Default)]
pub struct BuildOutcome {
    /// Resolved image per service, in build order.
    pub images: IndexMap<String, String>,
    pub metadata: IndexMap<String, BuildMetadata>,
    /// Variables published by this run only.
    pub environment: BuildEnvironment,
}

/// The service definitions a run works on, after request overrides and
/// registry rules are applied.
struct BuildPlan {
    manifest_name: String,
    infos: IndexMap<String, BuildInfo>,
    graph: BuildGraph,
    ordered: Vec<String>,
}

/// Caches and published variables of one `build` or `plan` call. Nothing
/// here outlives the call, so repeated runs on one controller start fresh.
struct RunState {
    hasher: ServiceHasher,
    env_setter: ServiceEnvVarsSetter,
    metadata: MetadataCollector,
}

pub struct Controller {
    config: BuilderConfig,
    runner: Arc<dyn BuildRunner>,
    registry: Arc<dyn RegistryClient>,
    repository: Arc<dyn RepositoryInfo>,
    tagger: ImageTagger,
    volume_tagger: ImageTagger,
    checker: ImageChecker,
    hooks: Vec<CompletionHook>,
    working_dir: PathBuf,
}

impl Controller {
    pub fn init<P>(
        config: BuilderConfig,
        runner: Arc<dyn BuildRunner>,
        registry: Arc<dyn RegistryClient>,
        repository: Arc<dyn RepositoryInfo>,
        working_dir: P,
    ) -> Controller
    where
        P: Into<PathBuf>,
    {
        let working_dir = working_dir.into();
        let tagger = ImageTagger::new(config.clone());
        let volume_tagger = ImageTagger::with_volume_mounts(config.clone());
        let checker = ImageChecker::new(
            registry.clone(),
            tagger.clone(),
            volume_tagger.clone(),
            config.is_okteto,
        );

        Controller {
            config,
            runner,
            registry,
            repository,
            tagger,
            volume_tagger,
            checker,
            hooks: Vec::new(),
            working_dir,
        }
    }

    pub fn add_completion_hook(&mut self, hook: CompletionHook) {
        self.hooks.push(hook);
    }

    /// Validates the request and returns the services to build in dependency
    /// order, including dependencies that were not requested.
    pub fn services_to_build(
        &self,
        manifest: &Manifest,
        request: &BuildRequest,
    ) -> Result<Vec<String>, BuildError> {
        Ok(self.plan_for(manifest, request)?.ordered)
    }

    pub fn service_hash(&self, manifest: &Manifest, service: &str) -> Result<String, BuildError> {
        let request = BuildRequest {
            services: vec![service.to_string()],
            ..Default::default()
        };
        let plan = self.plan_for(manifest, &request)?;
        let info = &plan.infos[service];
        Ok(self.new_hasher().build_hash(info, service))
    }

    /// Runs the cache check without building anything.
    pub async fn plan(
        &self,
        manifest: &Manifest,
        request: &BuildRequest,
    ) -> Result<Vec<PlannedService>, BuildError> {
        let plan = self.plan_for(manifest, request)?;
        let state = self.start_run(manifest);
        let checked = self
            .check_services(&state, &plan, request.policy, false)
            .await;

        let mut planned = Vec::with_capacity(plan.ordered.len());
        for service in plan.ordered.iter() {
            let status = checked
                .get(service)
                .cloned()
                .unwrap_or(CacheStatus::Miss);
            let hash = match status {
                CacheStatus::NotBuildable => String::new(),
                _ => {
                    self.hash_service(&state, service, &plan.infos[service])
                        .await
                }
            };
            planned.push(PlannedService {
                service: service.clone(),
                hash,
                status,
            });
        }

        Ok(planned)
    }

    pub async fn build(
        &self,
        manifest: &mut Manifest,
        request: &BuildRequest,
    ) -> Result<BuildOutcome, BuildError> {
        self.build_until(manifest, request, future::pending()).await
    }

    /// Like [`Controller::build`], but stops as soon as `shutdown` completes.
    /// No registry lookup or build is started after that point.
    pub async fn build_until<F>(
        &self,
        manifest: &mut Manifest,
        request: &BuildRequest,
        shutdown: F,
    ) -> Result<BuildOutcome, BuildError>
    where
        F: Future<Output = ()>,
    {
        let state = self.start_run(manifest);

        let result = tokio::select! {
            result = self.run(&state, manifest, request) => result,
            _ = shutdown => {
                warn!("build cancelled");
                Err(BuildError::Cancelled)
            }
        };

        let collected = state.metadata.all();
        for hook in self.hooks.iter() {
            hook(&collected);
        }

        result.map(|images| BuildOutcome {
            images,
            metadata: collected,
            environment: state.env_setter.environment().clone(),
        })
    }

    async fn run(
        &self,
        state: &RunState,
        manifest: &mut Manifest,
        request: &BuildRequest,
    ) -> Result<IndexMap<String, String>, BuildError> {
        let plan = self.plan_for(manifest, request)?;
        info!("services to build: {:?}", plan.ordered);

        let checked = self.check_services(state, &plan, request.policy, true).await;

        let mut images = IndexMap::new();
        for service in plan.ordered.iter() {
            let info = &plan.infos[service];

            match checked.get(service) {
                Some(CacheStatus::Hit(reference)) => {
                    info!("skipping build of {:?}, image already built: {}", service, reference);
                    images.insert(service.clone(), reference.clone());
                    continue;
                }
                Some(CacheStatus::NotBuildable) => {
                    if let Some(image) = info.explicit_image() {
                        state.env_setter.set_service_env_vars(service, image);
                        images.insert(service.clone(), image.to_string());
                    } else {
                        info!(
                            "could not build service {}, it has no Dockerfile \
                             and no volumes to include",
                            service
                        );
                    }
                    continue;
                }
                _ => {}
            }

            let hash = self.hash_service(state, service, info).await;

            let started = Instant::now();
            let result = self.build_service(state, &plan, service, info, &hash).await;
            state.metadata.update(service, |meta| {
                meta.build_duration = started.elapsed();
                meta.success = result.is_ok();
            });

            let reference = result?;
            info!("image for service {:?} pushed to registry: {}", service, reference);
            state.env_setter.set_service_env_vars(service, &reference);
            images.insert(service.clone(), reference);
        }

        self.expand_manifest(state, manifest);
        Ok(images)
    }

    fn plan_for(
        &self,
        manifest: &Manifest,
        request: &BuildRequest,
    ) -> Result<BuildPlan, BuildError> {
        let requested = if request.services.is_empty() {
            manifest.build.keys().cloned().collect::<Vec<_>>()
        } else {
            request.services.clone()
        };

        if requested.is_empty() {
            return Err(ValidationError::NoServicesToBuild.into());
        }

        let unknown = requested
            .iter()
            .filter(|service| !manifest.build.contains_key(*service))
            .cloned()
            .collect::<Vec<_>>();
        if !unknown.is_empty() {
            return Err(ValidationError::UnknownServices(unknown).into());
        }

        if request.has_single_image_overrides() && requested.len() > 1 {
            return Err(ValidationError::FlagsOnlyForSingleImage.into());
        }

        let mut builder = GraphBuilder::new();
        for (service, info) in manifest.build.iter() {
            builder.add_node(service, info.depends_on.iter().cloned())?;
        }
        let graph = builder.build()?.subtree(requested.as_slice())?;
        let ordered = graph.ordered();

        let mut infos = IndexMap::new();
        for service in ordered.iter() {
            let mut info = manifest.build[service].clone();

            if !self.config.is_okteto {
                if info.has_volumes() {
                    return Err(ValidationError::VolumeMountsUnsupported(service.clone()).into());
                }
                if info.has_dockerfile() && info.explicit_image().is_none() {
                    return Err(ValidationError::ImageRequired(service.clone()).into());
                }
            }

            if manifest.kind == ManifestKind::Stack && self.config.is_okteto {
                if let Some(image) = info.explicit_image() {
                    if !self.registry.is_okteto_registry(image) {
                        debug!("ignoring image {} of stack service {}", image, service);
                        info.image = None;
                    }
                }
            }

            if requested.contains(service) {
                apply_overrides(&mut info, request);
            }

            infos.insert(service.clone(), info);
        }

        Ok(BuildPlan {
            manifest_name: manifest.name.clone(),
            infos,
            graph,
            ordered,
        })
    }

    fn new_hasher(&self) -> ServiceHasher {
        ServiceHasher::new(
            self.repository.clone(),
            self.working_dir.clone(),
            self.config.smart_build.use_build_context,
        )
    }

    fn start_run(&self, manifest: &Manifest) -> RunState {
        RunState {
            hasher: self.new_hasher(),
            env_setter: ServiceEnvVarsSetter::new(self.registry.clone(), BuildEnvironment::new()),
            metadata: MetadataCollector::new(
                &manifest.name,
                &self.config.namespace,
                &self.config.repository_url,
            ),
        }
    }

    /// Hashes on the blocking pool, since the repository is read through
    /// synchronous git calls.
    async fn hash_service(&self, state: &RunState, service: &str, info: &BuildInfo) -> String {
        if let Some(meta) = state.metadata.get(service) {
            if !meta.build_hash.is_empty() {
                return meta.build_hash;
            }
        }

        let started = Instant::now();
        let hasher = state.hasher.clone();
        let owned_info = info.clone();
        let owned_service = service.to_string();
        let use_build_context = self.config.smart_build.use_build_context;

        let hashed = tokio::task::spawn_blocking(move || {
            let hash = hasher.build_hash(&owned_info, &owned_service);
            let repo_hash = if use_build_context {
                hasher.hash_project_commit(&owned_info).unwrap_or_default()
            } else {
                hash.clone()
            };
            (hash, repo_hash)
        })
        .await;

        let (hash, repo_hash) = match hashed {
            Ok(hashed) => hashed,
            Err(err) => {
                warn!("could not hash service {:?}: {}", service, err);
                (String::new(), String::new())
            }
        };

        state.metadata.update(service, |meta| {
            meta.build_hash = hash.clone();
            meta.repo_hash = repo_hash;
            meta.hash_duration = started.elapsed();
        });
        hash
    }

    fn skips_cache(&self, policy: BuildPolicy) -> bool {
        match policy {
            BuildPolicy::Always => true,
            BuildPolicy::IfChanged => !self.config.smart_build.enabled,
            BuildPolicy::IfNotPresent => false,
        }
    }

    /// Looks every planned service up in the registry with bounded
    /// concurrency. A service whose dependency has to be rebuilt is rebuilt
    /// too, without a lookup.
    async fn check_services(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        policy: BuildPolicy,
        clone_global_hits: bool,
    ) -> HashMap<String, CacheStatus> {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for service in plan.ordered.iter() {
            let (sender, receiver) = watch::channel(None::<bool>);
            senders.insert(service.as_str(), sender);
            receivers.insert(service.as_str(), receiver);
        }

        let skip_lookups = self.skips_cache(policy);
        let concurrency = self
            .config
            .smart_build
            .check_concurrency
            .max(1)
            .min(plan.ordered.len().max(1));

        let tasks = plan.ordered.iter().map(|service| {
            let sender = senders.remove(service.as_str());
            let dependencies = plan
                .graph
                .dependencies(service)
                .iter()
                .filter_map(|dependency| receivers.get(dependency.as_str()).cloned())
                .collect::<Vec<_>>();

            async move {
                let mut dependencies_satisfied = true;
                for mut receiver in dependencies {
                    if !wait_for_result(&mut receiver).await {
                        dependencies_satisfied = false;
                        break;
                    }
                }

                let info = &plan.infos[service];
                let status = if !info.has_dockerfile() && !info.has_volumes() {
                    CacheStatus::NotBuildable
                } else if skip_lookups {
                    CacheStatus::Miss
                } else if !dependencies_satisfied {
                    debug!("dependency of {} has to be rebuilt, skipping cache check", service);
                    CacheStatus::Miss
                } else {
                    self.check_service(state, plan, service, info, policy, clone_global_hits)
                        .await
                };

                if let Some(sender) = sender {
                    let _ = sender.send(Some(status.satisfies_dependents()));
                }
                (service.clone(), status)
            }
        });

        stream::iter(tasks.collect::<Vec<_>>())
            .buffer_unordered(concurrency)
            .collect::<HashMap<_, _>>()
            .await
    }

    async fn check_service(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        policy: BuildPolicy,
        clone_global_hits: bool,
    ) -> CacheStatus {
        let hash = self.hash_service(state, service, info).await;

        let started = Instant::now();
        let lookup = self.lookup(plan, service, info, policy, &hash).await;
        let lookup_duration = started.elapsed();

        let hit = match lookup {
            Ok(Some(hit)) => hit,
            Ok(None) => {
                state
                    .metadata
                    .update(service, |meta| meta.cache_hit_duration = lookup_duration);
                return CacheStatus::Miss;
            }
            Err(err) => {
                info!("error checking if image of {} is cached: {}", service, err);
                state
                    .metadata
                    .update(service, |meta| meta.cache_hit_duration = lookup_duration);
                return CacheStatus::Miss;
            }
        };

        // Images found by `IfNotPresent` are used where they are.
        let from_global = hit.candidate.starts_with(&format!("{}/", GLOBAL_REGISTRY));
        let clone = clone_global_hits && from_global && policy != BuildPolicy::IfNotPresent;

        let reference = if clone {
            match self.clone_to_dev(state, plan, service, info, &hit).await {
                Ok(reference) => reference,
                Err(err) => {
                    warn!("could not reuse image of {}, it will be rebuilt: {}", service, err);
                    return CacheStatus::Miss;
                }
            }
        } else {
            hit.reference
        };

        state.metadata.update(service, |meta| {
            meta.cache_hit = true;
            meta.success = true;
            meta.cache_hit_duration = lookup_duration;
        });

        if clone_global_hits {
            state.env_setter.set_service_env_vars(service, &reference);
        }
        CacheStatus::Hit(reference)
    }

    /// `IfNotPresent` accepts any image of the service, `IfChanged` only one
    /// built from `hash`.
    async fn lookup(
        &self,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        policy: BuildPolicy,
        hash: &str,
    ) -> Result<Option<CacheHit>, RegistryError> {
        if policy != BuildPolicy::IfNotPresent {
            return self
                .checker
                .check_if_build_hash_is_built(&plan.manifest_name, service, info, hash)
                .await;
        }

        match self
            .checker
            .image_digest_reference_for_service(&plan.manifest_name, service, info, hash)
            .await
        {
            Ok(reference) => Ok(Some(CacheHit {
                candidate: reference.clone(),
                reference,
            })),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn clone_to_dev(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        hit: &CacheHit,
    ) -> Result<String, RegistryError> {
        let target = match info.explicit_image() {
            Some(image) if !info.has_volumes() => image.to_string(),
            _ => self
                .tagger_for(info)
                .image_references_for_deploy(&plan.manifest_name, service)
                .into_iter()
                .next()
                .ok_or_else(|| {
                    RegistryError::Other(anyhow!("no dev reference for service {}", service))
                })?,
        };

        let started = Instant::now();
        let result = self.registry.clone_image(&hit.candidate, &target).await;
        state
            .metadata
            .update(service, |meta| meta.clone_duration = started.elapsed());

        debug!("cloned {} to {}", hit.candidate, target);
        result
    }

    fn tagger_for(&self, info: &BuildInfo) -> &ImageTagger {
        if info.has_volumes() {
            &self.volume_tagger
        } else {
            &self.tagger
        }
    }

    async fn build_service(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> Result<String, BuildError> {
        let mut base_image = None;

        if info.has_dockerfile() {
            info!("building image for service {:?}", service);
            let reference = self
                .build_from_dockerfile(state, plan, service, info, hash)
                .await?;
            base_image = Some(reference);
        }

        if info.has_volumes() {
            return self
                .add_volume_mounts(plan, service, info, hash, base_image.as_deref())
                .await;
        }

        base_image.ok_or_else(|| BuildError::Service {
            service: service.to_string(),
            cause: anyhow!("service has nothing to build"),
        })
    }

    async fn build_from_dockerfile(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        hash: &str,
    ) -> Result<String, BuildError> {
        let tag = self
            .tagger
            .service_image_reference(&plan.manifest_name, service, info, hash);

        let mut tags = vec![tag.clone()];
        tags.extend(self.tagger.global_tags_for(&tags, hash));

        let options = BuildOptions {
            tags,
            context: info.context.clone(),
            dockerfile: info.dockerfile_path(),
            target: info.target.clone(),
            build_args: self.build_args(state, plan, service, info),
            secrets: info.secrets.clone(),
            cache_from: info.cache_from.clone(),
        };

        self.run_and_confirm(service, &options, tag).await
    }

    async fn add_volume_mounts(
        &self,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
        hash: &str,
        base_image: Option<&str>,
    ) -> Result<String, BuildError> {
        info!("including volume hosts for service {:?}", service);

        let from = base_image
            .or_else(|| info.explicit_image())
            .ok_or_else(|| BuildError::Service {
                service: service.to_string(),
                cause: anyhow!("no image to include the volumes into"),
            })?;

        let mounts = self.accessible_volume_mounts(info);
        let dockerfile = volume_mounts_dockerfile(from, &mounts, &self.working_dir);

        let directory = tempfile::tempdir().map_err(|err| BuildError::Service {
            service: service.to_string(),
            cause: err.into(),
        })?;
        let dockerfile_path = directory.path().join("Dockerfile");
        fs::write(&dockerfile_path, dockerfile).map_err(|err| BuildError::Service {
            service: service.to_string(),
            cause: err.into(),
        })?;

        let tag = self
            .volume_tagger
            .service_image_reference(&plan.manifest_name, service, info, hash);
        let mut tags = vec![tag.clone()];
        tags.extend(self.volume_tagger.global_tags_for(&tags, hash));

        let options = BuildOptions {
            tags,
            context: self.working_dir.clone(),
            dockerfile: Some(dockerfile_path),
            ..Default::default()
        };

        // The temporary directory lives until the runner is done with it.
        let result = self.run_and_confirm(service, &options, tag).await;
        drop(directory);
        result
    }

    async fn run_and_confirm(
        &self,
        service: &str,
        options: &BuildOptions,
        tag: String,
    ) -> Result<String, BuildError> {
        self.runner
            .run(options)
            .await
            .map_err(|cause| BuildError::Service {
                service: service.to_string(),
                cause,
            })?;

        self.registry
            .image_tag_with_digest(&tag)
            .await
            .map_err(|cause| BuildError::DigestConfirmation {
                reference: tag.clone(),
                cause,
            })
    }

    fn accessible_volume_mounts(&self, info: &BuildInfo) -> Vec<VolumeMount> {
        info.volumes_to_include
            .iter()
            .filter(|mount| {
                let path = if mount.local_path.is_absolute() {
                    mount.local_path.clone()
                } else {
                    self.working_dir.join(&mount.local_path)
                };
                let exists = path.exists();
                if !exists {
                    debug!("skipping volume {}, it does not exist", path.display());
                }
                exists
            })
            .cloned()
            .collect()
    }

    /// Declared args expanded against the build environment, followed by the
    /// published variables of every direct dependency not already declared.
    fn build_args(
        &self,
        state: &RunState,
        plan: &BuildPlan,
        service: &str,
        info: &BuildInfo,
    ) -> Vec<BuildArg> {
        let environment = state.env_setter.environment();
        let mut args = info
            .args
            .iter()
            .map(|arg| BuildArg::new(arg.name.clone(), environment.expand(&arg.value)))
            .collect::<Vec<_>>();

        for dependency in plan.graph.dependencies(service) {
            for (key, value) in environment.service_vars(dependency) {
                if !args.iter().any(|arg| arg.name == key) {
                    args.push(BuildArg::new(key, value));
                }
            }
        }

        args
    }

    fn expand_manifest(&self, state: &RunState, manifest: &mut Manifest) {
        let environment = state.env_setter.environment();
        let build = &manifest.build;

        if let Some(deploy) = manifest.deploy.as_mut() {
            if let Some(stack) = deploy.stack.as_mut() {
                for (service, stack_service) in stack.services.iter_mut() {
                    let has_image = stack_service
                        .image
                        .as_ref()
                        .map(|image| !image.is_empty())
                        .unwrap_or(false);

                    if !has_image && build.contains_key(service) {
                        stack_service.image =
                            Some(format!("${{{}}}", service_env_var(service, IMAGE_SUFFIX)));
                    }

                    if let Some(image) = stack_service.image.as_mut() {
                        *image = environment.expand(image);
                    }
                }
            }

            for command in deploy.commands.iter_mut() {
                command.command = environment.expand(&command.command);
            }
        }
    }
}

fn apply_overrides(info: &mut BuildInfo, request: &BuildRequest) {
    if let Some(tag) = request.tag.as_ref() {
        info.image = Some(tag.clone());
    }
    if let Some(target) = request.target.as_ref() {
        info.target = Some(target.clone());
    }
    if !request.cache_from.is_empty() {
        info.cache_from = request.cache_from.clone();
    }
    for (key, value) in request.secrets.iter() {
        info.secrets.insert(key.clone(), value.clone());
    }
}

async fn wait_for_result(receiver: &mut watch::Receiver<Option<bool>>) -> bool {
    loop {
        if let Some(result) = *receiver.borrow() {
            return result;
        }
        if receiver.changed().await.is_err() {
            return receiver.borrow().unwrap_or(false);
        }
    }
}

/// `FROM <image>` followed by one `COPY` per mount. Local paths are made
/// relative to the build context.
fn volume_mounts_dockerfile(from: &str, mounts: &[VolumeMount], context: &Path) -> String {
    let mut dockerfile = format!("FROM {}\n", from);
    for mount in mounts {
        let local = mount
            .local_path
            .strip_prefix(context)
            .unwrap_or(&mount.local_path);
        dockerfile.push_str(&format!("COPY {} {}\n", local.display(), mount.remote_path));
    }
    dockerfile
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        checker::tests::FakeRegistry,
        config::SmartBuildConfig,
        models::{Deploy, DeployCommand, Stack, StackService},
    };
    use anyhow::Result;
    use async_trait::async_trait;
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
    };

    const DIGEST: &str = "sha256:7075f1094117e418764bb9b47a5dfc093466e714ec385223fb582d78220c7252";

    struct FakeRepository {
        commit: Mutex<String>,
    }

    impl Default for FakeRepository {
        fn default() -> Self {
            FakeRepository {
                commit: Mutex::new("1234567890".into()),
            }
        }
    }

    impl FakeRepository {
        fn commit(&self, commit: &str) {
            *self.commit.lock().unwrap() = commit.to_string();
        }
    }

    impl RepositoryInfo for FakeRepository {
        fn sha(&self) -> Result<String> {
            Ok(self.commit.lock().unwrap().clone())
        }

        fn latest_dir_sha(&self, _path: &Path) -> Result<String> {
            Ok(self.commit.lock().unwrap().clone())
        }

        fn diff_hash(&self, _path: &Path) -> Result<String> {
            Ok(String::new())
        }

        fn is_clean(&self) -> Result<bool> {
            Ok(true)
        }

        fn anonymized_repo(&self) -> String {
            "https://github.com/okteto/test".into()
        }
    }

    #[derive(Default)]
    struct FakeRunner {
        registry: Arc<FakeRegistry>,
        builds: Mutex<Vec<BuildOptions>>,
        dockerfiles: Mutex<Vec<String>>,
        failing_tags: HashSet<String>,
        hang: bool,
        skip_push: bool,
    }

    impl FakeRunner {
        fn new(registry: Arc<FakeRegistry>) -> FakeRunner {
            FakeRunner {
                registry,
                ..Default::default()
            }
        }

        fn built_tags(&self) -> Vec<String> {
            self.builds
                .lock()
                .unwrap()
                .iter()
                .map(|options| options.tags[0].clone())
                .collect()
        }
    }

    #[async_trait]
    impl BuildRunner for FakeRunner {
        async fn run(&self, options: &BuildOptions) -> Result<()> {
            if self.hang {
                future::pending::<()>().await;
            }

            if let Some(dockerfile) = options.dockerfile.as_ref() {
                if let Ok(content) = fs::read_to_string(dockerfile) {
                    self.dockerfiles.lock().unwrap().push(content);
                }
            }
            self.builds.lock().unwrap().push(options.clone());

            if options.tags.iter().any(|tag| self.failing_tags.contains(tag)) {
                return Err(anyhow!("exit status 1"));
            }
            if !self.skip_push {
                for tag in options.tags.iter() {
                    self.registry.push(tag);
                }
            }
            Ok(())
        }
    }

    fn managed_config() -> BuilderConfig {
        BuilderConfig {
            is_okteto: true,
            namespace: "cindy".into(),
            has_global_access: true,
            is_clean_project: true,
            repository_url: "https://github.com/okteto/test".into(),
            smart_build: SmartBuildConfig::default(),
        }
    }

    fn controller(
        config: BuilderConfig,
        registry: Arc<FakeRegistry>,
        runner: Arc<FakeRunner>,
    ) -> Controller {
        Controller::init(
            config,
            runner,
            registry,
            Arc::new(FakeRepository::default()),
            "/nonexistent",
        )
    }

    fn dockerfile_service(depends_on: &[&str]) -> BuildInfo {
        BuildInfo {
            dockerfile: Some(PathBuf::from("Dockerfile")),
            depends_on: depends_on.iter().map(|dep| dep.to_string()).collect(),
            ..Default::default()
        }
    }

    fn build_args_of(options: &BuildOptions) -> Map<String, String> {
        options
            .build_args
            .iter()
            .map(|arg| (arg.name.clone(), arg.value.clone()))
            .collect()
    }

    fn manifest(services: Vec<(&str, BuildInfo)>) -> Manifest {
        let mut manifest = Manifest::new("test", ManifestKind::Pipeline);
        for (name, info) in services {
            manifest.build.insert(name.to_string(), info);
        }
        manifest
    }

    #[tokio::test]
    async fn skips_services_already_in_the_registry() {
        let registry = Arc::new(FakeRegistry::with_images(&["okteto.dev/test-test-1:okteto"]));
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut manifest = manifest(vec![
            ("test-1", dockerfile_service(&[])),
            ("test-2", dockerfile_service(&[])),
        ]);
        let request = BuildRequest {
            policy: BuildPolicy::IfNotPresent,
            ..Default::default()
        };

        let outcome = controller.build(&mut manifest, &request).await.unwrap();

        let tags = runner.built_tags();
        assert_eq!(tags.len(), 1);
        assert!(tags[0].contains("test-test-2"));
        assert_eq!(
            outcome.environment.snapshot()["OKTETO_BUILD_TEST_1_IMAGE"],
            format!("okteto.dev/test-test-1@{}", DIGEST)
        );
        assert!(outcome.metadata["test-1"].cache_hit);
        assert!(!outcome.metadata["test-2"].cache_hit);
        assert!(outcome.metadata["test-2"].success);
    }

    #[tokio::test]
    async fn rebuilds_everything_with_always_policy() {
        let registry = Arc::new(FakeRegistry::with_images(&["okteto.dev/test-test-1:okteto"]));
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut manifest = manifest(vec![("test-1", dockerfile_service(&[]))]);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        controller.build(&mut manifest, &request).await.unwrap();

        assert_eq!(runner.built_tags().len(), 1);
        // Only the digest confirmation of the new image reaches the registry.
        assert_eq!(registry.lookups().len(), 1);
    }

    #[tokio::test]
    async fn clones_global_hits_into_the_dev_registry() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let hash = controller.service_hash(&manifest, "api").unwrap();
        registry.push(&format!("okteto.global/test-api:{}", hash));

        let outcome = controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();

        assert!(runner.built_tags().is_empty());
        assert_eq!(
            registry.clones.lock().unwrap().clone(),
            vec![(
                format!("okteto.global/test-api:{}", hash),
                "okteto.dev/test-api:okteto".to_string()
            )]
        );
        assert_eq!(
            outcome.environment.snapshot()["OKTETO_BUILD_API_IMAGE"],
            format!("okteto.dev/test-api@{}", DIGEST)
        );
    }

    #[tokio::test]
    async fn failed_clones_degrade_to_a_rebuild() {
        let registry = Arc::new(FakeRegistry {
            fail_clones: true,
            ..Default::default()
        });
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let hash = controller.service_hash(&manifest, "api").unwrap();
        registry.push(&format!("okteto.global/test-api:{}", hash));

        controller.build(&mut manifest, &BuildRequest::default()).await.unwrap();

        assert_eq!(runner.built_tags(), vec![format!("okteto.global/test-api:{}", hash)]);
    }

    #[tokio::test]
    async fn dependency_misses_force_a_rebuild_without_a_lookup() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut manifest = manifest(vec![
            ("api", dockerfile_service(&["db"])),
            ("db", dockerfile_service(&[])),
        ]);
        let api_hash = controller.service_hash(&manifest, "api").unwrap();
        registry.push(&format!("okteto.dev/test-api:{}", api_hash));

        controller.build(&mut manifest, &BuildRequest::default()).await.unwrap();

        let tags = runner.built_tags();
        assert_eq!(tags.len(), 2);
        assert!(tags[0].contains("test-db"));
        assert!(tags[1].contains("test-api"));
        assert!(!registry
            .lookups()
            .contains(&format!("okteto.dev/test-api:{}", api_hash)));
    }

    #[tokio::test]
    async fn dependencies_are_passed_as_build_args() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut api = dockerfile_service(&["db"]);
        api.args = vec![
            BuildArg::new("OKTETO_BUILD_DB_TAG", "pinned"),
            BuildArg::new("DB_IMAGE", "${OKTETO_BUILD_DB_IMAGE}"),
        ];
        let mut manifest = manifest(vec![("api", api), ("db", dockerfile_service(&[]))]);
        let request = BuildRequest {
            services: vec!["api".into()],
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let outcome = controller.build(&mut manifest, &request).await.unwrap();

        let builds = runner.builds.lock().unwrap().clone();
        assert_eq!(builds.len(), 2);
        let args = build_args_of(&builds[1]);

        let db_image = outcome.environment.snapshot()["OKTETO_BUILD_DB_IMAGE"].clone();
        assert_eq!(args["OKTETO_BUILD_DB_TAG"], "pinned");
        assert_eq!(args["DB_IMAGE"], db_image);
        assert_eq!(args["OKTETO_BUILD_DB_IMAGE"], db_image);
        assert!(args.contains_key("OKTETO_BUILD_DB_REGISTRY"));
        assert!(args.contains_key("OKTETO_BUILD_DB_REPOSITORY"));
        assert!(args.contains_key("OKTETO_BUILD_DB_SHA"));
        assert_eq!(builds[1].build_args.len(), 6);
    }

    #[tokio::test]
    async fn validates_requests() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry, runner);
        let manifest = manifest(vec![
            ("api", dockerfile_service(&[])),
            ("web", dockerfile_service(&[])),
        ]);

        let unknown = BuildRequest {
            services: vec!["api".into(), "worker".into(), "cron".into()],
            ..Default::default()
        };
        let err = controller.services_to_build(&manifest, &unknown).unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid services names, not found at manifest: [worker, cron]"
        );

        let flags = BuildRequest {
            target: Some("prod".into()),
            ..Default::default()
        };
        assert!(matches!(
            controller.services_to_build(&manifest, &flags),
            Err(BuildError::Validation(ValidationError::FlagsOnlyForSingleImage))
        ));

        let empty = Manifest::new("test", ManifestKind::Pipeline);
        assert!(matches!(
            controller.services_to_build(&empty, &BuildRequest::default()),
            Err(BuildError::Validation(ValidationError::NoServicesToBuild))
        ));
    }

    #[tokio::test]
    async fn unmanaged_clusters_require_images() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(BuilderConfig::default(), registry, runner);

        let manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        assert!(matches!(
            controller.services_to_build(&manifest, &BuildRequest::default()),
            Err(BuildError::Validation(ValidationError::ImageRequired(service))) if service == "api"
        ));
    }

    #[tokio::test]
    async fn graph_errors_abort_before_building() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry, runner.clone());

        let mut manifest = manifest(vec![
            ("api", dockerfile_service(&["web"])),
            ("web", dockerfile_service(&["api"])),
        ]);

        let err = controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Graph(_)));
        assert!(runner.built_tags().is_empty());
    }

    #[tokio::test]
    async fn build_failures_name_the_service() {
        let registry = Arc::new(FakeRegistry::default());
        let mut runner = FakeRunner::new(registry.clone());
        runner.failing_tags.insert("okteto.dev/test-api:okteto".into());
        let runner = Arc::new(runner);

        let mut config = managed_config();
        config.is_clean_project = false;
        let mut controller = controller(config, registry, runner.clone());

        let reported = Arc::new(AtomicBool::new(false));
        let hook_reported = reported.clone();
        controller.add_completion_hook(Box::new(move |metadata| {
            hook_reported.store(!metadata["api"].success, Ordering::SeqCst);
        }));

        let mut manifest = manifest(vec![
            ("api", dockerfile_service(&["db"])),
            ("db", dockerfile_service(&[])),
        ]);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let err = controller.build(&mut manifest, &request).await.unwrap_err();

        assert_eq!(err.to_string(), "error building service 'api': exit status 1");
        let builds = runner.builds.lock().unwrap().clone();
        assert!(build_args_of(&builds[1]).contains_key("OKTETO_BUILD_DB_IMAGE"));
        assert!(reported.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn missing_digest_after_build_is_fatal() {
        let registry = Arc::new(FakeRegistry::default());
        let mut runner = FakeRunner::new(registry.clone());
        runner.skip_push = true;
        let controller = controller(managed_config(), registry, Arc::new(runner));

        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let err = controller.build(&mut manifest, &request).await.unwrap_err();
        assert!(matches!(err, BuildError::DigestConfirmation { .. }));
    }

    #[tokio::test]
    async fn cancellation_stops_the_run() {
        let registry = Arc::new(FakeRegistry::default());
        let mut runner = FakeRunner::new(registry.clone());
        runner.hang = true;
        let runner = Arc::new(runner);
        let controller = controller(managed_config(), registry, runner.clone());

        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let err = controller
            .build_until(&mut manifest, &request, async {})
            .await
            .unwrap_err();

        assert!(matches!(err, BuildError::Cancelled));
        assert!(runner.built_tags().is_empty());
    }

    #[tokio::test]
    async fn expands_stack_images_and_deploy_commands() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let mut config = managed_config();
        config.is_clean_project = false;
        let controller = controller(config, registry, runner.clone());

        let mut api = dockerfile_service(&[]);
        api.image = Some("nginx".into());
        let mut manifest = manifest(vec![("api", api)]);
        manifest.kind = ManifestKind::Stack;

        let mut services = IndexMap::new();
        services.insert("api".to_string(), StackService { image: None });
        services.insert(
            "redis".to_string(),
            StackService {
                image: Some("redis:7".into()),
            },
        );
        manifest.deploy = Some(Deploy {
            commands: vec![DeployCommand {
                name: "deploy".into(),
                command: "helm upgrade --set image=${OKTETO_BUILD_API_IMAGE} chart".into(),
            }],
            stack: Some(Stack { services }),
        });

        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };
        controller.build(&mut manifest, &request).await.unwrap();

        // Stack images outside the managed registry are replaced by an inferred one.
        assert_eq!(runner.built_tags(), vec!["okteto.dev/test-api:okteto"]);

        let expected = format!("okteto.dev/test-api@{}", DIGEST);
        let deploy = manifest.deploy.unwrap();
        let stack = deploy.stack.unwrap();
        assert_eq!(stack.services["api"].image.as_deref(), Some(expected.as_str()));
        assert_eq!(stack.services["redis"].image.as_deref(), Some("redis:7"));
        assert_eq!(
            deploy.commands[0].command,
            format!("helm upgrade --set image={} chart", expected)
        );
    }

    #[tokio::test]
    async fn volume_mounts_are_baked_into_a_derived_image() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("nginx.conf"), "events {}").unwrap();

        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let mut config = managed_config();
        config.is_clean_project = false;
        let controller = Controller::init(
            config,
            runner.clone(),
            registry,
            Arc::new(FakeRepository::default()),
            dir.path(),
        );

        let mut web = dockerfile_service(&[]);
        web.volumes_to_include = vec![
            VolumeMount {
                local_path: PathBuf::from("nginx.conf"),
                remote_path: "/etc/nginx/nginx.conf".into(),
            },
            VolumeMount {
                local_path: PathBuf::from("missing"),
                remote_path: "/data".into(),
            },
        ];
        let mut manifest = manifest(vec![("web", web)]);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let outcome = controller.build(&mut manifest, &request).await.unwrap();

        assert_eq!(
            runner.built_tags(),
            vec![
                "okteto.dev/test-web:okteto",
                "okteto.dev/test-web:okteto-with-volume-mounts",
            ]
        );
        assert_eq!(
            runner.dockerfiles.lock().unwrap().last().unwrap(),
            &format!(
                "FROM okteto.dev/test-web@{}\nCOPY nginx.conf /etc/nginx/nginx.conf\n",
                DIGEST
            )
        );
        assert_eq!(outcome.images["web"], format!("okteto.dev/test-web@{}", DIGEST));
    }

    #[tokio::test]
    async fn plan_reports_cache_status_without_side_effects() {
        let registry = Arc::new(FakeRegistry::with_images(&["okteto.dev/test-db:okteto"]));
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut cache = BuildInfo::default();
        cache.image = Some("redis:7".into());
        let manifest = manifest(vec![
            ("api", dockerfile_service(&["db", "cache"])),
            ("db", dockerfile_service(&[])),
            ("cache", cache),
        ]);
        let request = BuildRequest {
            policy: BuildPolicy::IfNotPresent,
            ..Default::default()
        };

        let plan = controller.plan(&manifest, &request).await.unwrap();

        let statuses: Vec<(String, CacheStatus)> = plan
            .into_iter()
            .map(|planned| (planned.service, planned.status))
            .collect();
        assert_eq!(
            statuses,
            vec![
                ("db".to_string(), CacheStatus::Hit(format!("okteto.dev/test-db@{}", DIGEST))),
                ("cache".to_string(), CacheStatus::NotBuildable),
                ("api".to_string(), CacheStatus::Miss),
            ]
        );
        assert!(runner.built_tags().is_empty());
        assert!(registry.clones.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn volume_mount_images_are_reused_under_their_own_tags() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("nginx.conf"), "events {}").unwrap();

        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = Controller::init(
            managed_config(),
            runner.clone(),
            registry.clone(),
            Arc::new(FakeRepository::default()),
            dir.path(),
        );

        let mut web = dockerfile_service(&[]);
        web.volumes_to_include = vec![VolumeMount {
            local_path: PathBuf::from("nginx.conf"),
            remote_path: "/etc/nginx/nginx.conf".into(),
        }];
        let mut manifest = manifest(vec![("web", web)]);
        let hash = controller.service_hash(&manifest, "web").unwrap();
        let volume_tag = format!("okteto.global/test-web:{}-okteto-with-volume-mounts", hash);

        controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();
        assert_eq!(
            runner.built_tags(),
            vec![format!("okteto.global/test-web:{}", hash), volume_tag.clone()]
        );

        let outcome = controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();

        // The plain image under `:<hash>` must not be mistaken for the one
        // with the mounts baked in.
        assert_eq!(runner.built_tags().len(), 2);
        assert_eq!(
            registry.clones.lock().unwrap().clone(),
            vec![(
                volume_tag,
                "okteto.dev/test-web:okteto-with-volume-mounts".to_string()
            )]
        );
        assert!(outcome.metadata["web"].cache_hit);
        assert_eq!(outcome.images["web"], format!("okteto.dev/test-web@{}", DIGEST));
    }

    #[tokio::test]
    async fn runs_do_not_share_published_variables() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry, runner);
        let request = BuildRequest {
            policy: BuildPolicy::Always,
            ..Default::default()
        };

        let mut first = manifest(vec![("old", dockerfile_service(&[]))]);
        let first_outcome = controller.build(&mut first, &request).await.unwrap();
        assert!(first_outcome
            .environment
            .snapshot()
            .contains_key("OKTETO_BUILD_OLD_IMAGE"));

        let mut second = manifest(vec![("new", dockerfile_service(&[]))]);
        let second_outcome = controller.build(&mut second, &request).await.unwrap();
        let environment = second_outcome.environment.snapshot();

        assert!(environment.contains_key("OKTETO_BUILD_NEW_IMAGE"));
        assert!(environment
            .keys()
            .all(|key| !key.starts_with("OKTETO_BUILD_OLD_")));
    }

    #[tokio::test]
    async fn every_run_reads_the_current_commit() {
        let registry = Arc::new(FakeRegistry::default());
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let repository = Arc::new(FakeRepository::default());
        let controller = Controller::init(
            managed_config(),
            runner.clone(),
            registry,
            repository.clone(),
            "/nonexistent",
        );

        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let first_hash = controller.service_hash(&manifest, "api").unwrap();
        controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();

        repository.commit("abcdef0123");
        let second_hash = controller.service_hash(&manifest, "api").unwrap();
        assert_ne!(first_hash, second_hash);

        controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();

        assert_eq!(
            runner.built_tags(),
            vec![
                format!("okteto.global/test-api:{}", first_hash),
                format!("okteto.global/test-api:{}", second_hash),
            ]
        );
    }

    #[tokio::test]
    async fn registry_errors_rebuild_the_service() {
        let mut manifest = manifest(vec![("api", dockerfile_service(&[]))]);
        let hash = controller(
            managed_config(),
            Arc::new(FakeRegistry::default()),
            Arc::new(FakeRunner::default()),
        )
        .service_hash(&manifest, "api")
        .unwrap();

        let registry = Arc::new(FakeRegistry {
            failing: vec![format!("okteto.dev/test-api:{}", hash)]
                .into_iter()
                .collect(),
            ..Default::default()
        });
        registry.push(&format!("okteto.global/test-api:{}", hash));
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let outcome = controller
            .build(&mut manifest, &BuildRequest::default())
            .await
            .unwrap();

        // The lookup stops at the first error, even though a later candidate exists.
        assert_eq!(runner.built_tags(), vec![format!("okteto.global/test-api:{}", hash)]);
        assert!(registry.clones.lock().unwrap().is_empty());
        assert!(!outcome.metadata["api"].cache_hit);
    }

    #[tokio::test]
    async fn explicit_images_are_only_built_when_missing() {
        let registry = Arc::new(FakeRegistry::with_images(&["test/test-1"]));
        let runner = Arc::new(FakeRunner::new(registry.clone()));
        let controller = controller(managed_config(), registry.clone(), runner.clone());

        let mut test_1 = dockerfile_service(&[]);
        test_1.image = Some("test/test-1".into());
        let mut test_2 = dockerfile_service(&[]);
        test_2.image = Some("test/test-2".into());
        let mut manifest = manifest(vec![("test-1", test_1), ("test-2", test_2)]);
        let request = BuildRequest {
            services: vec!["test-1".into(), "test-2".into()],
            policy: BuildPolicy::IfNotPresent,
            ..Default::default()
        };

        assert_eq!(
            controller.services_to_build(&manifest, &request).unwrap(),
            vec!["test-1", "test-2"]
        );

        let outcome = controller.build(&mut manifest, &request).await.unwrap();

        assert_eq!(runner.built_tags(), vec!["test/test-2"]);
        assert!(registry.clones.lock().unwrap().is_empty());
        assert_eq!(outcome.images["test-1"], format!("test/test-1@{}", DIGEST));
        assert_eq!(outcome.images["test-2"], format!("test/test-2@{}", DIGEST));
        assert!(outcome.metadata["test-1"].cache_hit);
        assert!(!outcome.metadata["test-2"].cache_hit);
    }
}
