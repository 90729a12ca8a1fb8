mod bridge;
mod cache;
mod effects;
mod fetch;
mod process;
mod project;
mod registry;
mod resolver;
mod runtime;
mod worker;

pub use bridge::WorkerBridge;
pub use cache::{collect_file_dependencies, BlobCache, CacheKey};
pub use effects::{
    CommandRunner, Effects, GitClient, SharedEffects, SystemEffects, SystemGit, SystemRunner,
};
pub use fetch::{FetchStats, Fetchers};
pub use process::{run_command, RunOutput};
pub use project::{load_standalone, Artifact, ProjectNode, Target};
pub use registry::{ConstructRequest, Constructor, FactoryRegistry, Producer, ResolvedProducer};
pub use resolver::{discover_root, Resolver, ResolverStats};
pub use runtime::{RpcClient, RpcResult, RuntimeHandle, RuntimeManager, RuntimeSession};
pub use worker::{BuildRequest, BuildResponse};
