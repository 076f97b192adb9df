pub mod exec;
pub mod handle;
pub mod queue;
pub mod root;
pub mod service;

pub use exec::{run_git, GitCommandOutput, GitExecError, GitInvocation};
pub use handle::{GitOperation, GitRepository, HandleRegistry};
pub use queue::RepoQueue;
pub use root::RepoRootResolver;
pub use service::RepoService;
