//! Default adapters behind the capability traits.
//!
//! - [`claude::ClaudeCli`]: `AnalysisProvider` + `AgentExecutor` over the `claude` CLI
//! - [`git::GitRepo`]: `GitCollaborator` over `git2` and `gh`

pub mod claude;
pub mod git;

pub use claude::ClaudeCli;
pub use git::GitRepo;
