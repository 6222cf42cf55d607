//! # Tools
//!
//! - `git` - Branch and worktree provisioning for experiments and swarm instances

pub mod git;
