//! # Git Worktree Isolation
//!
//! Every swarm instance gets its own branch `swarm/<NN>-<slug>` checked out
//! in its own worktree, so instances never see each other's changes.

use anyhow::{Context, Result};
use git2::{BranchType, Repository};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::swarm::WorktreeInfo;

const MAX_SLUG_LEN: usize = 40;

/// Lowercase, dash-separated, branch-safe slug of a hypothesis
pub fn slugify(text: &str) -> String {
    let mut slug = String::new();
    let mut pending_dash = false;

    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
            if slug.len() >= MAX_SLUG_LEN {
                break;
            }
        } else {
            pending_dash = true;
        }
    }

    if slug.is_empty() {
        "experiment".to_string()
    } else {
        slug
    }
}

/// Zero-pad a 1-based index to at least two digits, wider for big runs
pub fn pad_ordinal(index: usize, total: usize) -> String {
    let width = total.to_string().len().max(2);
    format!("{:0width$}", index, width = width)
}

/// Create an experiment branch from HEAD (no checkout)
pub fn create_branch(project_root: &Path, branch: &str) -> Result<()> {
    let repo = Repository::open(project_root)
        .with_context(|| format!("Failed to open repository at {:?}", project_root))?;
    let head = repo.head().context("Failed to get HEAD")?;
    let head_commit = head.peel_to_commit().context("Failed to get HEAD commit")?;

    repo.branch(branch, &head_commit, false)
        .with_context(|| format!("Failed to create branch: {}", branch))?;
    Ok(())
}

/// Create the worktree for instance `index` of `total` under `worktrees_dir`.
///
/// When the branch or directory is already taken (a repeated run, or two
/// hypotheses with the same slug) the slug gets a `-2`, `-3`... suffix.
pub fn create_swarm_worktree(
    project_root: &Path,
    worktrees_dir: &Path,
    index: usize,
    total: usize,
    hypothesis: &str,
) -> Result<WorktreeInfo> {
    let repo = Repository::open(project_root)
        .with_context(|| format!("Failed to open repository at {:?}", project_root))?;
    let ordinal = pad_ordinal(index, total);
    let base = slugify(hypothesis);

    let mut slug = base.clone();
    let mut suffix = 1;
    let (name, branch, path) = loop {
        let name = format!("{}-{}", ordinal, slug);
        let branch = format!("swarm/{}", name);
        let path = worktrees_dir.join(&name);
        let branch_taken = repo.find_branch(&branch, BranchType::Local).is_ok();
        if !branch_taken && !path.exists() {
            break (name, branch, path);
        }
        suffix += 1;
        slug = format!("{}-{}", base, suffix);
    };
    tracing::debug!(%name, "Worktree name chosen");

    create_branch(project_root, &branch)?;

    let added = std::fs::create_dir_all(worktrees_dir)
        .with_context(|| format!("Failed to create worktree directory: {:?}", worktrees_dir))
        .and_then(|_| add_worktree(project_root, &path, &branch));
    if let Err(e) = added {
        delete_branch(project_root, &branch);
        return Err(e);
    }

    tracing::debug!(path = ?path, %branch, "Worktree created");
    Ok(WorktreeInfo {
        path,
        ordinal,
        branch,
        slug,
        hypothesis: hypothesis.to_string(),
        sub_type: None,
    })
}

// git2's worktree API does not check out an existing branch cleanly; use the CLI
fn add_worktree(project_root: &Path, path: &Path, branch: &str) -> Result<()> {
    let output = Command::new("git")
        .args(["worktree", "add", &path.to_string_lossy(), branch])
        .current_dir(project_root)
        .output()
        .context("Failed to run git worktree add")?;

    if !output.status.success() {
        anyhow::bail!(
            "git worktree add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
    }
    Ok(())
}

fn delete_branch(project_root: &Path, branch: &str) {
    Command::new("git")
        .args(["branch", "-D", branch])
        .current_dir(project_root)
        .output()
        .ok();
}

/// Remove an instance's worktree, and its branch unless `keep_branch`
pub fn remove_swarm_worktree(
    project_root: &Path,
    worktree: &WorktreeInfo,
    keep_branch: bool,
) -> Result<()> {
    Command::new("git")
        .args([
            "worktree",
            "remove",
            "--force",
            &worktree.path.to_string_lossy(),
        ])
        .current_dir(project_root)
        .output()
        .ok(); // Already gone is fine

    if worktree.path.exists() {
        std::fs::remove_dir_all(&worktree.path)
            .with_context(|| format!("Failed to remove worktree directory: {:?}", worktree.path))?;
    }

    Command::new("git")
        .args(["worktree", "prune"])
        .current_dir(project_root)
        .output()
        .ok();

    if !keep_branch {
        delete_branch(project_root, &worktree.branch);
    }

    Ok(())
}

/// Default location for swarm worktrees inside a runtime directory
pub fn worktrees_dir(runtime_dir: &Path) -> PathBuf {
    runtime_dir.join("worktrees")
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Signature;

    fn init_repo(dir: &Path) -> Repository {
        let repo = Repository::init(dir).unwrap();
        {
            let sig = Signature::now("tester", "tester@example.com").unwrap();
            std::fs::write(dir.join("README.md"), "hello\n").unwrap();
            let mut index = repo.index().unwrap();
            index.add_path(Path::new("README.md")).unwrap();
            index.write().unwrap();
            let tree_id = index.write_tree().unwrap();
            let tree = repo.find_tree(tree_id).unwrap();
            repo.commit(Some("HEAD"), &sig, &sig, "init", &tree, &[])
                .unwrap();
        }
        repo
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Cache the AST, per file!"), "cache-the-ast-per-file");
        assert_eq!(slugify("  ---  "), "experiment");
        assert!(slugify(&"a ".repeat(100)).len() <= MAX_SLUG_LEN);
    }

    #[test]
    fn test_pad_ordinal() {
        assert_eq!(pad_ordinal(1, 3), "01");
        assert_eq!(pad_ordinal(12, 12), "12");
        assert_eq!(pad_ordinal(7, 150), "007");
    }

    #[test]
    fn test_create_and_remove_worktree() {
        let repo_dir = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        let repo = init_repo(repo_dir.path());

        let info =
            create_swarm_worktree(repo_dir.path(), trees.path(), 1, 2, "Batch the writes").unwrap();
        assert_eq!(info.ordinal, "01");
        assert_eq!(info.branch, "swarm/01-batch-the-writes");
        assert!(info.path.join("README.md").exists());
        assert!(repo
            .find_branch(&info.branch, git2::BranchType::Local)
            .is_ok());

        remove_swarm_worktree(repo_dir.path(), &info, false).unwrap();
        assert!(!info.path.exists());
        assert!(repo
            .find_branch(&info.branch, git2::BranchType::Local)
            .is_err());
    }

    #[test]
    fn test_taken_name_gets_suffix() {
        let repo_dir = tempfile::tempdir().unwrap();
        let trees = tempfile::tempdir().unwrap();
        let repo = init_repo(repo_dir.path());

        let first = create_swarm_worktree(repo_dir.path(), trees.path(), 1, 1, "Batch").unwrap();
        let second = create_swarm_worktree(repo_dir.path(), trees.path(), 1, 1, "Batch").unwrap();
        assert_eq!(first.branch, "swarm/01-batch");
        assert_eq!(second.branch, "swarm/01-batch-2");
        assert_eq!(second.slug, "batch-2");
        assert_ne!(first.path, second.path);
        assert!(second.path.join("README.md").exists());

        // Keeping the branch leaves it for review
        remove_swarm_worktree(repo_dir.path(), &second, true).unwrap();
        assert!(!second.path.exists());
        assert!(repo.find_branch(&second.branch, BranchType::Local).is_ok());
    }
}
