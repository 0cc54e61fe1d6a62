use anyhow::{Context, Result, bail};
use std::path::{Component, Path, PathBuf};
use tracing::instrument;

/// A symlink whose creation was deferred until the rest of the tree exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    /// Path of the symlink to create
    pub file: PathBuf,
    /// Target the symlink points to, relative targets are resolved from the directory of `file`
    pub link: PathBuf,
}

#[cfg(unix)]
async fn symlink(link: &Path, file: &Path) -> std::io::Result<()> {
    tokio::fs::symlink(link, file).await
}

#[cfg(windows)]
async fn symlink(link: &Path, file: &Path) -> std::io::Result<()> {
    // windows needs to know upfront whether the link points to a directory
    let resolved = match file.parent() {
        Some(parent) => parent.join(link),
        None => link.to_path_buf(),
    };
    let is_dir = tokio::fs::metadata(&resolved)
        .await
        .map(|md| md.is_dir())
        .unwrap_or(false);
    if is_dir {
        tokio::fs::symlink_dir(link, file).await
    } else {
        tokio::fs::symlink_file(link, file).await
    }
}

/// Creates all `links`, each one as a separate task, all of them concurrently.
///
/// Every link is attempted even if some fail; the failure with the lowest position in `links` is
/// returned.
#[instrument(skip(links), fields(count = links.len()))]
pub async fn create_links(links: Vec<LinkInfo>) -> Result<(), executor::Error> {
    let count = links.len();
    let mut pending = links.into_iter();
    executor::run_bounded(count, count, move |_| {
        let LinkInfo { file, link } = pending.next().context("no link left to create")?;
        Ok(async move {
            tracing::trace!("symlink {:?} -> {:?}", &file, &link);
            symlink(&link, &file)
                .await
                .with_context(|| format!("failed creating symlink {:?} -> {:?}", &file, &link))
        })
    })
    .await
}

fn clean(path: &Path) -> Vec<Component<'_>> {
    let mut parts: Vec<Component<'_>> = Vec::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match parts.last() {
                Some(Component::Normal(_)) => {
                    parts.pop();
                }
                // ".." at the root stays at the root
                Some(Component::RootDir | Component::Prefix(_)) => {}
                _ => parts.push(component),
            },
            _ => parts.push(component),
        }
    }
    parts
}

/// Expresses `target` as a path relative to `base_dir`, lexically (no symlinks are resolved).
///
/// Both paths must be absolute or both relative.
pub fn relative_target(base_dir: &Path, target: &Path) -> Result<PathBuf> {
    if base_dir.is_absolute() != target.is_absolute() {
        bail!("cannot make {:?} relative to {:?}", target, base_dir);
    }
    let base = clean(base_dir);
    let target_parts = clean(target);
    let common = base
        .iter()
        .zip(target_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();
    if base_dir.is_absolute() && common == 0 {
        bail!(
            "cannot make {:?} relative to {:?}, paths have different roots",
            target,
            base_dir
        );
    }
    if base[common..].contains(&Component::ParentDir) {
        bail!("cannot make {:?} relative to {:?}", target, base_dir);
    }
    let mut relative = PathBuf::new();
    for _ in common..base.len() {
        relative.push(Component::ParentDir.as_os_str());
    }
    for component in &target_parts[common..] {
        relative.push(component.as_os_str());
    }
    if relative.as_os_str().is_empty() {
        relative.push(Component::CurDir.as_os_str());
    }
    Ok(relative)
}
