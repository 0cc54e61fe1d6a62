use anyhow::{Context, anyhow, bail};
use async_recursion::async_recursion;
use futures::FutureExt;
use futures::future::BoxFuture;
use std::path::Path;
use tracing::instrument;

use crate::link::{self, LinkInfo};
use crate::preserve;

/// Desktop metadata file dropped by macOS Finder; never replicated
pub const SKIPPED_FILE_NAME: &str = ".DS_Store";

/// Whether hard links can be relied upon on this platform at all
pub const HARD_LINKS_SUPPORTED: bool = !cfg!(windows);

/// Error type for tree copy operations.
///
/// # Logging Convention
/// The Display implementation shows the full error chain, so it can be logged with `{}` or `{:#}`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Walking and replicating the source tree failed; no symlinks were created
    #[error("{0:#}")]
    Traverse(#[source] anyhow::Error),
    /// The tree was replicated but creating deferred symlinks failed
    #[error("{0:#}")]
    Links(#[source] executor::Error),
}

#[derive(Copy, Clone, Debug, Default)]
pub struct Summary {
    pub bytes_copied: u64,
    pub files_copied: usize,
    pub hard_links_created: usize,
    pub hard_links_unchanged: usize,
    pub symlinks_created: usize,
    pub directories_created: usize,
    pub directories_unchanged: usize,
    pub entries_skipped: usize,
}

impl std::ops::Add for Summary {
    type Output = Self;
    fn add(self, other: Self) -> Self {
        Self {
            bytes_copied: self.bytes_copied + other.bytes_copied,
            files_copied: self.files_copied + other.files_copied,
            hard_links_created: self.hard_links_created + other.hard_links_created,
            hard_links_unchanged: self.hard_links_unchanged + other.hard_links_unchanged,
            symlinks_created: self.symlinks_created + other.symlinks_created,
            directories_created: self.directories_created + other.directories_created,
            directories_unchanged: self.directories_unchanged + other.directories_unchanged,
            entries_skipped: self.entries_skipped + other.entries_skipped,
        }
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "bytes copied: {}\n\
            files copied: {}\n\
            hard-links created: {}\n\
            hard-links unchanged: {}\n\
            symlinks created: {}\n\
            directories created: {}\n\
            directories unchanged: {}\n\
            entries skipped: {}\n",
            bytesize::ByteSize(self.bytes_copied),
            self.files_copied,
            self.hard_links_created,
            self.hard_links_unchanged,
            self.symlinks_created,
            self.directories_created,
            self.directories_unchanged,
            self.entries_skipped,
        )
    }
}

/// Creates hard links on behalf of a [`CopyOperation`].
pub trait HardLinker: Send + Sync {
    fn hard_link<'a>(
        &'a self,
        src: &'a Path,
        dst: &'a Path,
    ) -> BoxFuture<'a, std::io::Result<()>>;
}

/// Hard links through the operating system.
#[derive(Copy, Clone, Debug, Default)]
pub struct OsHardLinker;

impl HardLinker for OsHardLinker {
    fn hard_link<'a>(
        &'a self,
        src: &'a Path,
        dst: &'a Path,
    ) -> BoxFuture<'a, std::io::Result<()>> {
        tokio::fs::hard_link(src, dst).boxed()
    }
}

#[cfg(unix)]
fn is_same_file(md1: &std::fs::Metadata, md2: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::MetadataExt;
    md1.dev() == md2.dev() && md1.ino() == md2.ino()
}

#[cfg(not(unix))]
fn is_same_file(_md1: &std::fs::Metadata, _md2: &std::fs::Metadata) -> bool {
    false
}

/// Removes whatever non-directory entry occupies `path`.
async fn remove_existing_file(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::symlink_metadata(path).await {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => {
            tracing::debug!("removing existing {:?}", path);
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("failed removing existing {:?}", path))
        }
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => {
            Err(error).with_context(|| format!("failed reading metadata from {:?}", path))
        }
    }
}

/// A single replication of one source path into one destination path.
///
/// The operation walks the source sequentially, copying (or hard-linking) files and creating
/// directories as it goes. Symlinks are only recorded during the walk and created all at once,
/// in parallel, after the walk succeeded, since a link may point at an entry that was not
/// replicated yet when the link was visited.
///
/// Hard linking is attempted until it fails for the first time. From then on every remaining
/// file of the operation is copied.
pub struct CopyOperation<'a> {
    use_hard_links: bool,
    pending_links: Vec<LinkInfo>,
    summary: Summary,
    hard_linker: &'a dyn HardLinker,
}

impl CopyOperation<'static> {
    #[must_use]
    pub fn new(use_hard_links: bool) -> Self {
        CopyOperation::with_hard_linker(use_hard_links, &OsHardLinker)
    }
}

impl<'a> CopyOperation<'a> {
    #[must_use]
    pub fn with_hard_linker(use_hard_links: bool, hard_linker: &'a dyn HardLinker) -> Self {
        Self {
            use_hard_links: use_hard_links && HARD_LINKS_SUPPORTED,
            pending_links: Vec::new(),
            summary: Summary::default(),
            hard_linker,
        }
    }

    /// Whether the next regular file will be hard-linked
    #[must_use]
    pub fn use_hard_links(&self) -> bool {
        self.use_hard_links
    }

    #[must_use]
    pub fn summary(&self) -> &Summary {
        &self.summary
    }

    /// Replicates `from` into `to` and creates all deferred symlinks.
    #[instrument(skip(self))]
    pub async fn run(mut self, from: &Path, to: &Path) -> Result<Summary, Error> {
        tracing::debug!("copy files, use hard links: {}", self.use_hard_links);
        self.copy_dir_or_file(from, to, true)
            .await
            .map_err(Error::Traverse)?;
        let links = std::mem::take(&mut self.pending_links);
        let count = links.len();
        if count > 0 {
            tracing::debug!("creating {} deferred symlink(s)", count);
            link::create_links(links).await.map_err(Error::Links)?;
            self.summary.symlinks_created += count;
        }
        Ok(self.summary)
    }

    #[async_recursion]
    async fn copy_dir_or_file(
        &mut self,
        from: &Path,
        to: &Path,
        is_root: bool,
    ) -> anyhow::Result<()> {
        let from_metadata = tokio::fs::symlink_metadata(from)
            .await
            .with_context(|| format!("failed reading metadata from {:?}", from))?;
        if from_metadata.is_dir() {
            return self.copy_dir(from, to, &from_metadata, is_root).await;
        }
        if from_metadata.is_symlink() {
            return self.defer_symlink(from, to).await;
        }
        if from_metadata.is_file() {
            return self.copy_file(from, to, is_root, &from_metadata).await;
        }
        Err(anyhow!(
            "copy: {:?} -> {:?} failed, unsupported src file type: {:?}",
            from,
            to,
            from_metadata.file_type()
        ))
    }

    async fn copy_dir(
        &mut self,
        from: &Path,
        to: &Path,
        from_metadata: &std::fs::Metadata,
        is_root: bool,
    ) -> anyhow::Result<()> {
        match tokio::fs::create_dir(to).await {
            Ok(()) => self.summary.directories_created += 1,
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                let to_metadata = tokio::fs::metadata(to)
                    .await
                    .with_context(|| format!("failed reading metadata from {:?}", to))?;
                if !to_metadata.is_dir() {
                    bail!("cannot create directory {:?}, path exists and is not a directory", to);
                }
                tracing::debug!("{:?} already exists, leaving it as is", to);
                self.summary.directories_unchanged += 1;
            }
            Err(error) if is_root && error.kind() == std::io::ErrorKind::NotFound => {
                tokio::fs::create_dir_all(to)
                    .await
                    .with_context(|| format!("cannot create directory {:?}", to))?;
                self.summary.directories_created += 1;
            }
            Err(error) => {
                return Err(error).with_context(|| format!("cannot create directory {:?}", to));
            }
        }
        preserve::set_dir_permissions_if_needed(to, from_metadata).await?;
        let mut entries = tokio::fs::read_dir(from)
            .await
            .with_context(|| format!("cannot open directory {:?} for reading", from))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("failed traversing directory {:?}", from))?
        {
            let name = entry.file_name();
            if name == SKIPPED_FILE_NAME {
                tracing::trace!("skipping {:?}", entry.path());
                self.summary.entries_skipped += 1;
                continue;
            }
            self.copy_dir_or_file(&entry.path(), &to.join(&name), false)
                .await?;
        }
        Ok(())
    }

    /// Records the symlink at `from` to be recreated at `to` once the walk is done.
    ///
    /// Absolute targets are rewritten relative to the directory containing `from`.
    async fn defer_symlink(&mut self, from: &Path, to: &Path) -> anyhow::Result<()> {
        let mut link = tokio::fs::read_link(from)
            .await
            .with_context(|| format!("failed reading symlink {:?}", from))?;
        if link.is_absolute() {
            let from_dir = match from.parent() {
                Some(parent) if !parent.as_os_str().is_empty() => parent,
                _ => Path::new("."),
            };
            let from_dir = std::path::absolute(from_dir)
                .with_context(|| format!("cannot resolve directory of symlink {:?}", from))?;
            link = link::relative_target(&from_dir, &link)
                .with_context(|| format!("cannot rewrite target of symlink {:?}", from))?;
            tracing::debug!("rewrote absolute symlink {:?} target to {:?}", from, &link);
        }
        remove_existing_file(to).await?;
        self.pending_links.push(LinkInfo {
            file: to.to_path_buf(),
            link,
        });
        Ok(())
    }

    /// Replicates the regular file `from` at `to`, by hard link while those keep working and by
    /// copying contents and permissions otherwise.
    ///
    /// An existing non-directory entry at `to` is replaced.
    #[instrument(skip(self, from_metadata))]
    pub async fn copy_file(
        &mut self,
        from: &Path,
        to: &Path,
        create_parent_dirs: bool,
        from_metadata: &std::fs::Metadata,
    ) -> anyhow::Result<()> {
        let parent = to
            .parent()
            .filter(|p| create_parent_dirs && !p.as_os_str().is_empty());
        if let Some(parent) = parent {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("cannot create directory {:?}", parent))?;
        }
        match tokio::fs::symlink_metadata(to).await {
            Ok(to_metadata) => {
                if self.use_hard_links && is_same_file(from_metadata, &to_metadata) {
                    tracing::debug!("already hard-linked, leaving file as is");
                    self.summary.hard_links_unchanged += 1;
                    return Ok(());
                }
                remove_existing_file(to).await?;
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed reading metadata from {:?}", to));
            }
        }
        if self.use_hard_links {
            match self.hard_linker.hard_link(from, to).await {
                Ok(()) => {
                    self.summary.hard_links_created += 1;
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(
                        "cannot copy {:?} -> {:?} using hard link, copying this and all remaining files: {}",
                        from,
                        to,
                        &error
                    );
                    self.use_hard_links = false;
                }
            }
        }
        tokio::fs::copy(from, to)
            .await
            .with_context(|| format!("failed copying {:?} to {:?}", from, to))?;
        self.summary.files_copied += 1;
        self.summary.bytes_copied += from_metadata.len();
        Ok(())
    }
}

/// Replicates `from` into `to`, hard-linking regular files when `use_hard_links` is set and the
/// platform allows it.
pub async fn copy_tree(from: &Path, to: &Path, use_hard_links: bool) -> Result<Summary, Error> {
    CopyOperation::new(use_hard_links).run(from, to).await
}

/// Replicates `from` into `to` copying every regular file.
pub async fn copy_dir_or_file(from: &Path, to: &Path) -> Result<Summary, Error> {
    copy_tree(from, to, false).await
}

/// Replicates `from` into `to` hard-linking regular files for as long as that works.
pub async fn copy_using_hard_links(from: &Path, to: &Path) -> Result<Summary, Error> {
    copy_tree(from, to, true).await
}
