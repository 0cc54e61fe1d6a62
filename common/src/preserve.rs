//! Propagation of source directory permissions onto the destination tree

use anyhow::Result;
use tracing::instrument;

/// Mode a newly created directory ends up with under the usual `022` umask
pub const DEFAULT_DIR_MODE: u32 = 0o755;

/// Copies the permission bits of a source directory onto `dir`.
///
/// The syscall is skipped when the source has [`DEFAULT_DIR_MODE`], which is what a fresh directory
/// already has in the common case. Returns whether the permissions were changed. On platforms
/// without unix modes this does nothing.
#[cfg(unix)]
#[instrument]
pub async fn set_dir_permissions_if_needed(
    dir: &std::path::Path,
    src_metadata: &std::fs::Metadata,
) -> Result<bool> {
    use anyhow::Context;
    use std::os::unix::fs::PermissionsExt;
    let mode = src_metadata.permissions().mode() & 0o7777;
    if mode == DEFAULT_DIR_MODE {
        return Ok(false);
    }
    tracing::debug!("setting directory mode to {:o}", mode);
    tokio::fs::set_permissions(dir, std::fs::Permissions::from_mode(mode))
        .await
        .with_context(|| format!("cannot set {:?} permissions to {:o}", dir, mode))?;
    Ok(true)
}

#[cfg(not(unix))]
#[instrument]
pub async fn set_dir_permissions_if_needed(
    _dir: &std::path::Path,
    _src_metadata: &std::fs::Metadata,
) -> Result<bool> {
    Ok(false)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::testutils;
    use std::os::unix::fs::PermissionsExt;
    use tracing_test::traced_test;

    async fn mode_of(path: &std::path::Path) -> u32 {
        tokio::fs::metadata(path)
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o7777
    }

    #[tokio::test]
    #[traced_test]
    async fn default_mode_is_left_alone() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o755)).await?;
        tokio::fs::set_permissions(&dst, std::fs::Permissions::from_mode(0o700)).await?;
        let src_metadata = tokio::fs::symlink_metadata(&src).await?;
        assert!(!set_dir_permissions_if_needed(&dst, &src_metadata).await?);
        // untouched, even though it differs from the source
        assert_eq!(mode_of(&dst).await, 0o700);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn non_default_mode_is_copied() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        let dst = tmp_dir.join("dst");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::create_dir(&dst).await?;
        tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o1750)).await?;
        let src_metadata = tokio::fs::symlink_metadata(&src).await?;
        assert!(set_dir_permissions_if_needed(&dst, &src_metadata).await?);
        assert_eq!(mode_of(&dst).await, 0o1750);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn missing_directory_is_an_error() -> Result<(), anyhow::Error> {
        let tmp_dir = testutils::create_temp_dir().await?;
        let src = tmp_dir.join("src");
        tokio::fs::create_dir(&src).await?;
        tokio::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o700)).await?;
        let src_metadata = tokio::fs::symlink_metadata(&src).await?;
        let error = set_dir_permissions_if_needed(&tmp_dir.join("missing"), &src_metadata)
            .await
            .unwrap_err();
        assert!(format!("{error:#}").contains("cannot set"));
        Ok(())
    }
}
