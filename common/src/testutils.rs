use async_recursion::async_recursion;
use std::os::unix::fs::PermissionsExt;

pub async fn create_temp_dir() -> anyhow::Result<std::path::PathBuf> {
    let mut idx = 0;
    loop {
        let tmp_dir = std::env::temp_dir().join(format!("rstage_test{}", &idx));
        if let Err(error) = tokio::fs::create_dir(&tmp_dir).await {
            match error.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    idx += 1;
                }
                _ => return Err(error.into()),
            }
        } else {
            return Ok(tmp_dir);
        }
    }
}

pub async fn setup_test_dir() -> anyhow::Result<std::path::PathBuf> {
    // create a temporary directory
    let tmp_dir = create_temp_dir().await?;
    // foo
    // |- .DS_Store
    // |- 0.txt
    // |- bar
    //    |- .DS_Store
    //    |- 1.txt
    //    |- 2.txt  (mode 0o640)
    //    |- 3.txt
    // |- baz      (mode 0o750)
    //    |- 4.txt
    //    |- 5.txt -> ../bar/2.txt
    //    |- 6.txt -> (absolute path) .../foo/bar/3.txt
    let foo_path = tmp_dir.join("foo");
    tokio::fs::create_dir(&foo_path).await?;
    tokio::fs::write(foo_path.join(".DS_Store"), "finder").await?;
    tokio::fs::write(foo_path.join("0.txt"), "0").await?;
    let bar_path = foo_path.join("bar");
    tokio::fs::create_dir(&bar_path).await?;
    tokio::fs::write(bar_path.join(".DS_Store"), "finder").await?;
    tokio::fs::write(bar_path.join("1.txt"), "1").await?;
    tokio::fs::write(bar_path.join("2.txt"), "2").await?;
    tokio::fs::set_permissions(
        bar_path.join("2.txt"),
        std::fs::Permissions::from_mode(0o640),
    )
    .await?;
    tokio::fs::write(bar_path.join("3.txt"), "3").await?;
    let baz_path = foo_path.join("baz");
    tokio::fs::create_dir(&baz_path).await?;
    tokio::fs::write(baz_path.join("4.txt"), "4").await?;
    tokio::fs::symlink("../bar/2.txt", baz_path.join("5.txt")).await?;
    tokio::fs::symlink(bar_path.join("3.txt"), baz_path.join("6.txt")).await?;
    tokio::fs::set_permissions(&baz_path, std::fs::Permissions::from_mode(0o750)).await?;
    Ok(tmp_dir)
}

pub fn mode_of(metadata: &std::fs::Metadata) -> u32 {
    metadata.permissions().mode() & 0o7777
}

/// Checks that `dst` is a faithful replica of `src`: same entries minus `.DS_Store`, same file
/// contents and modes, and relative symlinks resolving to the same data.
#[async_recursion]
pub async fn check_dirs_identical(
    src: &std::path::Path,
    dst: &std::path::Path,
) -> anyhow::Result<()> {
    use anyhow::Context;
    let mut src_entries = tokio::fs::read_dir(src).await?;
    let mut expected_count = 0;
    while let Some(src_entry) = src_entries.next_entry().await? {
        let src_entry_path = src_entry.path();
        let src_entry_name = src_entry_path.file_name().unwrap();
        let dst_entry_path = dst.join(src_entry_name);
        if src_entry_name == ".DS_Store" {
            assert!(
                tokio::fs::symlink_metadata(&dst_entry_path).await.is_err(),
                "{dst_entry_path:?} should have been skipped"
            );
            continue;
        }
        expected_count += 1;
        let src_md = tokio::fs::symlink_metadata(&src_entry_path)
            .await
            .context(format!("Source file {:?} is missing!", &src_entry_path))?;
        let dst_md = tokio::fs::symlink_metadata(&dst_entry_path)
            .await
            .context(format!(
                "Destination file {:?} is missing!",
                &dst_entry_path
            ))?;
        assert_eq!(src_md.is_file(), dst_md.is_file(), "{dst_entry_path:?}");
        assert_eq!(src_md.is_dir(), dst_md.is_dir(), "{dst_entry_path:?}");
        assert_eq!(src_md.is_symlink(), dst_md.is_symlink(), "{dst_entry_path:?}");
        if src_md.is_symlink() {
            let src_link = tokio::fs::read_link(&src_entry_path).await?;
            let dst_link = tokio::fs::read_link(&dst_entry_path).await?;
            assert!(dst_link.is_relative(), "{dst_entry_path:?} -> {dst_link:?}");
            if src_link.is_relative() {
                assert_eq!(src_link, dst_link);
            }
            // links to directories are checked through the directory itself
            if tokio::fs::metadata(&src_entry_path).await?.is_file() {
                let src_contents = tokio::fs::read(&src_entry_path).await?;
                let dst_contents = tokio::fs::read(&dst_entry_path).await?;
                assert_eq!(src_contents, dst_contents, "{dst_entry_path:?}");
            }
        } else if src_md.is_file() {
            let src_contents = tokio::fs::read(&src_entry_path).await?;
            let dst_contents = tokio::fs::read(&dst_entry_path).await?;
            assert_eq!(src_contents, dst_contents, "{dst_entry_path:?}");
            assert_eq!(mode_of(&src_md), mode_of(&dst_md), "{dst_entry_path:?}");
        } else {
            assert_eq!(mode_of(&src_md), mode_of(&dst_md), "{dst_entry_path:?}");
            check_dirs_identical(&src_entry_path, &dst_entry_path).await?;
        }
    }
    let mut dst_count = 0;
    let mut dst_entries = tokio::fs::read_dir(dst).await?;
    while dst_entries.next_entry().await?.is_some() {
        dst_count += 1;
    }
    assert_eq!(expected_count, dst_count, "unexpected entries in {dst:?}");
    Ok(())
}
