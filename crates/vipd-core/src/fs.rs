//! Filesystem utilities.

use std::io;
use std::path::Path;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Replaces the contents of `path` without ever exposing a half-written file.
///
/// The data is written and synced to a uniquely named temporary file in the
/// same directory, which is then persisted over the target. Permissions of an
/// existing target are carried over.
///
/// # Errors
///
/// Returns an error if the temporary file cannot be written or moved into place.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).await?;

    // Dropping the handle on any error below removes the temporary file.
    let temp_file = NamedTempFile::new_in(parent)?;
    let mut file = fs::File::from_std(temp_file.as_file().try_clone()?);
    file.write_all(contents).await?;
    file.sync_all().await?;
    drop(file);

    match fs::metadata(path).await {
        Ok(metadata) => fs::set_permissions(temp_file.path(), metadata.permissions()).await?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    temp_file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leftover_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }

    #[tokio::test]
    async fn test_write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        write_atomic(&path, b"first").await.unwrap();
        write_atomic(&path, b"second").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "second");
        assert_eq!(leftover_files(&dir.path().join("nested")), vec!["state.json"]);
    }

    #[tokio::test]
    async fn test_write_atomic_ignores_leftovers_from_earlier_runs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        // Whatever a crashed writer left behind must not get in the way.
        std::fs::create_dir(dir.path().join(".state.json.vipd-tmp")).unwrap();
        std::fs::write(dir.path().join(".tmp-leftover"), "junk").unwrap();

        write_atomic(&path, b"{}").await.unwrap();
        write_atomic(&path, b"{\"entries\":{}}").await.unwrap();

        assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"entries\":{}}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hosts");
        std::fs::write(&path, "127.0.0.1 localhost\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o640)).unwrap();

        write_atomic(&path, b"127.0.0.1 localhost\n").await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_write_atomic_reports_unwritable_directory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let locked = dir.path().join("locked");
        std::fs::create_dir(&locked).unwrap();
        std::fs::write(locked.join("state.json"), "old").unwrap();
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o555)).unwrap();

        let result = write_atomic(&locked.join("state.json"), b"new").await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        // Root ignores directory permissions, so only check when it applies.
        if result.is_err() {
            assert_eq!(std::fs::read_to_string(locked.join("state.json")).unwrap(), "old");
            assert_eq!(leftover_files(&locked), vec!["state.json"]);
        }
    }
}
