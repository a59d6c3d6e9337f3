//! Atomic file persistence
//!
//! Every state file the gateway owns (account registry, quota cache,
//! priority config, token files) is written with the same dance: write to a
//! temp file in the target directory, then rename over the destination.
//! A crash between the two steps leaves the old file intact; a crash after
//! the rename leaves the new file intact.

use std::path::Path;

use tokio::io;

/// Write `contents` to `path` atomically (temp file + rename).
///
/// The temp file lives in the same directory as the target so the rename
/// stays on one filesystem. Parent directories are created if missing.
pub async fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with_mode(path, contents, None).await
}

/// Atomic write with file permissions 0600 (owner read/write only).
///
/// Used for token files, which hold live credentials.
pub async fn write_atomic_secret(path: &Path, contents: &[u8]) -> io::Result<()> {
    write_atomic_with_mode(path, contents, Some(0o600)).await
}

async fn write_atomic_with_mode(path: &Path, contents: &[u8], mode: Option<u32>) -> io::Result<()> {
    let dir = path.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no parent directory")
    })?;
    tokio::fs::create_dir_all(dir).await?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("state");
    let tmp_path = dir.join(format!(".{file_name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, contents).await?;

    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(mode);
        tokio::fs::set_permissions(&tmp_path, perms).await?;
    }
    #[cfg(not(unix))]
    let _ = mode;

    tokio::fs::rename(&tmp_path, path).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_and_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_atomic(&path, b"{\"v\": 1}").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{\"v\": 1}");

        write_atomic(&path, b"{\"v\": 2}").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "{\"v\": 2}");
    }

    #[tokio::test]
    async fn creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a/b/state.json");

        write_atomic(&path, b"x").await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        write_atomic(&path, b"x").await.unwrap();

        let mut entries = tokio::fs::read_dir(dir.path()).await.unwrap();
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await.unwrap() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        assert_eq!(names, vec!["state.json"]);
    }

    /// Simulated crash: a stale temp file from an aborted write must not
    /// prevent the next write, and the target keeps its old contents until
    /// a rename actually happens.
    #[tokio::test]
    async fn aborted_write_keeps_old_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        write_atomic(&path, b"old").await.unwrap();

        // Abort after the temp write, before the rename.
        let tmp = dir
            .path()
            .join(format!(".state.json.tmp.{}", std::process::id()));
        tokio::fs::write(&tmp, b"new-partial").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "old");

        // The next full write succeeds despite the stale temp file.
        write_atomic(&path, b"new").await.unwrap();
        assert_eq!(tokio::fs::read_to_string(&path).await.unwrap(), "new");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn secret_write_sets_0600() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");

        write_atomic_secret(&path, b"{}").await.unwrap();

        let mode = tokio::fs::metadata(&path)
            .await
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(mode, 0o600, "token file must be 0600, got {mode:o}");
    }
}
