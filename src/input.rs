//! Opening the container's output streams
//!
//! FIFOs and piped stdin go through tokio's pipe support, which reads
//! through the reactor. A read that is still pending at shutdown is simply
//! dropped. Reads of anything else run on the blocking pool.

use crate::errors::Result;

use std::path::Path;
use tokio::io::AsyncRead;
use tracing::debug;

/// A container stream ready to be framed
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Open the stream at `path` for reading.
///
/// Must be called from within a tokio runtime.
pub async fn open_path(path: &Path) -> Result<BoxedReader> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;

        let metadata = tokio::fs::metadata(path).await?;
        if metadata.file_type().is_fifo() {
            debug!("Opening {} as a pipe", path.display());
            let receiver = tokio::net::unix::pipe::OpenOptions::new().open_receiver(path)?;
            return Ok(Box::new(receiver));
        }
    }

    debug!("Opening {} as a regular file", path.display());
    Ok(Box::new(tokio::fs::File::open(path).await?))
}

/// Open the process's stdin for reading
pub fn open_stdin() -> Result<BoxedReader> {
    #[cfg(unix)]
    {
        use std::os::fd::AsFd;

        let fd = std::io::stdin().as_fd().try_clone_to_owned()?;
        match tokio::net::unix::pipe::Receiver::from_file(std::fs::File::from(fd)) {
            Ok(receiver) => return Ok(Box::new(receiver)),
            Err(e) => debug!("stdin is not a pipe ({}), reading it as a file", e),
        }
    }

    Ok(Box::new(tokio::io::stdin()))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn mkfifo(dir: &TempDir, name: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let status = std::process::Command::new("mkfifo")
            .arg(&path)
            .status()
            .unwrap();
        assert!(status.success());
        path
    }

    #[tokio::test]
    async fn test_fifo_reads_through_the_reactor() {
        let dir = TempDir::new().unwrap();
        let path = mkfifo(&dir, "stdout");

        let mut reader = open_path(&path).await.unwrap();
        let mut writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        writer.write_all(b"from the pipe\n").unwrap();
        drop(writer);

        let mut contents = String::new();
        reader.read_to_string(&mut contents).await.unwrap();
        assert_eq!(contents, "from the pipe\n");
    }

    #[tokio::test]
    async fn test_pending_fifo_read_can_be_dropped() {
        let dir = TempDir::new().unwrap();
        let path = mkfifo(&dir, "stderr");

        let mut reader = open_path(&path).await.unwrap();
        let _writer = std::fs::OpenOptions::new().write(true).open(&path).unwrap();

        let mut buf = [0u8; 16];
        let read = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            reader.read(&mut buf),
        )
        .await;
        assert!(read.is_err());
    }

    #[tokio::test]
    async fn test_regular_file_is_read_to_the_end() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("replay.log");
        std::fs::write(&path, "one\ntwo\n").unwrap();

        let mut contents = String::new();
        open_path(&path)
            .await
            .unwrap()
            .read_to_string(&mut contents)
            .await
            .unwrap();
        assert_eq!(contents, "one\ntwo\n");
    }

    #[tokio::test]
    async fn test_missing_path_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(open_path(&dir.path().join("absent")).await.is_err());
    }
}
