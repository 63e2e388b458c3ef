//! Outbound chunk streaming and saving completed files.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanlink_core::{unix_now, FileSendJob, OutboundAction};
use tokio::io::AsyncWriteExt;

use crate::net::Context;

/// Stream every chunk of an accepted file, pausing between chunks. Runs to completion or shutdown.
pub async fn stream_file(ctx: Context, job: FileSendJob) {
    let total = job.total_chunks();
    tracing::info!(file = %job.file_id, to = %job.to, chunks = total, "sending file");
    let delay = Duration::from_millis(job.delay_ms);
    for index in 0..total {
        if ctx.is_shutting_down() {
            tracing::info!(file = %job.file_id, sent = index, "file send interrupted by shutdown");
            return;
        }
        let actions = {
            let mut node = ctx.node.lock().await;
            node.send_file_chunk(&job, index, unix_now())
        };
        match actions {
            Ok(actions) => {
                for action in actions {
                    if let OutboundAction::Send { to, kind, bytes } = action {
                        ctx.send(to, kind, &bytes).await;
                    }
                }
            }
            Err(e) => {
                tracing::error!(file = %job.file_id, chunk = index, error = %e, "cannot encode chunk");
                return;
            }
        }
        tokio::time::sleep(delay).await;
    }
    tracing::info!(file = %job.file_id, "all chunks sent");
}

/// Candidate paths for `filename` in `dir`: `name.ext`, then `name_1.ext`, `name_2.ext`, ...
/// Only the final path component of `filename` is used.
fn candidate_paths(dir: &Path, filename: &str) -> impl Iterator<Item = PathBuf> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .unwrap_or("received.bin")
        .to_string();
    let (stem, ext) = match base.rsplit_once('.') {
        Some((s, e)) if !s.is_empty() => (s.to_string(), Some(e.to_string())),
        _ => (base.clone(), None),
    };
    let dir = dir.to_path_buf();
    std::iter::once(dir.join(&base)).chain((1u32..).map(move |n| match &ext {
        Some(e) => dir.join(format!("{stem}_{n}.{e}")),
        None => dir.join(format!("{stem}_{n}")),
    }))
}

/// Write a completed file under `dir`. Existing files are never opened for writing.
pub async fn save_received_file(dir: &Path, filename: &str, data: &[u8]) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(dir).await?;
    for path in candidate_paths(dir, filename) {
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match opened {
            Ok(mut file) => {
                file.write_all(data).await?;
                file.flush().await?;
                return Ok(path);
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(e) => return Err(e),
        }
    }
    Err(io::Error::new(io::ErrorKind::AlreadyExists, "no free file name"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidates_get_suffixes() {
        let dir = Path::new("/tmp/inbox");
        let names: Vec<PathBuf> = candidate_paths(dir, "photo.png").take(3).collect();
        assert_eq!(
            names,
            vec![dir.join("photo.png"), dir.join("photo_1.png"), dir.join("photo_2.png")]
        );
        let bare: Vec<PathBuf> = candidate_paths(dir, "README").take(2).collect();
        assert_eq!(bare, vec![dir.join("README"), dir.join("README_1")]);
    }

    #[test]
    fn path_components_stripped() {
        let dir = Path::new("/tmp/inbox");
        assert_eq!(candidate_paths(dir, "../../etc/passwd").next(), Some(dir.join("passwd")));
        assert_eq!(candidate_paths(dir, "..").next(), Some(dir.join("received.bin")));
    }

    #[tokio::test]
    async fn save_creates_dir_and_never_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("inbox");
        let a = save_received_file(&target, "notes.txt", b"one").await.unwrap();
        let b = save_received_file(&target, "notes.txt", b"two").await.unwrap();
        assert_eq!(a, target.join("notes.txt"));
        assert_eq!(b, target.join("notes_1.txt"));
        assert_eq!(std::fs::read(&a).unwrap(), b"one");
        assert_eq!(std::fs::read(&b).unwrap(), b"two");
    }

    #[tokio::test]
    async fn file_appearing_first_is_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        // Created by someone else, e.g. between a listing and our write.
        std::fs::write(dir.path().join("notes.txt"), b"theirs").unwrap();
        let ours = save_received_file(dir.path(), "notes.txt", b"ours").await.unwrap();
        assert_eq!(ours, dir.path().join("notes_1.txt"));
        assert_eq!(std::fs::read(dir.path().join("notes.txt")).unwrap(), b"theirs");
    }
}
