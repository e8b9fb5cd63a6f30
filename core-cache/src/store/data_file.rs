//! Positional reads and writes on sparse data files, plus the atomic
//! metadata replace.

use bytes::Bytes;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

/// Write `data` at `offset`, creating the file if needed, and sync it.
pub(crate) async fn write_at(path: &Path, offset: u64, data: &[u8]) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)
        .await?;
    file.seek(SeekFrom::Start(offset)).await?;
    file.write_all(data).await?;
    file.sync_data().await
}

pub(crate) async fn read_at(path: &Path, offset: u64, length: u64) -> io::Result<Bytes> {
    let mut file = fs::File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;
    let mut buf = vec![0u8; to_usize(length)?];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

pub(crate) fn read_at_blocking(path: &Path, offset: u64, length: u64) -> io::Result<Bytes> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; to_usize(length)?];
    file.read_exact(&mut buf)?;
    Ok(Bytes::from(buf))
}

/// Replace `path` with `contents` so readers see either the old or the new
/// file, never a partial one.
pub(crate) async fn replace_atomic(path: &Path, tmp_path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = fs::File::create(tmp_path).await?;
    tmp.write_all(contents).await?;
    tmp.sync_all().await?;
    drop(tmp);
    fs::rename(tmp_path, path).await
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn to_usize(length: u64) -> io::Result<usize> {
    usize::try_from(length).map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "read too large"))
}
