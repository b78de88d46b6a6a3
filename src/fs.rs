use std::{
    fs::{self, File, remove_file, rename},
    io::Write,
    path::Path,
};

use anyhow::{Context, Result, anyhow};
use serde::Serialize;

/// Encodes `doc` as pretty JSON and replaces `path` with it atomically.
/// Nothing is written when encoding fails.
pub fn write_document<P: AsRef<Path>, T: Serialize>(path: P, doc: &T) -> Result<()> {
    let mut data = serde_json::to_vec_pretty(doc).context("unable to encode document")?;
    data.push(b'\n');
    replace_file(path.as_ref(), &data)
}

/// Replaces `path` with `data` through a hidden temporary file in the same
/// directory. The permissions of an existing target are carried over.
pub fn replace_file(path: &Path, data: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .ok_or_else(|| anyhow!("invalid path {:?}", path))?;
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let tmp = dir.join(format!(".{}.tmp", file_name.to_string_lossy()));
    let permissions = fs::metadata(path).ok().map(|m| m.permissions());

    let written = File::create(&tmp)
        .and_then(|mut f| {
            if let Some(perm) = permissions {
                f.set_permissions(perm)?;
            }
            f.write_all(data)?;
            f.sync_all()
        })
        .with_context(|| format!("unable to write {:?}", tmp))
        .and_then(|_| {
            rename(&tmp, path).with_context(|| format!("unable to rename {:?} to {:?}", tmp, path))
        });
    if written.is_err() {
        let _ = remove_file(&tmp);
    }
    written?;

    File::open(dir)
        .and_then(|d| d.sync_all())
        .with_context(|| format!("unable to sync directory {:?}", dir))
}
