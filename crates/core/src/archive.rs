//! Tar stream helpers
//!
//! Phase containers exchange files with the orchestrator exclusively as tar
//! streams: app sources and metadata files are copied in, build artifacts
//! are copied out, and daemon image builds consume a tar build context.
//! Archives are deterministic (entries sorted, mtimes stripped) so repeated
//! runs hand the daemon byte-identical contexts.

use crate::errors::Result;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Predicate deciding which files a directory archive includes.
pub type FileFilter = std::sync::Arc<dyn Fn(&Path) -> bool + Send + Sync>;

/// Archive a directory as a tar stream with entries relative to its root.
///
/// All entries are owned `uid:gid` with mtime 0. `filter` (when given) is
/// applied to paths relative to `dir`; filtered files and directories are
/// skipped whole.
pub fn tar_directory(
    dir: &Path,
    uid: u64,
    gid: u64,
    filter: Option<&FileFilter>,
) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    append_dir(&mut builder, dir, dir, uid, gid, filter)?;
    Ok(builder.into_inner()?)
}

fn append_dir(
    builder: &mut tar::Builder<Vec<u8>>,
    dir: &Path,
    base: &Path,
    uid: u64,
    gid: u64,
    filter: Option<&FileFilter>,
) -> Result<()> {
    let mut entries: Vec<_> = std::fs::read_dir(dir)?.collect::<std::io::Result<_>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let relative = path.strip_prefix(base).expect("entry is under base");
        if let Some(filter) = filter {
            if !filter(relative) {
                continue;
            }
        }

        if path.is_dir() {
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            header.set_mode(0o755);
            header.set_mtime(0);
            header.set_uid(uid);
            header.set_gid(gid);
            builder.append_data(
                &mut header,
                format!("{}/", relative.display()),
                std::io::empty(),
            )?;
            append_dir(builder, &path, base, uid, gid, filter)?;
        } else if path.is_file() {
            let metadata = std::fs::metadata(&path)?;
            let mut header = tar::Header::new_gnu();
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(metadata.len());
            header.set_mode(0o644);
            header.set_mtime(0);
            header.set_uid(uid);
            header.set_gid(gid);
            let file = std::fs::File::open(&path)?;
            builder.append_data(&mut header, relative, file)?;
        }
    }
    Ok(())
}

/// Archive a single in-memory file.
pub fn tar_file(name: &str, contents: &[u8], uid: u64, gid: u64, mode: u32) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    header.set_mode(mode);
    header.set_mtime(0);
    header.set_uid(uid);
    header.set_gid(gid);
    builder.append_data(&mut header, name, contents)?;
    Ok(builder.into_inner()?)
}

/// Archive directory entries (no contents) so copying the archive into a
/// container normalizes ownership of the named directories.
pub fn tar_dir_entries(names: &[&str], uid: u64, gid: u64) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    for name in names {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_mtime(0);
        header.set_uid(uid);
        header.set_gid(gid);
        builder.append_data(&mut header, format!("{}/", name), std::io::empty())?;
    }
    Ok(builder.into_inner()?)
}

/// Unpack a tar stream into a directory, creating it if needed.
pub fn untar_to_dir(bytes: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)?;
    let mut archive = tar::Archive::new(bytes);
    archive.set_preserve_permissions(false);
    archive.unpack(dest)?;
    Ok(())
}

/// Read every regular file in a tar stream into memory, keyed by entry path.
pub fn read_tar_entries(bytes: &[u8]) -> Result<BTreeMap<PathBuf, Vec<u8>>> {
    let mut archive = tar::Archive::new(bytes);
    let mut out = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type() != tar::EntryType::Regular {
            continue;
        }
        let path = entry.path()?.into_owned();
        let mut contents = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut contents)?;
        out.insert(path, contents);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_tar_directory_round_trip() {
        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("sub")).unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        std::fs::write(src.path().join("sub/b.txt"), b"beta").unwrap();

        let bytes = tar_directory(src.path(), 0, 0, None).unwrap();
        let entries = read_tar_entries(&bytes).unwrap();
        assert_eq!(entries.get(Path::new("a.txt")).unwrap(), b"alpha");
        assert_eq!(entries.get(Path::new("sub/b.txt")).unwrap(), b"beta");
    }

    #[test]
    fn test_tar_directory_is_deterministic() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("z.txt"), b"z").unwrap();
        std::fs::write(src.path().join("a.txt"), b"a").unwrap();

        let first = tar_directory(src.path(), 0, 0, None).unwrap();
        let second = tar_directory(src.path(), 0, 0, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_tar_directory_applies_filter() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("keep.txt"), b"k").unwrap();
        std::fs::write(src.path().join("drop.log"), b"d").unwrap();

        let filter: FileFilter =
            Arc::new(|p: &Path| p.extension().map(|e| e != "log").unwrap_or(true));
        let bytes = tar_directory(src.path(), 0, 0, Some(&filter)).unwrap();
        let entries = read_tar_entries(&bytes).unwrap();
        assert!(entries.contains_key(Path::new("keep.txt")));
        assert!(!entries.contains_key(Path::new("drop.log")));
    }

    #[test]
    fn test_untar_round_trip() {
        let bytes = tar_file("stack.toml", b"[run-image]\n", 0, 0, 0o644).unwrap();
        let dest = tempfile::tempdir().unwrap();
        untar_to_dir(&bytes, dest.path()).unwrap();
        assert_eq!(
            std::fs::read(dest.path().join("stack.toml")).unwrap(),
            b"[run-image]\n"
        );
    }

    #[test]
    fn test_tar_ownership_is_set() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"alpha").unwrap();
        let bytes = tar_directory(src.path(), 1000, 1000, None).unwrap();

        let mut archive = tar::Archive::new(bytes.as_slice());
        let entry = archive.entries().unwrap().next().unwrap().unwrap();
        assert_eq!(entry.header().uid().unwrap(), 1000);
        assert_eq!(entry.header().gid().unwrap(), 1000);
        assert_eq!(entry.header().mtime().unwrap(), 0);
    }
}
