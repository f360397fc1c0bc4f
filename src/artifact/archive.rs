//! Deterministic tar.gz packing of build directories
//!
//! Entries are sorted and carry zeroed timestamps and owners, so the same
//! tree always packs to the same bytes and therefore the same digest.

use crate::error::{ShipyardError, ShipyardResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs;
use std::path::Path;
use tar::{EntryType, Header};
use walkdir::WalkDir;

fn archive_err(context: &str, e: std::io::Error) -> ShipyardError {
    ShipyardError::io(context.to_string(), e)
}

/// Pack a directory tree into a gzip-compressed tar archive
pub fn pack_dir(root: &Path) -> ShipyardResult<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            ShipyardError::io(
                format!("walking {}", root.display()),
                e.into_io_error()
                    .unwrap_or_else(|| std::io::Error::other("walkdir loop")),
            )
        })?;
        let path = entry.path();
        if path == root {
            continue;
        }
        let rel = path
            .strip_prefix(root)
            .map_err(|e| ShipyardError::Internal(e.to_string()))?;

        let metadata = fs::symlink_metadata(path)
            .map_err(|e| ShipyardError::io(format!("stat {}", path.display()), e))?;
        let file_type = metadata.file_type();

        let mut header = Header::new_gnu();
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mode(file_mode(&metadata));

        if file_type.is_dir() {
            header.set_entry_type(EntryType::Directory);
            header.set_size(0);
            builder
                .append_data(&mut header, rel, std::io::empty())
                .map_err(|e| archive_err("appending directory", e))?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(path)
                .map_err(|e| ShipyardError::io(format!("readlink {}", path.display()), e))?;
            header.set_entry_type(EntryType::Symlink);
            header.set_size(0);
            builder
                .append_link(&mut header, rel, &target)
                .map_err(|e| archive_err("appending symlink", e))?;
        } else if file_type.is_file() {
            let file = fs::File::open(path)
                .map_err(|e| ShipyardError::io(format!("opening {}", path.display()), e))?;
            header.set_entry_type(EntryType::Regular);
            header.set_size(metadata.len());
            builder
                .append_data(&mut header, rel, file)
                .map_err(|e| archive_err("appending file", e))?;
        }
    }

    let encoder = builder
        .into_inner()
        .map_err(|e| archive_err("finishing archive", e))?;
    encoder
        .finish()
        .map_err(|e| archive_err("compressing archive", e))
}

/// Unpack an archive produced by [`pack_dir`] into `dest`
pub fn unpack_into(bytes: &[u8], dest: &Path) -> ShipyardResult<()> {
    fs::create_dir_all(dest)
        .map_err(|e| ShipyardError::io(format!("creating {}", dest.display()), e))?;

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .map_err(|e| ShipyardError::io(format!("unpacking into {}", dest.display()), e))
}

#[cfg(unix)]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn file_mode(metadata: &fs::Metadata) -> u32 {
    if metadata.is_dir() {
        0o755
    } else {
        0o644
    }
}
