use anyhow::{bail, Context, Result};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use walkdir::WalkDir;

/// Recursively delete a snapshot directory, bottom-up.
///
/// A top-level symbolic link is refused outright rather than deleted through.
/// Below the top level, symbolic links are never followed: they are unlinked
/// like regular files, so nothing outside `path` is touched.
pub fn remove_tree(path: &Path) -> Result<()> {
    let metadata = fs::symlink_metadata(path)
        .with_context(|| format!("Failed to stat snapshot: {}", path.display()))?;

    if metadata.file_type().is_symlink() {
        bail!("Refusing to delete through symbolic link: {}", path.display());
    }

    if !metadata.is_dir() {
        fs::remove_file(path)
            .with_context(|| format!("Failed to remove file: {}", path.display()))?;
        return Ok(());
    }

    make_dirs_writable(path)?;

    for entry in WalkDir::new(path).follow_links(false).contents_first(true) {
        let entry =
            entry.with_context(|| format!("Failed to walk snapshot: {}", path.display()))?;
        let entry_path = entry.path();

        if entry.file_type().is_dir() {
            fs::remove_dir(entry_path).with_context(|| {
                format!("Failed to remove directory: {}", entry_path.display())
            })?;
        } else {
            fs::remove_file(entry_path)
                .with_context(|| format!("Failed to remove file: {}", entry_path.display()))?;
        }
    }

    Ok(())
}

/// Grant the owner rwx on `dir` and every directory below it.
///
/// Archived trees keep their original modes, and a read-only directory
/// cannot have its entries unlinked. Each directory's mode is fixed before
/// it is listed, so unreadable directories are handled too.
fn make_dirs_writable(dir: &Path) -> Result<()> {
    let mut permissions = fs::symlink_metadata(dir)
        .with_context(|| format!("Failed to stat: {}", dir.display()))?
        .permissions();
    let mode = permissions.mode();
    if mode & 0o700 != 0o700 {
        permissions.set_mode(mode | 0o700);
        fs::set_permissions(dir, permissions)
            .with_context(|| format!("Failed to make directory writable: {}", dir.display()))?;
    }

    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to list: {}", dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("Failed to list: {}", dir.display()))?;
        let file_type = entry
            .file_type()
            .with_context(|| format!("Failed to stat: {}", entry.path().display()))?;
        if file_type.is_dir() {
            make_dirs_writable(&entry.path())?;
        }
    }
    Ok(())
}
