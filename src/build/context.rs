use std::fs;
use std::io;
use std::path::Path;

use tempfile::TempDir;
use walkdir::WalkDir;

use crate::recipe::{Recipe, SOURCE_DIR};

/// A temporary image build context: the rendered `Dockerfile` plus a copy of
/// the source tree under `src/`. Deleted on drop.
#[derive(Debug)]
pub struct BuildContext {
    dir: TempDir,
}

impl BuildContext {
    pub fn materialize(recipe: &Recipe, source: Option<&Path>) -> io::Result<Self> {
        let dir = tempfile::Builder::new().prefix("shipyard-").tempdir()?;
        fs::write(dir.path().join("Dockerfile"), recipe.render())?;

        let dest = dir.path().join(SOURCE_DIR);
        fs::create_dir_all(&dest)?;
        if let Some(source) = source {
            copy_tree(source, &dest)?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn copy_tree(source: &Path, dest: &Path) -> io::Result<()> {
    if !source.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("source directory {} does not exist", source.display()),
        ));
    }

    for entry in WalkDir::new(source).min_depth(1).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(io::Error::other)?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_file() {
            fs::copy(entry.path(), &target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    let points_to = fs::read_link(link)?;
    std::os::unix::fs::symlink(points_to, target)
}

#[cfg(not(unix))]
fn copy_symlink(link: &Path, target: &Path) -> io::Result<()> {
    if link.is_file() {
        fs::copy(link, target)?;
    }
    Ok(())
}
