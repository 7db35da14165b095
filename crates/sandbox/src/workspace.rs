use std::io;
use std::path::{Component, Path, PathBuf};

use tempfile::TempDir;
use tracing::debug;

use crate::error::ExecError;
use crate::request::UploadedFile;

const WORKSPACE_DIR: &str = "workspace";
const SCRIPT_NAME: &str = "run.sh";

/// Ephemeral on-disk state for one request: a private temp root holding the
/// `workspace/` directory that gets mounted and the generated `run.sh` beside
/// it, so the script is never visible as a workspace file.
#[derive(Debug)]
pub struct Workspace {
    root: TempDir,
    dir: PathBuf,
    script_path: PathBuf,
}

impl Workspace {
    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn script_path(&self) -> &Path {
        &self.script_path
    }

    /// Removes the whole tree in one step.
    pub fn close(self) -> io::Result<()> {
        self.root.close()
    }
}

pub async fn stage_workspace(files: &[UploadedFile]) -> Result<Workspace, ExecError> {
    // Check every name before anything is written.
    let relative = files
        .iter()
        .map(|file| checked_relative_path(&file.name))
        .collect::<Result<Vec<_>, _>>()?;

    let root = tempfile::Builder::new().prefix("forge-").tempdir()?;
    let dir = root.path().join(WORKSPACE_DIR);
    tokio::fs::create_dir(&dir).await?;

    for (file, relative) in files.iter().zip(relative) {
        let target = dir.join(relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, &file.bytes).await?;
    }

    let script_path = root.path().join(SCRIPT_NAME);
    debug!(root = %root.path().display(), files = files.len(), "staged workspace");
    Ok(Workspace {
        root,
        dir,
        script_path,
    })
}

fn checked_relative_path(name: &str) -> Result<PathBuf, ExecError> {
    if name.is_empty() || name.contains('\0') || name.contains('\\') {
        return Err(ExecError::forbidden(format!("invalid file name `{name}`")));
    }
    let mut relative = PathBuf::new();
    for component in Path::new(name).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ExecError::forbidden(format!(
                    "file name `{name}` escapes the workspace"
                )));
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ExecError::forbidden(format!("invalid file name `{name}`")));
    }
    Ok(relative)
}
