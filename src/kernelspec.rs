//! Discovery and installation of kernel specs on disk.
//!
//! A kernel spec is a directory containing a `kernel.json` file and
//! optional resource files, found under the `kernels/` subdirectory of the
//! Jupyter data directories. See the [kernel specs] documentation for the
//! format and search path.
//!
//! [kernel specs]: https://jupyter-client.readthedocs.io/en/latest/kernels.html#kernel-specs

use std::collections::BTreeMap;
use std::env;
use std::io;
use std::path::{Path, PathBuf};

use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tracing::warn;

use crate::Error;

/// Information parsed from a `kernel.json` file.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct KernelSpec {
    /// List of command-line arguments to start the kernel, with the
    /// substitutable tokens `{connection_file}` and `{resource_dir}`.
    pub argv: Vec<String>,

    /// The display name of the kernel.
    pub display_name: String,

    /// The language of the kernel.
    pub language: String,

    /// The interrupt mode of the kernel ("signal" by default).
    #[serde(default)]
    pub interrupt_mode: KernelInterruptMode,

    /// A dictionary of environment variables to set for the kernel.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Free-form metadata about the kernel.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The interrupt mode of the kernel.
#[derive(Serialize, Deserialize, Default, Copy, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KernelInterruptMode {
    /// Interrupts are communicated by sending a signal.
    #[default]
    Signal,

    /// Interrupts are communicated by messages on the control socket.
    Message,
}

/// The directory where connection files are placed.
///
/// Respects `JUPYTER_RUNTIME_DIR`, falling back to the platform's usual
/// location.
pub fn runtime_dir() -> PathBuf {
    if let Ok(dir) = env::var("JUPYTER_RUNTIME_DIR") {
        return PathBuf::from(dir);
    }
    data_dir().join("runtime")
}

/// The user's Jupyter data directory.
///
/// Respects `JUPYTER_DATA_DIR`, falling back to the platform's usual
/// location.
pub fn data_dir() -> PathBuf {
    if let Ok(dir) = env::var("JUPYTER_DATA_DIR") {
        return PathBuf::from(dir);
    }
    #[cfg(windows)]
    {
        PathBuf::from(env::var("APPDATA").unwrap_or_default()).join("jupyter")
    }
    #[cfg(target_os = "macos")]
    {
        PathBuf::from(env::var("HOME").unwrap_or_default()).join("Library/Jupyter")
    }
    #[cfg(all(unix, not(target_os = "macos")))]
    {
        match env::var("XDG_DATA_HOME") {
            Ok(xdg_data_home) => PathBuf::from(xdg_data_home).join("jupyter"),
            Err(_) => PathBuf::from(env::var("HOME").unwrap_or_default())
                .join(".local/share/jupyter"),
        }
    }
}

/// Lists the ordered search path to find kernel specs.
///
/// Later entries override earlier ones, so the user's data directory and
/// any `JUPYTER_PATH` entries take precedence over the system directories.
fn data_search_paths() -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    #[cfg(unix)]
    dirs.extend([
        PathBuf::from("/usr/share/jupyter"),
        PathBuf::from("/usr/local/share/jupyter"),
    ]);
    #[cfg(windows)]
    dirs.push(PathBuf::from(env::var("ProgramData").unwrap_or_default()).join("jupyter"));
    dirs.push(data_dir());
    if let Ok(jupyter_path) = env::var("JUPYTER_PATH") {
        let pathsep = if cfg!(windows) { ';' } else { ':' };
        dirs.extend(jupyter_path.split(pathsep).map(PathBuf::from));
    }
    dirs
}

/// Finds and loads kernel specs from the Jupyter data directories.
///
/// Names are normalised to lowercase; when the same name appears in more
/// than one directory, the later directory in the search path wins.
pub struct KernelSpecResolver {
    search_paths: Vec<PathBuf>,
    user_dir: PathBuf,
    system_dir: PathBuf,
}

impl KernelSpecResolver {
    /// A resolver over the standard search path and environment variables.
    pub fn from_env() -> Self {
        Self {
            search_paths: data_search_paths(),
            user_dir: data_dir(),
            system_dir: PathBuf::from("/usr/local/share/jupyter"),
        }
    }

    /// A resolver over an explicit list of data directories, lowest
    /// priority first.
    ///
    /// The last directory doubles as the user install target and the
    /// first as the system install target.
    pub fn with_paths(search_paths: Vec<PathBuf>) -> Self {
        let user_dir = search_paths.last().cloned().unwrap_or_else(data_dir);
        let system_dir = search_paths
            .first()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("/usr/local/share/jupyter"));
        Self {
            search_paths,
            user_dir,
            system_dir,
        }
    }

    /// Map from kernel name to its spec directory, for every spec found.
    pub async fn find_kernel_specs(&self) -> BTreeMap<String, PathBuf> {
        let found = join_all(
            self.search_paths
                .iter()
                .map(|path| list_specs_in(path.join("kernels"))),
        )
        .await;

        let mut specs = BTreeMap::new();
        for dir_specs in found {
            for (name, path) in dir_specs {
                specs.insert(name, path);
            }
        }
        specs
    }

    /// Load the spec for a kernel by name.
    pub async fn get_kernel_spec(&self, name: &str) -> Result<(PathBuf, KernelSpec), Error> {
        let name = name.to_lowercase();
        let specs = self.find_kernel_specs().await;
        let dir = specs
            .get(&name)
            .ok_or_else(|| Error::NoSuchKernel(name.clone()))?;
        let spec = read_spec_at(dir).await?;
        Ok((dir.clone(), spec))
    }

    /// Copy a kernel spec directory into the search path.
    ///
    /// With `user` set, installs into the user data directory, otherwise
    /// into the system directory. Fails if the name is already taken,
    /// unless `replace` is set.
    pub async fn install_kernel_spec(
        &self,
        source: &Path,
        name: &str,
        user: bool,
        replace: bool,
    ) -> Result<PathBuf, Error> {
        // Validate before copying anything.
        let spec = read_spec_at(source).await?;
        if !spec.argv.iter().any(|arg| arg.contains("{connection_file}")) {
            return Err(Error::InvalidKernelSpec(format!(
                "spec at {:?} has no {{connection_file}} in its argv",
                source
            )));
        }

        let root = if user { &self.user_dir } else { &self.system_dir };
        let destination = root.join("kernels").join(name.to_lowercase());
        if fs::try_exists(&destination).await.unwrap_or(false) {
            if !replace {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::AlreadyExists,
                    format!("kernel spec {name:?} is already installed"),
                )));
            }
            fs::remove_dir_all(&destination).await?;
        }
        copy_dir(source, &destination).await?;
        Ok(destination)
    }
}

/// List all the kernel specs under one `kernels/` directory.
async fn list_specs_in(path: PathBuf) -> Vec<(String, PathBuf)> {
    let mut specs = Vec::new();
    let Ok(mut items) = fs::read_dir(&path).await else {
        return specs;
    };
    while let Ok(Some(item)) = items.next_entry().await {
        let dir = item.path();
        if !dir.is_dir() || !dir.join("kernel.json").is_file() {
            continue;
        }
        match item.file_name().into_string() {
            Ok(name) => specs.push((name.to_lowercase(), dir)),
            Err(_) => warn!("skipping kernel spec with non-unicode name in {path:?}"),
        }
    }
    specs
}

async fn read_spec_at(dir: &Path) -> Result<KernelSpec, Error> {
    let contents = fs::read(dir.join("kernel.json")).await?;
    serde_json::from_slice(&contents)
        .map_err(|err| Error::InvalidKernelSpec(format!("in {dir:?}: {err}")))
}

/// Copy a directory tree, without following symlinks.
async fn copy_dir(source: &Path, destination: &Path) -> Result<(), Error> {
    let mut pending = vec![(source.to_path_buf(), destination.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        fs::create_dir_all(&dst).await?;
        let mut items = fs::read_dir(&src).await?;
        while let Some(item) = items.next_entry().await? {
            let file_type = item.file_type().await?;
            let target = dst.join(item.file_name());
            if file_type.is_dir() {
                pending.push((item.path(), target));
            } else if file_type.is_file() {
                fs::copy(item.path(), target).await?;
            }
        }
    }
    Ok(())
}
