//! Pluggable backends that realise kernel start/stop on a platform.
//!
//! A [`KernelProvisioner`] owns the kernel's process handle (or whatever
//! stands in for one) and is the only component that touches it. The
//! bundled [`LocalProvisioner`] spawns a subprocess from a kernel spec's
//! `argv`; alternative backends are looked up by name in a
//! [`ProvisionerRegistry`].

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::kernelspec::KernelSpec;
use crate::Error;

/// Signals a provisioner can deliver to its kernel process.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum KernelSignal {
    /// Ask the kernel to interrupt the running computation (SIGINT).
    Interrupt,

    /// Ask the kernel process to exit (SIGTERM).
    Terminate,

    /// Force the kernel process to exit (SIGKILL).
    Kill,
}

/// Everything a provisioner needs to know to launch one kernel.
#[derive(Clone, Debug)]
pub struct LaunchContext {
    /// Name of the kernel spec being launched.
    pub kernel_name: String,

    /// The kernel spec with the argv template and environment.
    pub spec: KernelSpec,

    /// Path of the connection file, if one was written to disk.
    pub connection_file: Option<PathBuf>,

    /// Directory holding the kernel spec's resource files.
    pub resource_dir: Option<PathBuf>,
}

/// A concrete command produced by [`KernelProvisioner::pre_launch`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LaunchCommand {
    /// The substituted command line, never empty.
    pub argv: Vec<String>,

    /// Extra environment variables, merged over the parent environment.
    pub env: BTreeMap<String, String>,
}

/// Lifecycle backend that launches, signals, polls, and cleans up one
/// kernel process.
///
/// A kernel manager owns exactly one provisioner at a time and serialises
/// calls to it, so implementations do not need internal locking.
#[async_trait]
pub trait KernelProvisioner: Send + Sync {
    /// Whether this provisioner currently holds a process handle.
    fn has_process(&self) -> bool;

    /// Resolve the kernel spec into a concrete command and environment.
    async fn pre_launch(&mut self, context: &LaunchContext) -> Result<LaunchCommand, Error>;

    /// Start the kernel process from a command produced by `pre_launch`.
    async fn launch(
        &mut self,
        command: LaunchCommand,
        context: &LaunchContext,
    ) -> Result<(), Error>;

    /// Check the process without waiting: `None` while it is alive, or
    /// its exit code once it has stopped.
    async fn poll(&mut self) -> Result<Option<i32>, Error>;

    /// Wait for the process to exit, up to the timeout. A zero timeout
    /// polls without waiting.
    async fn wait(&mut self, timeout: Duration) -> Result<i32, Error>;

    /// Deliver a signal to the process.
    async fn send_signal(&mut self, signal: KernelSignal) -> Result<(), Error>;

    /// Ask the process to exit.
    async fn terminate(&mut self) -> Result<(), Error> {
        self.send_signal(KernelSignal::Terminate).await
    }

    /// Force the process to exit immediately.
    async fn kill(&mut self) -> Result<(), Error>;

    /// Release resources after the process is gone. With `restart` set,
    /// keep whatever the relaunch will reuse (such as the connection
    /// file).
    async fn cleanup(&mut self, restart: bool) -> Result<(), Error>;

    /// The connection descriptor, for provisioners that materialise it
    /// out-of-band.
    fn connection_info(&self) -> Option<&ConnectionInfo>;

    /// Record the connection descriptor the manager settled on.
    fn load_connection_info(&mut self, info: &ConnectionInfo);
}

/// The bundled provisioner: spawns the kernel as a local subprocess.
pub struct LocalProvisioner {
    child: Option<Child>,
    connection: Option<ConnectionInfo>,
    connection_file: Option<PathBuf>,
    keep_stdin_open: bool,
}

impl LocalProvisioner {
    /// A provisioner with stdin kept open, the usual configuration.
    pub fn new() -> Self {
        Self {
            child: None,
            connection: None,
            connection_file: None,
            keep_stdin_open: true,
        }
    }

    /// Close the kernel's stdin instead of keeping a pipe open.
    pub fn with_closed_stdin(mut self) -> Self {
        self.keep_stdin_open = false;
        self
    }
}

impl Default for LocalProvisioner {
    fn default() -> Self {
        Self::new()
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return -signal;
        }
    }
    status.code().unwrap_or(-1)
}

#[async_trait]
impl KernelProvisioner for LocalProvisioner {
    fn has_process(&self) -> bool {
        self.child.is_some()
    }

    async fn pre_launch(&mut self, context: &LaunchContext) -> Result<LaunchCommand, Error> {
        let spec = &context.spec;
        if spec.argv.is_empty() {
            return Err(Error::InvalidKernelSpec(format!(
                "kernel {:?} has an empty argv",
                context.kernel_name
            )));
        }

        let connection_file = match &context.connection_file {
            Some(path) => path.to_string_lossy().into_owned(),
            None if spec.argv.iter().any(|arg| arg.contains("{connection_file}")) => {
                return Err(Error::InvalidKernelSpec(format!(
                    "kernel {:?} needs a connection file, but none was provided",
                    context.kernel_name
                )));
            }
            None => String::new(),
        };
        let resource_dir = context
            .resource_dir
            .as_ref()
            .map(|dir| dir.to_string_lossy().into_owned())
            .unwrap_or_default();

        let argv = spec
            .argv
            .iter()
            .map(|arg| {
                arg.replace("{connection_file}", &connection_file)
                    .replace("{resource_dir}", &resource_dir)
            })
            .collect();

        Ok(LaunchCommand {
            argv,
            env: spec.env.clone(),
        })
    }

    async fn launch(
        &mut self,
        command: LaunchCommand,
        context: &LaunchContext,
    ) -> Result<(), Error> {
        if command.argv.is_empty() {
            return Err(Error::InvalidKernelSpec(format!(
                "kernel {:?} has an empty command line",
                context.kernel_name
            )));
        }
        debug!("launching kernel: {:?}", command.argv);
        let child = Command::new(&command.argv[0])
            .args(&command.argv[1..])
            .envs(&command.env)
            .stdin(if self.keep_stdin_open {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(Error::Subprocess)?;
        self.child = Some(child);
        self.connection_file = context.connection_file.clone();
        Ok(())
    }

    async fn poll(&mut self) -> Result<Option<i32>, Error> {
        match &mut self.child {
            Some(child) => Ok(child
                .try_wait()
                .map_err(Error::Subprocess)?
                .map(exit_code)),
            None => Ok(Some(0)),
        }
    }

    async fn wait(&mut self, timeout: Duration) -> Result<i32, Error> {
        let Some(child) = &mut self.child else {
            return Ok(0);
        };
        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(status) => Ok(exit_code(status.map_err(Error::Subprocess)?)),
            Err(_) => Err(Error::timeout(None, None)),
        }
    }

    async fn send_signal(&mut self, signal: KernelSignal) -> Result<(), Error> {
        let Some(child) = &mut self.child else {
            return Ok(());
        };
        let Some(pid) = child.id() else {
            // Already reaped.
            return Ok(());
        };

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            let signal = match signal {
                KernelSignal::Interrupt => Signal::SIGINT,
                KernelSignal::Terminate => Signal::SIGTERM,
                KernelSignal::Kill => Signal::SIGKILL,
            };
            kill(Pid::from_raw(pid as i32), signal)
                .map_err(|err| Error::Subprocess(io::Error::from_raw_os_error(err as i32)))
        }

        #[cfg(not(unix))]
        {
            let _ = pid;
            match signal {
                // No true signals; the closest approximations.
                KernelSignal::Terminate | KernelSignal::Kill => {
                    child.start_kill().map_err(Error::Subprocess)
                }
                KernelSignal::Interrupt => Err(Error::Subprocess(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "interrupt signals are not supported on this platform",
                ))),
            }
        }
    }

    async fn kill(&mut self) -> Result<(), Error> {
        if let Some(child) = &mut self.child {
            child.kill().await.map_err(Error::Subprocess)?;
        }
        Ok(())
    }

    async fn cleanup(&mut self, restart: bool) -> Result<(), Error> {
        self.child = None;
        if !restart {
            if let Some(path) = self.connection_file.take() {
                tokio::fs::remove_file(&path).await.ok();
            }
            self.connection = None;
        }
        Ok(())
    }

    fn connection_info(&self) -> Option<&ConnectionInfo> {
        self.connection.as_ref()
    }

    fn load_connection_info(&mut self, info: &ConnectionInfo) {
        self.connection = Some(info.clone());
    }
}

/// Factory producing fresh provisioner instances.
pub type ProvisionerFactory = dyn Fn() -> Box<dyn KernelProvisioner> + Send + Sync;

/// Named collection of provisioner factories.
///
/// Registration is explicit, once per provisioner at startup; there is no
/// scanning of runtime metadata. The bundled `local` provisioner is
/// registered unconditionally by [`ProvisionerRegistry::with_defaults`].
pub struct ProvisionerRegistry {
    factories: DashMap<String, Arc<ProvisionerFactory>>,
}

impl ProvisionerRegistry {
    /// An empty registry with no provisioners.
    pub fn new() -> Self {
        Self {
            factories: DashMap::new(),
        }
    }

    /// A registry with the bundled provisioners registered.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register("local", || Box::new(LocalProvisioner::new()));
        registry
    }

    /// Register a provisioner factory under a name. Registering the same
    /// name again replaces the factory, so initialisation is idempotent.
    pub fn register(
        &self,
        name: impl Into<String>,
        factory: impl Fn() -> Box<dyn KernelProvisioner> + Send + Sync + 'static,
    ) {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    /// Instantiate the provisioner registered under a name.
    pub fn create(&self, name: &str) -> Result<Box<dyn KernelProvisioner>, Error> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory()),
            None => Err(Error::UnknownProvisioner(name.to_string())),
        }
    }

    /// Names of all registered provisioners.
    pub fn names(&self) -> Vec<String> {
        self.factories
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }
}

impl Default for ProvisionerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernelspec::KernelInterruptMode;

    fn spec(argv: &[&str]) -> KernelSpec {
        KernelSpec {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            display_name: "Test".into(),
            language: "python".into(),
            interrupt_mode: KernelInterruptMode::Signal,
            env: BTreeMap::new(),
            metadata: serde_json::Map::new(),
        }
    }

    fn context(argv: &[&str]) -> LaunchContext {
        LaunchContext {
            kernel_name: "test".into(),
            spec: spec(argv),
            connection_file: Some(PathBuf::from("/tmp/kernel-abc.json")),
            resource_dir: Some(PathBuf::from("/usr/share/jupyter/kernels/test")),
        }
    }

    #[tokio::test]
    async fn pre_launch_substitutes_template_tokens() {
        let mut provisioner = LocalProvisioner::new();
        let ctx = context(&["python", "-m", "kernel", "-f", "{connection_file}"]);
        let command = provisioner.pre_launch(&ctx).await.unwrap();
        assert_eq!(
            command.argv,
            ["python", "-m", "kernel", "-f", "/tmp/kernel-abc.json"]
        );

        let ctx = context(&["run", "{resource_dir}/main.py"]);
        let command = provisioner.pre_launch(&ctx).await.unwrap();
        assert_eq!(
            command.argv,
            ["run", "/usr/share/jupyter/kernels/test/main.py"]
        );
    }

    #[tokio::test]
    async fn pre_launch_rejects_unusable_specs() {
        let mut provisioner = LocalProvisioner::new();

        let ctx = context(&[]);
        assert!(matches!(
            provisioner.pre_launch(&ctx).await,
            Err(Error::InvalidKernelSpec(_))
        ));

        let mut ctx = context(&["python", "-f", "{connection_file}"]);
        ctx.connection_file = None;
        assert!(matches!(
            provisioner.pre_launch(&ctx).await,
            Err(Error::InvalidKernelSpec(_))
        ));
    }

    #[test]
    fn registry_creates_known_provisioners_only() {
        let registry = ProvisionerRegistry::with_defaults();
        assert!(registry.create("local").is_ok());
        assert!(matches!(
            registry.create("kubernetes"),
            Err(Error::UnknownProvisioner(name)) if name == "kubernetes"
        ));
    }

    #[test]
    fn registering_twice_replaces_the_factory() {
        let registry = ProvisionerRegistry::new();
        registry.register("local", || Box::new(LocalProvisioner::new()));
        registry.register("local", || {
            Box::new(LocalProvisioner::new().with_closed_stdin())
        });
        assert_eq!(registry.names(), ["local"]);
        registry.create("local").unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_provisioner_signals_a_real_process() {
        let dir = tempfile::tempdir().unwrap();
        let mut provisioner = LocalProvisioner::new();
        let mut context = context(&["sleep", "30"]);
        context.connection_file = Some(dir.path().join("kernel-test.json"));
        let command = provisioner.pre_launch(&context).await.unwrap();
        provisioner.launch(command, &context).await.unwrap();

        assert!(provisioner.has_process());
        assert_eq!(provisioner.poll().await.unwrap(), None);

        provisioner.terminate().await.unwrap();
        let code = provisioner.wait(Duration::from_secs(5)).await.unwrap();
        assert_ne!(code, 0);
        provisioner.cleanup(false).await.unwrap();
        assert!(!provisioner.has_process());
    }
}
