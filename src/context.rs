//! The explicit context threaded through managers and resolvers.
//!
//! There is no process-wide state in this crate: everything that would be
//! a global registry lives in a [`ClientContext`] that callers construct
//! and pass around. Tests build disposable contexts over temporary
//! directories.

use crate::kernelspec::KernelSpecResolver;
use crate::provisioning::ProvisionerRegistry;

/// Shared services for kernel managers: the provisioner registry and the
/// kernel spec resolver.
pub struct ClientContext {
    provisioners: ProvisionerRegistry,
    kernelspecs: KernelSpecResolver,
}

impl ClientContext {
    /// A context with the bundled provisioners and the standard kernel
    /// spec search path.
    pub fn new() -> Self {
        Self {
            provisioners: ProvisionerRegistry::with_defaults(),
            kernelspecs: KernelSpecResolver::from_env(),
        }
    }

    /// A context with a custom kernel spec resolver.
    pub fn with_resolver(kernelspecs: KernelSpecResolver) -> Self {
        Self {
            provisioners: ProvisionerRegistry::with_defaults(),
            kernelspecs,
        }
    }

    /// The provisioner registry, for registering alternative backends.
    pub fn provisioners(&self) -> &ProvisionerRegistry {
        &self.provisioners
    }

    /// The kernel spec resolver.
    pub fn kernelspecs(&self) -> &KernelSpecResolver {
        &self.kernelspecs
    }
}

impl Default for ClientContext {
    fn default() -> Self {
        Self::new()
    }
}
