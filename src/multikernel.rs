//! A named collection of kernel managers.
//!
//! The registry assigns each started kernel an opaque id and isolates the
//! managers from one another: lifecycle operations on different kernels
//! may run concurrently, while each manager still serialises its own.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::future::join_all;
use uuid::Uuid;

use crate::context::ClientContext;
use crate::manager::{KernelManager, ManagerConfig};
use crate::Error;

/// Starts and tracks kernels by opaque id.
pub struct MultiKernelManager {
    context: Arc<ClientContext>,
    kernels: DashMap<String, KernelManager>,
}

impl MultiKernelManager {
    /// An empty registry over the given context.
    pub fn new(context: Arc<ClientContext>) -> Self {
        Self {
            context,
            kernels: DashMap::new(),
        }
    }

    /// Resolve a kernel spec by name, launch it, and return the new
    /// kernel's id.
    pub async fn start_kernel(
        &self,
        spec_name: &str,
        config: ManagerConfig,
    ) -> Result<String, Error> {
        let (resource_dir, spec) = self.context.kernelspecs().get_kernel_spec(spec_name).await?;
        let manager = KernelManager::new(
            spec_name.to_lowercase(),
            spec,
            Some(resource_dir),
            config,
            &self.context,
        )?;
        manager.start_kernel().await?;

        let kernel_id = Uuid::new_v4().to_string();
        self.kernels.insert(kernel_id.clone(), manager);
        Ok(kernel_id)
    }

    /// Look up a running kernel's manager by id.
    pub fn get(&self, kernel_id: &str) -> Result<KernelManager, Error> {
        self.kernels
            .get(kernel_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NoSuchKernel(kernel_id.to_string()))
    }

    /// Ids of all kernels currently tracked by the registry.
    pub fn list_ids(&self) -> Vec<String> {
        self.kernels
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Shut a kernel down and remove it from the registry.
    pub async fn shutdown(&self, kernel_id: &str, now: bool) -> Result<(), Error> {
        let manager = self.get(kernel_id)?;
        let result = manager.shutdown_kernel(now).await;
        self.kernels.remove(kernel_id);
        result
    }

    /// Restart a kernel in place, keeping its id.
    pub async fn restart(&self, kernel_id: &str) -> Result<(), Error> {
        self.get(kernel_id)?.restart_kernel(false).await
    }

    /// Drop a kernel from the registry without shutting it down.
    pub fn remove(&self, kernel_id: &str) -> Result<KernelManager, Error> {
        self.kernels
            .remove(kernel_id)
            .map(|(_, manager)| manager)
            .ok_or_else(|| Error::NoSuchKernel(kernel_id.to_string()))
    }

    /// Shut down every kernel in parallel with a shared timeout.
    ///
    /// Failures do not stop the sweep; they are collected per kernel and
    /// returned together. An empty result means every kernel went down
    /// cleanly.
    pub async fn shutdown_all(&self, timeout: Duration) -> Vec<(String, Error)> {
        let ids = self.list_ids();
        let shutdowns = ids.iter().map(|kernel_id| {
            let kernel_id = kernel_id.clone();
            async move {
                let result = match self.get(&kernel_id) {
                    Ok(manager) => {
                        match tokio::time::timeout(timeout, manager.shutdown_kernel(false)).await
                        {
                            Ok(result) => result,
                            Err(_) => Err(Error::timeout(None, None)),
                        }
                    }
                    Err(err) => Err(err),
                };
                (kernel_id, result)
            }
        });

        let mut failures = Vec::new();
        for (kernel_id, result) in join_all(shutdowns).await {
            self.kernels.remove(&kernel_id);
            if let Err(err) = result {
                failures.push((kernel_id, err));
            }
        }
        failures
    }
}
