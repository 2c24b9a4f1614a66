//! The connection descriptor shared between a kernel and its clients.
//!
//! A kernel is reached through five sockets whose transport, address, and
//! ports are recorded in a JSON connection file, together with the HMAC key
//! used to sign every message. See the [connection files] section of the
//! Jupyter documentation for the format.
//!
//! [connection files]: https://jupyter-client.readthedocs.io/en/stable/kernels.html#connection-files

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::net::TcpListener;
use uuid::Uuid;

use crate::Error;

/// Transport used to reach the kernel's sockets.
#[derive(Serialize, Deserialize, Copy, Clone, Debug, PartialEq, Eq, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Transport {
    /// TCP sockets, the default and the only option on most platforms.
    Tcp,

    /// Unix domain sockets, usable when kernel and client share a host.
    Ipc,
}

fn default_signature_scheme() -> String {
    "hmac-sha256".into()
}

/// Everything a client needs to reach and authenticate with one kernel.
///
/// The descriptor is immutable once its ports are bound; a port recorded as
/// zero means "assign by the OS at bind time".
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Transport for all five channels.
    pub transport: Transport,

    /// IP address (or IPC path prefix) the kernel listens on.
    pub ip: String,

    /// Port of the shell (request/reply) channel.
    pub shell_port: u16,

    /// Port of the iopub (broadcast) channel.
    pub iopub_port: u16,

    /// Port of the stdin (kernel-initiated input) channel.
    pub stdin_port: u16,

    /// Port of the control (priority request/reply) channel.
    pub control_port: u16,

    /// Port of the heartbeat channel.
    pub hb_port: u16,

    /// Signature scheme for message authentication, normally "hmac-sha256".
    #[serde(default = "default_signature_scheme")]
    pub signature_scheme: String,

    /// Shared secret key. An empty key disables signing entirely.
    pub key: String,

    /// Name of the kernel spec this descriptor was created for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kernel_name: Option<String>,
}

fn form_url(transport: Transport, ip: &str, port: u16) -> String {
    format!("{transport}://{ip}:{port}")
}

impl ConnectionInfo {
    /// Endpoint URL of the shell channel.
    pub fn shell_url(&self) -> String {
        form_url(self.transport, &self.ip, self.shell_port)
    }

    /// Endpoint URL of the iopub channel.
    pub fn iopub_url(&self) -> String {
        form_url(self.transport, &self.ip, self.iopub_port)
    }

    /// Endpoint URL of the stdin channel.
    pub fn stdin_url(&self) -> String {
        form_url(self.transport, &self.ip, self.stdin_port)
    }

    /// Endpoint URL of the control channel.
    pub fn control_url(&self) -> String {
        form_url(self.transport, &self.ip, self.control_port)
    }

    /// Endpoint URL of the heartbeat channel.
    pub fn hb_url(&self) -> String {
        form_url(self.transport, &self.ip, self.hb_port)
    }

    /// Create a descriptor with freshly bound, OS-assigned ports and a
    /// random signing key, without ever writing it to disk.
    pub async fn ephemeral(ip: &str, kernel_name: Option<String>) -> Result<Self, Error> {
        let ports = reserve_ports(ip, 5).await?;
        Ok(Self {
            transport: Transport::Tcp,
            ip: ip.to_string(),
            shell_port: ports[0],
            iopub_port: ports[1],
            stdin_port: ports[2],
            control_port: ports[3],
            hb_port: ports[4],
            signature_scheme: default_signature_scheme(),
            key: mint_key(),
            kernel_name,
        })
    }

    /// Replace any zero port with a freshly bound, OS-assigned one.
    pub async fn assign_missing_ports(&mut self) -> Result<(), Error> {
        let missing = [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.control_port,
            self.hb_port,
        ]
        .iter()
        .filter(|port| **port == 0)
        .count();
        if missing == 0 {
            return Ok(());
        }

        let mut ports = reserve_ports(&self.ip, missing).await?.into_iter();
        for port in [
            &mut self.shell_port,
            &mut self.iopub_port,
            &mut self.stdin_port,
            &mut self.control_port,
            &mut self.hb_port,
        ] {
            if *port == 0 {
                *port = ports.next().unwrap_or_default();
            }
        }
        self.validate()
    }

    /// Check the descriptor's internal invariants.
    ///
    /// Non-zero ports must be pairwise distinct, and a non-empty signature
    /// scheme requires a non-empty key.
    pub fn validate(&self) -> Result<(), Error> {
        let mut seen = HashSet::new();
        for port in [
            self.shell_port,
            self.iopub_port,
            self.stdin_port,
            self.control_port,
            self.hb_port,
        ] {
            if port != 0 && !seen.insert(port) {
                return Err(Error::InvalidConnectionInfo(format!(
                    "port {port} is assigned to more than one channel"
                )));
            }
        }
        if !self.signature_scheme.is_empty() && self.key.is_empty() {
            return Err(Error::InvalidConnectionInfo(format!(
                "signature scheme {:?} requires a key",
                self.signature_scheme
            )));
        }
        Ok(())
    }

    /// Load and validate a connection file.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let contents = fs::read(path.as_ref()).await?;
        let info: Self = serde_json::from_slice(&contents)
            .map_err(|err| Error::InvalidConnectionInfo(err.to_string()))?;
        info.validate()?;
        Ok(info)
    }

    /// Persist the descriptor atomically with owner-only permissions.
    ///
    /// The contents are written to a sibling temporary file, restricted to
    /// mode 0600 on Unix, then renamed into place.
    pub async fn write(&self, path: impl AsRef<Path>) -> Result<(), Error> {
        let path = path.as_ref();
        let contents = serde_json::to_vec_pretty(self)
            .map_err(|err| Error::InvalidConnectionInfo(err.to_string()))?;

        let tmp = path.with_file_name(format!(
            ".{}.{}",
            path.file_name().unwrap_or_default().to_string_lossy(),
            Uuid::new_v4().simple()
        ));
        let write_restricted = async {
            fs::write(&tmp, &contents).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600)).await?;
            }
            fs::rename(&tmp, path).await
        };
        if let Err(source) = write_restricted.await {
            fs::remove_file(&tmp).await.ok();
            return Err(Error::PermissionDenied {
                path: path.to_path_buf(),
                source,
            });
        }
        Ok(())
    }
}

/// Mint a fresh random signing key, hex-encoded.
fn mint_key() -> String {
    use rand::Rng;
    let key_bytes = rand::thread_rng().gen::<[u8; 16]>();
    hex::encode(key_bytes)
}

/// Find a set of open ports by binding listeners on port 0.
///
/// The listeners are all held until the full set is gathered, so the ports
/// are distinct. Closing them before the kernel binds opens an inherent race
/// in the design of the protocol.
async fn reserve_ports(ip: &str, count: usize) -> Result<Vec<u16>, Error> {
    let mut listeners = Vec::with_capacity(count);
    let mut ports = Vec::with_capacity(count);
    for _ in 0..count {
        let listener = TcpListener::bind((ip, 0)).await?;
        ports.push(listener.local_addr()?.port());
        listeners.push(listener);
    }
    Ok(ports)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ConnectionInfo {
        ConnectionInfo {
            transport: Transport::Tcp,
            ip: "127.0.0.1".into(),
            shell_port: 53380,
            iopub_port: 53381,
            stdin_port: 53382,
            control_port: 53383,
            hb_port: 53384,
            signature_scheme: "hmac-sha256".into(),
            key: "e733b584-1d43845bc7d8d11a60df6363".into(),
            kernel_name: Some("python3".into()),
        }
    }

    #[test]
    fn urls_follow_the_transport() {
        let info = sample();
        assert_eq!(info.shell_url(), "tcp://127.0.0.1:53380");
        assert_eq!(info.hb_url(), "tcp://127.0.0.1:53384");

        let info = ConnectionInfo {
            transport: Transport::Ipc,
            ..info
        };
        assert_eq!(info.iopub_url(), "ipc://127.0.0.1:53381");
    }

    #[test]
    fn validation_rejects_port_collisions_and_missing_keys() {
        let mut info = sample();
        info.iopub_port = info.shell_port;
        assert!(matches!(
            info.validate(),
            Err(Error::InvalidConnectionInfo(_))
        ));

        let mut info = sample();
        info.key = String::new();
        assert!(matches!(
            info.validate(),
            Err(Error::InvalidConnectionInfo(_))
        ));

        // An empty scheme with an empty key is the explicit signing opt-out.
        info.signature_scheme = String::new();
        assert!(info.validate().is_ok());
    }

    #[test]
    fn zero_ports_do_not_collide() {
        let mut info = sample();
        info.shell_port = 0;
        info.iopub_port = 0;
        assert!(info.validate().is_ok());
    }

    #[tokio::test]
    async fn ephemeral_descriptors_have_distinct_ports_and_a_key() {
        let info = ConnectionInfo::ephemeral("127.0.0.1", None).await.unwrap();
        info.validate().unwrap();
        let ports = [
            info.shell_port,
            info.iopub_port,
            info.stdin_port,
            info.control_port,
            info.hb_port,
        ];
        assert!(ports.iter().all(|port| *port != 0));
        assert_eq!(ports.iter().collect::<HashSet<_>>().len(), 5);
        assert_eq!(info.key.len(), 32);
    }

    #[tokio::test]
    async fn write_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel-test.json");

        let info = sample();
        info.write(&path).await.unwrap();
        let loaded = ConnectionInfo::load(&path).await.unwrap();
        assert_eq!(loaded, info);

        // No temporary sibling file is left behind.
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, ["kernel-test.json"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn connection_files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernel-perms.json");
        sample().write(&path).await.unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[tokio::test]
    async fn assign_missing_ports_fills_only_zeroes() {
        let mut info = sample();
        info.stdin_port = 0;
        info.hb_port = 0;
        info.assign_missing_ports().await.unwrap();
        assert_eq!(info.shell_port, 53380);
        assert_ne!(info.stdin_port, 0);
        assert_ne!(info.hb_port, 0);
        info.validate().unwrap();
    }
}
