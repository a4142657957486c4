//! Command execution inside vertica pods.
//!
//! [`KubePodRunner`] uses the pod `exec` subresource (kube `ws` feature) to
//! run a command in a container and collect its output. SQL goes through
//! `vsql -tAc` so results come back headerless and pipe-delimited.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::AttachParams;
use kube::{Api, Client};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Upper bound for a single exec call.
const EXEC_TIMEOUT: Duration = Duration::from_secs(600);

/// Namespaced name of a pod.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PodName {
    pub namespace: String,
    pub name: String,
}

impl PodName {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PodName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Output of a command that exited successfully.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }
}

/// Credentials passed to vsql.
#[derive(Clone, Debug, Default)]
pub struct VsqlCredentials {
    pub user: String,
    pub password: Option<String>,
}

/// Build the vsql command line for `sql`.
pub fn vsql_command(sql: &str, credentials: Option<&VsqlCredentials>) -> Vec<String> {
    let mut cmd = vec!["vsql".to_string()];
    if let Some(c) = credentials {
        cmd.push("-U".to_string());
        cmd.push(c.user.clone());
        if let Some(pw) = &c.password {
            cmd.push("-w".to_string());
            cmd.push(pw.clone());
        }
    }
    cmd.push("-tAc".to_string());
    cmd.push(sql.to_string());
    cmd
}

/// Runs commands inside a pod's container.
#[async_trait]
pub trait PodRunner: Send + Sync {
    /// Run `command` in `container`. A non-zero exit is an `Error::Exec`.
    async fn exec_in_pod(
        &self,
        pod: &PodName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput>;

    /// Credentials used by [`PodRunner::exec_vsql`].
    fn vsql_credentials(&self) -> Option<&VsqlCredentials> {
        None
    }

    /// Run a SQL statement through vsql.
    async fn exec_vsql(&self, pod: &PodName, container: &str, sql: &str) -> Result<ExecOutput> {
        let cmd = vsql_command(sql, self.vsql_credentials());
        self.exec_in_pod(pod, container, &cmd).await
    }
}

/// [`PodRunner`] backed by the Kubernetes exec API.
#[derive(Clone)]
pub struct KubePodRunner {
    client: Client,
    credentials: Option<VsqlCredentials>,
}

impl KubePodRunner {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: VsqlCredentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    async fn run(&self, pod: &PodName, container: &str, command: &[String]) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &pod.namespace);
        let params = AttachParams::default()
            .container(container)
            .stdin(false)
            .stdout(true)
            .stderr(true);
        let mut attached = pods.exec(&pod.name, command.to_vec(), &params).await?;

        let stdout = attached.stdout();
        let stderr = attached.stderr();
        let status = attached.take_status();
        let (stdout, stderr) =
            tokio::try_join!(read_all(stdout), read_all(stderr)).map_err(|e| Error::Exec {
                pod: pod.to_string(),
                message: e.to_string(),
            })?;
        let status = match status {
            Some(s) => s.await,
            None => None,
        };
        if let Err(e) = attached.join().await {
            debug!(pod = %pod, error = %e, "exec session did not close cleanly");
        }

        if status
            .as_ref()
            .and_then(|s| s.status.as_deref())
            .is_some_and(|s| s == "Failure")
        {
            let reason = status
                .and_then(|s| s.message)
                .unwrap_or_else(|| "command failed".to_string());
            return Err(Error::Exec {
                pod: pod.to_string(),
                message: format!("{reason}: {}", stderr.trim()),
            });
        }
        Ok(ExecOutput { stdout, stderr })
    }
}

async fn read_all<R: AsyncRead + Unpin>(reader: Option<R>) -> std::io::Result<String> {
    let mut out = String::new();
    if let Some(mut r) = reader {
        r.read_to_string(&mut out).await?;
    }
    Ok(out)
}

#[async_trait]
impl PodRunner for KubePodRunner {
    async fn exec_in_pod(
        &self,
        pod: &PodName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        debug!(pod = %pod, container, command = ?redact(command), "exec in pod");
        tokio::time::timeout(EXEC_TIMEOUT, self.run(pod, container, command))
            .await
            .map_err(|_| Error::Exec {
                pod: pod.to_string(),
                message: "timed out".to_string(),
            })?
    }

    fn vsql_credentials(&self) -> Option<&VsqlCredentials> {
        self.credentials.as_ref()
    }
}

/// Command line with any vsql password masked, for logging.
fn redact(command: &[String]) -> Vec<&str> {
    let mut out = Vec::with_capacity(command.len());
    let mut mask_next = false;
    for arg in command {
        if mask_next {
            out.push("*****");
            mask_next = false;
        } else {
            mask_next = arg == "-w" || arg == "--password";
            out.push(arg.as_str());
        }
    }
    out
}
