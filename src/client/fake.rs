//! Scriptable stand-ins for the pod exec and admin command collaborators.
//!
//! Used by the test suites to drive actors without a cluster. Setup methods are
//! synchronous so fixtures can be built outside an async context.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::dispatcher::{
    AddNodeOptions, AddSubclusterOptions, CreateDbOptions, Dispatcher, InstallPackagesOptions,
    InstallPackagesStatus, PromoteSandboxOptions, RebalanceShardsOptions, ReIpOptions,
    RemoveNodeOptions, RemoveSubclusterOptions, ReplicateDbOptions, RestartNodeOptions,
    ReviveDbOptions, RotateHttpsCertsOptions, RotateNmaCertsOptions, SandboxSubclusterOptions,
    SetConfigParameterOptions, StartDbOptions, StopDbOptions, UnsandboxSubclusterOptions,
};
use super::pod_runner::{ExecOutput, PodName, PodRunner};
use crate::controller::error::{Error, Result};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// FakePodRunner
// ============================================================================

/// One recorded exec call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedExec {
    pub pod: PodName,
    pub container: String,
    pub command: Vec<String>,
}

impl RecordedExec {
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

#[derive(Clone, Debug)]
struct Scripted {
    pod: Option<PodName>,
    needle: String,
    result: std::result::Result<ExecOutput, String>,
}

#[derive(Default)]
struct RunnerState {
    scripted: Vec<Scripted>,
    calls: Vec<RecordedExec>,
}

/// [`PodRunner`] answering from scripted responses.
///
/// A response matches when its pod (if any) is the target and its needle is a
/// substring of the space-joined command line. The most recent registration
/// wins. Unmatched commands succeed with empty output.
#[derive(Default)]
pub struct FakePodRunner {
    state: Mutex<RunnerState>,
}

impl FakePodRunner {
    pub fn new() -> Self {
        Self::default()
    }

    fn script(&self, pod: Option<&PodName>, needle: &str, result: std::result::Result<ExecOutput, String>) {
        lock(&self.state).scripted.push(Scripted {
            pod: pod.cloned(),
            needle: needle.to_string(),
            result,
        });
    }

    /// Answer commands containing `needle` on `pod` with `stdout`.
    pub fn respond(&self, pod: &PodName, needle: &str, stdout: &str) {
        self.script(Some(pod), needle, Ok(ExecOutput::stdout(stdout)));
    }

    /// Answer commands containing `needle` on any pod with `stdout`.
    pub fn respond_any(&self, needle: &str, stdout: &str) {
        self.script(None, needle, Ok(ExecOutput::stdout(stdout)));
    }

    /// Fail commands containing `needle` on `pod`.
    pub fn fail(&self, pod: &PodName, needle: &str, message: &str) {
        self.script(Some(pod), needle, Err(message.to_string()));
    }

    /// Fail commands containing `needle` on any pod.
    pub fn fail_any(&self, needle: &str, message: &str) {
        self.script(None, needle, Err(message.to_string()));
    }

    pub fn calls(&self) -> Vec<RecordedExec> {
        lock(&self.state).calls.clone()
    }

    /// Calls whose command line contains `needle`.
    pub fn calls_matching(&self, needle: &str) -> Vec<RecordedExec> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.command_line().contains(needle))
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }
}

#[async_trait]
impl PodRunner for FakePodRunner {
    async fn exec_in_pod(
        &self,
        pod: &PodName,
        container: &str,
        command: &[String],
    ) -> Result<ExecOutput> {
        let line = command.join(" ");
        let mut state = lock(&self.state);
        state.calls.push(RecordedExec {
            pod: pod.clone(),
            container: container.to_string(),
            command: command.to_vec(),
        });
        let found = state
            .scripted
            .iter()
            .rev()
            .find(|s| s.pod.as_ref().is_none_or(|p| p == pod) && line.contains(&s.needle))
            .map(|s| s.result.clone());
        match found {
            Some(Ok(out)) => Ok(out),
            Some(Err(message)) => Err(Error::Exec {
                pod: pod.to_string(),
                message,
            }),
            None => Ok(ExecOutput::default()),
        }
    }
}

// ============================================================================
// FakeDispatcher
// ============================================================================

/// One recorded admin command.
#[derive(Clone, Debug)]
pub enum DispatchCall {
    CreateDb(CreateDbOptions),
    ReviveDb(ReviveDbOptions),
    StartDb(StartDbOptions),
    StopDb(StopDbOptions),
    RestartNode(RestartNodeOptions),
    ReIp(ReIpOptions),
    AddNode(AddNodeOptions),
    RemoveNode(RemoveNodeOptions),
    AddSubcluster(AddSubclusterOptions),
    RemoveSubcluster(RemoveSubclusterOptions),
    InstallPackages(InstallPackagesOptions),
    RebalanceShards(RebalanceShardsOptions),
    SetConfigParameter(SetConfigParameterOptions),
    GetConfigParameter { initiator: PodName, name: String },
    PollHttps(PodName),
    SandboxSubcluster(SandboxSubclusterOptions),
    UnsandboxSubcluster(UnsandboxSubclusterOptions),
    ReplicateDb(ReplicateDbOptions),
    PromoteSandbox(PromoteSandboxOptions),
    RotateHttpsCerts(RotateHttpsCertsOptions),
    RotateNmaCerts(RotateNmaCertsOptions),
}

impl DispatchCall {
    pub fn op(&self) -> &'static str {
        match self {
            DispatchCall::CreateDb(_) => "create_db",
            DispatchCall::ReviveDb(_) => "revive_db",
            DispatchCall::StartDb(_) => "start_db",
            DispatchCall::StopDb(_) => "stop_db",
            DispatchCall::RestartNode(_) => "restart_node",
            DispatchCall::ReIp(_) => "re_ip",
            DispatchCall::AddNode(_) => "add_node",
            DispatchCall::RemoveNode(_) => "remove_node",
            DispatchCall::AddSubcluster(_) => "add_subcluster",
            DispatchCall::RemoveSubcluster(_) => "remove_subcluster",
            DispatchCall::InstallPackages(_) => "install_packages",
            DispatchCall::RebalanceShards(_) => "rebalance_shards",
            DispatchCall::SetConfigParameter(_) => "set_config_parameter",
            DispatchCall::GetConfigParameter { .. } => "get_config_parameter",
            DispatchCall::PollHttps(_) => "poll_https",
            DispatchCall::SandboxSubcluster(_) => "sandbox_subcluster",
            DispatchCall::UnsandboxSubcluster(_) => "unsandbox_subcluster",
            DispatchCall::ReplicateDb(_) => "replicate_db",
            DispatchCall::PromoteSandbox(_) => "promote_sandbox",
            DispatchCall::RotateHttpsCerts(_) => "rotate_https_certs",
            DispatchCall::RotateNmaCerts(_) => "rotate_nma_certs",
        }
    }
}

#[derive(Default)]
struct DispatcherState {
    calls: Vec<DispatchCall>,
    failures: BTreeMap<String, String>,
    config: BTreeMap<String, String>,
    install_status: InstallPackagesStatus,
}

/// [`Dispatcher`] that records every call and succeeds unless told otherwise.
#[derive(Default)]
pub struct FakeDispatcher {
    state: Mutex<DispatcherState>,
}

impl FakeDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call of `op` fail with `message`.
    pub fn fail_op(&self, op: &str, message: &str) {
        lock(&self.state)
            .failures
            .insert(op.to_string(), message.to_string());
    }

    pub fn clear_failures(&self) {
        lock(&self.state).failures.clear();
    }

    /// Value returned by `get_config_parameter`.
    pub fn set_config(&self, name: &str, value: &str) {
        lock(&self.state)
            .config
            .insert(name.to_string(), value.to_string());
    }

    pub fn set_install_status(&self, status: InstallPackagesStatus) {
        lock(&self.state).install_status = status;
    }

    pub fn calls(&self) -> Vec<DispatchCall> {
        lock(&self.state).calls.clone()
    }

    /// Calls of one operation, by name.
    pub fn calls_named(&self, op: &str) -> Vec<DispatchCall> {
        lock(&self.state)
            .calls
            .iter()
            .filter(|c| c.op() == op)
            .cloned()
            .collect()
    }

    pub fn clear_calls(&self) {
        lock(&self.state).calls.clear();
    }

    fn record(&self, call: DispatchCall) -> Result<()> {
        let op = call.op();
        let mut state = lock(&self.state);
        state.calls.push(call);
        match state.failures.get(op) {
            Some(message) => Err(Error::Dispatch {
                op: op.to_string(),
                message: message.clone(),
            }),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn create_db(&self, opts: &CreateDbOptions) -> Result<()> {
        self.record(DispatchCall::CreateDb(opts.clone()))
    }

    async fn revive_db(&self, opts: &ReviveDbOptions) -> Result<()> {
        self.record(DispatchCall::ReviveDb(opts.clone()))
    }

    async fn start_db(&self, opts: &StartDbOptions) -> Result<()> {
        self.record(DispatchCall::StartDb(opts.clone()))
    }

    async fn stop_db(&self, opts: &StopDbOptions) -> Result<()> {
        self.record(DispatchCall::StopDb(opts.clone()))
    }

    async fn restart_node(&self, opts: &RestartNodeOptions) -> Result<()> {
        self.record(DispatchCall::RestartNode(opts.clone()))
    }

    async fn re_ip(&self, opts: &ReIpOptions) -> Result<()> {
        self.record(DispatchCall::ReIp(opts.clone()))
    }

    async fn add_node(&self, opts: &AddNodeOptions) -> Result<()> {
        self.record(DispatchCall::AddNode(opts.clone()))
    }

    async fn remove_node(&self, opts: &RemoveNodeOptions) -> Result<()> {
        self.record(DispatchCall::RemoveNode(opts.clone()))
    }

    async fn add_subcluster(&self, opts: &AddSubclusterOptions) -> Result<()> {
        self.record(DispatchCall::AddSubcluster(opts.clone()))
    }

    async fn remove_subcluster(&self, opts: &RemoveSubclusterOptions) -> Result<()> {
        self.record(DispatchCall::RemoveSubcluster(opts.clone()))
    }

    async fn install_packages(
        &self,
        opts: &InstallPackagesOptions,
    ) -> Result<InstallPackagesStatus> {
        self.record(DispatchCall::InstallPackages(opts.clone()))?;
        Ok(lock(&self.state).install_status.clone())
    }

    async fn rebalance_shards(&self, opts: &RebalanceShardsOptions) -> Result<()> {
        self.record(DispatchCall::RebalanceShards(opts.clone()))
    }

    async fn set_config_parameter(&self, opts: &SetConfigParameterOptions) -> Result<()> {
        self.record(DispatchCall::SetConfigParameter(opts.clone()))?;
        lock(&self.state)
            .config
            .insert(opts.name.clone(), opts.value.clone());
        Ok(())
    }

    async fn get_config_parameter(&self, initiator: &PodName, name: &str) -> Result<String> {
        self.record(DispatchCall::GetConfigParameter {
            initiator: initiator.clone(),
            name: name.to_string(),
        })?;
        Ok(lock(&self.state)
            .config
            .get(name)
            .cloned()
            .unwrap_or_default())
    }

    async fn poll_https(&self, initiator: &PodName) -> Result<()> {
        self.record(DispatchCall::PollHttps(initiator.clone()))
    }

    async fn sandbox_subcluster(&self, opts: &SandboxSubclusterOptions) -> Result<()> {
        self.record(DispatchCall::SandboxSubcluster(opts.clone()))
    }

    async fn unsandbox_subcluster(&self, opts: &UnsandboxSubclusterOptions) -> Result<()> {
        self.record(DispatchCall::UnsandboxSubcluster(opts.clone()))
    }

    async fn replicate_db(&self, opts: &ReplicateDbOptions) -> Result<()> {
        self.record(DispatchCall::ReplicateDb(opts.clone()))
    }

    async fn promote_sandbox(&self, opts: &PromoteSandboxOptions) -> Result<()> {
        self.record(DispatchCall::PromoteSandbox(opts.clone()))
    }

    async fn rotate_https_certs(&self, opts: &RotateHttpsCertsOptions) -> Result<()> {
        self.record(DispatchCall::RotateHttpsCerts(opts.clone()))
    }

    async fn rotate_nma_certs(&self, opts: &RotateNmaCertsOptions) -> Result<()> {
        self.record(DispatchCall::RotateNmaCerts(opts.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::indexing_slicing)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_latest_response_wins() {
        let runner = FakePodRunner::new();
        let pod = PodName::new("ns", "p-0");
        runner.respond(&pod, "select", "1");
        runner.respond(&pod, "select", "2");
        let out = runner
            .exec_vsql(&pod, "server", "select 1")
            .await
            .unwrap();
        assert_eq!(out.stdout, "2");
        assert_eq!(runner.calls().len(), 1);
    }

    #[tokio::test]
    async fn test_pod_specific_and_failures() {
        let runner = FakePodRunner::new();
        let a = PodName::new("ns", "a");
        let b = PodName::new("ns", "b");
        runner.fail(&a, "ls", "boom");
        assert!(runner.exec_in_pod(&a, "server", &["ls".into()]).await.is_err());
        let out = runner.exec_in_pod(&b, "server", &["ls".into()]).await.unwrap();
        assert_eq!(out, ExecOutput::default());
    }

    #[tokio::test]
    async fn test_dispatcher_failure() {
        let d = FakeDispatcher::new();
        d.fail_op("stop_db", "nope");
        let opts = StopDbOptions {
            initiator: PodName::new("ns", "p"),
            scope: Default::default(),
        };
        assert!(d.stop_db(&opts).await.is_err());
        assert_eq!(d.calls_named("stop_db").len(), 1);
    }
}
