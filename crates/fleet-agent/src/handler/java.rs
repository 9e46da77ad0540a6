//! Java services.
//!
//! Identified by the `java` executable. Deployments are named through
//! `-Djava.apps.prog={group}-{app}`, which maps to the deploy name
//! `{group}:{app}`. Probing replays the deployment's probe interfaces
//! against the instance's first listening port.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use fleet_core::{Instance, JavaPayload, PrivatePayload, ProbeReport, ProjectType};
use fleet_registry::{InterfaceSource, ProbeInterface};
use http_body_util::{BodyExt, Full};
use tracing::debug;

use super::{
    ENV_NODE_NAME, HostContext, ProbeCall, ProbeOutcome, ProjectHandler, UNKNOWN_VERSION,
};
use crate::error::{AgentError, AgentResult};
use crate::identify::Identifier;
use crate::proc::ProcInfo;

pub const PROG_ARG: &str = "-Djava.apps.prog=";
pub const VERSION_ARG: &str = "-Djava.apps.version=";
pub const NODE_ARG: &str = "-Djava.apps.node=";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

pub struct JavaHandler {
    interfaces: Arc<dyn InterfaceSource>,
    timeout: Duration,
}

impl JavaHandler {
    pub fn new(interfaces: Arc<dyn InterfaceSource>) -> Self {
        Self {
            interfaces,
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// `foo-bar` → `foo:bar`
pub fn deploy_name_from_prog(prog: &str) -> Option<String> {
    let (group, app) = prog.split_once('-')?;
    if group.is_empty() || app.is_empty() {
        return None;
    }
    Some(format!("{group}:{app}"))
}

fn main_class(cmdline: &[String]) -> String {
    let mut args = cmdline.iter().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-cp" | "-classpath" | "--class-path" => {
                args.next();
            }
            "-jar" => return args.next().cloned().unwrap_or_default(),
            a if a.starts_with('-') => {}
            a => return a.to_string(),
        }
    }
    String::new()
}

/// Judge one probe response.
pub fn judge(iface: &ProbeInterface, status: http::StatusCode, body: &str) -> ProbeCall {
    let name = iface.name.clone();
    if !status.is_success() {
        return ProbeCall {
            name,
            outcome: ProbeOutcome::Failure(format!("http status {status}")),
            report: None,
        };
    }
    if let Err(reason) = iface.check_response(body) {
        return ProbeCall {
            name,
            outcome: ProbeOutcome::Failure(reason),
            report: None,
        };
    }
    match serde_json::from_str::<ProbeReport>(body) {
        Ok(report) => {
            let outcome = if report.fail > 0 || report.status > 300 {
                ProbeOutcome::Failure(format!(
                    "status={} success={} fail={}",
                    report.status, report.success, report.fail
                ))
            } else {
                ProbeOutcome::Success
            };
            ProbeCall {
                name,
                outcome,
                report: Some(report),
            }
        }
        Err(_) => ProbeCall {
            name,
            outcome: ProbeOutcome::Warning("response is not a probe report".into()),
            report: None,
        },
    }
}

/// POST the interface's sample call to `address` and return status and body.
pub async fn call_interface(
    address: &str,
    iface: &ProbeInterface,
    timeout: Duration,
) -> Result<(http::StatusCode, String), String> {
    let uri = format!("http://{address}{}", iface.path);
    let result = tokio::time::timeout(timeout, async {
        let stream = tokio::net::TcpStream::connect(address)
            .await
            .map_err(|e| format!("connect {address}: {e}"))?;
        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
            .await
            .map_err(|e| format!("handshake: {e}"))?;
        tokio::spawn(async move {
            let _ = conn.await;
        });

        let mut builder = http::Request::builder()
            .method("POST")
            .uri(&uri)
            .header("host", address)
            .header("content-type", "application/json")
            .header("user-agent", "fleet-agent/0.1");
        for (k, v) in &iface.headers {
            builder = builder.header(k.as_str(), v.as_str());
        }
        let req = builder
            .body(Full::new(Bytes::from(iface.data.clone())))
            .map_err(|e| format!("bad request: {e}"))?;

        let resp = sender
            .send_request(req)
            .await
            .map_err(|e| format!("request: {e}"))?;
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .map_err(|e| format!("read body: {e}"))?
            .to_bytes();
        Ok((status, String::from_utf8_lossy(&body).into_owned()))
    })
    .await;
    match result {
        Ok(inner) => inner,
        Err(_) => Err(format!("{uri} timed out after {timeout:?}")),
    }
}

#[async_trait]
impl ProjectHandler for JavaHandler {
    fn project_type(&self) -> ProjectType {
        ProjectType::java()
    }

    fn identifier(&self) -> Identifier {
        Identifier::new(ProjectType::java()).exe("java")
    }

    fn parse(&self, proc: &ProcInfo, host: &HostContext, ins: &mut Instance) -> AgentResult<()> {
        if ins.deploy_name.is_empty() {
            ins.deploy_name = proc
                .arg_value(PROG_ARG)
                .and_then(deploy_name_from_prog)
                .ok_or_else(|| AgentError::Process {
                    pid: proc.pid,
                    reason: format!("no {PROG_ARG} argument"),
                })?;
        }
        if ins.version.is_empty() {
            ins.version = proc
                .arg_value(VERSION_ARG)
                .filter(|v| !v.is_empty())
                .unwrap_or(UNKNOWN_VERSION)
                .to_string();
        }
        let node_name = proc
            .env
            .get(ENV_NODE_NAME)
            .map(String::as_str)
            .or_else(|| proc.arg_value(NODE_ARG))
            .filter(|v| !v.is_empty())
            .unwrap_or(host.host_name.as_str())
            .to_string();
        ins.set_payload(&PrivatePayload::Java(JavaPayload {
            node_name,
            main_class: main_class(&proc.cmdline),
            ..Default::default()
        }));
        Ok(())
    }

    async fn probe(&self, ins: &Instance) -> Vec<ProbeCall> {
        let Some(listen) = ins.listening.first() else {
            return Vec::new();
        };
        let ip = if listen.ip == "0.0.0.0" || listen.ip == "::" {
            "127.0.0.1"
        } else {
            listen.ip.as_str()
        };
        let address = if ip.contains(':') {
            format!("[{ip}]:{}", listen.port)
        } else {
            format!("{ip}:{}", listen.port)
        };

        let mut calls = Vec::new();
        for iface in self.interfaces.interfaces(&ins.deploy_name) {
            let call = match call_interface(&address, &iface, self.timeout).await {
                Ok((status, body)) => judge(&iface, status, &body),
                Err(reason) => ProbeCall {
                    name: iface.name.clone(),
                    outcome: ProbeOutcome::Failure(reason),
                    report: None,
                },
            };
            debug!(instance = %ins.id, interface = %call.name, outcome = ?call.outcome, "java probe");
            calls.push(call);
        }
        calls
    }
}
