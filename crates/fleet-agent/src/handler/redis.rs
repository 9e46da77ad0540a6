//! Redis servers: identified by the `redis-server` executable, probed with `PING`.

use std::time::Duration;

use async_trait::async_trait;
use fleet_core::{Instance, PrivatePayload, ProjectType, RedisPayload};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use super::{HostContext, ProbeCall, ProbeOutcome, ProjectHandler, UNKNOWN_VERSION};
use crate::error::AgentResult;
use crate::identify::Identifier;
use crate::proc::ProcInfo;

pub const DEFAULT_PORT: u16 = 6379;

pub struct RedisHandler {
    timeout: Duration,
}

impl Default for RedisHandler {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(3),
        }
    }
}

/// Port from `--port N` or a `host:port` process title.
pub fn port_from_cmdline(cmdline: &[String]) -> Option<u16> {
    let joined = cmdline.join(" ");
    let mut tokens = joined.split_whitespace();
    let mut from_title = None;
    while let Some(token) = tokens.next() {
        if token == "--port" {
            return tokens.next()?.parse().ok();
        }
        if from_title.is_none() {
            from_title = token.rsplit_once(':').and_then(|(_, p)| p.parse().ok());
        }
    }
    from_title
}

async fn ping(address: &str) -> Result<String, String> {
    let mut stream = tokio::net::TcpStream::connect(address)
        .await
        .map_err(|e| format!("connect {address}: {e}"))?;
    stream
        .write_all(b"PING\r\n")
        .await
        .map_err(|e| format!("write: {e}"))?;
    let mut line = String::new();
    BufReader::new(stream)
        .read_line(&mut line)
        .await
        .map_err(|e| format!("read: {e}"))?;
    Ok(line.trim_end().to_string())
}

#[async_trait]
impl ProjectHandler for RedisHandler {
    fn project_type(&self) -> ProjectType {
        ProjectType::redis()
    }

    fn identifier(&self) -> Identifier {
        Identifier::new(ProjectType::redis()).exe("redis-server")
    }

    fn parse(&self, proc: &ProcInfo, _host: &HostContext, ins: &mut Instance) -> AgentResult<()> {
        let port = port_from_cmdline(&proc.cmdline).unwrap_or(DEFAULT_PORT);
        if ins.deploy_name.is_empty() {
            ins.deploy_name = format!("redis-{port}");
        }
        if ins.version.is_empty() {
            ins.version = UNKNOWN_VERSION.to_string();
        }
        ins.set_payload(&PrivatePayload::Redis(RedisPayload {
            port,
            role: String::new(),
        }));
        Ok(())
    }

    async fn probe(&self, ins: &Instance) -> Vec<ProbeCall> {
        let port = match ins.payload() {
            Ok(PrivatePayload::Redis(p)) if p.port > 0 => p.port,
            _ => DEFAULT_PORT,
        };
        let address = format!("127.0.0.1:{port}");
        let outcome = match tokio::time::timeout(self.timeout, ping(&address)).await {
            Ok(Ok(reply)) if reply == "+PONG" => ProbeOutcome::Success,
            Ok(Ok(reply)) if reply.starts_with("-LOADING") || reply.starts_with("-BUSY") => {
                ProbeOutcome::Warning(reply)
            }
            Ok(Ok(reply)) => ProbeOutcome::Failure(format!("unexpected reply {reply:?}")),
            Ok(Err(reason)) => ProbeOutcome::Failure(reason),
            Err(_) => ProbeOutcome::Failure(format!("no reply within {:?}", self.timeout)),
        };
        vec![ProbeCall {
            name: "ping".into(),
            outcome,
            report: None,
        }]
    }
}

#[cfg(test)]
mod tests {
    use super::super::skeleton;
    use super::super::test_host::{host, proc};
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn port_sources() {
        let argv = |a: &[&str]| a.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(port_from_cmdline(&argv(&["redis-server *:6380"])), Some(6380));
        assert_eq!(port_from_cmdline(&argv(&["redis-server", "/etc/r.conf", "--port", "7000"])), Some(7000));
        assert_eq!(port_from_cmdline(&argv(&["redis-server"])), None);
    }

    #[test]
    fn parse_fills_name_and_port() {
        let p = proc("/usr/bin/redis-server", &["redis-server 127.0.0.1:7001"], &[]);
        let handler = RedisHandler::default();
        let mut ins = skeleton(&p, ProjectType::redis(), &host());
        handler.parse(&p, &host(), &mut ins).unwrap();
        assert_eq!(ins.deploy_name, "redis-7001");
        assert_eq!(ins.version, UNKNOWN_VERSION);
        assert!(matches!(ins.payload().unwrap(), PrivatePayload::Redis(RedisPayload { port: 7001, .. })));
    }

    #[tokio::test]
    async fn ping_probe() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 64];
            let _ = sock.read(&mut buf).await.unwrap();
            sock.write_all(b"+PONG\r\n").await.unwrap();
        });

        let mut ins = Instance::sample(&fleet_core::DeployKey::new("redis", "cache"), "i", "h1", "7.2");
        ins.set_payload(&PrivatePayload::Redis(RedisPayload { port, role: String::new() }));
        let calls = RedisHandler::default().probe(&ins).await;
        assert_eq!(calls[0].outcome, ProbeOutcome::Success);
    }
}
