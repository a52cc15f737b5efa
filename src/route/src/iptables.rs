use std::{fmt, net::IpAddr};

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::error::Error;

pub const BGP_PORT: u16 = 179;
pub const DEFAULT_LOCAL_BGP_PORT: u16 = 17900;

const TABLE: &str = "nat";
const CHAIN: &str = "PREROUTING";

/// DNAT rule forwarding BGP sessions from `router` to the speaker listening
/// on `local:port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardRule {
    pub router: IpAddr,
    pub local: IpAddr,
    pub port: u16,
}

impl ForwardRule {
    pub fn new(router: IpAddr, local: IpAddr, port: u16) -> ForwardRule {
        ForwardRule {
            router,
            local,
            port,
        }
    }

    pub fn rule_spec(&self) -> Vec<String> {
        let destination = match self.local {
            IpAddr::V4(a) => format!("{a}:{}", self.port),
            IpAddr::V6(a) => format!("[{a}]:{}", self.port),
        };
        vec![
            "-s".to_string(),
            self.router.to_string(),
            "-p".to_string(),
            "tcp".to_string(),
            "--dport".to_string(),
            BGP_PORT.to_string(),
            "-j".to_string(),
            "DNAT".to_string(),
            "--to-destination".to_string(),
            destination,
        ]
    }

    fn program(&self) -> &'static str {
        match self.router {
            IpAddr::V4(_) => "iptables",
            IpAddr::V6(_) => "ip6tables",
        }
    }

    fn command(&self, op: &str) -> Vec<String> {
        let mut args = vec![
            "-t".to_string(),
            TABLE.to_string(),
            op.to_string(),
            CHAIN.to_string(),
        ];
        args.extend(self.rule_spec());
        args
    }
}

impl fmt::Display for ForwardRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {TABLE} -A {CHAIN} {}", self.rule_spec().join(" "))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

/// Executes an external program. Abstracted so rule handling can be
/// exercised without touching the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct HostRunner;

#[async_trait]
impl CommandRunner for HostRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error> {
        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await?;
        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

/// Installs and removes BGP forwarding rules. The check and the
/// modification run under one lock so concurrent callers never insert a
/// rule twice.
#[derive(Debug, Default)]
pub struct PortForwarder<R: CommandRunner = HostRunner> {
    runner: R,
    lock: Mutex<()>,
}

impl<R: CommandRunner> PortForwarder<R> {
    pub fn new(runner: R) -> PortForwarder<R> {
        PortForwarder {
            runner,
            lock: Mutex::new(()),
        }
    }

    /// Returns true when the rule was installed by this call.
    #[tracing::instrument(skip_all, fields(rule = %rule))]
    pub async fn ensure_forward(&self, rule: &ForwardRule) -> Result<bool, Error> {
        let _guard = self.lock.lock().await;
        if self.exists(rule).await? {
            tracing::debug!("forwarding rule already exists");
            return Ok(false);
        }
        self.modify(rule, "-A").await?;
        tracing::info!("installed forwarding rule");
        Ok(true)
    }

    /// Returns true when a rule was removed by this call.
    #[tracing::instrument(skip_all, fields(rule = %rule))]
    pub async fn delete_forward(&self, rule: &ForwardRule) -> Result<bool, Error> {
        let _guard = self.lock.lock().await;
        if !self.exists(rule).await? {
            return Ok(false);
        }
        self.modify(rule, "-D").await?;
        tracing::info!("removed forwarding rule");
        Ok(true)
    }

    async fn exists(&self, rule: &ForwardRule) -> Result<bool, Error> {
        let out = self
            .runner
            .run(rule.program(), &rule.command("-C"))
            .await
            .map_err(|e| {
                tracing::error!(rule = %rule, error = ?e, "failed to check forwarding rule");
                e
            })?;
        Ok(out.success)
    }

    async fn modify(&self, rule: &ForwardRule, op: &str) -> Result<(), Error> {
        let out = self.runner.run(rule.program(), &rule.command(op)).await?;
        if !out.success {
            tracing::error!(rule = %rule, stderr = %out.stderr, "iptables rejected the rule");
            return Err(Error::Iptables {
                rule: rule.to_string(),
                reason: out.stderr,
            });
        }
        Ok(())
    }
}
