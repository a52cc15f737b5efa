use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use elbd_route::{
    error::Error,
    iptables::{CommandOutput, CommandRunner},
};

/// Command runner emulating the `nat` table of iptables in memory. Every
/// invocation is recorded as `<program> <op>`.
#[derive(Debug, Clone, Default)]
pub struct MockIptables {
    inner: Arc<Mutex<MockIptablesInner>>,
}

#[derive(Debug, Default)]
struct MockIptablesInner {
    // chain -> rule specs, in insertion order
    chains: Vec<(String, Vec<String>)>,
    calls: Vec<String>,
}

impl MockIptables {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule specs currently installed in `chain`.
    pub fn rules(&self, chain: &str) -> Vec<Vec<String>> {
        self.inner
            .lock()
            .unwrap()
            .chains
            .iter()
            .filter(|(c, _)| c == chain)
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.inner.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl CommandRunner for MockIptables {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput, Error> {
        // -t nat <op> <chain> <spec...>
        if args.len() < 4 || args[0] != "-t" || args[1] != "nat" {
            return Ok(CommandOutput {
                success: false,
                stderr: format!("unsupported invocation: {}", args.join(" ")),
            });
        }
        let op = args[2].as_str();
        let chain = args[3].clone();
        let spec = args[4..].to_vec();

        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(format!("{program} {op}"));
        let position = inner
            .chains
            .iter()
            .position(|(c, s)| *c == chain && *s == spec);
        let success = match (op, position) {
            ("-C", p) => p.is_some(),
            ("-A", _) => {
                inner.chains.push((chain, spec));
                true
            }
            ("-D", Some(i)) => {
                inner.chains.remove(i);
                true
            }
            _ => false,
        };
        Ok(CommandOutput {
            success,
            stderr: if success {
                String::new()
            } else {
                "iptables: Bad rule (does a matching rule exist in that chain?).".to_string()
            },
        })
    }
}
