//! iptables-backed packet filter
//!
//! Renders engine rules into iptables arguments and runs them through
//! `tokio::process`. `set_rules` installs a whole chain in one
//! `iptables-restore --noflush` transaction, so a rejected rule leaves the
//! chain as it was.

use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use hostwall_engine::model::is_valid_interface_name;
use hostwall_engine::{BoxFuture, ChainPolicy, FilterError, FilterOp, PacketFilter, Rule};

/// iptables rejects comments longer than this many bytes
const MAX_COMMENT_BYTES: usize = 255;

pub struct IptablesFilter {
    binary: String,
    restore_binary: String,
    dry_run: bool,
}

impl IptablesFilter {
    pub fn new(binary: impl Into<String>, restore_binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
            restore_binary: restore_binary.into(),
            dry_run: false,
        }
    }

    /// Log every invocation instead of executing it
    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    async fn run(&self, op: FilterOp, chain: &str, args: Vec<String>) -> Result<(), FilterError> {
        if self.dry_run {
            info!("[dry-run] {} -w {}", self.binary, args.join(" "));
            return Ok(());
        }
        debug!("{} -w {}", self.binary, args.join(" "));

        let output = Command::new(&self.binary)
            .arg("-w")
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| FilterError::new(op, chain, format!("failed to run {}: {e}", self.binary)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FilterError::new(
                op,
                chain,
                format!("{} exited with {}: {}", self.binary, output.status, stderr.trim()),
            ));
        }
        Ok(())
    }

    /// Feed `payload` to `iptables-restore --noflush` as one transaction
    async fn restore(&self, chain: &str, payload: String) -> Result<(), FilterError> {
        let op = FilterOp::SetRules;
        if self.dry_run {
            info!("[dry-run] {} -w --noflush <<\n{payload}", self.restore_binary);
            return Ok(());
        }
        debug!("{} -w --noflush <<\n{payload}", self.restore_binary);

        let failed = |e: std::io::Error| {
            FilterError::new(op, chain, format!("failed to run {}: {e}", self.restore_binary))
        };
        let mut child = Command::new(&self.restore_binary)
            .args(["-w", "--noflush"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(failed)?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(payload.as_bytes()).await.map_err(failed)?;
        }
        let output = child.wait_with_output().await.map_err(failed)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FilterError::new(
                op,
                chain,
                format!(
                    "{} exited with {}: {}",
                    self.restore_binary,
                    output.status,
                    stderr.trim()
                ),
            ));
        }
        Ok(())
    }
}

fn policy_target(policy: ChainPolicy) -> &'static str {
    match policy {
        ChainPolicy::Allow => "ACCEPT",
        ChainPolicy::Drop => "DROP",
    }
}

/// Match and target arguments for `rule`, without the `-A CHAIN` prefix
pub fn rule_args(rule: &Rule) -> Vec<String> {
    let mut args = Vec::new();

    if let Some(protocol) = rule.protocol {
        args.extend(["-p".to_string(), protocol.as_str().to_string()]);
    }
    if let Some(source) = rule.source {
        args.extend(["-s".to_string(), source.to_string()]);
    }
    if let Some(destination) = rule.destination {
        args.extend(["-d".to_string(), destination.to_string()]);
    }
    if let Some(port) = rule.destination_port {
        // --dport needs a protocol match
        if rule.protocol.is_none() {
            args.extend(["-p".to_string(), "tcp".to_string()]);
        }
        args.extend(["--dport".to_string(), port.to_string()]);
    }
    if let Some(interface) = &rule.interface {
        args.extend(["-i".to_string(), interface.clone()]);
    }
    if let Some(interface) = &rule.destination_interface {
        args.extend(["-o".to_string(), interface.clone()]);
    }
    if !rule.state.is_empty() {
        let states: Vec<&str> = rule.state.iter().map(|s| s.as_str()).collect();
        args.extend([
            "-m".to_string(),
            "conntrack".to_string(),
            "--ctstate".to_string(),
            states.join(","),
        ]);
    }
    let comment = sanitize_comment(&rule.comment);
    if !comment.is_empty() {
        args.extend([
            "-m".to_string(),
            "comment".to_string(),
            "--comment".to_string(),
            comment,
        ]);
    }
    args.extend(["-j".to_string(), rule.policy.target().to_string()]);
    args
}

fn append_args(chain: &str, rule: &Rule) -> Vec<String> {
    let mut args = vec!["-A".to_string(), chain.to_string()];
    args.extend(rule_args(rule));
    args
}

/// Single-line comment without double quotes, at most 255 bytes
fn sanitize_comment(comment: &str) -> String {
    let mut cleaned = String::new();
    for c in comment.chars() {
        let c = match c {
            '"' => '\'',
            c if c.is_control() => ' ',
            c => c,
        };
        if cleaned.len() + c.len_utf8() > MAX_COMMENT_BYTES {
            break;
        }
        cleaned.push(c);
    }
    cleaned.trim().to_string()
}

/// Reject what the kernel would refuse, before anything is written
fn check_rule(rule: &Rule) -> Result<(), String> {
    for name in [&rule.interface, &rule.destination_interface].into_iter().flatten() {
        if !is_valid_interface_name(name) {
            return Err(format!("invalid interface name '{name}'"));
        }
    }
    let ipv6_source = rule.source.is_some_and(|net| !matches!(net, ipnet::IpNet::V4(_)));
    let ipv6_destination = rule.destination.is_some_and(|ip| !ip.is_ipv4());
    if ipv6_source || ipv6_destination {
        return Err("IPv6 address in an IPv4 rule".to_string());
    }
    Ok(())
}

/// `iptables-restore` input replacing the contents of `chain` with `rules`
pub fn restore_payload(chain: &str, rules: &[Rule]) -> Result<String, String> {
    let mut payload = format!("*filter\n-F {chain}\n");
    for (index, rule) in rules.iter().enumerate() {
        check_rule(rule).map_err(|e| format!("rule {index}: {e}"))?;
        let line: Vec<String> = append_args(chain, rule)
            .into_iter()
            .map(|arg| {
                if arg.is_empty() || arg.contains(char::is_whitespace) {
                    format!("\"{arg}\"")
                } else {
                    arg
                }
            })
            .collect();
        payload.push_str(&line.join(" "));
        payload.push('\n');
    }
    payload.push_str("COMMIT\n");
    Ok(payload)
}

impl PacketFilter for IptablesFilter {
    fn create_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(self.run(FilterOp::CreateChain, chain, vec!["-N".into(), chain.into()]))
    }

    fn flush_chain<'a>(&'a self, chain: &'a str) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(self.run(FilterOp::FlushChain, chain, vec!["-F".into(), chain.into()]))
    }

    fn set_policy<'a>(
        &'a self,
        chain: &'a str,
        policy: ChainPolicy,
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        let args = vec!["-P".into(), chain.into(), policy_target(policy).into()];
        Box::pin(self.run(FilterOp::SetPolicy, chain, args))
    }

    fn set_rules<'a>(
        &'a self,
        chain: &'a str,
        rules: &'a [Rule],
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            let payload = restore_payload(chain, rules)
                .map_err(|e| FilterError::new(FilterOp::SetRules, chain, e))?;
            self.restore(chain, payload).await
        })
    }

    fn append_rule<'a>(
        &'a self,
        chain: &'a str,
        rule: &'a Rule,
    ) -> BoxFuture<'a, Result<(), FilterError>> {
        Box::pin(async move {
            check_rule(rule).map_err(|e| FilterError::new(FilterOp::AppendRule, chain, e))?;
            self.run(FilterOp::AppendRule, chain, append_args(chain, rule))
                .await
        })
    }
}
