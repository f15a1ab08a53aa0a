//! Chain reconciler: bootstraps the managed chains and commits compiled rule
//! sets into them.
//!
//! The reconciler is owned by the single apply worker, so every kernel write
//! (bootstrap included) is serialized through it.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::collaborators::{ChainPolicy, PacketFilter, SupplementaryRules};
use crate::error::{FilterError, ReconcileError};
use crate::model::{Chain, Role, Rule};
use crate::queue::ApplyJob;
use crate::settings::RetryPolicy;
use crate::status::StatusBoard;

/// Result of applying one job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied { rules: usize },
    /// Identical to the last committed rule set; nothing was written
    Unchanged,
}

/// Bootstrap rule set per chain for a given local role
pub type InitialRules = Arc<dyn Fn(Role) -> BTreeMap<Chain, Vec<Rule>> + Send + Sync>;

pub struct ChainReconciler {
    filter: Arc<dyn PacketFilter>,
    retry: RetryPolicy,
    role: Role,
    initial: InitialRules,
    supplement: Option<Arc<dyn SupplementaryRules>>,
    last_committed: HashMap<Chain, Vec<Rule>>,
    protected: BTreeSet<Chain>,
    status: StatusBoard,
}

impl ChainReconciler {
    /// `role` is the local role at startup; each applied job updates it
    pub fn new(
        filter: Arc<dyn PacketFilter>,
        retry: RetryPolicy,
        role: Role,
        initial: impl Fn(Role) -> BTreeMap<Chain, Vec<Rule>> + Send + Sync + 'static,
        status: StatusBoard,
    ) -> Self {
        Self {
            filter,
            retry,
            role,
            initial: Arc::new(initial),
            supplement: None,
            last_committed: HashMap::new(),
            protected: BTreeSet::new(),
            status,
        }
    }

    /// Rules fetched at apply time and merged into every job
    pub fn with_supplement(mut self, supplement: Arc<dyn SupplementaryRules>) -> Self {
        self.supplement = Some(supplement);
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_protected(&self, chain: Chain) -> bool {
        self.protected.contains(&chain)
    }

    pub fn last_committed(&self, chain: Chain) -> Option<&[Rule]> {
        self.last_committed.get(&chain).map(Vec::as_slice)
    }

    /// Bootstrap every managed chain, one after the other
    pub async fn bootstrap_all(&mut self) {
        for chain in Chain::ALL {
            match self.bootstrap_with_retry(chain).await {
                Ok(()) => info!(chain = %chain, "Chain bootstrapped, kernel chain fails closed"),
                Err(e) => error!(chain = %chain, "Chain left unprotected: {e}"),
            }
        }
    }

    /// Run the bootstrap protocol until it succeeds or the budget runs out
    pub async fn bootstrap_with_retry(&mut self, chain: Chain) -> Result<(), ReconcileError> {
        let attempts = self.retry.attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.bootstrap_once(chain).await {
                Ok(()) => {
                    self.mark_protected(chain).await;
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!(
                        chain = %chain,
                        "Bootstrap attempt {attempt}/{attempts} failed: {e}; retrying in {:?}",
                        self.retry.spacing
                    );
                    attempt += 1;
                    tokio::time::sleep(self.retry.spacing).await;
                }
                Err(source) => {
                    self.mark_unprotected(chain, &source).await;
                    return Err(ReconcileError::Bootstrap {
                        chain,
                        attempts,
                        source,
                    });
                }
            }
        }
    }

    /// One pass over the six bootstrap steps; any failure aborts the pass
    async fn bootstrap_once(&mut self, chain: Chain) -> Result<(), FilterError> {
        let kernel = chain.kernel_chain();
        let custom = chain.custom_chain();

        self.filter.set_policy(kernel, ChainPolicy::Allow).await?;
        self.filter.flush_chain(kernel).await?;
        if self.filter.flush_chain(custom).await.is_err() {
            self.filter.create_chain(custom).await?;
        }

        let initial = (self.initial)(self.role).remove(&chain).unwrap_or_default();
        self.filter.set_rules(custom, &initial).await?;
        self.filter
            .append_rule(kernel, &Rule::delegation(chain))
            .await?;

        // Only reached once the delegation is in place
        self.filter.set_policy(kernel, ChainPolicy::Drop).await?;

        self.last_committed.remove(&chain);
        Ok(())
    }

    async fn mark_protected(&mut self, chain: Chain) {
        self.protected.insert(chain);
        self.status.mark_protected(chain, true).await;
    }

    async fn mark_unprotected(&mut self, chain: Chain, error: &FilterError) {
        self.protected.remove(&chain);
        self.status.mark_protected(chain, false).await;
        self.status.record_failure(chain, error).await;
    }

    /// Commit one job. An unprotected chain gets a single fresh bootstrap
    /// attempt first and the job is dropped if that fails too.
    pub async fn apply(&mut self, job: &ApplyJob) -> Result<ApplyOutcome, ReconcileError> {
        let chain = job.chain;
        if job.role != self.role {
            info!(chain = %chain, "Local role changed from {} to {}", self.role, job.role);
            self.role = job.role;
        }

        if !self.is_protected(chain) {
            match self.bootstrap_once(chain).await {
                Ok(()) => {
                    info!(chain = %chain, "Unprotected chain re-bootstrapped");
                    self.mark_protected(chain).await;
                }
                Err(source) => {
                    self.mark_unprotected(chain, &source).await;
                    return Err(ReconcileError::Bootstrap {
                        chain,
                        attempts: 1,
                        source,
                    });
                }
            }
        }

        let extra = match &self.supplement {
            Some(supplement) => match supplement.rules_for(chain).await {
                Ok(rules) => rules,
                Err(source) => {
                    self.status.record_failure(chain, &source).await;
                    return Err(ReconcileError::Supplement { chain, source });
                }
            },
            None => Vec::new(),
        };

        let rules = merge(chain, job.rules.rules(), extra);
        if self.last_committed.get(&chain) == Some(&rules) {
            return Ok(ApplyOutcome::Unchanged);
        }

        match self.write(chain, &rules).await {
            Ok(()) => {
                let count = rules.len();
                self.last_committed.insert(chain, rules);
                self.status.record_applied(chain).await;
                Ok(ApplyOutcome::Applied { rules: count })
            }
            Err(source) => {
                self.last_committed.remove(&chain);
                self.status.record_failure(chain, &source).await;
                Err(ReconcileError::Apply { chain, source })
            }
        }
    }

    async fn write(&self, chain: Chain, rules: &[Rule]) -> Result<(), FilterError> {
        let custom = chain.custom_chain();
        match chain {
            Chain::Input => self.filter.set_rules(custom, rules).await,
            Chain::Forward => {
                let body: Vec<Rule> = rules
                    .iter()
                    .filter(|rule| !rule.is_default_deny())
                    .cloned()
                    .collect();
                self.filter.set_rules(custom, &body).await?;
                self.filter.append_rule(custom, &Rule::default_deny()).await
            }
        }
    }
}

/// Compiled rules followed by any new apply-time rules, deny kept last
fn merge(chain: Chain, compiled: &[Rule], extra: Vec<Rule>) -> Vec<Rule> {
    let mut seen: HashSet<Rule> = HashSet::new();
    let mut rules: Vec<Rule> = Vec::with_capacity(compiled.len() + extra.len() + 1);

    let candidates = compiled
        .iter()
        .cloned()
        .chain(extra.into_iter().map(Rule::unrestricted));
    for rule in candidates {
        if rule.chain != chain || rule.is_default_deny() {
            continue;
        }
        if seen.insert(rule.clone()) {
            rules.push(rule);
        }
    }

    if chain == Chain::Forward {
        rules.push(Rule::default_deny());
    }
    rules
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PortSpec, Protocol};

    #[test]
    fn test_merge_keeps_deny_last() {
        let compiled = vec![
            Rule::accept(Chain::Forward).port(PortSpec::Single(80)),
            Rule::default_deny(),
        ];
        let extra = vec![
            Rule::accept(Chain::Forward).port(PortSpec::Single(8000)),
            Rule::accept(Chain::Forward).port(PortSpec::Single(80)).comment("dup"),
        ];
        let merged = merge(Chain::Forward, &compiled, extra);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged[1].destination_port, Some(PortSpec::Single(8000)));
        assert!(merged[2].is_default_deny());
    }

    #[test]
    fn test_merge_input_has_no_deny() {
        let compiled = vec![Rule::accept(Chain::Input)
            .protocol(Protocol::Tcp)
            .port(PortSpec::Single(22))];
        let merged = merge(Chain::Input, &compiled, Vec::new());
        assert_eq!(merged, compiled);
    }
}
