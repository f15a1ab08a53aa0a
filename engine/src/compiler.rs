//! Merges provider outputs into one ordered rule set per chain

use std::collections::HashSet;

use crate::model::{Chain, Role, Rule, RuleSet};
use crate::sources::ProviderOutputs;

/// Compiled rule sets for both managed chains
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledRules {
    pub input: RuleSet,
    pub forward: RuleSet,
}

impl CompiledRules {
    pub fn get(&self, chain: Chain) -> &RuleSet {
        match chain {
            Chain::Input => &self.input,
            Chain::Forward => &self.forward,
        }
    }

    pub fn into_sets(self) -> [RuleSet; 2] {
        [self.input, self.forward]
    }
}

/// Deterministic merge: priority order, role gate, first occurrence wins,
/// forward chain closed by a single default deny.
pub fn compile(role: Role, outputs: &ProviderOutputs) -> CompiledRules {
    let mut input = RuleSet::new(Chain::Input);
    let mut forward = RuleSet::new(Chain::Forward);
    let mut seen: HashSet<Rule> = HashSet::new();

    for candidate in outputs.iter() {
        if candidate.role_restriction.is_some_and(|wanted| wanted != role) {
            continue;
        }
        let rule = candidate.clone().unrestricted();
        if rule.is_default_deny() || !seen.insert(rule.clone()) {
            continue;
        }
        match rule.chain {
            Chain::Input => input.push(rule),
            Chain::Forward => forward.push(rule),
        }
    }

    forward.push(Rule::default_deny());

    CompiledRules { input, forward }
}
