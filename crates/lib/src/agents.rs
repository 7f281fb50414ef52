//! Bot id to upstream agent resolution.
//!
//! The mapping is built once at startup and read without locking afterwards.

use crate::config::{self, AgentConfig, Config};
use std::collections::HashMap;

/// Maps an inbound `aibotid` to the upstream agent that answers for it.
pub trait AgentResolver: Send + Sync {
    /// None when the bot is not mapped and no fallback is configured.
    fn resolve(&self, aibotid: &str) -> Option<AgentConfig>;
}

/// Resolver over the `agents` section of the config.
#[derive(Debug, Clone, Default)]
pub struct StaticAgentResolver {
    bots: HashMap<String, AgentConfig>,
    fallback: Option<AgentConfig>,
}

impl StaticAgentResolver {
    pub fn new(bots: HashMap<String, AgentConfig>, fallback: Option<AgentConfig>) -> Self {
        Self { bots, fallback }
    }

    pub fn from_config(config: &Config) -> Self {
        let bots = config
            .agents
            .bots
            .iter()
            .map(|(id, agent)| (id.trim().to_string(), agent.clone()))
            .collect();
        Self::new(bots, config::resolve_fallback_agent(config))
    }

    pub fn len(&self) -> usize {
        self.bots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bots.is_empty() && self.fallback.is_none()
    }
}

impl AgentResolver for StaticAgentResolver {
    fn resolve(&self, aibotid: &str) -> Option<AgentConfig> {
        match self.bots.get(aibotid.trim()) {
            Some(agent) => Some(agent.clone()),
            None => {
                if self.fallback.is_some() {
                    log::debug!("agents: no mapping for aibotid={}, using fallback", aibotid);
                }
                self.fallback.clone()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str) -> AgentConfig {
        AgentConfig {
            agent_id: id.to_string(),
            base_url: format!("http://upstream/{}", id),
            api_key: "k".to_string(),
            name: None,
        }
    }

    #[test]
    fn resolves_mapped_bot() {
        let mut bots = HashMap::new();
        bots.insert("bot-a".to_string(), agent("1"));
        let r = StaticAgentResolver::new(bots, None);
        assert_eq!(r.resolve("bot-a").unwrap().agent_id, "1");
        assert_eq!(r.resolve(" bot-a ").unwrap().agent_id, "1");
        assert!(r.resolve("bot-b").is_none());
    }

    #[test]
    fn falls_back_for_unmapped_bot() {
        let r = StaticAgentResolver::new(HashMap::new(), Some(agent("fb")));
        assert_eq!(r.resolve("anything").unwrap().agent_id, "fb");
        assert!(!r.is_empty());
    }
}
