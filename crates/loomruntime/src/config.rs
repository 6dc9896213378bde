use std::time::Duration;

/// What `WorkflowEngine::recover` does with nodes that were Running when the
/// process stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryPolicy {
    /// Run the node again as a new attempt, failing it once attempts are spent
    Requeue,
    /// Mark the node Failed and let its failure policy decide
    Fail,
}

impl std::str::FromStr for RecoveryPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "requeue" => Ok(RecoveryPolicy::Requeue),
            "fail" => Ok(RecoveryPolicy::Fail),
            other => Err(format!("unknown recovery policy: {}", other)),
        }
    }
}

/// Configuration for the engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Concurrent node attempts per execution, unless the workflow overrides it
    pub max_parallel_nodes: usize,
    pub event_buffer_size: usize,
    /// Attempts allowed for nodes without their own retry policy
    pub default_max_attempts: u32,
    /// Per-attempt limit for compute nodes without a workflow setting
    pub default_node_timeout: Option<Duration>,
    /// Applied to interactions that do not declare `timeout_secs`
    pub default_interaction_timeout: Option<Duration>,
    pub sweep_interval: Duration,
    pub recovery_policy: RecoveryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_parallel_nodes: 10,
            event_buffer_size: 1000,
            default_max_attempts: 3,
            default_node_timeout: None,
            default_interaction_timeout: None,
            sweep_interval: Duration::from_secs(30),
            recovery_policy: RecoveryPolicy::Requeue,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `LOOM_*` environment variables.
    ///
    /// Unparseable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_parse::<usize>("LOOM_MAX_PARALLEL_NODES") {
            config.max_parallel_nodes = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("LOOM_EVENT_BUFFER_SIZE") {
            config.event_buffer_size = v.max(1);
        }
        if let Some(v) = env_parse::<u32>("LOOM_DEFAULT_MAX_ATTEMPTS") {
            config.default_max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("LOOM_NODE_TIMEOUT_MS") {
            config.default_node_timeout = Some(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<u64>("LOOM_INTERACTION_TIMEOUT_SECS") {
            config.default_interaction_timeout = Some(Duration::from_secs(v));
        }
        if let Some(v) = env_parse::<u64>("LOOM_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = env_parse::<RecoveryPolicy>("LOOM_RECOVERY_POLICY") {
            config.recovery_policy = v;
        }

        config
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!("Ignoring invalid value for {}: {:?}", key, raw);
            None
        }
    }
}
