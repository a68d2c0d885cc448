//! Adaptive model router — per-step provider and model selection.
//!
//! Each step is classified by keyword signals, scored for complexity, and
//! mapped to a `(provider, model, temperature, max_tokens)` route according
//! to the configured [`RoutingStrategy`]. Local routes escalate to the best
//! ready hosted provider when a step is too complex or too tool-heavy, and
//! every route is availability-checked with automatic fallback.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::provider::{CLOUD_PRIORITY, ProviderDirectory};

/// Classifiable step kinds for routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    /// Decomposition and strategy work.
    Planning,
    /// Code generation and modification.
    Coding,
    /// Information gathering.
    Research,
    /// Meta-reasoning over prior output.
    Reflection,
    /// Security-sensitive review.
    Security,
    /// Data processing and analysis.
    DataAnalysis,
    /// Prose production.
    Writing,
    /// Everything else.
    General,
}

impl StepKind {
    const ALL: [Self; 8] = [
        Self::Planning,
        Self::Coding,
        Self::Research,
        Self::Reflection,
        Self::Security,
        Self::DataAnalysis,
        Self::Writing,
        Self::General,
    ];

    /// Returns the string representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Coding => "coding",
            Self::Research => "research",
            Self::Reflection => "reflection",
            Self::Security => "security",
            Self::DataAnalysis => "data_analysis",
            Self::Writing => "writing",
            Self::General => "general",
        }
    }

    /// Complexity baseline contributed by the kind itself.
    const fn baseline(self) -> f64 {
        match self {
            Self::Security => 3.0,
            Self::Coding | Self::DataAnalysis => 2.0,
            Self::Research => 1.5,
            Self::Planning => 1.0,
            Self::Reflection | Self::Writing | Self::General => 0.5,
        }
    }

    fn signals(self) -> &'static [&'static str] {
        match self {
            Self::Coding => &[
                "code", "implement", "write function", "refactor", "debug", "fix bug", "compile",
                "build", "test", "unittest", "script", "module", "class",
            ],
            Self::Research => &[
                "research", "search", "find", "look up", "investigate", "explore", "web",
                "read the",
            ],
            Self::Security => &[
                "security", "audit", "vulnerability", "permission", "access control", "encrypt",
                "credential", "secret", "auth", "cve",
            ],
            Self::DataAnalysis => &[
                "data", "analyse", "analyze", "statistics", "aggregate", "query", "database",
                "sql", "csv", "json", "parse", "transform",
            ],
            Self::Writing => &[
                "write", "document", "draft", "compose", "email", "readme", "report", "summary",
                "blog", "post",
            ],
            Self::Reflection => &["reflect", "review", "evaluate", "assess", "critique"],
            Self::Planning => &["plan", "decompose", "break down", "outline", "strategy"],
            Self::General => &[],
        }
    }
}

impl std::fmt::Display for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the router prioritizes providers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingStrategy {
    /// Prefer local backends, fall back to cloud.
    #[default]
    LocalFirst,
    /// Prefer cloud backends, fall back to local.
    CloudFirst,
    /// Simple steps local, complex steps cloud.
    CostOptimized,
    /// Always the strongest available model.
    QualityFirst,
}

/// A routing decision: where a step's LLM call goes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRoute {
    /// Step kind this route serves.
    pub step_kind: StepKind,
    /// Provider name.
    pub provider: String,
    /// Model id.
    pub model: String,
    /// Sampling temperature.
    pub temperature: f32,
    /// Generation cap.
    pub max_tokens: u32,
    /// Why this route was chosen.
    pub reason: String,
}

impl ModelRoute {
    fn new(
        step_kind: StepKind,
        provider: impl Into<String>,
        model: impl Into<String>,
        temperature: f32,
        max_tokens: u32,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            step_kind,
            provider: provider.into(),
            model: model.into(),
            temperature,
            max_tokens,
            reason: reason.into(),
        }
    }

    /// Whether the route points at a local backend.
    #[must_use]
    pub fn is_local(&self) -> bool {
        matches!(self.provider.as_str(), "ollama" | "local")
    }
}

/// Explicit router configuration. No environment or other ambient state is
/// consulted; callers construct and pass this in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Default strategy.
    pub strategy: RoutingStrategy,
    /// Local model for light steps.
    pub local_model: String,
    /// Local model for heavy steps.
    pub local_large_model: String,
    /// Hosted model for fast/cheap steps.
    pub cloud_fast_model: String,
    /// Hosted model for heavy steps.
    pub cloud_power_model: String,
    /// Complexity at or above which local routes escalate to cloud.
    pub escalation_threshold: f64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            strategy: RoutingStrategy::LocalFirst,
            local_model: "qwen3:8b".to_owned(),
            local_large_model: "qwen3:32b".to_owned(),
            cloud_fast_model: "gemini-2.5-flash".to_owned(),
            cloud_power_model: "gemini-2.5-pro".to_owned(),
            escalation_threshold: 5.0,
        }
    }
}

/// Per-category usage statistics for observability.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouterStats {
    /// Route selections per step kind.
    pub routes: HashMap<String, u64>,
    /// Fallbacks taken, by destination provider.
    pub fallbacks: HashMap<String, u64>,
    /// Escalations per step kind.
    pub escalations: HashMap<String, u64>,
}

// ── Step classification ──────────────────────────────────────────────

/// Classify a step by keyword matching its description and tool hints.
///
/// The highest-scoring kind wins; no signal (or a tie at zero) falls back
/// to [`StepKind::General`].
#[must_use]
pub fn classify_step(description: &str, expected_tools: &[String]) -> StepKind {
    let mut text = description.to_lowercase();
    if !expected_tools.is_empty() {
        text.push(' ');
        text.push_str(&expected_tools.join(" ").to_lowercase());
    }

    let mut best = StepKind::General;
    let mut best_score = 0usize;
    for kind in StepKind::ALL {
        let score = kind
            .signals()
            .iter()
            .filter(|signal| text.contains(*signal))
            .count();
        if score > best_score {
            best = kind;
            best_score = score;
        }
    }
    best
}

// ── Complexity estimation ────────────────────────────────────────────

const COMPLEXITY_HIGH: [&str; 31] = [
    "architect",
    "design system",
    "refactor entire",
    "migration",
    "security audit",
    "vulnerability",
    "cve",
    "penetration",
    "multi-step",
    "multi-file",
    "cross-module",
    "distributed",
    "concurrent",
    "race condition",
    "deadlock",
    "transaction",
    "optimize",
    "performance bottleneck",
    "memory leak",
    "machine learning",
    "cryptograph",
    "encryption",
    "certificate",
    "kubernetes",
    "terraform",
    "infrastructure",
    "complex",
    "advanced",
    "sophisticated",
    "comprehensive",
    "exactly-once",
];

const COMPLEXITY_LOW: [&str; 12] = [
    "simple",
    "quick",
    "basic",
    "trivial",
    "minor",
    "rename",
    "typo",
    "update comment",
    "list",
    "show",
    "display",
    "print",
];

/// Estimate step complexity on a 0-10 scale.
///
/// Combines keyword signals, description length, the kind's baseline, the
/// expected-tool count, and conversation depth.
#[must_use]
pub fn estimate_complexity(
    description: &str,
    kind: StepKind,
    expected_tools: &[String],
    context_messages: usize,
) -> f64 {
    let text = description.to_lowercase();
    let mut score = 0.0;

    for signal in COMPLEXITY_HIGH {
        if text.contains(signal) {
            score += 1.5;
        }
    }
    for signal in COMPLEXITY_LOW {
        if text.contains(signal) {
            score -= 0.5;
        }
    }

    score += match description.len() {
        501.. => 2.0,
        201..=500 => 1.0,
        101..=200 => 0.5,
        _ => 0.0,
    };

    score += kind.baseline();

    score += match expected_tools.len() {
        5.. => 2.0,
        3..=4 => 1.0,
        1..=2 => 0.5,
        0 => 0.0,
    };

    score += match context_messages {
        21.. => 1.0,
        11..=20 => 0.5,
        _ => 0.0,
    };

    score.clamp(0.0, 10.0)
}

// ── Router ───────────────────────────────────────────────────────────

/// Routes agent steps to the optimal provider+model combination.
pub struct ModelRouter {
    config: RouterConfig,
    routes: HashMap<StepKind, ModelRoute>,
    directory: Arc<dyn ProviderDirectory>,
    route_counts: HashMap<StepKind, u64>,
    fallback_counts: HashMap<String, u64>,
    escalation_counts: HashMap<StepKind, u64>,
}

impl ModelRouter {
    /// Create a router with the given config and availability directory.
    #[must_use]
    pub fn new(config: RouterConfig, directory: Arc<dyn ProviderDirectory>) -> Self {
        let routes = build_routes(&config);
        info!(strategy = ?config.strategy, "model router initialized");
        Self {
            config,
            routes,
            directory,
            route_counts: HashMap::new(),
            fallback_counts: HashMap::new(),
            escalation_counts: HashMap::new(),
        }
    }

    /// Select the best route for a step.
    ///
    /// Three passes: classify and look up the base route, escalate local
    /// routes on complexity or tool pressure, then availability-check with
    /// fallback. When no fallback is ready the original route is returned
    /// so the call fails at dispatch time with a clear error.
    pub fn select(
        &mut self,
        description: &str,
        expected_tools: &[String],
        context_messages: usize,
    ) -> ModelRoute {
        let kind = classify_step(description, expected_tools);
        let mut route = self
            .routes
            .get(&kind)
            .or_else(|| self.routes.get(&StepKind::General))
            .cloned()
            .unwrap_or_else(|| self.default_general_route());

        let complexity = estimate_complexity(description, kind, expected_tools, context_messages);

        if matches!(
            self.config.strategy,
            RoutingStrategy::LocalFirst | RoutingStrategy::CostOptimized
        ) {
            route = self.maybe_escalate(route, complexity);
        }

        // Heavy tool-calling steps are unreliable on small local models;
        // force the escalation path regardless of complexity score.
        if expected_tools.len() > 2 && route.is_local() {
            info!(
                tools = expected_tools.len(),
                provider = %route.provider,
                "tool-heavy step on local route, escalating"
            );
            route = self.maybe_escalate(route, self.config.escalation_threshold + 1.0);
        }

        if !self.directory.is_ready(&route.provider) {
            route = self.find_fallback(route);
        }

        *self.route_counts.entry(kind).or_default() += 1;

        debug!(
            kind = %kind,
            provider = %route.provider,
            model = %route.model,
            complexity,
            "routed step"
        );
        route
    }

    /// Override the route for one step kind (e.g. a workspace setting).
    pub fn override_route(&mut self, kind: StepKind, route: ModelRoute) {
        info!(kind = %kind, provider = %route.provider, model = %route.model, "route override");
        self.routes.insert(kind, route);
    }

    /// Change the strategy and rebuild the route table.
    pub fn set_strategy(&mut self, strategy: RoutingStrategy) {
        self.config.strategy = strategy;
        self.routes = build_routes(&self.config);
        info!(strategy = ?strategy, "routing strategy changed");
    }

    /// Routing, fallback, and escalation statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            routes: self
                .route_counts
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), *v))
                .collect(),
            fallbacks: self.fallback_counts.clone(),
            escalations: self
                .escalation_counts
                .iter()
                .map(|(k, v)| (k.as_str().to_owned(), *v))
                .collect(),
        }
    }

    fn default_general_route(&self) -> ModelRoute {
        ModelRoute::new(
            StepKind::General,
            "ollama",
            self.config.local_model.clone(),
            0.7,
            4096,
            "default route",
        )
    }

    /// Escalate a local route to the best ready hosted provider when the
    /// complexity crosses the threshold.
    fn maybe_escalate(&mut self, route: ModelRoute, complexity: f64) -> ModelRoute {
        if complexity < self.config.escalation_threshold || !route.is_local() {
            return route;
        }

        let chain = [
            ("google", self.config.cloud_power_model.clone()),
            ("openai", "gpt-5.2".to_owned()),
            ("anthropic", "claude-sonnet-4-6".to_owned()),
        ];
        for (provider, model) in chain {
            if self.directory.is_ready(provider) {
                *self.escalation_counts.entry(route.step_kind).or_default() += 1;
                info!(
                    kind = %route.step_kind,
                    from = %route.provider,
                    to = provider,
                    complexity,
                    "escalating to hosted provider"
                );
                return ModelRoute::new(
                    route.step_kind,
                    provider,
                    model,
                    route.temperature,
                    route.max_tokens.max(8192),
                    format!("escalated from {} (complexity={complexity:.1})", route.provider),
                );
            }
        }

        // No hosted provider ready; stay local.
        route
    }

    /// Walk the fallback chain for an unavailable provider.
    fn find_fallback(&mut self, route: ModelRoute) -> ModelRoute {
        let chain: Vec<(&str, String)> = if route.is_local() {
            vec![
                ("google", self.config.cloud_fast_model.clone()),
                ("openai", "gpt-5-mini".to_owned()),
                ("anthropic", "claude-sonnet-4-6".to_owned()),
            ]
        } else {
            vec![
                ("ollama", self.config.local_model.clone()),
                ("google", self.config.cloud_fast_model.clone()),
                ("openai", "gpt-5-mini".to_owned()),
                ("anthropic", "claude-sonnet-4-6".to_owned()),
            ]
        };

        for (provider, model) in chain {
            if provider == route.provider {
                continue;
            }
            if self.directory.is_ready(provider) {
                *self.fallback_counts.entry(provider.to_owned()).or_default() += 1;
                info!(from = %route.provider, to = provider, kind = %route.step_kind, "provider fallback");
                return ModelRoute::new(
                    route.step_kind,
                    provider,
                    model,
                    route.temperature,
                    route.max_tokens,
                    format!("fallback from {}", route.provider),
                );
            }
        }

        warn!(provider = %route.provider, "no fallback available");
        route
    }
}

impl std::fmt::Debug for ModelRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRouter")
            .field("strategy", &self.config.strategy)
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

fn build_routes(config: &RouterConfig) -> HashMap<StepKind, ModelRoute> {
    let local = |kind: StepKind, model: &str, temp: f32, max: u32, reason: &str| {
        ModelRoute::new(kind, "ollama", model, temp, max, reason)
    };
    let cloud = |kind: StepKind, model: &str, temp: f32, max: u32, reason: &str| {
        ModelRoute::new(kind, "google", model, temp, max, reason)
    };

    match config.strategy {
        RoutingStrategy::LocalFirst => HashMap::from([
            (
                StepKind::Planning,
                local(StepKind::Planning, &config.local_model, 0.3, 4096, "planning is fast; local model is sufficient"),
            ),
            (
                StepKind::Coding,
                local(StepKind::Coding, &config.local_large_model, 0.2, 8192, "code gen with largest local model"),
            ),
            (
                StepKind::Research,
                local(StepKind::Research, &config.local_model, 0.5, 4096, "exploratory research runs locally"),
            ),
            (
                StepKind::Reflection,
                local(StepKind::Reflection, &config.local_model, 0.4, 2048, "meta-reasoning on the fast local model"),
            ),
            (
                StepKind::Security,
                cloud(StepKind::Security, &config.cloud_power_model, 0.1, 4096, "security review needs maximum accuracy"),
            ),
            (
                StepKind::DataAnalysis,
                local(StepKind::DataAnalysis, &config.local_large_model, 0.3, 8192, "data analysis with large local model"),
            ),
            (
                StepKind::Writing,
                local(StepKind::Writing, &config.local_model, 0.7, 4096, "writing runs locally"),
            ),
            (
                StepKind::General,
                local(StepKind::General, &config.local_model, 0.7, 4096, "default: local model for uncategorized steps"),
            ),
        ]),
        RoutingStrategy::CloudFirst => StepKind::ALL
            .into_iter()
            .map(|kind| {
                let (model, temp, max, reason): (&str, f32, u32, &str) = match kind {
                    StepKind::Coding | StepKind::Security | StepKind::DataAnalysis => {
                        (&config.cloud_power_model, 0.2, 8192, "strongest cloud model")
                    }
                    _ => (&config.cloud_fast_model, 0.5, 4096, "cloud flash for fast steps"),
                };
                (kind, cloud(kind, model, temp, max, reason))
            })
            .collect(),
        RoutingStrategy::CostOptimized => StepKind::ALL
            .into_iter()
            .map(|kind| {
                let route = if kind.baseline() >= 1.5 {
                    cloud(kind, &config.cloud_power_model, 0.3, 8192, "cost-optimized: needs cloud quality")
                } else {
                    local(kind, &config.local_model, 0.5, 4096, "cost-optimized: runs locally")
                };
                (kind, route)
            })
            .collect(),
        RoutingStrategy::QualityFirst => StepKind::ALL
            .into_iter()
            .map(|kind| {
                (
                    kind,
                    cloud(kind, &config.cloud_power_model, 0.3, 8192, "quality-first: always strongest model"),
                )
            })
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    struct FakeDirectory {
        ready: Mutex<HashSet<String>>,
    }

    impl FakeDirectory {
        fn new(ready: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                ready: Mutex::new(ready.iter().map(|s| (*s).to_owned()).collect()),
            })
        }
    }

    impl ProviderDirectory for FakeDirectory {
        fn is_ready(&self, name: &str) -> bool {
            self.ready.lock().expect("lock").contains(name)
        }
    }

    #[test]
    fn classification_by_keywords() {
        assert_eq!(classify_step("Refactor the parser module", &[]), StepKind::Coding);
        assert_eq!(
            classify_step("Search the web for recent results", &[]),
            StepKind::Research
        );
        assert_eq!(
            classify_step("Run a security audit of credentials", &[]),
            StepKind::Security
        );
        assert_eq!(classify_step("Say hello", &[]), StepKind::General);
    }

    #[test]
    fn complexity_scales_with_signals() {
        let simple = estimate_complexity("Show the list", StepKind::General, &[], 0);
        let complex = estimate_complexity(
            "architect a distributed write-ahead log with exactly-once semantics",
            StepKind::Coding,
            &[],
            0,
        );
        assert!(simple < 1.0, "{simple}");
        assert!(complex >= 5.0, "{complex}");
    }

    #[test]
    fn local_first_escalates_on_complexity() {
        let directory = FakeDirectory::new(&["ollama", "google"]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        let route = router.select(
            "architect a distributed write-ahead log with exactly-once semantics",
            &[],
            0,
        );
        assert_eq!(route.provider, "google");
        assert_eq!(route.model, "gemini-2.5-pro");
        assert_eq!(router.stats().escalations.len(), 1);
    }

    #[test]
    fn escalation_stays_local_without_cloud() {
        let directory = FakeDirectory::new(&["ollama"]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        let route = router.select(
            "architect a distributed write-ahead log with exactly-once semantics",
            &[],
            0,
        );
        assert_eq!(route.provider, "ollama");
    }

    #[test]
    fn tool_heavy_step_escalates() {
        let directory = FakeDirectory::new(&["ollama", "anthropic"]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        let tools: Vec<String> = ["a", "b", "c"].iter().map(|s| (*s).to_owned()).collect();
        let route = router.select("Say hello politely", &tools, 0);
        assert_eq!(route.provider, "anthropic");
    }

    #[test]
    fn unavailable_provider_falls_back() {
        let directory = FakeDirectory::new(&["openai"]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        let route = router.select("Say hello", &[], 0);
        assert_eq!(route.provider, "openai");
        assert_eq!(router.stats().fallbacks.get("openai"), Some(&1));
    }

    #[test]
    fn nothing_ready_keeps_original_route() {
        let directory = FakeDirectory::new(&[]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        let route = router.select("Say hello", &[], 0);
        assert_eq!(route.provider, "ollama");
    }

    #[test]
    fn override_replaces_route() {
        let directory = FakeDirectory::new(&["ollama", "anthropic"]);
        let mut router = ModelRouter::new(RouterConfig::default(), directory);

        router.override_route(
            StepKind::General,
            ModelRoute::new(
                StepKind::General,
                "anthropic",
                "claude-sonnet-4-6",
                0.5,
                4096,
                "workspace override",
            ),
        );
        let route = router.select("Say hello", &[], 0);
        assert_eq!(route.provider, "anthropic");
    }

    #[test]
    fn quality_first_always_cloud() {
        let directory = FakeDirectory::new(&["google"]);
        let config = RouterConfig {
            strategy: RoutingStrategy::QualityFirst,
            ..RouterConfig::default()
        };
        let mut router = ModelRouter::new(config, directory);

        let route = router.select("rename a variable", &[], 0);
        assert_eq!(route.provider, "google");
        assert_eq!(route.model, "gemini-2.5-pro");
    }
}
