// ── Keystone Atoms: Configuration ──────────────────────────────────────────
// Single JSON constants file (`keystone.json`) shared by every service.
// Every section has serde defaults so a missing or partial file still yields
// a runnable dev configuration.

use crate::atoms::constants::*;
use crate::atoms::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// ── Model configuration ────────────────────────────────────────────────────

/// Backend kind for a pool entry. A closed variant set; dispatch happens
/// through the `ModelBackend` trait and its tagged factory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// llama.cpp-style local HTTP server (gguf).
    Local,
    /// vLLM HTTP server. GPU-backed; demoted on release_gpu().
    Vllm,
    /// transformers serving endpoint.
    Hf,
    /// Cloud chat API (Groq / OpenAI / Gemini).
    Api,
    /// HTTP embedding endpoint (Ollama-compatible).
    Embedder,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub backend: BackendKind,
    /// Model identifier passed to the backend ("llama-3.1-8b", …).
    pub model_id: String,
    #[serde(default)]
    pub base_url: String,
    /// Env var holding the API key for cloud backends. The key itself never
    /// appears in config or logs.
    #[serde(default)]
    pub api_key_env: String,
    /// Cloud API flavor when backend == Api: "groq" | "openai" | "gemini".
    #[serde(default)]
    pub flavor: String,
    #[serde(default)]
    pub gpu_backed: bool,
}

fn default_model_configs() -> BTreeMap<String, ModelConfig> {
    let mut m = BTreeMap::new();
    m.insert(
        "gpu_prime".to_string(),
        ModelConfig {
            backend: BackendKind::Vllm,
            model_id: "prime-32b".to_string(),
            base_url: "http://127.0.0.1:8000".to_string(),
            api_key_env: String::new(),
            flavor: String::new(),
            gpu_backed: true,
        },
    );
    m.insert(
        "cpu_lite".to_string(),
        ModelConfig {
            backend: BackendKind::Local,
            model_id: "lite-3b".to_string(),
            base_url: "http://127.0.0.1:8080".to_string(),
            api_key_env: String::new(),
            flavor: String::new(),
            gpu_backed: false,
        },
    );
    m.insert(
        "groq_fallback".to_string(),
        ModelConfig {
            backend: BackendKind::Api,
            model_id: "llama-3.3-70b-versatile".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            api_key_env: "GROQ_API_KEY".to_string(),
            flavor: "groq".to_string(),
            gpu_backed: false,
        },
    );
    m.insert(
        "oracle_openai".to_string(),
        ModelConfig {
            backend: BackendKind::Api,
            model_id: "gpt-4o-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            api_key_env: "OPENAI_API_KEY".to_string(),
            flavor: "openai".to_string(),
            gpu_backed: false,
        },
    );
    m.insert(
        "oracle_gemini".to_string(),
        ModelConfig {
            backend: BackendKind::Api,
            model_id: "gemini-2.0-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            api_key_env: "GEMINI_API_KEY".to_string(),
            flavor: "gemini".to_string(),
            gpu_backed: false,
        },
    );
    m.insert(
        "embedder".to_string(),
        ModelConfig {
            backend: BackendKind::Embedder,
            model_id: "nomic-embed-text".to_string(),
            base_url: "http://127.0.0.1:11434".to_string(),
            api_key_env: String::new(),
            flavor: String::new(),
            gpu_backed: false,
        },
    );
    m
}

fn default_aliases() -> BTreeMap<String, String> {
    let mut m = BTreeMap::new();
    m.insert("prime".to_string(), "gpu_prime".to_string());
    m.insert("lite".to_string(), "cpu_lite".to_string());
    m
}

fn default_fallback_chains() -> BTreeMap<String, Vec<String>> {
    let mut m = BTreeMap::new();
    m.insert(
        "prime".to_string(),
        vec![
            "gpu_prime".to_string(),
            "cpu_lite".to_string(),
            "groq_fallback".to_string(),
            "oracle_openai".to_string(),
            "oracle_gemini".to_string(),
        ],
    );
    m.insert(
        "lite".to_string(),
        vec![
            "cpu_lite".to_string(),
            "groq_fallback".to_string(),
            "oracle_openai".to_string(),
            "oracle_gemini".to_string(),
        ],
    );
    m
}

// ── Knowledge bases ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeBaseConfig {
    /// Persona adopted when this KB is the primary probe collection.
    pub persona: String,
    /// Keyword fallbacks when the probe finds nothing.
    #[serde(default)]
    pub keywords: Vec<String>,
}

// ── Section structs ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SemanticProbeConfig {
    pub similarity_threshold: f32,
    pub max_phrases: usize,
    pub top_k_per_phrase: usize,
    pub cache_max_age_turns: u64,
}

impl Default for SemanticProbeConfig {
    fn default() -> Self {
        SemanticProbeConfig {
            similarity_threshold: PROBE_SIMILARITY_THRESHOLD,
            max_phrases: PROBE_MAX_PHRASES,
            top_k_per_phrase: 5,
            cache_max_age_turns: PROBE_CACHE_MAX_AGE_TURNS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryReviewConfig {
    pub enabled: bool,
    pub violation_threshold: usize,
    pub max_messages: usize,
}

impl Default for HistoryReviewConfig {
    fn default() -> Self {
        HistoryReviewConfig {
            enabled: true,
            violation_threshold: HISTORY_VIOLATION_THRESHOLD,
            max_messages: HISTORY_MAX_MESSAGES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedIntentConfig {
    pub enabled: bool,
    pub confidence_threshold: f32,
    pub top_k: usize,
}

impl Default for EmbedIntentConfig {
    fn default() -> Self {
        EmbedIntentConfig {
            enabled: true,
            confidence_threshold: EMBED_INTENT_THRESHOLD,
            top_k: EMBED_INTENT_TOP_K,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpistemicConfig {
    pub enabled: bool,
    /// CJK runs at or below this length are treated as stray artifacts.
    pub max_stray_cjk_chars: usize,
}

impl Default for EpistemicConfig {
    fn default() -> Self {
        EpistemicConfig { enabled: true, max_stray_cjk_chars: 10 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    pub enabled: bool,
    pub min_interval_secs: u64,
    pub max_invocations: u32,
    /// When false, the LLM-backed review is skipped and only rule checks run.
    pub llm_review: bool,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        ObserverConfig {
            enabled: true,
            min_interval_secs: OBSERVER_MIN_INTERVAL_SECS,
            max_invocations: OBSERVER_MAX_INVOCATIONS,
            llm_review: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopDetectionConfig {
    pub enabled: bool,
    pub single_detector_trigger: f64,
    pub pair_detector_trigger: f64,
    pub weighted_trigger: f64,
    pub verbatim_similarity: f64,
    pub paraphrase_similarity: f64,
}

impl Default for LoopDetectionConfig {
    fn default() -> Self {
        LoopDetectionConfig {
            enabled: true,
            single_detector_trigger: LOOP_TRIGGER_SINGLE,
            pair_detector_trigger: LOOP_TRIGGER_PAIR,
            weighted_trigger: LOOP_TRIGGER_WEIGHTED,
            verbatim_similarity: LOOP_VERBATIM_SIMILARITY,
            paraphrase_similarity: LOOP_PARAPHRASE_SIMILARITY,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouncilConfig {
    pub enabled: bool,
    pub note_ttl_hours: i64,
    pub pending_cap: usize,
    pub long_prompt_chars: usize,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        CouncilConfig {
            enabled: true,
            note_ttl_hours: COUNCIL_NOTE_TTL_HOURS,
            pending_cap: COUNCIL_PENDING_CAP,
            long_prompt_chars: COUNCIL_LONG_PROMPT_CHARS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebResearchConfig {
    /// Fetchable without review; results ranked first.
    pub trusted_domains: Vec<String>,
    /// Fetchable; ranked after trusted.
    pub reliable_domains: Vec<String>,
    /// Never fetched, never returned in search results.
    pub blocked_domains: Vec<String>,
    pub search_hourly_limit: u32,
    pub fetch_hourly_limit: u32,
}

impl Default for WebResearchConfig {
    fn default() -> Self {
        WebResearchConfig {
            trusted_domains: vec![
                "wikipedia.org".to_string(),
                "gutenberg.org".to_string(),
                "poetryfoundation.org".to_string(),
                "docs.rs".to_string(),
            ],
            reliable_domains: vec![
                "github.com".to_string(),
                "stackoverflow.com".to_string(),
                "arxiv.org".to_string(),
            ],
            blocked_domains: vec!["example-content-farm.com".to_string()],
            search_hourly_limit: WEB_SEARCH_HOURLY_LIMIT,
            fetch_hourly_limit: WEB_FETCH_HOURLY_LIMIT,
        }
    }
}

fn default_safe_sidecar_tools() -> Vec<String> {
    vec![
        "read_file".to_string(),
        "embedding_query".to_string(),
        "introspect_logs".to_string(),
        "web_search".to_string(),
    ]
}

// ── Service wiring ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceUrls {
    pub engine: String,
    /// HA standby engine; the gateway's single-shot fallback target.
    pub engine_candidate: String,
    pub gateway: String,
    pub orchestrator: String,
    pub tool_server: String,
    pub trainer: String,
    pub generation_backend: String,
}

impl Default for ServiceUrls {
    fn default() -> Self {
        ServiceUrls {
            engine: "http://127.0.0.1:7801".to_string(),
            engine_candidate: "http://127.0.0.1:7811".to_string(),
            gateway: "http://127.0.0.1:7800".to_string(),
            orchestrator: "http://127.0.0.1:7802".to_string(),
            tool_server: "http://127.0.0.1:7803".to_string(),
            trainer: "http://127.0.0.1:7804".to_string(),
            generation_backend: "http://127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Docker container names for the handoff pair.
    pub generation_container: String,
    pub trainer_container: String,
    pub watchdog_interval_secs: u64,
    /// Candidate shared volume root for one-way session sync.
    pub candidate_volume: PathBuf,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        OrchestratorConfig {
            generation_container: "keystone-generation".to_string(),
            trainer_container: "keystone-trainer".to_string(),
            watchdog_interval_secs: WATCHDOG_INTERVAL_SECS,
            candidate_volume: PathBuf::from("/shared-candidate"),
        }
    }
}

// ── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlatformConfig {
    #[serde(default = "default_model_configs")]
    pub model_configs: BTreeMap<String, ModelConfig>,
    #[serde(default = "default_aliases")]
    pub model_aliases: BTreeMap<String, String>,
    #[serde(default = "default_fallback_chains")]
    pub fallback_chains: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub knowledge_bases: BTreeMap<String, KnowledgeBaseConfig>,
    #[serde(default)]
    pub semantic_probe: SemanticProbeConfig,
    #[serde(default)]
    pub history_review: HistoryReviewConfig,
    #[serde(default)]
    pub embed_intent: EmbedIntentConfig,
    #[serde(default)]
    pub epistemic_guardrails: EpistemicConfig,
    #[serde(default)]
    pub cognitive_audit: ObserverConfig,
    #[serde(default)]
    pub loop_detection: LoopDetectionConfig,
    #[serde(default)]
    pub council: CouncilConfig,
    #[serde(default)]
    pub web_research: WebResearchConfig,
    #[serde(default = "default_safe_sidecar_tools")]
    pub safe_sidecar_tools: Vec<String>,
    #[serde(default)]
    pub services: ServiceUrls,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Shared volume root for sessions, checkpoints, council notes, and the
    /// maintenance flag.
    #[serde(default = "default_shared_volume")]
    pub shared_volume: PathBuf,
    /// Filesystem roots the tool server may read and write under.
    #[serde(default = "default_allowed_roots")]
    pub allowed_file_roots: Vec<PathBuf>,
    /// First tokens permitted for `run_shell` when shell=true.
    #[serde(default = "default_shell_whitelist")]
    pub shell_whitelist: Vec<String>,
}

fn default_shared_volume() -> PathBuf {
    PathBuf::from("/shared")
}

fn default_allowed_roots() -> Vec<PathBuf> {
    vec![PathBuf::from("/knowledge"), PathBuf::from("/shared")]
}

fn default_shell_whitelist() -> Vec<String> {
    ["ls", "cat", "grep", "wc", "head", "tail", "df", "du", "uptime", "date"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

impl Default for PlatformConfig {
    fn default() -> Self {
        PlatformConfig {
            model_configs: default_model_configs(),
            model_aliases: default_aliases(),
            fallback_chains: default_fallback_chains(),
            knowledge_bases: BTreeMap::new(),
            semantic_probe: SemanticProbeConfig::default(),
            history_review: HistoryReviewConfig::default(),
            embed_intent: EmbedIntentConfig::default(),
            epistemic_guardrails: EpistemicConfig::default(),
            cognitive_audit: ObserverConfig::default(),
            loop_detection: LoopDetectionConfig::default(),
            council: CouncilConfig::default(),
            web_research: WebResearchConfig::default(),
            safe_sidecar_tools: default_safe_sidecar_tools(),
            services: ServiceUrls::default(),
            orchestrator: OrchestratorConfig::default(),
            shared_volume: default_shared_volume(),
            allowed_file_roots: default_allowed_roots(),
            shell_whitelist: default_shell_whitelist(),
        }
    }
}

impl PlatformConfig {
    /// Load from a JSON file. Missing file ⇒ defaults; malformed file is a
    /// hard error so a typo never silently reverts the platform to defaults.
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            log::warn!("[config] {} not found, using defaults", path.display());
            return Ok(PlatformConfig::default());
        }
        let raw = std::fs::read_to_string(path)?;
        serde_json::from_str(&raw)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from the conventional location, honoring `KEYSTONE_CONFIG`.
    pub fn load_default() -> EngineResult<Self> {
        let path = std::env::var("KEYSTONE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("keystone.json"));
        Self::load(&path)
    }
}
