use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Instant;

use crate::optimizer::PromptOptimizer;

/// Baseline price used for the analyzer's rough cost estimate.
const BASELINE_COST_PER_1K_TOKENS: f64 = 0.002;

const TECHNICAL_TERMS: &[&str] = &[
    "algorithm", "api", "authentication", "backend", "database", "encryption",
    "framework", "frontend", "http", "json", "microservices", "oauth",
    "protocol", "query", "schema", "sdk", "sql", "ssl", "tls", "webhook",
    "docker", "kubernetes", "aws", "azure", "gcp", "rest", "graphql",
    "websocket", "redis", "postgresql", "mongodb", "elasticsearch",
    "machine learning", "ai", "neural network", "tensorflow", "pytorch",
    "deployment", "ci/cd", "git", "version control", "testing", "unit test",
    "integration test", "load balancing", "scaling", "monitoring", "logging",
];

const STEP_MARKERS: &[&str] = &["step", "first", "second", "then", "next", "finally", "1.", "2.", "3."];
const CREATIVE_MARKERS: &[&str] = &["creative", "story", "imagine", "write a", "compose", "narrative"];
const ANALYTICAL_MARKERS: &[&str] = &["analyze", "compare", "evaluate", "assess", "examine", "investigate"];
const CODE_MARKERS: &[&str] = &["code", "function", "class", "program", "script", "algorithm"];
const REASONING_MARKERS: &[&str] = &["why", "how", "explain", "reason", "logic", "because"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityLevel {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

impl ComplexityLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComplexityLevel::Simple => "simple",
            ComplexityLevel::Moderate => "moderate",
            ComplexityLevel::Complex => "complex",
            ComplexityLevel::VeryComplex => "very_complex",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplexityFactor {
    Length,
    TechnicalTerms,
    MultiStep,
    Creative,
    Analytical,
    CodeGeneration,
    Reasoning,
}

/// Score boundaries between the four tiers. Configuration, not constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityThresholds {
    pub simple: f64,
    pub moderate: f64,
    pub complex: f64,
}

impl Default for ComplexityThresholds {
    fn default() -> Self {
        Self {
            simple: 0.25,
            moderate: 0.50,
            complex: 0.75,
        }
    }
}

/// Per-factor weights for the overall score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactorWeights {
    pub length: f64,
    pub technical_terms: f64,
    pub multi_step: f64,
    pub creative: f64,
    pub analytical: f64,
    pub code_generation: f64,
    pub reasoning: f64,
}

impl Default for FactorWeights {
    fn default() -> Self {
        Self {
            length: 0.20,
            technical_terms: 0.15,
            multi_step: 0.20,
            creative: 0.10,
            analytical: 0.15,
            code_generation: 0.10,
            reasoning: 0.10,
        }
    }
}

impl FactorWeights {
    fn iter(&self) -> [(ComplexityFactor, f64); 7] {
        [
            (ComplexityFactor::Length, self.length),
            (ComplexityFactor::TechnicalTerms, self.technical_terms),
            (ComplexityFactor::MultiStep, self.multi_step),
            (ComplexityFactor::Creative, self.creative),
            (ComplexityFactor::Analytical, self.analytical),
            (ComplexityFactor::CodeGeneration, self.code_generation),
            (ComplexityFactor::Reasoning, self.reasoning),
        ]
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplexityConfig {
    pub thresholds: ComplexityThresholds,
    pub factor_weights: FactorWeights,
    pub cache_results: bool,
    /// Default provider recommendations by tier.
    pub fast_provider: String,
    pub balanced_provider: String,
    pub capable_provider: String,
}

impl Default for ComplexityConfig {
    fn default() -> Self {
        Self {
            thresholds: ComplexityThresholds::default(),
            factor_weights: FactorWeights::default(),
            cache_results: true,
            fast_provider: "groq".to_string(),
            balanced_provider: "openai".to_string(),
            capable_provider: "anthropic".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplexityScore {
    pub overall_score: f64,
    pub level: ComplexityLevel,
    pub factors: HashMap<ComplexityFactor, f64>,

    pub word_count: usize,
    pub character_count: usize,
    pub sentence_count: usize,
    pub technical_term_count: usize,
    pub code_blocks: usize,
    pub urls: usize,

    pub estimated_tokens: u32,
    pub estimated_cost_usd: f64,
    pub recommended_provider: String,

    pub analysis_time_ms: f64,
    pub cache_hit: bool,
}

/// Scores a prompt on a 0-1 scale across seven weighted factors and
/// classifies it into a tier. Pure aside from the md5-keyed result cache.
pub struct ComplexityAnalyzer {
    config: ComplexityConfig,
    fenced_block: Regex,
    url: Regex,
    sentence_end: Regex,
    cache: RwLock<HashMap<String, ComplexityScore>>,
}

impl ComplexityAnalyzer {
    pub fn new(config: ComplexityConfig) -> Self {
        Self {
            config,
            fenced_block: Regex::new(r"(?s)```.*?```").expect("static pattern"),
            url: Regex::new(r"https?://[^\s]+").expect("static pattern"),
            sentence_end: Regex::new(r"[.!?]+").expect("static pattern"),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn analyze(&self, prompt: &str) -> ComplexityScore {
        let key = format!("{:x}", md5::compute(prompt.as_bytes()));
        if self.config.cache_results {
            if let Ok(cache) = self.cache.read() {
                if let Some(cached) = cache.get(&key) {
                    let mut hit = cached.clone();
                    hit.cache_hit = true;
                    return hit;
                }
            }
        }

        let score = self.analyze_uncached(prompt);

        if self.config.cache_results {
            if let Ok(mut cache) = self.cache.write() {
                cache.insert(key, score.clone());
            }
        }
        score
    }

    fn analyze_uncached(&self, prompt: &str) -> ComplexityScore {
        let started = Instant::now();
        let lowered = prompt.to_lowercase();

        let word_count = prompt.split_whitespace().count();
        let character_count = prompt.chars().count();
        let sentence_count = self
            .sentence_end
            .split(prompt)
            .filter(|s| !s.trim().is_empty())
            .count();

        let technical_term_count = count_markers(&lowered, TECHNICAL_TERMS);
        let code_blocks = self.fenced_block.find_iter(prompt).count();
        let urls = self.url.find_iter(prompt).count();

        let mut factors = HashMap::new();
        factors.insert(ComplexityFactor::Length, saturate(word_count, 1000));
        factors.insert(
            ComplexityFactor::TechnicalTerms,
            saturate(technical_term_count, 10),
        );
        factors.insert(
            ComplexityFactor::MultiStep,
            saturate(count_markers(&lowered, STEP_MARKERS), 5),
        );
        factors.insert(
            ComplexityFactor::Creative,
            saturate(count_markers(&lowered, CREATIVE_MARKERS), 3),
        );
        factors.insert(
            ComplexityFactor::Analytical,
            saturate(count_markers(&lowered, ANALYTICAL_MARKERS), 3),
        );
        factors.insert(
            ComplexityFactor::CodeGeneration,
            saturate(count_markers(&lowered, CODE_MARKERS) + code_blocks, 5),
        );
        factors.insert(
            ComplexityFactor::Reasoning,
            saturate(count_markers(&lowered, REASONING_MARKERS), 4),
        );

        let mut weighted = 0.0;
        let mut total_weight = 0.0;
        for (factor, weight) in self.config.factor_weights.iter() {
            if let Some(value) = factors.get(&factor) {
                weighted += value * weight;
                total_weight += weight;
            }
        }
        let overall_score = if total_weight > 0.0 {
            weighted / total_weight
        } else {
            0.0
        };

        let level = self.classify(overall_score);
        let estimated_tokens = PromptOptimizer::estimate_tokens(prompt);
        let estimated_cost_usd = estimated_tokens as f64 / 1000.0 * BASELINE_COST_PER_1K_TOKENS;

        ComplexityScore {
            overall_score,
            level,
            factors,
            word_count,
            character_count,
            sentence_count,
            technical_term_count,
            code_blocks,
            urls,
            estimated_tokens,
            estimated_cost_usd,
            recommended_provider: self.recommend(level),
            analysis_time_ms: started.elapsed().as_secs_f64() * 1000.0,
            cache_hit: false,
        }
    }

    fn classify(&self, score: f64) -> ComplexityLevel {
        let thresholds = &self.config.thresholds;
        if score <= thresholds.simple {
            ComplexityLevel::Simple
        } else if score <= thresholds.moderate {
            ComplexityLevel::Moderate
        } else if score <= thresholds.complex {
            ComplexityLevel::Complex
        } else {
            ComplexityLevel::VeryComplex
        }
    }

    fn recommend(&self, level: ComplexityLevel) -> String {
        match level {
            ComplexityLevel::Simple => self.config.fast_provider.clone(),
            ComplexityLevel::Moderate => self.config.balanced_provider.clone(),
            ComplexityLevel::Complex | ComplexityLevel::VeryComplex => {
                self.config.capable_provider.clone()
            }
        }
    }

    pub fn cache_len(&self) -> usize {
        self.cache.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.write() {
            cache.clear();
        }
    }
}

impl Default for ComplexityAnalyzer {
    fn default() -> Self {
        Self::new(ComplexityConfig::default())
    }
}

/// Counts how many distinct markers from the list occur in the text.
fn count_markers(lowered: &str, markers: &[&str]) -> usize {
    markers.iter().filter(|m| lowered.contains(*m)).count()
}

fn saturate(count: usize, saturation: usize) -> f64 {
    (count as f64 / saturation as f64).min(1.0)
}
