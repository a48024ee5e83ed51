use regex::Regex;
use serde::Serialize;

/// Politeness and filler phrases removed outright.
const COURTESY_PHRASES: &[&str] = &[
    "i would appreciate if",
    "it would be great if",
    "i would like you to",
    "i want you to",
    "i need you to",
    "would you mind",
    "if you could",
    "can you",
    "kindly",
    "please",
];

/// Long connectives and their short equivalents.
const SIMPLIFICATIONS: &[(&str, &str)] = &[
    ("consequently", "so"),
    ("nevertheless", "but"),
    ("nonetheless", "but"),
    ("moreover", "also"),
    ("furthermore", "also"),
    ("additionally", "also"),
    ("however", "but"),
    ("thus", "so"),
    ("therefore", "so"),
    ("hence", "so"),
    ("accordingly", "so"),
    ("ultimately", "finally"),
    ("essentially", "basically"),
    ("fundamentally", "basically"),
    ("primarily", "mainly"),
    ("initially", "first"),
    ("subsequently", "then"),
    ("previously", "before"),
];

/// Context framing that adds tokens without changing the ask.
const CONTEXT_MARKERS: &[&str] = &[
    "as you know",
    "as mentioned",
    "as stated",
    "as discussed",
    "previously",
    "earlier",
    "before",
    "in the past",
];

/// How the optimized prompt compares to the caller's original.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizationStats {
    pub original_tokens: u32,
    pub optimized_tokens: u32,
    pub tokens_saved: u32,
    pub reduction_percentage: f64,
    pub original_length: usize,
    pub optimized_length: usize,
}

/// Canonicalizes prompts before they reach the cache key and the providers.
///
/// `optimize` is a pure function and a fixed point: feeding its output back
/// in returns the same bytes. When the aggressive passes would strip more
/// than 70% of the estimated tokens the conservative variant (courtesy
/// elision + normalization only) is returned instead.
pub struct PromptOptimizer {
    courtesy: Vec<Regex>,
    simplifications: Vec<(Regex, &'static str)>,
    context_markers: Vec<Regex>,
    parenthetical: Regex,
    bracketed: Regex,
    repeated_bangs: Regex,
    repeated_questions: Regex,
    repeated_dots: Regex,
    space_before_punct: Regex,
    whitespace_run: Regex,
    polite_opener: Regex,
    sentence_end: Regex,
}

impl PromptOptimizer {
    pub fn new() -> Self {
        let word = |w: &str| {
            Regex::new(&format!(r"(?i)\b{}\b", regex::escape(w))).expect("static pattern")
        };
        Self {
            courtesy: COURTESY_PHRASES.iter().map(|p| word(p)).collect(),
            simplifications: SIMPLIFICATIONS
                .iter()
                .map(|(from, to)| (word(from), *to))
                .collect(),
            context_markers: CONTEXT_MARKERS
                .iter()
                .map(|m| {
                    Regex::new(&format!(r"(?i)\b{}\b[,\s]*", regex::escape(m)))
                        .expect("static pattern")
                })
                .collect(),
            parenthetical: Regex::new(r"\([^)]*\)").expect("static pattern"),
            bracketed: Regex::new(r"\[[^\]]*\]").expect("static pattern"),
            repeated_bangs: Regex::new(r"!{2,}").expect("static pattern"),
            repeated_questions: Regex::new(r"\?{2,}").expect("static pattern"),
            repeated_dots: Regex::new(r"\.{2,}").expect("static pattern"),
            space_before_punct: Regex::new(r"\s+([,.!?])").expect("static pattern"),
            whitespace_run: Regex::new(r"\s+").expect("static pattern"),
            polite_opener: Regex::new(r"(?i)\b(please|kindly|can you|would you)\b")
                .expect("static pattern"),
            sentence_end: Regex::new(r"[.!?]+").expect("static pattern"),
        }
    }

    /// Canonicalize a prompt. Never alters intent; see the quality guard.
    pub fn optimize(&self, prompt: &str) -> String {
        if prompt.trim().is_empty() {
            return String::new();
        }
        let original_tokens = Self::estimate_tokens(prompt);

        let mut text = self.elide_courtesy(prompt);
        text = self.simplify(&text);
        text = self.strip_context(&text);
        text = self.normalize(&text);
        text = self.compress(&text);

        let optimized_tokens = Self::estimate_tokens(&text);
        let reduction =
            (original_tokens.saturating_sub(optimized_tokens)) as f64 / original_tokens.max(1) as f64;
        if reduction > 0.7 {
            // Over-aggressive on short prompts loses meaning; fall back to
            // the safe passes only.
            return self.normalize(&self.elide_courtesy(prompt));
        }

        text
    }

    pub fn stats(&self, original: &str, optimized: &str) -> OptimizationStats {
        let original_tokens = Self::estimate_tokens(original);
        let optimized_tokens = Self::estimate_tokens(optimized);
        let tokens_saved = original_tokens.saturating_sub(optimized_tokens);
        let reduction_percentage = if original_tokens > 0 {
            tokens_saved as f64 / original_tokens as f64 * 100.0
        } else {
            0.0
        };
        OptimizationStats {
            original_tokens,
            optimized_tokens,
            tokens_saved,
            reduction_percentage,
            original_length: original.chars().count(),
            optimized_length: optimized.chars().count(),
        }
    }

    /// Rough ~4 characters per token. Used for budgets and routing; the
    /// provider-reported usage is the truth post-call.
    pub fn estimate_tokens(text: &str) -> u32 {
        (text.chars().count() / 4) as u32
    }

    fn elide_courtesy(&self, text: &str) -> String {
        let mut out = text.to_string();
        for phrase in &self.courtesy {
            out = phrase.replace_all(&out, "").into_owned();
        }
        out
    }

    fn simplify(&self, text: &str) -> String {
        let mut out = text.to_string();
        for (pattern, replacement) in &self.simplifications {
            out = pattern.replace_all(&out, *replacement).into_owned();
        }
        out
    }

    fn strip_context(&self, text: &str) -> String {
        let mut out = text.to_string();
        for marker in &self.context_markers {
            out = marker.replace_all(&out, "").into_owned();
        }
        out = self.parenthetical.replace_all(&out, "").into_owned();
        out = self.bracketed.replace_all(&out, "").into_owned();
        out
    }

    /// Punctuation runs collapse after the space-before-punct pass:
    /// eliding a whole clause can leave `X.  .` behind, and the run only
    /// becomes adjacent once the stray space is gone.
    fn normalize(&self, text: &str) -> String {
        let mut out = text
            .replace(['\u{201C}', '\u{201D}'], "\"")
            .replace(['\u{2018}', '\u{2019}'], "'");
        out = self.space_before_punct.replace_all(&out, "$1").into_owned();
        out = self.repeated_bangs.replace_all(&out, "!").into_owned();
        out = self.repeated_questions.replace_all(&out, "?").into_owned();
        out = self.repeated_dots.replace_all(&out, ".").into_owned();
        out = self.whitespace_run.replace_all(&out, " ").into_owned();
        out.trim().to_string()
    }

    /// Each sentence keeps its own terminal mark: rewriting `?` or `!` to
    /// `.` would change intent, and the conservative guard output must be
    /// a fixed point of this pass too.
    fn compress(&self, text: &str) -> String {
        let mut out = String::new();
        let mut last_end = 0;
        for terminator in self.sentence_end.find_iter(text) {
            if let Some(sentence) = self.clean_clause(&text[last_end..terminator.start()]) {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(&sentence);
                out.push_str(terminator.as_str());
            }
            last_end = terminator.end();
        }
        if let Some(sentence) = self.clean_clause(&text[last_end..]) {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&sentence);
        }
        out
    }

    fn clean_clause(&self, raw: &str) -> Option<String> {
        let mut sentence = self.polite_opener.replace_all(raw, "").into_owned();
        sentence = self.whitespace_run.replace_all(&sentence, " ").trim().to_string();
        if sentence.is_empty() {
            return None;
        }
        // More than two coordinated clauses: keep the lead action.
        if sentence.matches(" and ").count() > 1 {
            let lead = sentence
                .split(" and ")
                .next()
                .unwrap_or("")
                .trim()
                .to_string();
            sentence = lead;
        }
        Some(sentence)
    }
}

impl Default for PromptOptimizer {
    fn default() -> Self {
        Self::new()
    }
}
