//! Heuristic content analysis of a conversation's recent inbound text
//!
//! Pure functions over message text: no network, no storage. The output feeds
//! the matching engine and is never persisted.

use std::collections::HashMap;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::types::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Urgency {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Urgency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Neutral,
    Negative,
}

impl std::fmt::Display for Sentiment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Positive => write!(f, "positive"),
            Self::Neutral => write!(f, "neutral"),
            Self::Negative => write!(f, "negative"),
        }
    }
}

impl Sentiment {
    /// Lenient parse of a one-word label
    pub fn from_str(s: &str) -> Option<Self> {
        let word = s
            .trim()
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_lowercase();
        match word.as_str() {
            "positive" => Some(Self::Positive),
            "neutral" => Some(Self::Neutral),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CustomerType {
    New,
    Prospect,
    Frustrated,
    Existing,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keyword {
    pub word: String,
    pub count: usize,
}

/// Structured signal extracted from a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisResult {
    /// Every matched category, in `Category::ALL` order
    pub categories: Vec<Category>,
    pub urgency: Urgency,
    /// ISO 639-1 code
    pub language: String,
    pub sentiment: Sentiment,
    /// Top keywords by frequency, ties in first-occurrence order
    pub keywords: Vec<Keyword>,
    pub complexity: Complexity,
    pub customer_type: CustomerType,
    pub message_count: usize,
}

impl AnalysisResult {
    pub fn has_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }

    pub fn keyword_terms(&self) -> impl Iterator<Item = &str> {
        self.keywords.iter().map(|k| k.word.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    /// Most recent inbound messages considered
    #[serde(default = "default_window")]
    pub window: usize,
    /// Message count above which a conversation is considered drawn out
    #[serde(default = "default_message_threshold")]
    pub message_threshold: usize,
    #[serde(default = "default_base_language")]
    pub base_language: String,
    /// Conversation age above which urgency is at least medium
    #[serde(default = "default_stale_after_minutes")]
    pub stale_after_minutes: i64,
    #[serde(default = "default_max_keywords")]
    pub max_keywords: usize,
}

fn default_window() -> usize {
    10
}
fn default_message_threshold() -> usize {
    3
}
fn default_base_language() -> String {
    "en".to_string()
}
fn default_stale_after_minutes() -> i64 {
    60
}
fn default_max_keywords() -> usize {
    10
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            window: default_window(),
            message_threshold: default_message_threshold(),
            base_language: default_base_language(),
            stale_after_minutes: default_stale_after_minutes(),
            max_keywords: default_max_keywords(),
        }
    }
}

const TECHNICAL_TERMS: &[&str] = &[
    "error", "bug", "broken", "crash", "not working", "issue", "problem", "troubleshoot", "down",
    "outage", "server", "login", "log in", "configure", "install", "api", "timeout",
];
const BILLING_TERMS: &[&str] = &[
    "bill", "billing", "payment", "charge", "refund", "subscription", "invoice", "pricing", "card",
    "receipt",
];
const SALES_TERMS: &[&str] = &[
    "buy", "purchase", "demo", "trial", "upgrade", "plan", "discount", "quote", "feature",
    "product",
];
const ONBOARDING_TERMS: &[&str] = &[
    "new", "start", "setup", "set up", "how to", "tutorial", "guide", "first time",
    "getting started", "signed up",
];
const MANAGEMENT_TERMS: &[&str] = &[
    "urgent", "emergency", "critical", "asap", "immediately", "manager", "escalate", "complaint",
    "unacceptable", "supervisor",
];

const URGENCY_TERMS: &[&str] = &[
    "urgent", "emergency", "critical", "asap", "immediately", "down", "outage", "right now",
];
const SOON_TERMS: &[&str] = &["soon", "quickly", "today", "as soon as"];
const COMPLAINT_TERMS: &[&str] = &[
    "still", "again", "complaint", "unacceptable", "not working", "broken", "frustrated", "waiting",
];

const NEGATIVE_TERMS: &[&str] = &[
    "angry", "frustrated", "terrible", "awful", "bad", "worst", "hate", "broken", "useless",
    "disappointed", "unacceptable", "ridiculous", "annoyed", "upset", "horrible", "poor", "fail",
    "not working",
];
const POSITIVE_TERMS: &[&str] = &[
    "thank", "great", "excellent", "love", "awesome", "happy", "perfect", "amazing",
    "appreciate", "helpful", "good", "wonderful",
];

const STOPWORDS: &[&str] = &[
    "this", "that", "with", "have", "from", "they", "will", "would", "there", "their", "what",
    "when", "where", "which", "about", "been", "were", "your", "just", "like", "also", "into",
    "than", "then", "them", "some", "could", "should", "does", "doesn't", "don't", "can't",
    "cannot", "need", "want", "please", "hello", "thanks", "thank", "here", "very", "really",
    "only", "more", "after", "before", "because", "while", "still", "again", "it's", "i'm",
    "i've", "we're", "you're", "that's", "these", "those", "being", "other",
];

struct LanguageMarkers {
    code: &'static str,
    words: &'static [&'static str],
    chars: &'static [char],
}

const LANGUAGES: &[LanguageMarkers] = &[
    LanguageMarkers {
        code: "es",
        words: &[
            "hola", "necesito", "ayuda", "gracias", "por favor", "cuenta", "quiero", "tengo",
            "buenos", "donde",
        ],
        chars: &['ñ', '¿', '¡', 'á', 'í', 'ó', 'ú'],
    },
    LanguageMarkers {
        code: "fr",
        words: &[
            "bonjour", "merci", "besoin", "compte", "pourquoi", "s'il vous plait",
        ],
        chars: &['ç', 'è', 'ê', 'à', 'â', 'ù', 'œ', 'î'],
    },
    LanguageMarkers {
        code: "de",
        words: &[
            "hallo", "danke", "bitte", "hilfe", "konto", "brauche", "nicht", "funktioniert",
            "meinem",
        ],
        chars: &['ä', 'ö', 'ü', 'ß'],
    },
    LanguageMarkers {
        code: "pt",
        words: &[
            "olá", "ola", "obrigado", "obrigada", "preciso", "ajuda", "conta", "você", "voce",
            "não", "nao", "minha",
        ],
        chars: &['ã', 'õ', 'ç'],
    },
];

/// Lowercased text split into word tokens
struct Normalized {
    tokens: Vec<String>,
    /// Tokens joined by single spaces and padded, for phrase lookup
    padded: String,
}

impl Normalized {
    fn new(text: &str) -> Self {
        let tokens = tokenize(text);
        let padded = format!(" {} ", tokens.join(" "));
        Self { tokens, padded }
    }

    fn contains(&self, term: &str) -> bool {
        if term.contains(' ') {
            self.padded.contains(&format!(" {} ", term))
        } else {
            self.tokens.iter().any(|t| word_matches(t, term))
        }
    }

    /// Distinct terms from `terms` present in the text
    fn count_terms(&self, terms: &[&str]) -> usize {
        terms.iter().filter(|t| self.contains(t)).count()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .map(|t| t.trim_matches('\''))
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// Exact match or the term plus a common inflection ("errors", "charged")
fn word_matches(token: &str, term: &str) -> bool {
    match token.strip_prefix(term) {
        Some("") => true,
        Some(rest) => matches!(rest, "s" | "es" | "ed" | "d" | "ing"),
        None => false,
    }
}

/// Stateless analyzer configured once and shared
#[derive(Debug, Clone, Default)]
pub struct ContentAnalyzer {
    config: AnalyzerConfig,
}

impl ContentAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Analyze the most recent inbound texts (oldest first). `conversation_age`
    /// feeds the staleness component of urgency when known.
    pub fn analyze<S: AsRef<str>>(
        &self,
        texts: &[S],
        conversation_age: Option<Duration>,
    ) -> AnalysisResult {
        let skip = texts.len().saturating_sub(self.config.window);
        let messages: Vec<&str> = texts[skip..].iter().map(|t| t.as_ref()).collect();
        let combined = Normalized::new(&messages.join("\n"));
        let per_message: Vec<Normalized> = messages.iter().map(|m| Normalized::new(m)).collect();

        let language = self.detect_language(&combined);
        let categories = self.detect_categories(&combined, &language);
        let repeated_complaints = per_message
            .iter()
            .filter(|m| m.count_terms(COMPLAINT_TERMS) > 0)
            .count()
            >= 2;
        let urgency =
            self.detect_urgency(&combined, messages.len(), repeated_complaints, conversation_age);
        let sentiment = detect_sentiment(&combined);
        let keywords = extract_keywords(&combined.tokens, self.config.max_keywords);
        let complexity = self.assess_complexity(&categories, combined.tokens.len(), messages.len());
        let customer_type = classify_customer(&categories, sentiment, urgency, repeated_complaints);

        AnalysisResult {
            categories,
            urgency,
            language,
            sentiment,
            keywords,
            complexity,
            customer_type,
            message_count: messages.len(),
        }
    }

    fn detect_categories(&self, text: &Normalized, language: &str) -> Vec<Category> {
        Category::ALL
            .into_iter()
            .filter(|category| match category {
                Category::Technical => text.count_terms(TECHNICAL_TERMS) > 0,
                Category::Billing => text.count_terms(BILLING_TERMS) > 0,
                Category::Sales => text.count_terms(SALES_TERMS) > 0,
                Category::Onboarding => text.count_terms(ONBOARDING_TERMS) > 0,
                Category::Management => text.count_terms(MANAGEMENT_TERMS) > 0,
                Category::Multilingual => language != self.config.base_language,
            })
            .collect()
    }

    fn detect_urgency(
        &self,
        text: &Normalized,
        message_count: usize,
        repeated_complaints: bool,
        age: Option<Duration>,
    ) -> Urgency {
        let hits = text.count_terms(URGENCY_TERMS);
        let drawn_out = message_count > self.config.message_threshold;

        if hits >= 2 || (hits == 1 && (drawn_out || repeated_complaints)) {
            return Urgency::Critical;
        }
        if hits == 1 || repeated_complaints {
            return Urgency::High;
        }
        let stale = age.is_some_and(|a| a > Duration::minutes(self.config.stale_after_minutes));
        if text.count_terms(SOON_TERMS) > 0 || drawn_out || stale {
            return Urgency::Medium;
        }
        Urgency::Low
    }

    fn detect_language(&self, text: &Normalized) -> String {
        let mut best: Option<(&str, usize)> = None;
        for lang in LANGUAGES {
            let words = lang
                .words
                .iter()
                .filter(|w| {
                    if w.contains(' ') {
                        text.padded.contains(&format!(" {} ", w))
                    } else {
                        text.tokens.iter().any(|t| t.as_str() == **w)
                    }
                })
                .count();
            let chars = lang
                .chars
                .iter()
                .filter(|c| text.padded.contains(**c))
                .count();
            let score = words * 2 + chars;
            if score > 0 && best.is_none_or(|(_, s)| score > s) {
                best = Some((lang.code, score));
            }
        }
        // markers are words English text does not use; a lone diacritic is not enough
        match best {
            Some((code, score)) if score >= 2 => code.to_string(),
            _ => self.config.base_language.clone(),
        }
    }

    fn assess_complexity(
        &self,
        categories: &[Category],
        word_count: usize,
        message_count: usize,
    ) -> Complexity {
        if categories.len() >= 3 || word_count > 150 {
            Complexity::Complex
        } else if categories.len() == 2 || word_count > 50 || message_count > self.config.message_threshold {
            Complexity::Moderate
        } else {
            Complexity::Simple
        }
    }
}

fn detect_sentiment(text: &Normalized) -> Sentiment {
    let negative = text.count_terms(NEGATIVE_TERMS);
    let positive = text.count_terms(POSITIVE_TERMS);
    match negative.cmp(&positive) {
        std::cmp::Ordering::Greater => Sentiment::Negative,
        std::cmp::Ordering::Less => Sentiment::Positive,
        std::cmp::Ordering::Equal => Sentiment::Neutral,
    }
}

fn extract_keywords(tokens: &[String], limit: usize) -> Vec<Keyword> {
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();
    for (position, token) in tokens.iter().enumerate() {
        if token.chars().count() < 4
            || STOPWORDS.contains(&token.as_str())
            || token.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        counts.entry(token.as_str()).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));
    ranked
        .into_iter()
        .take(limit)
        .map(|(word, count, _)| Keyword {
            word: word.to_string(),
            count,
        })
        .collect()
}

fn classify_customer(
    categories: &[Category],
    sentiment: Sentiment,
    urgency: Urgency,
    repeated_complaints: bool,
) -> CustomerType {
    if sentiment == Sentiment::Negative && (urgency >= Urgency::High || repeated_complaints) {
        CustomerType::Frustrated
    } else if categories.contains(&Category::Onboarding) {
        CustomerType::New
    } else if categories.contains(&Category::Sales) {
        CustomerType::Prospect
    } else {
        CustomerType::Existing
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn analyze(texts: &[&str]) -> AnalysisResult {
        ContentAnalyzer::default().analyze(texts, None)
    }

    #[test]
    fn test_outage_is_technical_and_critical() {
        let r = analyze(&["URGENT: our production server is down, customers can't log in"]);
        assert!(r.has_category(Category::Technical));
        assert!(r.has_category(Category::Management));
        assert!(!r.has_category(Category::Sales), "production is not product");
        assert_eq!(r.urgency, Urgency::Critical);
        assert_eq!(r.language, "en");
    }

    #[test]
    fn test_spanish_is_flagged_multilingual() {
        let r = analyze(&["Hola, necesito ayuda con mi cuenta"]);
        assert_eq!(r.language, "es");
        assert_eq!(r.categories, vec![Category::Multilingual]);
        assert_eq!(r.urgency, Urgency::Low);
    }

    #[test]
    fn test_other_languages() {
        assert_eq!(analyze(&["Bonjour, j'ai besoin d'aide avec mon compte"]).language, "fr");
        assert_eq!(analyze(&["Hallo, ich brauche Hilfe mit meinem Konto"]).language, "de");
        assert_eq!(analyze(&["Olá, preciso de ajuda com minha conta"]).language, "pt");
        assert_eq!(analyze(&["I need help with my account"]).language, "en");
    }

    #[test]
    fn test_english_with_foreign_looking_tokens_stays_english() {
        let r = analyze(&["Our server has been down since 9am EST"]);
        assert_eq!(r.language, "en");
        assert!(!r.has_category(Category::Multilingual));
        assert_eq!(analyze(&["The para 3 of the contract looks wrong"]).language, "en");
        assert_eq!(analyze(&["Payment failed, please con firm"]).language, "en");
        assert_eq!(analyze(&["See you Mon, und so on"]).language, "en");
        assert_eq!(analyze(&["Ich bin confused, como?"]).language, "en");
    }

    #[test]
    fn test_multiple_categories_are_retained() {
        let r = analyze(&["I want to upgrade my plan but the payment page shows an error"]);
        assert!(r.has_category(Category::Sales));
        assert!(r.has_category(Category::Billing));
        assert!(r.has_category(Category::Technical));
        assert_eq!(r.complexity, Complexity::Complex);
    }

    #[test]
    fn test_inflections_match() {
        let r = analyze(&["I was charged twice and need a refund"]);
        assert_eq!(r.categories, vec![Category::Billing]);
    }

    #[test]
    fn test_no_category() {
        let r = analyze(&["Just wondering about your opening hours"]);
        assert!(r.categories.is_empty());
        assert_eq!(r.urgency, Urgency::Low);
        assert_eq!(r.customer_type, CustomerType::Existing);
    }

    #[test]
    fn test_urgency_tiers() {
        assert_eq!(analyze(&["Please fix this immediately"]).urgency, Urgency::High);
        assert_eq!(analyze(&["Can you get back to me today?"]).urgency, Urgency::Medium);
        assert_eq!(
            analyze(&["hi", "hello?", "anyone there", "please respond"]).urgency,
            Urgency::Medium
        );
        // one urgency term in a drawn-out conversation escalates
        assert_eq!(
            analyze(&["hi", "hello?", "anyone there", "this is urgent"]).urgency,
            Urgency::Critical
        );
    }

    #[test]
    fn test_repeated_complaints_raise_urgency() {
        let r = analyze(&["The export is broken", "It is still broken, this is terrible"]);
        assert_eq!(r.urgency, Urgency::High);
        assert_eq!(r.sentiment, Sentiment::Negative);
        assert_eq!(r.customer_type, CustomerType::Frustrated);
    }

    #[test]
    fn test_stale_conversation_is_medium() {
        let analyzer = ContentAnalyzer::default();
        let r = analyzer.analyze(&["Question about my account"], Some(Duration::hours(2)));
        assert_eq!(r.urgency, Urgency::Medium);
        let r = analyzer.analyze(&["Question about my account"], Some(Duration::minutes(10)));
        assert_eq!(r.urgency, Urgency::Low);
    }

    #[test]
    fn test_sentiment_vote() {
        assert_eq!(analyze(&["Thanks, this is great"]).sentiment, Sentiment::Positive);
        assert_eq!(analyze(&["This is awful and useless"]).sentiment, Sentiment::Negative);
        assert_eq!(analyze(&["Thanks, but it is broken"]).sentiment, Sentiment::Neutral);
        assert_eq!(analyze(&["Where is the settings page"]).sentiment, Sentiment::Neutral);
    }

    #[test]
    fn test_keywords_by_frequency_then_first_occurrence() {
        let r = analyze(&["invoice total wrong, invoice date wrong, invoice number fine"]);
        let words: Vec<&str> = r.keyword_terms().collect();
        assert_eq!(words, vec!["invoice", "wrong", "total", "date", "number", "fine"]);
        assert_eq!(r.keywords[0].count, 3);
        assert_eq!(r.keywords[1].count, 2);
    }

    #[test]
    fn test_keywords_drop_stopwords_and_short_words() {
        let r = analyze(&["I can't log in and need this fixed"]);
        let words: Vec<&str> = r.keyword_terms().collect();
        assert_eq!(words, vec!["fixed"]);
    }

    #[test]
    fn test_keywords_capped() {
        let text = "alpha bravo charlie delta echo foxtrot golf hotel india juliet kilo lima mike";
        let r = analyze(&[text]);
        assert_eq!(r.keywords.len(), 10);
    }

    #[test]
    fn test_window_limits_messages() {
        let analyzer = ContentAnalyzer::new(AnalyzerConfig {
            window: 2,
            ..Default::default()
        });
        let r = analyzer.analyze(&["refund please", "hello", "hi again"], None);
        assert_eq!(r.message_count, 2);
        assert!(!r.has_category(Category::Billing));
    }

    #[test]
    fn test_customer_type_hints() {
        assert_eq!(
            analyze(&["I just signed up, how to get started?"]).customer_type,
            CustomerType::New
        );
        assert_eq!(
            analyze(&["Can I get a demo of the product"]).customer_type,
            CustomerType::Prospect
        );
    }

    #[test]
    fn test_empty_input() {
        let r = analyze(&[]);
        assert!(r.categories.is_empty());
        assert_eq!(r.message_count, 0);
        assert_eq!(r.language, "en");
        assert!(r.keywords.is_empty());
    }
}
