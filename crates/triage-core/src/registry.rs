//! Static catalog of installable agent templates

use serde::Serialize;

use crate::providers::types::ProviderKind;
use crate::types::Category;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PricingTier {
    Free,
    Premium,
}

impl std::fmt::Display for PricingTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Free => write!(f, "free"),
            Self::Premium => write!(f, "premium"),
        }
    }
}

/// An installable agent definition
#[derive(Debug, Serialize)]
pub struct AgentTemplate {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub category: Category,
    /// Extra categories the agent is a reasonable fit for
    pub related_categories: &'static [Category],
    pub capabilities: &'static [&'static str],
    pub icon: &'static str,
    pub system_prompt: &'static str,
    pub conversation_starters: &'static [&'static str],
    /// (key, text) pairs; the first entry doubles as the greeting
    pub suggested_responses: &'static [(&'static str, &'static str)],
    pub pricing: PricingTier,
    pub recommended_providers: &'static [ProviderKind],
    pub version: &'static str,
}

impl AgentTemplate {
    pub fn greeting(&self) -> Option<&'static str> {
        self.suggested_responses.first().map(|(_, text)| *text)
    }

    pub fn default_provider(&self) -> ProviderKind {
        self.recommended_providers
            .first()
            .copied()
            .unwrap_or(ProviderKind::OpenAi)
    }

    fn matches_query(&self, query: &str) -> bool {
        self.name.to_lowercase().contains(query)
            || self.description.to_lowercase().contains(query)
            || self.capabilities.iter().any(|c| c.contains(query))
    }
}

static TEMPLATES: [AgentTemplate; 6] = [
    AgentTemplate {
        id: "technical_support",
        name: "Technical Support Specialist",
        description: "Expert at diagnosing technical issues and providing step-by-step solutions",
        category: Category::Technical,
        related_categories: &[],
        capabilities: &["troubleshooting", "debugging", "system_analysis", "solution_steps"],
        icon: "🔧",
        system_prompt: "You are a technical support specialist. Diagnose the customer's problem, \
                        ask for exact error messages when they are missing, and give clear numbered steps.",
        conversation_starters: &[
            "I'm having trouble with...",
            "The system is showing an error...",
            "How do I configure...",
            "The feature isn't working...",
        ],
        suggested_responses: &[
            ("error_analysis", "Let me help you analyze this error. Can you provide the exact error message?"),
            ("step_by_step", "I will walk you through this step by step to resolve the issue."),
            ("system_check", "Let us run through some basic system checks first."),
        ],
        pricing: PricingTier::Free,
        recommended_providers: &[ProviderKind::OpenAi, ProviderKind::Claude],
        version: "1.0.0",
    },
    AgentTemplate {
        id: "billing_support",
        name: "Billing & Payments Expert",
        description: "Specialized in handling billing inquiries, payment issues, and subscription management",
        category: Category::Billing,
        related_categories: &[],
        capabilities: &["payment_processing", "subscription_management", "refund_handling", "pricing_questions"],
        icon: "💳",
        system_prompt: "You are a billing and payments expert. Explain charges plainly, \
                        never ask for full card numbers, and state refund timelines explicitly.",
        conversation_starters: &[
            "I have a question about my bill...",
            "My payment didn't go through...",
            "I need a refund for...",
            "Can you explain the charges...",
        ],
        suggested_responses: &[
            ("billing_inquiry", "I can help you with your billing question. Let me review your account details."),
            ("payment_issue", "Let me help resolve this payment issue for you."),
            ("refund_request", "I will process your refund request and explain the timeline."),
        ],
        pricing: PricingTier::Free,
        recommended_providers: &[ProviderKind::OpenAi],
        version: "1.0.0",
    },
    AgentTemplate {
        id: "sales_assistant",
        name: "Sales Assistant Pro",
        description: "Helps convert inquiries into sales with product knowledge and persuasive communication",
        category: Category::Sales,
        related_categories: &[],
        capabilities: &["product_recommendations", "lead_qualification", "objection_handling", "upselling"],
        icon: "📈",
        system_prompt: "You are a sales assistant focused on helping customers pick the right plan. \
                        Be accurate about features and never invent discounts.",
        conversation_starters: &[
            "I'm interested in your product...",
            "What's the difference between plans...",
            "Do you offer discounts...",
            "Can I schedule a demo...",
        ],
        suggested_responses: &[
            ("product_demo", "I would be happy to show you how our product can solve your specific needs."),
            ("pricing_discussion", "Let me explain our pricing options and find the best fit for you."),
            ("feature_comparison", "Here is how our features compare and which would work best for your use case."),
        ],
        pricing: PricingTier::Premium,
        recommended_providers: &[ProviderKind::Claude, ProviderKind::OpenAi],
        version: "1.0.0",
    },
    AgentTemplate {
        id: "onboarding_guide",
        name: "Customer Onboarding Guide",
        description: "Helps new customers get started quickly with personalized setup assistance",
        category: Category::Onboarding,
        related_categories: &[],
        capabilities: &["setup_guidance", "feature_introduction", "training_resources", "progress_tracking"],
        icon: "🎯",
        system_prompt: "You are a customer onboarding guide. Help new customers set up their account \
                        one step at a time and point them to the most useful features first.",
        conversation_starters: &[
            "I just signed up, where do I start?",
            "How do I set up my account?",
            "What features should I use first?",
            "I'm new to this type of software...",
        ],
        suggested_responses: &[
            ("welcome_message", "Welcome! I will help you get started with a personalized setup plan."),
            ("next_steps", "Great progress! Here are the next steps to get you fully set up."),
            ("feature_tutorial", "Let me show you how to use this key feature."),
        ],
        pricing: PricingTier::Free,
        recommended_providers: &[ProviderKind::OpenAi, ProviderKind::Gemini],
        version: "1.0.0",
    },
    AgentTemplate {
        id: "multilingual_support",
        name: "Multilingual Support Agent",
        description: "Provides customer support in multiple languages with cultural awareness",
        category: Category::Multilingual,
        related_categories: &[],
        capabilities: &["translation", "cultural_adaptation", "language_detection", "localized_responses"],
        icon: "🌍",
        system_prompt: "You are a multilingual support agent. Always reply in the customer's language \
                        and keep product terms untranslated.",
        conversation_starters: &[
            "Can you help me in Spanish?",
            "I need help in French",
            "Can you help me in German?",
            "Can you help me in English?",
        ],
        suggested_responses: &[
            ("language_switch", "Of course! I can help you in your preferred language."),
            ("translation_offer", "I can translate this information for you."),
            ("cultural_note", "Let me provide information relevant to your region."),
        ],
        pricing: PricingTier::Premium,
        recommended_providers: &[ProviderKind::Claude, ProviderKind::Gemini],
        version: "1.0.0",
    },
    AgentTemplate {
        id: "escalation_manager",
        name: "Escalation Manager",
        description: "Handles complex issues and manages escalations to appropriate human agents",
        category: Category::Management,
        related_categories: &[Category::Technical],
        capabilities: &["issue_assessment", "priority_routing", "escalation_management", "handoff_preparation"],
        icon: "⚡",
        system_prompt: "You are an escalation manager. Acknowledge the impact, collect the facts a human \
                        specialist needs, and prepare a concise handoff summary.",
        conversation_starters: &[
            "This is urgent and needs immediate attention",
            "I have tried everything and nothing works",
            "I need to speak with a manager",
            "This issue is affecting my business",
        ],
        suggested_responses: &[
            ("urgent_assessment", "I understand this is urgent. Let me assess the situation and get you the right help."),
            ("escalation_preparation", "I am preparing your case for escalation to ensure quick resolution."),
            ("priority_handling", "This requires priority attention. I am connecting you with our specialist team."),
        ],
        pricing: PricingTier::Premium,
        recommended_providers: &[ProviderKind::Claude, ProviderKind::OpenAi],
        version: "1.0.0",
    },
];

pub fn all() -> &'static [AgentTemplate] {
    &TEMPLATES
}

pub fn get(id: &str) -> Option<&'static AgentTemplate> {
    TEMPLATES.iter().find(|t| t.id == id)
}

pub fn by_category(category: Category) -> Vec<&'static AgentTemplate> {
    TEMPLATES.iter().filter(|t| t.category == category).collect()
}

pub fn by_pricing(tier: PricingTier) -> Vec<&'static AgentTemplate> {
    TEMPLATES.iter().filter(|t| t.pricing == tier).collect()
}

/// Case-insensitive search over name, description and capabilities
pub fn search(query: &str) -> Vec<&'static AgentTemplate> {
    let query = query.trim().to_lowercase();
    if query.is_empty() {
        return TEMPLATES.iter().collect();
    }
    TEMPLATES.iter().filter(|t| t.matches_query(&query)).collect()
}

/// Distinct categories in catalog order
pub fn categories() -> Vec<Category> {
    let mut seen = Vec::new();
    for t in TEMPLATES.iter() {
        if !seen.contains(&t.category) {
            seen.push(t.category);
        }
    }
    seen
}

/// Template ids worth installing for a conversation with this text
pub fn recommend_for_text(text: &str) -> Vec<&'static str> {
    let lower = text.to_lowercase();
    let has_any = |terms: &[&str]| terms.iter().any(|t| lower.contains(t));

    let mut ids = Vec::new();
    if has_any(&["error", "bug", "not working", "broken", "issue", "problem", "troubleshoot"]) {
        ids.push("technical_support");
    }
    if has_any(&["bill", "payment", "charge", "refund", "subscription", "pricing", "invoice"]) {
        ids.push("billing_support");
    }
    if has_any(&["buy", "purchase", "demo", "trial", "pricing", "upgrade", "features", "product"]) {
        ids.push("sales_assistant");
    }
    if has_any(&["new", "start", "setup", "how to", "tutorial", "guide", "first time"]) {
        ids.push("onboarding_guide");
    }
    if has_any(&["urgent", "emergency", "critical", "asap", "immediately", "manager", "escalate"]) {
        ids.push("escalation_manager");
    }
    if !text.is_ascii() {
        ids.push("multilingual_support");
    }
    ids
}
