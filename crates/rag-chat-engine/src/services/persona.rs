use ::config::{Config, File, FileFormat};
use serde::Deserialize;
use tracing::warn;

use crate::config::PersonaConfig;
use crate::services::events::SourceRef;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a customer support assistant for {company_name}. \
Answer questions about {product_name} using only the sources below. \
Keep the tone {tone}. If the sources do not cover the question, say so plainly.\n\n\
Confidence: {confidence_tier}\n\nSources:\n{sources}";

const DEFAULT_FALLBACK: &str =
    "I couldn't find specific information about that in the {product_name} documentation.";

const DEFAULT_ESCALATION: &str =
    "Let me connect you with a human agent who can help with this question.";

const DEFAULT_OFF_TOPIC: &str = "I can only help with questions about {product_name}.";

const CAVEAT_DISCLAIMER: &str = "\n\nThe sources only partially cover this question. \
Recommend that the customer verify the answer with support if anything is unclear.";

#[derive(Debug, Clone, Default, Deserialize)]
struct PersonaTemplates {
    system_prompt: Option<String>,
    fallback_message: Option<String>,
    escalation_message: Option<String>,
    off_topic_message: Option<String>,
}

/// Assembles the system prompt and canned messages from a YAML template
/// bundle. A missing file or key falls back to hard-coded defaults.
pub struct PersonaService {
    config: PersonaConfig,
    templates: PersonaTemplates,
}

impl PersonaService {
    pub fn new(config: PersonaConfig) -> Self {
        let templates = Self::load_templates(&config.template_path);
        Self { config, templates }
    }

    fn load_templates(path: &str) -> PersonaTemplates {
        let loaded = Config::builder()
            .add_source(File::new(path.trim_end_matches(".yaml"), FileFormat::Yaml).required(false))
            .build()
            .and_then(|c| c.try_deserialize::<PersonaTemplates>());

        match loaded {
            Ok(templates) => templates,
            Err(e) => {
                warn!(path, error = %e, "persona template load failed, using defaults");
                PersonaTemplates::default()
            }
        }
    }

    fn render(&self, template: &str, confidence_tier: &str, sources: &str) -> String {
        template
            .replace("{company_name}", &self.config.company_name)
            .replace("{product_name}", &self.config.product_name)
            .replace("{tone}", &self.config.tone)
            .replace("{confidence_tier}", confidence_tier)
            .replace("{sources}", sources)
    }

    pub fn build_system_prompt(&self, sources: &[SourceRef], confidence_tier: &str) -> String {
        let template = self
            .templates
            .system_prompt
            .as_deref()
            .unwrap_or(DEFAULT_SYSTEM_PROMPT);

        let mut prompt = self.render(template, confidence_tier, &format_sources(sources));
        if confidence_tier == "CAVEAT" {
            prompt.push_str(CAVEAT_DISCLAIMER);
        }
        prompt
    }

    pub fn get_fallback_message(&self) -> String {
        let template = self
            .templates
            .fallback_message
            .as_deref()
            .unwrap_or(DEFAULT_FALLBACK);
        self.render(template, "", "")
    }

    pub fn get_escalation_message(&self) -> String {
        let template = self
            .templates
            .escalation_message
            .as_deref()
            .unwrap_or(DEFAULT_ESCALATION);
        self.render(template, "", "")
    }

    pub fn get_off_topic_message(&self) -> String {
        let template = self
            .templates
            .off_topic_message
            .as_deref()
            .unwrap_or(DEFAULT_OFF_TOPIC);
        self.render(template, "", "")
    }

    /// Clarification question naming up to three candidate topics.
    pub fn build_ambiguity_prompt(&self, topics: &[String]) -> String {
        let joined = topics
            .iter()
            .take(3)
            .map(|t| format!("'{t}'"))
            .collect::<Vec<_>>()
            .join(" and ");

        format!("I found information about {joined}. Could you clarify which one you're asking about?")
    }
}

fn format_sources(sources: &[SourceRef]) -> String {
    if sources.is_empty() {
        return "(no sources)".to_string();
    }

    sources
        .iter()
        .map(|s| format!("[{}]\n{}", s.title, s.text))
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn persona() -> PersonaService {
        PersonaService::new(PersonaConfig {
            company_name: "TestCorp".into(),
            product_name: "TestDryer".into(),
            tone: "friendly".into(),
            template_path: "does/not/exist.yaml".into(),
        })
    }

    #[test]
    fn system_prompt_includes_company() {
        let prompt = persona().build_system_prompt(&[], "ANSWER");
        assert!(prompt.contains("TestCorp"));
        assert!(prompt.contains("ANSWER"));
    }

    #[test]
    fn system_prompt_includes_sources() {
        let sources = vec![SourceRef {
            title: "Manual Ch. 3".into(),
            text: "Clean the lint trap.".into(),
            url: None,
            score: 0.9,
        }];
        let prompt = persona().build_system_prompt(&sources, "ANSWER");
        assert!(prompt.contains("lint trap"));
        assert!(prompt.contains("Manual Ch. 3"));
    }

    #[test]
    fn caveat_prompt_includes_disclaimer() {
        let prompt = persona().build_system_prompt(&[], "CAVEAT");
        assert!(prompt.to_lowercase().contains("recommend"));
    }

    #[test]
    fn off_topic_message_names_product() {
        assert!(persona().get_off_topic_message().contains("TestDryer"));
    }

    #[test]
    fn fallback_message_names_product() {
        assert!(persona().get_fallback_message().contains("TestDryer"));
    }

    #[test]
    fn ambiguity_prompt_quotes_and_joins_topics() {
        let msg = persona().build_ambiguity_prompt(&[
            "lint trap".to_string(),
            "water filter".to_string(),
        ]);
        assert!(msg.contains("'lint trap'"));
        assert!(msg.contains("'water filter'"));
        assert!(msg.contains(" and "));
    }

    #[test]
    fn ambiguity_prompt_caps_at_three_topics() {
        let topics: Vec<String> = (0..5).map(|i| format!("topic{i}")).collect();
        let msg = persona().build_ambiguity_prompt(&topics);
        assert!(msg.contains("'topic2'"));
        assert!(!msg.contains("'topic3'"));
    }

    #[test]
    fn missing_template_file_falls_back_to_defaults() {
        // Construction must not fail on a missing bundle.
        let msg = persona().get_escalation_message();
        assert!(msg.contains("human agent"));
    }
}
