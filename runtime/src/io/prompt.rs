//! Prompt rendering for generation requests.

use anyhow::{Context, Result, anyhow};
use minijinja::{Environment, context};
use tracing::debug;

use crate::core::validator::{ENTRY_POINT, TEARDOWN_FUNCTION};
use crate::io::transport::{GenerationParams, GenerationRequest};

const SYSTEM_TEMPLATE: &str = include_str!("prompts/system.md");
const REQUEST_TEMPLATE: &str = include_str!("prompts/request.md");

/// Renders the system and request templates into a [`GenerationRequest`].
#[derive(Debug)]
pub struct PromptBuilder {
    env: Environment<'static>,
    params: GenerationParams,
}

impl PromptBuilder {
    pub fn new(params: GenerationParams) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("system", SYSTEM_TEMPLATE)
            .context("load system template")?;
        env.add_template("request", REQUEST_TEMPLATE)
            .context("load request template")?;
        Ok(Self { env, params })
    }

    /// Build the request for a user's effect description.
    pub fn build(&self, prompt: &str) -> Result<GenerationRequest> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(anyhow!("prompt is empty"));
        }

        let system = self
            .env
            .get_template("system")?
            .render(context! {
                entry_point => ENTRY_POINT,
                teardown => TEARDOWN_FUNCTION,
            })
            .context("render system template")?;
        let request = self
            .env
            .get_template("request")?
            .render(context! {
                prompt => prompt,
                entry_point => ENTRY_POINT,
                teardown => TEARDOWN_FUNCTION,
            })
            .context("render request template")?;

        debug!(prompt_bytes = request.len(), "rendered generation prompt");
        Ok(GenerationRequest {
            system,
            prompt: request,
            params: self.params,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::RuntimeConfig;

    fn builder() -> PromptBuilder {
        PromptBuilder::new(RuntimeConfig::default().generation_params()).expect("templates")
    }

    #[test]
    fn system_prompt_names_the_contract() {
        let request = builder().build("falling snow").expect("build");
        assert!(request.system.contains("function createAnimation(container)"));
        assert!(request.system.contains("return function cleanup()"));
        assert!(!request.system.contains("{{"));
    }

    #[test]
    fn request_embeds_trimmed_prompt() {
        let request = builder().build("  falling snow \n").expect("build");
        assert!(request.prompt.contains("<request>\nfalling snow\n</request>"));
        assert_eq!(request.params.top_k, 32);
    }

    #[test]
    fn blank_prompt_is_rejected() {
        assert!(builder().build("   ").is_err());
    }
}
