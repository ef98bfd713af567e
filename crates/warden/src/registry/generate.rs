//! Asking a text generator for a function to save.

use crate::pipeline::prompts::strip_code_fence;
use crate::provider::{ProviderError, TextGenerator};

fn prompt(description: &str) -> String {
    format!(
        "Generate a JavaScript function based on the following prompt:\n\n{description}\n\n\
         Provide only the function code without any explanation."
    )
}

/// Ask `generator` for a function matching `description`.
///
/// The reply is trimmed and unwrapped from a Markdown code fence, and a
/// trailing `;` is dropped so the result can be saved with
/// [`save_script_function`](super::save_script_function) as is.
///
/// # Errors
///
/// Returns the generator's error unchanged.
pub async fn generate_function(
    generator: &dyn TextGenerator,
    description: &str,
) -> Result<String, ProviderError> {
    let reply = generator.generate(&prompt(description), None).await?;
    let code = strip_code_fence(&reply);
    let code = code.strip_suffix(';').unwrap_or(&code).trim_end().to_string();
    tracing::debug!(bytes = code.len(), "generated function source");
    Ok(code)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::{Arc, Mutex};

    use serde_json::json;

    use super::*;
    use crate::registry::{FunctionRegistry, SaveError, save_script_function};
    use crate::sandbox::Sandbox;

    fn replying(reply: &'static str) -> (impl TextGenerator, Arc<Mutex<Vec<String>>>) {
        let prompts = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&prompts);
        let generator = move |prompt: String, system: Option<String>| {
            assert!(system.is_none());
            seen.lock().unwrap().push(prompt);
            async move { Ok::<_, ProviderError>(reply.to_string()) }
        };
        (generator, prompts)
    }

    #[tokio::test]
    async fn test_generated_function_can_be_saved_and_called() {
        let (generator, prompts) =
            replying("```javascript\nfunction square(x) {\n  return x * x;\n};\n```\n");

        let code = generate_function(&generator, "square a number").await.unwrap();
        assert_eq!(code, "function square(x) {\n  return x * x;\n}");
        assert_eq!(
            prompts.lock().unwrap().as_slice(),
            [concat!(
                "Generate a JavaScript function based on the following prompt:\n\n",
                "square a number\n\n",
                "Provide only the function code without any explanation."
            )]
        );

        let registry = FunctionRegistry::new();
        save_script_function(&registry, Arc::new(Sandbox::default()), "square", &code).unwrap();
        assert_eq!(registry.execute("square", &[json!(7)]).unwrap(), json!(49));
    }

    #[tokio::test]
    async fn test_prose_reply_is_not_saved() {
        let (generator, _) = replying("  Here is a function that squares numbers.  ");

        let code = generate_function(&generator, "square").await.unwrap();
        assert_eq!(code, "Here is a function that squares numbers.");

        let registry = FunctionRegistry::new();
        let err = save_script_function(&registry, Arc::new(Sandbox::default()), "square", &code)
            .unwrap_err();
        assert!(matches!(err, SaveError::Sandbox(_)), "{err:?}");
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn test_generator_error_is_returned() {
        let failing = |_prompt: String, _system: Option<String>| async move {
            Err::<String, _>(ProviderError::Transport("connection refused".to_string()))
        };
        let err = generate_function(&failing, "anything").await.unwrap_err();
        assert_eq!(err, ProviderError::Transport("connection refused".to_string()));
    }
}
