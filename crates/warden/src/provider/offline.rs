use async_trait::async_trait;

use super::{ProviderError, TextGenerator};

/// Canned responses for running without an API key.
///
/// Every prompt gets `Mock response for: <prompt>`. The reviewer never sees
/// `APPROVED`, so a pipeline driven by this generator ends in
/// [`Outcome::GaveUp`](crate::pipeline::Outcome::GaveUp).
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineGenerator;

#[async_trait]
impl TextGenerator for OfflineGenerator {
    async fn generate(
        &self,
        prompt: &str,
        _system_prompt: Option<&str>,
    ) -> Result<String, ProviderError> {
        Ok(format!("Mock response for: {prompt}"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_response() {
        let text = OfflineGenerator.generate("add 2 and 3", Some("sys")).await.unwrap();
        assert_eq!(text, "Mock response for: add 2 and 3");
    }
}
