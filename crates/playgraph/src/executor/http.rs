//! JSON-over-HTTP executor client.

use super::{ExecutionConfig, ExecutorClient, InstructionResult, decode_results};
use crate::error::{Error, Result};
use crate::types::Instruction;
use serde::Deserialize;
use serde_json::json;

/// Response size limit; instruction batches and their facts can be large.
const MAX_BODY_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct SessionResponse {
    session_id: String,
}

/// Executor reachable at `<endpoint>/sessions`
pub struct HttpExecutorClient {
    agent: ureq::Agent,
    endpoint: String,
}

impl HttpExecutorClient {
    #[must_use]
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            agent: ureq::Agent::new_with_defaults(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn session_url(&self, session: &str) -> String {
        format!("{}/sessions/{session}", self.endpoint)
    }
}

impl ExecutorClient for HttpExecutorClient {
    fn start_session(&self) -> Result<String> {
        let url = format!("{}/sessions", self.endpoint);
        let response: SessionResponse = self
            .agent
            .post(&url)
            .send_json(json!({}))?
            .body_mut()
            .read_json()
            .map_err(|e| Error::Protocol(format!("malformed session response: {e}")))?;
        if response.session_id.is_empty() {
            return Err(Error::Protocol("executor returned an empty session id".into()));
        }
        Ok(response.session_id)
    }

    fn init_execution(&self, session: &str, config: &ExecutionConfig) -> Result<()> {
        let url = format!("{}/init", self.session_url(session));
        self.agent.post(&url).send_json(config)?;
        Ok(())
    }

    fn run_instructions(
        &self,
        session: &str,
        instructions: &[Instruction],
    ) -> Result<Vec<InstructionResult>> {
        let url = format!("{}/run", self.session_url(session));
        let body = self
            .agent
            .post(&url)
            .send_json(json!({ "instructions": instructions }))?
            .body_mut()
            .with_config()
            .limit(MAX_BODY_SIZE)
            .read_to_string()
            .map_err(|e| Error::Protocol(format!("unreadable run response: {e}")))?;
        decode_results(&body)
    }

    fn stop_session(&self, session: &str) -> Result<()> {
        self.agent.delete(&self.session_url(session)).call()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls() {
        let client = HttpExecutorClient::new("http://localhost:9090/");
        assert_eq!(client.endpoint(), "http://localhost:9090");
        assert_eq!(client.session_url("s1"), "http://localhost:9090/sessions/s1");
    }
}
