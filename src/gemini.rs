use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{stream, StreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

use crate::gateway::{ChatSession, Fragment, FragmentStream, Gateway, GatewayError, SendOptions, Source};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Content {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
}

impl Content {
    fn turn(role: &str, text: &str) -> Self {
        Self {
            role: Some(role.to_string()),
            parts: vec![Part { text: Some(text.to_string()) }],
        }
    }

    fn instruction(text: &str) -> Self {
        Self {
            role: None,
            parts: vec![Part { text: Some(text.to_string()) }],
        }
    }

    fn text(&self) -> String {
        self.parts.iter().filter_map(|p| p.text.as_deref()).collect()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    system_instruction: &'a Content,
    generation_config: GenerationConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<Tool>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f32,
    top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: TEMPERATURE,
            top_p: TOP_P,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Tool {
    google_search: GoogleSearch,
}

#[derive(Serialize)]
struct GoogleSearch {}

impl<'a> GenerateContentRequest<'a> {
    fn new(contents: &'a [Content], system_instruction: &'a Content, options: SendOptions) -> Self {
        let tools = if options.web_search {
            vec![Tool {
                google_search: GoogleSearch {},
            }]
        } else {
            Vec::new()
        };

        Self {
            contents,
            system_instruction,
            generation_config: GenerationConfig::default(),
            tools,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<Content>,
    grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroundingMetadata {
    #[serde(default)]
    grounding_chunks: Vec<GroundingChunk>,
}

#[derive(Deserialize)]
struct GroundingChunk {
    web: Option<WebChunk>,
}

#[derive(Deserialize)]
struct WebChunk {
    uri: Option<String>,
    title: Option<String>,
}

impl Candidate {
    fn sources(&self) -> Vec<Source> {
        self.grounding_metadata
            .iter()
            .flat_map(|m| &m.grounding_chunks)
            .filter_map(|chunk| chunk.web.as_ref())
            .filter_map(|web| {
                let uri = web.uri.as_deref().filter(|u| !u.is_empty())?;
                Some(Source {
                    uri: uri.to_string(),
                    title: web.title.clone().unwrap_or_default(),
                })
            })
            .collect()
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    #[serde(default)]
    message: String,
}

/// Turn one SSE `data:` payload into a reply fragment.
///
/// `Ok(None)` means the event carried neither text nor sources and should be skipped.
fn parse_sse_data(data: &str) -> Result<Option<Fragment>, GatewayError> {
    let data = data.trim();
    if data.is_empty() || data == "[DONE]" {
        return Ok(None);
    }

    let response: GenerateContentResponse = serde_json::from_str(data)
        .map_err(|e| GatewayError::Stream(format!("malformed Gemini event: {}", e)))?;

    if let Some(error) = response.error {
        let message = if error.message.is_empty() {
            "unknown Gemini API error".to_string()
        } else {
            error.message
        };
        return Err(GatewayError::Stream(message));
    }

    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(GatewayError::Stream(format!("prompt blocked: {}", reason)));
    }

    let Some(candidate) = response.candidates.first() else {
        return Ok(None);
    };
    let text = candidate.content.as_ref().map(Content::text).unwrap_or_default();
    let sources = candidate.sources();

    if text.is_empty() && sources.is_empty() {
        Ok(None)
    } else {
        Ok(Some(Fragment { text, sources }))
    }
}

fn transport_error(err: EventStreamError<reqwest::Error>) -> GatewayError {
    match err {
        EventStreamError::Transport(e) => GatewayError::Stream(e.without_url().to_string()),
        other => GatewayError::Stream(other.to_string()),
    }
}

#[derive(Clone)]
pub struct GeminiClient {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
}

impl GeminiClient {
    pub fn new(api_key: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            base_url: DEFAULT_BASE_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into()).filter(|k| !k.trim().is_empty());
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.is_some()
    }

    fn start_session(&self, instruction: &str) -> Result<GeminiSession, GatewayError> {
        let api_key = self.api_key.clone().ok_or(GatewayError::CredentialMissing)?;

        Ok(GeminiSession {
            client: self.client.clone(),
            api_key,
            url: format!(
                "{}/models/{}:streamGenerateContent",
                self.base_url.trim_end_matches('/'),
                self.model
            ),
            instruction: Content::instruction(instruction),
            history: Arc::new(Mutex::new(Vec::new())),
        })
    }
}

#[async_trait]
impl Gateway for GeminiClient {
    async fn open_session(&self, instruction: &str) -> Result<Arc<dyn ChatSession>, GatewayError> {
        let session = self.start_session(instruction)?;
        tracing::info!(model = %self.model, "opened Gemini chat session");
        Ok(Arc::new(session))
    }
}

/// A Gemini dialogue. Completed exchanges are kept so every request carries
/// the conversation so far.
pub struct GeminiSession {
    client: Client,
    api_key: String,
    url: String,
    instruction: Content,
    history: Arc<Mutex<Vec<Content>>>,
}

impl GeminiSession {
    #[cfg(test)]
    fn history_len(&self) -> usize {
        self.history.lock().unwrap().len()
    }
}

/// Reply in flight; recorded into the history only once the stream ends cleanly.
struct PendingTurn {
    fragments: FragmentStream,
    user_turn: Content,
    reply: String,
    seen_sources: HashSet<String>,
    history: Arc<Mutex<Vec<Content>>>,
}

impl PendingTurn {
    /// Drop sources already reported earlier in this reply.
    fn take_new_sources(&mut self, fragment: &mut Fragment) {
        let seen = &mut self.seen_sources;
        fragment.sources.retain(|source| seen.insert(source.uri.clone()));
    }

    fn commit(self) {
        tracing::info!(chars = self.reply.chars().count(), "Gemini reply complete");
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push(self.user_turn);
        history.push(Content::turn("model", &self.reply));
    }
}

#[async_trait]
impl ChatSession for GeminiSession {
    async fn send_streaming(
        &self,
        utterance: &str,
        options: SendOptions,
    ) -> Result<FragmentStream, GatewayError> {
        let user_turn = Content::turn("user", utterance);
        let contents = {
            let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
            let mut contents = history.clone();
            contents.push(user_turn.clone());
            contents
        };

        let request = GenerateContentRequest::new(&contents, &self.instruction, options);

        tracing::debug!(turns = contents.len(), web_search = options.web_search, "sending Gemini request");

        let response = self
            .client
            .post(&self.url)
            .query(&[("alt", "sse"), ("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(|e| GatewayError::SessionOpen(format!("could not reach Gemini: {}", e.without_url())))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GatewayError::SessionOpen(format!(
                    "Gemini rejected the API key ({}): {}",
                    status, text
                )),
                _ => GatewayError::SessionOpen(format!("Gemini API error {}: {}", status, text)),
            });
        }

        let fragments = response.bytes_stream().eventsource().filter_map(|event| async move {
            match event {
                Ok(event) => parse_sse_data(&event.data).transpose(),
                Err(e) => Some(Err(transport_error(e))),
            }
        });

        let turn = PendingTurn {
            fragments: Box::pin(fragments),
            user_turn,
            reply: String::new(),
            seen_sources: HashSet::new(),
            history: Arc::clone(&self.history),
        };

        let stream = stream::unfold(Some(turn), |state| async move {
            let mut turn = state?;
            match turn.fragments.next().await {
                Some(Ok(mut fragment)) => {
                    turn.reply.push_str(&fragment.text);
                    turn.take_new_sources(&mut fragment);
                    Some((Ok(fragment), Some(turn)))
                }
                Some(Err(err)) => Some((Err(err), None)),
                None => {
                    turn.commit();
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn network_tests_disabled() -> bool {
        std::env::var_os("CODEX_SANDBOX_NETWORK_DISABLED").is_some()
    }

    fn sse_text(text: &str) -> String {
        format!(
            "data: {{\"candidates\":[{{\"content\":{{\"parts\":[{{\"text\":{}}}],\"role\":\"model\"}}}}]}}\n\n",
            serde_json::to_string(text).unwrap()
        )
    }

    fn sse_grounded(text: &str, sources: &[(&str, &str)]) -> String {
        let chunks: Vec<serde_json::Value> = sources
            .iter()
            .map(|(uri, title)| serde_json::json!({ "web": { "uri": uri, "title": title } }))
            .collect();
        let payload = serde_json::json!({
            "candidates": [{
                "content": { "parts": [{ "text": text }], "role": "model" },
                "groundingMetadata": { "groundingChunks": chunks }
            }]
        });
        format!("data: {}\n\n", payload)
    }

    fn source(uri: &str, title: &str) -> Source {
        Source {
            uri: uri.to_string(),
            title: title.to_string(),
        }
    }

    async fn collect(mut stream: FragmentStream) -> Vec<Result<Fragment, GatewayError>> {
        let mut out = Vec::new();
        while let Some(item) = stream.next().await {
            out.push(item);
        }
        out
    }

    #[test]
    fn test_parse_text_chunk() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Hello"},{"text":" there"}],"role":"model"}}]}"#;
        assert_eq!(parse_sse_data(data).unwrap(), Some(Fragment::from("Hello there")));
    }

    #[test]
    fn test_parse_grounding_chunks() {
        let data = r#"{"candidates":[{"content":{"parts":[{"text":"Rates rose."}]},
            "groundingMetadata":{"groundingChunks":[
                {"web":{"uri":"https://www.federalreserve.gov","title":"federalreserve.gov"}},
                {"web":{"uri":"","title":"empty"}},
                {"retrievedContext":{}}
            ]}}]}"#;
        let fragment = parse_sse_data(data).unwrap().expect("fragment");
        assert_eq!(fragment.text, "Rates rose.");
        assert_eq!(
            fragment.sources,
            vec![source("https://www.federalreserve.gov", "federalreserve.gov")]
        );

        let sources_only = r#"{"candidates":[{"groundingMetadata":{"groundingChunks":[{"web":{"uri":"https://a.example"}}]}}]}"#;
        let fragment = parse_sse_data(sources_only).unwrap().expect("fragment");
        assert_eq!(fragment.text, "");
        assert_eq!(fragment.sources, vec![source("https://a.example", "")]);
    }

    #[test]
    fn test_parse_skips_empty_events() {
        assert_eq!(parse_sse_data("").unwrap(), None);
        assert_eq!(parse_sse_data("[DONE]").unwrap(), None);
        let finish = r#"{"candidates":[{"finishReason":"STOP"}],"usageMetadata":{"totalTokenCount":12}}"#;
        assert_eq!(parse_sse_data(finish).unwrap(), None);
    }

    #[test]
    fn test_parse_error_payload() {
        let data = r#"{"error":{"code":500,"message":"internal","status":"INTERNAL"}}"#;
        assert_eq!(
            parse_sse_data(data),
            Err(GatewayError::Stream("internal".to_string()))
        );
    }

    #[test]
    fn test_parse_blocked_prompt() {
        let data = r#"{"promptFeedback":{"blockReason":"SAFETY"}}"#;
        assert!(matches!(parse_sse_data(data), Err(GatewayError::Stream(msg)) if msg.contains("SAFETY")));
    }

    #[test]
    fn test_parse_malformed_json() {
        assert!(matches!(parse_sse_data("{not json"), Err(GatewayError::Stream(_))));
    }

    #[test]
    fn test_request_shape() {
        let contents = vec![Content::turn("user", "Hello")];
        let instruction = Content::instruction("Be helpful");
        let request = GenerateContentRequest::new(&contents, &instruction, SendOptions::default());
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["contents"][0]["role"], "user");
        assert_eq!(value["contents"][0]["parts"][0]["text"], "Hello");
        assert_eq!(value["systemInstruction"]["parts"][0]["text"], "Be helpful");
        assert!(value["systemInstruction"].get("role").is_none());
        assert!((value["generationConfig"]["temperature"].as_f64().unwrap() - 0.7).abs() < 1e-6);
        assert!((value["generationConfig"]["topP"].as_f64().unwrap() - 0.9).abs() < 1e-6);
        assert!(value.get("tools").is_none());
    }

    #[test]
    fn test_request_with_web_search() {
        let contents = vec![Content::turn("user", "Current mortgage rates?")];
        let instruction = Content::instruction("Be helpful");
        let request =
            GenerateContentRequest::new(&contents, &instruction, SendOptions { web_search: true });
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["tools"], serde_json::json!([{ "googleSearch": {} }]));
    }

    #[test]
    fn test_builders() {
        let client = GeminiClient::new(Some("key".to_string()))
            .with_base_url("http://localhost:1234/v1beta/")
            .with_model("gemini-test");
        let session = client.start_session("inst").unwrap();
        assert_eq!(
            session.url,
            "http://localhost:1234/v1beta/models/gemini-test:streamGenerateContent"
        );
        assert_eq!(client.model(), "gemini-test");
    }

    #[tokio::test]
    async fn test_open_session_without_key() {
        let client = GeminiClient::new(None);
        assert!(!client.has_api_key());
        assert_eq!(
            client.open_session("inst").await.err(),
            Some(GatewayError::CredentialMissing)
        );

        let blank = GeminiClient::new(Some("   ".to_string()));
        assert_eq!(
            blank.open_session("inst").await.err(),
            Some(GatewayError::CredentialMissing)
        );
    }

    #[tokio::test]
    async fn test_streams_fragments_and_records_history() {
        if network_tests_disabled() {
            return;
        }

        let server = MockServer::start().await;
        let body = format!("{}{}", sse_text("Hi"), sse_text(" there"));

        Mock::given(method("POST"))
            .and(path("/models/gemini-test:streamGenerateContent"))
            .and(query_param("alt", "sse"))
            .and(query_param("key", "secret"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(Some("secret".to_string()))
            .with_base_url(server.uri())
            .with_model("gemini-test");
        let session = client.start_session("Be helpful").unwrap();

        let stream = session
            .send_streaming("Hello", SendOptions::default())
            .await
            .expect("stream");
        let fragments: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.expect("fragment").text)
            .collect();

        assert_eq!(fragments, vec!["Hi".to_string(), " there".to_string()]);
        assert_eq!(session.history_len(), 2);

        let history = session.history.lock().unwrap().clone();
        assert_eq!(history[1].role.as_deref(), Some("model"));
        assert_eq!(history[1].text(), "Hi there");
    }

    #[tokio::test]
    async fn test_mid_stream_error_leaves_history_untouched() {
        if network_tests_disabled() {
            return;
        }

        let server = MockServer::start().await;
        let body = format!(
            "{}data: {{\"error\":{{\"message\":\"overloaded\"}}}}\n\n{}",
            sse_text("Hi"),
            sse_text("never")
        );

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(Some("secret".to_string())).with_base_url(server.uri());
        let session = client.start_session("Be helpful").unwrap();

        let items = collect(
            session
                .send_streaming("Hello", SendOptions::default())
                .await
                .expect("stream"),
        )
        .await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0], Ok(Fragment::from("Hi")));
        assert_eq!(items[1], Err(GatewayError::Stream("overloaded".to_string())));
        assert_eq!(session.history_len(), 0);
    }

    #[tokio::test]
    async fn test_rejected_key_is_session_open_error() {
        if network_tests_disabled() {
            return;
        }

        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_string("API key not valid"))
            .mount(&server)
            .await;

        let client = GeminiClient::new(Some("bad".to_string())).with_base_url(server.uri());
        let session = client.open_session("inst").await.expect("session");

        match session.send_streaming("Hello", SendOptions::default()).await {
            Err(GatewayError::SessionOpen(msg)) => {
                assert!(msg.contains("rejected the API key"));
                assert!(msg.contains("API key not valid"));
            }
            Err(other) => panic!("expected SessionOpen, got {other:?}"),
            Ok(_) => panic!("expected an error"),
        }
    }

    #[tokio::test]
    async fn test_web_search_sources_are_deduplicated_across_chunks() {
        if network_tests_disabled() {
            return;
        }

        let server = MockServer::start().await;
        let body = format!(
            "{}{}{}",
            sse_grounded("Rates ", &[("https://a.example/rates", "A"), ("https://b.example", "B")]),
            sse_grounded("are up.", &[("https://a.example/rates", "A again"), ("https://c.example", "C")]),
            sse_grounded("", &[("https://b.example", "B")]),
        );

        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "tools": [{ "googleSearch": {} }] })))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let client = GeminiClient::new(Some("secret".to_string())).with_base_url(server.uri());
        let session = client.start_session("Be helpful").unwrap();

        let fragments: Vec<Fragment> = collect(
            session
                .send_streaming("Mortgage rates today?", SendOptions { web_search: true })
                .await
                .expect("stream"),
        )
        .await
        .into_iter()
        .map(|r| r.expect("fragment"))
        .collect();

        let sources: Vec<Source> = fragments.iter().flat_map(|f| f.sources.clone()).collect();
        assert_eq!(
            sources,
            vec![
                source("https://a.example/rates", "A"),
                source("https://b.example", "B"),
                source("https://c.example", "C"),
            ]
        );

        let text: String = fragments.iter().map(|f| f.text.as_str()).collect();
        assert_eq!(text, "Rates are up.");

        let history = session.history.lock().unwrap().clone();
        assert_eq!(history[1].text(), "Rates are up.");
    }
}
