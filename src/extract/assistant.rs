use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::poll::{poll_until, PollPolicy, Progress};
use super::ExtractionService;
use crate::config::{AssistantCredentials, Settings};
use crate::error::ExtractError;

const BETA_HEADER: (&str, &str) = ("OpenAI-Beta", "assistants=v2");

/// OpenAI Assistants client. One thread per document, never reused.
pub struct AssistantClient {
    client: Client,
    base_url: String,
    api_key: String,
    assistant_id: String,
    instruction: String,
    poll: PollPolicy,
    stop: Arc<AtomicBool>,
}

impl AssistantClient {
    pub fn new(
        settings: &Settings,
        credentials: AssistantCredentials,
        stop: Arc<AtomicBool>,
    ) -> Result<Self, ExtractError> {
        let client = Client::builder()
            .timeout(settings.http_timeout().max(Duration::from_secs(30)))
            .build()?;
        Ok(Self {
            client,
            base_url: settings.openai_base_url.trim_end_matches('/').to_string(),
            api_key: credentials.api_key,
            assistant_id: credentials.assistant_id,
            instruction: settings.instruction.clone(),
            poll: settings.poll_policy(),
            stop,
        })
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.client
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
    }

    fn post(&self, path: &str) -> RequestBuilder {
        self.client
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.api_key)
            .header(BETA_HEADER.0, BETA_HEADER.1)
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, ExtractError> {
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ExtractError::Api {
                status: status.as_u16(),
                message: body,
            });
        }
        Ok(resp.json().await?)
    }

    async fn upload(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(file_name.to_string())
            .mime_str("application/pdf")?;
        let form = reqwest::multipart::Form::new()
            .text("purpose", "assistants")
            .part("file", part);
        let file: Created = self.send(self.post("/files").multipart(form)).await?;
        Ok(file.id)
    }

    async fn converse(&self, thread_id: &str, file_id: &str) -> Result<String, ExtractError> {
        let message = json!({
            "role": "user",
            "content": self.instruction,
            "attachments": [{
                "file_id": file_id,
                "tools": [{ "type": "code_interpreter" }],
            }],
        });
        let _: Created = self
            .send(self.post(&format!("/threads/{}/messages", thread_id)).json(&message))
            .await?;

        let run: Run = self
            .send(
                self.post(&format!("/threads/{}/runs", thread_id))
                    .json(&json!({ "assistant_id": self.assistant_id })),
            )
            .await?;
        info!(thread_id, run_id = %run.id, "Extraction run started, polling for completion");

        let run_path = format!("/threads/{}/runs/{}", thread_id, run.id);
        let run_path = run_path.as_str();
        poll_until(&self.poll, &self.stop, || async move {
            let run: Run = self.send(self.get(run_path)).await?;
            run_progress(run)
        })
        .await?;

        let messages: MessageList = self
            .send(self.get(&format!("/threads/{}/messages?order=desc&limit=1", thread_id)))
            .await?;
        first_text(messages)
    }

    async fn cleanup(&self, thread_id: Option<&str>, file_id: &str) {
        let mut paths = vec![format!("/files/{}", file_id)];
        if let Some(t) = thread_id {
            paths.push(format!("/threads/{}", t));
        }
        for path in paths {
            let req = self
                .client
                .delete(format!("{}{}", self.base_url, path))
                .bearer_auth(&self.api_key)
                .header(BETA_HEADER.0, BETA_HEADER.1);
            match req.send().await {
                Ok(resp) if resp.status().is_success() => debug!(path = %path, "Deleted"),
                Ok(resp) => warn!(path = %path, status = %resp.status(), "Cleanup rejected"),
                Err(e) => warn!(path = %path, error = %e, "Cleanup failed"),
            }
        }
    }
}

#[async_trait]
impl ExtractionService for AssistantClient {
    async fn extract(&self, file_name: &str, bytes: Vec<u8>) -> Result<String, ExtractError> {
        let file_id = self.upload(file_name, bytes).await?;
        let thread: Created = match self.send(self.post("/threads").json(&json!({}))).await {
            Ok(t) => t,
            Err(e) => {
                self.cleanup(None, &file_id).await;
                return Err(e);
            }
        };

        let reply = self.converse(&thread.id, &file_id).await;
        self.cleanup(Some(&thread.id), &file_id).await;
        reply
    }
}

// ── Wire shapes ──

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Run {
    id: String,
    status: String,
    #[serde(default)]
    last_error: Option<RunError>,
}

#[derive(Debug, Deserialize)]
struct RunError {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<Message>,
}

#[derive(Debug, Deserialize)]
struct Message {
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart {
    Text { text: TextValue },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct TextValue {
    value: String,
}

fn run_progress(run: Run) -> Result<Progress<()>, ExtractError> {
    match run.status.as_str() {
        "completed" => Ok(Progress::Done(())),
        "queued" | "in_progress" | "cancelling" => Ok(Progress::Pending(run.status)),
        _ => {
            let detail = run
                .last_error
                .map(|e| format!("{}: {}", e.code, e.message))
                .unwrap_or_default();
            Err(ExtractError::Failed {
                status: run.status,
                detail,
            })
        }
    }
}

/// First text payload of the newest message.
fn first_text(list: MessageList) -> Result<String, ExtractError> {
    list.data
        .into_iter()
        .next()
        .and_then(|m| {
            m.content.into_iter().find_map(|part| match part {
                ContentPart::Text { text } => Some(text.value),
                ContentPart::Other => None,
            })
        })
        .ok_or(ExtractError::EmptyReply)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use axum::body::Bytes;
    use axum::extract::State;
    use axum::http::{HeaderMap, Method, StatusCode, Uri};
    use axum::{Json, Router};
    use serde_json::Value;

    use super::*;

    /// Local stand-in for the Assistants API. Logs every request line.
    #[derive(Default)]
    struct Stub {
        log: Mutex<Vec<String>>,
        runs: Mutex<VecDeque<Value>>,
        fail: Option<&'static str>,
        missing_headers: Mutex<usize>,
    }

    impl Stub {
        fn with_runs(runs: Vec<Value>) -> Self {
            Self {
                runs: Mutex::new(runs.into()),
                ..Self::default()
            }
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    async fn handle(
        State(stub): State<Arc<Stub>>,
        method: Method,
        uri: Uri,
        headers: HeaderMap,
        _body: Bytes,
    ) -> (StatusCode, Json<Value>) {
        let target = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        let line = format!("{} {}", method, target);
        stub.log.lock().unwrap().push(line.clone());

        let beta_ok = headers.get("openai-beta").is_some_and(|v| v == "assistants=v2");
        let auth_ok = headers.get("authorization").is_some_and(|v| v == "Bearer sk-test");
        if !beta_ok || !auth_ok {
            *stub.missing_headers.lock().unwrap() += 1;
        }
        if stub.fail == Some(line.as_str()) {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": {"message": "upstream exploded"}})),
            );
        }

        let body = match (method.as_str(), uri.path()) {
            ("POST", "/files") => json!({"id": "file_1", "object": "file"}),
            ("POST", "/threads") => json!({"id": "thread_1", "object": "thread"}),
            ("POST", "/threads/thread_1/messages") => json!({"id": "msg_1"}),
            ("POST", "/threads/thread_1/runs") => json!({"id": "run_1", "status": "queued"}),
            ("GET", "/threads/thread_1/runs/run_1") => stub
                .runs
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| json!({"id": "run_1", "status": "completed"})),
            ("GET", "/threads/thread_1/messages") => json!({"data": [
                {"id": "msg_2", "content": [{"type": "text", "text": {"value": "Here: {\"policy_id\":\"P1\"}"}}]}
            ]}),
            ("DELETE", _) => json!({"deleted": true}),
            _ => return (StatusCode::NOT_FOUND, Json(json!({"error": {"message": "no route"}}))),
        };
        (StatusCode::OK, Json(body))
    }

    async fn client_for(stub: Arc<Stub>) -> AssistantClient {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new().fallback(handle).with_state(stub);
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let settings = Settings {
            openai_base_url: format!("http://{}/", addr),
            poll_interval_ms: 10,
            poll_max_interval_ms: 10,
            poll_backoff: 1.0,
            extraction_timeout_secs: 5,
            ..Settings::default()
        };
        let credentials = AssistantCredentials {
            api_key: "sk-test".into(),
            assistant_id: "asst_1".into(),
        };
        AssistantClient::new(&settings, credentials, Arc::new(AtomicBool::new(false))).unwrap()
    }

    const CLEANUP: [&str; 2] = ["DELETE /files/file_1", "DELETE /threads/thread_1"];

    #[tokio::test]
    async fn full_conversation_in_order_then_cleanup() {
        let stub = Arc::new(Stub::with_runs(vec![
            json!({"id": "run_1", "status": "in_progress"}),
            json!({"id": "run_1", "status": "completed"}),
        ]));
        let client = client_for(Arc::clone(&stub)).await;

        let reply = client.extract("policy1.pdf", b"%PDF-1.7".to_vec()).await.unwrap();
        assert_eq!(reply, "Here: {\"policy_id\":\"P1\"}");
        assert_eq!(
            stub.log(),
            vec![
                "POST /files",
                "POST /threads",
                "POST /threads/thread_1/messages",
                "POST /threads/thread_1/runs",
                "GET /threads/thread_1/runs/run_1",
                "GET /threads/thread_1/runs/run_1",
                "GET /threads/thread_1/messages?order=desc&limit=1",
                CLEANUP[0],
                CLEANUP[1],
            ]
        );
        assert_eq!(*stub.missing_headers.lock().unwrap(), 0);
    }

    #[tokio::test]
    async fn failed_run_reaches_caller_and_still_cleans_up() {
        let stub = Arc::new(Stub::with_runs(vec![json!({
            "id": "run_1",
            "status": "failed",
            "last_error": {"code": "server_error", "message": "boom"}
        })]));
        let client = client_for(Arc::clone(&stub)).await;

        let err = client.extract("policy1.pdf", b"%PDF".to_vec()).await.unwrap_err();
        match err {
            ExtractError::Failed { status, detail } => {
                assert_eq!(status, "failed");
                assert_eq!(detail, "server_error: boom");
            }
            other => panic!("unexpected {:?}", other),
        }
        let log = stub.log();
        assert!(!log.iter().any(|l| l.contains("/messages?")));
        assert_eq!(&log[log.len() - 2..], &CLEANUP);
    }

    #[tokio::test]
    async fn error_status_becomes_api_error_and_cleans_up() {
        let stub = Arc::new(Stub {
            fail: Some("POST /threads/thread_1/messages"),
            ..Stub::default()
        });
        let client = client_for(Arc::clone(&stub)).await;

        let err = client.extract("policy1.pdf", b"%PDF".to_vec()).await.unwrap_err();
        match err {
            ExtractError::Api { status, message } => {
                assert_eq!(status, 500);
                assert!(message.contains("upstream exploded"));
            }
            other => panic!("unexpected {:?}", other),
        }
        let log = stub.log();
        assert!(!log.iter().any(|l| l.ends_with("/runs")));
        assert_eq!(&log[log.len() - 2..], &CLEANUP);
    }

    #[tokio::test]
    async fn thread_creation_failure_deletes_the_upload_only() {
        let stub = Arc::new(Stub {
            fail: Some("POST /threads"),
            ..Stub::default()
        });
        let client = client_for(Arc::clone(&stub)).await;

        let err = client.extract("policy1.pdf", b"%PDF".to_vec()).await.unwrap_err();
        assert!(matches!(err, ExtractError::Api { status: 500, .. }));
        assert_eq!(stub.log(), vec!["POST /files", "POST /threads", CLEANUP[0]]);
    }

    #[tokio::test]
    async fn rejected_upload_has_nothing_to_clean() {
        let stub = Arc::new(Stub {
            fail: Some("POST /files"),
            ..Stub::default()
        });
        let client = client_for(Arc::clone(&stub)).await;

        assert!(client.extract("policy1.pdf", b"%PDF".to_vec()).await.is_err());
        assert_eq!(stub.log(), vec!["POST /files"]);
    }

    fn run(json: &str) -> Run {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn run_states() {
        assert!(matches!(
            run_progress(run(r#"{"id":"run_1","status":"completed"}"#)),
            Ok(Progress::Done(()))
        ));
        assert!(matches!(
            run_progress(run(r#"{"id":"run_1","status":"in_progress","last_error":null}"#)),
            Ok(Progress::Pending(s)) if s == "in_progress"
        ));

        let err = run_progress(run(
            r#"{"id":"run_1","status":"failed","last_error":{"code":"server_error","message":"boom"}}"#,
        ))
        .unwrap_err();
        match err {
            ExtractError::Failed { status, detail } => {
                assert_eq!(status, "failed");
                assert_eq!(detail, "server_error: boom");
            }
            other => panic!("unexpected {:?}", other),
        }

        for status in ["expired", "cancelled", "incomplete", "requires_action"] {
            let json = format!(r#"{{"id":"run_1","status":"{}"}}"#, status);
            assert!(matches!(run_progress(run(&json)), Err(ExtractError::Failed { .. })));
        }
    }

    #[test]
    fn reply_is_first_text_of_first_message() {
        let list: MessageList = serde_json::from_str(
            r#"{"object":"list","data":[
                {"id":"msg_2","role":"assistant","content":[
                    {"type":"image_file","image_file":{"file_id":"file_9"}},
                    {"type":"text","text":{"value":"{\"policy_id\":\"P1\"}","annotations":[]}},
                    {"type":"text","text":{"value":"second","annotations":[]}}
                ]},
                {"id":"msg_1","role":"user","content":[{"type":"text","text":{"value":"Please extract","annotations":[]}}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(first_text(list).unwrap(), "{\"policy_id\":\"P1\"}");
    }

    #[test]
    fn empty_thread_is_empty_reply() {
        let list: MessageList = serde_json::from_str(r#"{"data":[]}"#).unwrap();
        assert!(matches!(first_text(list), Err(ExtractError::EmptyReply)));
    }
}
