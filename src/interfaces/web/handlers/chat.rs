//! The OpenAI-compatible chat endpoint that fronts the pipelines.
//!
//! A streaming request gets one `chat.completion.chunk` per progress event,
//! a terminal chunk carrying the structured outcome, and `data: [DONE]`.
//! The pipeline task is detached: a client that disconnects stops receiving
//! deltas but never cancels a run.

use std::convert::Infallible;

use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::sse::{Event, Sse},
    response::{IntoResponse, Response},
};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tracing::info;

use crate::core::deployment::pipeline::{self, PipelineContext};
use crate::core::deployment::progress::{EventPhase, ProgressEvent, ProgressSender};
use crate::core::errors::OrchestratorError;
use crate::core::intent;
use crate::interfaces::web::AppState;
use crate::interfaces::web::schemas::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChoiceDelta, validate,
};

fn chunk_event(chunk: &ChatCompletionChunk) -> Event {
    Event::default().data(serde_json::to_string(chunk).unwrap_or_default())
}

fn event_to_chunk(completion_id: &str, event: &ProgressEvent) -> ChatCompletionChunk {
    let terminal = event.stage == "deployment" && event.phase == EventPhase::End;
    if terminal {
        let payload = event
            .data
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| event.text.clone());
        return ChatCompletionChunk::new(
            completion_id,
            ChoiceDelta {
                role: None,
                content: Some(payload),
            },
            Some("stop".to_string()),
        );
    }
    ChatCompletionChunk::new(
        completion_id,
        ChoiceDelta {
            role: None,
            content: Some(format!("[{}] {}\n", event.stage, event.text)),
        },
        None,
    )
}

fn validation_failure(completion_id: &str, stream: bool, err: &OrchestratorError) -> Response {
    if stream {
        let chunk = ChatCompletionChunk::new(
            completion_id,
            ChoiceDelta {
                role: Some("assistant".to_string()),
                content: Some(format!("{}: {}", err.kind(), err)),
            },
            Some("error".to_string()),
        );
        let stream = tokio_stream::iter(vec![
            Ok::<_, Infallible>(chunk_event(&chunk)),
            Ok(Event::default().data("[DONE]")),
        ]);
        return Sse::new(stream).into_response();
    }
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({
            "error": {
                "message": err.to_string(),
                "type": err.kind(),
                "code": 400,
            }
        })),
    )
        .into_response()
}

pub async fn chat_completions(
    State(state): State<AppState>,
    Json(mut payload): Json<ChatCompletionRequest>,
) -> Response {
    let completion_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());

    // Free-text requests may omit structured fields; let the model propose
    // them without ever overwriting what the caller supplied.
    if let Some(model) = &state.intent {
        let text = payload.user_text();
        let missing_core = payload.deployment_mode.is_none() || payload.github_repo_url.is_none();
        if missing_core && !text.trim().is_empty() {
            let mut fields = payload.to_intent_fields();
            if let Some(proposal) =
                intent::propose_missing_fields(model.as_ref(), &text, &fields).await
            {
                intent::merge_preserving(&mut fields, proposal);
                payload.apply_intent(fields);
            }
        }
    }

    let (action, request) = match validate(&payload, &state.config) {
        Ok(validated) => validated,
        Err(err) => return validation_failure(&completion_id, payload.stream, &err),
    };
    info!(
        "chat request {} (model {}): {} '{}' ({})",
        completion_id,
        payload.model.as_deref().unwrap_or(crate::interfaces::web::schemas::MODEL_ID),
        action.as_str(),
        request.id,
        request.mode.map(|m| m.as_str()).unwrap_or("recorded mode")
    );

    let (tx, rx) = tokio::sync::mpsc::channel(256);
    let ctx = PipelineContext {
        config: state.config.clone(),
        store: state.store.clone(),
        registry: state.registry.clone(),
        events: ProgressSender::new(tx),
    };

    if payload.stream {
        tokio::spawn(pipeline::run_lifecycle(ctx, action, request));

        let role_chunk = ChatCompletionChunk::new(
            &completion_id,
            ChoiceDelta {
                role: Some("assistant".to_string()),
                content: None,
            },
            None,
        );
        let head = tokio_stream::once(Ok::<_, Infallible>(chunk_event(&role_chunk)));
        let id = completion_id.clone();
        let body = ReceiverStream::new(rx)
            .map(move |event| Ok::<_, Infallible>(chunk_event(&event_to_chunk(&id, &event))));
        let tail = tokio_stream::once(Ok::<_, Infallible>(Event::default().data("[DONE]")));

        return Sse::new(head.chain(body).chain(tail)).into_response();
    }

    // Non-streaming callers only want the final outcome; events are dropped.
    drop(rx);
    let outcome = pipeline::run_lifecycle(ctx, action, request).await;
    let content = serde_json::to_string_pretty(&outcome)
        .unwrap_or_else(|_| format!("deployment {} {}", outcome.deployment_id, outcome.status));
    Json(ChatCompletionResponse::single(&completion_id, content, "stop")).into_response()
}
