use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeDelta, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::{Config, ParserConfig};
use crate::error::ServiceError;
use crate::fetcher::MessageRecord;
use crate::runner::{FetchRequest, Runner};

const SERVICE_NAME: &str = "telegram-parser";

const CHANNEL_KEYS: [&str; 3] = ["channel", "url", "link"];
const DATE_KEYS: [&str; 3] = ["date_from", "afterDate", "after_date"];

#[derive(Clone)]
pub struct AppState {
    pub runner: Runner,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/health", get(health))
        .route("/test", get(status))
        .route("/status", get(status))
        .route("/parse", post(parse))
        .with_state(state)
}

#[derive(Serialize)]
struct ParseResponse {
    success: bool,
    channel: String,
    count: usize,
    messages: Vec<MessageRecord>,
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": SERVICE_NAME,
        "message": "Telegram Parser is running!",
        "config": state.config.presence(),
    }))
}

async fn status(State(state): State<AppState>) -> Response {
    match state.runner.status().await {
        Ok(me) => Json(json!({ "connected": true, "me": me })).into_response(),
        Err(e) => error_response(&e, "Connection failed"),
    }
}

async fn parse(State(state): State<AppState>, body: Bytes) -> Response {
    let request = match parse_request(&body, &state.config.parser, Utc::now()) {
        Ok(request) => request,
        Err(e) => return error_response(&e, "Bad request"),
    };

    info!(
        "Parse request: channel={} limit={} cutoff={:?}",
        request.channel, request.limit, request.cutoff
    );

    let channel = request.channel.clone();
    match state.runner.fetch(request).await {
        Ok(messages) => Json(ParseResponse {
            success: true,
            channel,
            count: messages.len(),
            messages,
        })
        .into_response(),
        Err(e) => error_response(&e, "Server error while parsing channel"),
    }
}

/// Validation failures are 400 with their own message; everything else is a
/// 500 under `label` with the error text as details.
fn error_response(err: &ServiceError, label: &str) -> Response {
    match err {
        ServiceError::Validation { message, details } => {
            let mut body = json!({ "error": message });
            if let Some(details) = details {
                body["details"] = Value::String(details.clone());
            }
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
        other => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": label, "details": other.to_string() })),
        )
            .into_response(),
    }
}

/// Turn a raw `/parse` body into a request the runner can execute.
pub fn parse_request(
    body: &[u8],
    parser: &ParserConfig,
    now: DateTime<Utc>,
) -> Result<FetchRequest, ServiceError> {
    let payload: Value = serde_json::from_slice(body)
        .map_err(|e| ServiceError::validation_with("Bad JSON payload", e.to_string()))?;
    let Value::Object(fields) = payload else {
        return Err(ServiceError::validation_with(
            "Bad JSON payload",
            "expected a JSON object",
        ));
    };

    let channel = CHANNEL_KEYS
        .iter()
        .find_map(|key| match fields.get(*key) {
            Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        })
        .ok_or_else(|| ServiceError::validation("No channel provided. Use field 'channel' or 'url'."))?;

    let limit = match fields.get("limit") {
        None | Some(Value::Null) => parser.default_limit,
        Some(value) => parse_limit(value)?,
    }
    .min(parser.max_limit);

    let cutoff = parse_cutoff(&fields, now)?;

    Ok(FetchRequest {
        channel,
        limit,
        cutoff,
    })
}

fn parse_limit(value: &Value) -> Result<usize, ServiceError> {
    let parsed = match value {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    match parsed {
        Some(n) if n >= 1 => Ok(usize::try_from(n).unwrap_or(usize::MAX)),
        _ => Err(ServiceError::validation_with(
            "Invalid limit",
            format!("expected a positive integer, got {value}"),
        )),
    }
}

fn parse_cutoff(
    fields: &Map<String, Value>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, ServiceError> {
    let date = DATE_KEYS
        .iter()
        .find_map(|key| fields.get(*key).filter(|v| !v.is_null()));
    let days = fields.get("days_back").filter(|v| !v.is_null());

    match (date, days) {
        (Some(_), Some(_)) => Err(ServiceError::validation(
            "Use either date_from/afterDate or days_back, not both",
        )),
        (Some(value), None) => {
            let parsed = value.as_str().and_then(parse_date);
            match parsed {
                Some(date) => Ok(Some(date)),
                None => Err(ServiceError::validation_with(
                    "Invalid date_from",
                    format!("expected an ISO-8601 date, got {value}"),
                )),
            }
        }
        (None, Some(value)) => {
            let days = match value {
                Value::Number(n) => n.as_i64(),
                Value::String(s) => s.trim().parse::<i64>().ok(),
                _ => None,
            };
            days.filter(|d| *d >= 0)
                .and_then(TimeDelta::try_days)
                .and_then(|delta| now.checked_sub_signed(delta))
                .map(Some)
                .ok_or_else(|| ServiceError::validation("Invalid days_back"))
        }
        (None, None) => Ok(None),
    }
}

/// RFC 3339, a naive datetime taken as UTC, or a bare date at midnight UTC.
fn parse_date(input: &str) -> Option<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(date) = DateTime::parse_from_rfc3339(input) {
        return Some(date.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(input, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientManager;
    use crate::config::MessageOrder;
    use crate::platform::testing::{self, at, post, ScriptedClient, ScriptedConnector};
    use crate::runner::RunnerSettings;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn history() -> Vec<crate::platform::RawMessage> {
        vec![
            post(5, Some(at(2024, 3, 1)), "five"),
            post(4, None, "four"),
            post(3, Some(at(2024, 1, 1)), "three"),
            post(2, Some(at(2023, 12, 31)), "two"),
            post(1, Some(at(2024, 6, 1)), "one"),
        ]
    }

    fn app_with(config: Config, connector: Arc<ScriptedConnector>) -> Router {
        let config = Arc::new(config);
        let manager = ClientManager::new(connector, config.clone());
        let runner = Runner::spawn(
            manager,
            RunnerSettings {
                timeout: Duration::from_secs(5),
                order: MessageOrder::NewestFirst,
                queue_depth: 4,
            },
        );
        router(AppState { runner, config })
    }

    fn app() -> Router {
        let connector = Arc::new(ScriptedConnector::new(|| {
            Ok(ScriptedClient::new("@example", history()))
        }));
        app_with(testing::configured(), connector)
    }

    async fn send(app: Router, method: &str, uri: &str, body: &str) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn ids(body: &Value) -> Vec<i64> {
        body["messages"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_i64().unwrap())
            .collect()
    }

    fn parser() -> ParserConfig {
        Config::default().parser
    }

    #[tokio::test]
    async fn test_missing_channel_is_bad_request() {
        let (status, body) = send(app(), "POST", "/parse", r#"{"limit": 5}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn test_empty_channel_is_bad_request() {
        let (status, body) = send(app(), "POST", "/parse", r#"{"channel": ""}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(
            body["error"],
            "No channel provided. Use field 'channel' or 'url'."
        );
        assert!(body.get("details").is_none());
    }

    #[tokio::test]
    async fn test_unparsable_json_is_bad_request() {
        let (status, body) = send(app(), "POST", "/parse", "{channel: nope").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Bad JSON payload");
        assert!(body["details"].is_string());
    }

    #[tokio::test]
    async fn test_non_object_body_is_bad_request() {
        let (status, body) = send(app(), "POST", "/parse", r#"["@example"]"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "Bad JSON payload");
    }

    #[tokio::test]
    async fn test_limit_larger_than_history_returns_everything() {
        let connector = Arc::new(ScriptedConnector::new(|| {
            Ok(ScriptedClient::new(
                "@example",
                vec![
                    post(3, Some(at(2024, 3, 1)), "c"),
                    post(2, Some(at(2024, 2, 1)), "b"),
                    post(1, Some(at(2024, 1, 1)), "a"),
                ],
            ))
        }));
        let app = app_with(testing::configured(), connector);

        let (status, body) =
            send(app, "POST", "/parse", r#"{"channel": "@example", "limit": 5}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["channel"], "@example");
        assert_eq!(body["count"], 3);
        assert_eq!(ids(&body), vec![3, 2, 1]);
        assert_eq!(body["messages"][0]["date"], "2024-03-01T00:00:00+00:00");
    }

    #[tokio::test]
    async fn test_count_matches_messages_and_respects_limit() {
        let (status, body) = send(app(), "POST", "/parse", r#"{"url": "@example", "limit": "2"}"#).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 2);
        assert_eq!(ids(&body), vec![5, 4]);
        assert!(body["messages"][1]["date"].is_null());
    }

    #[tokio::test]
    async fn test_after_date_stops_at_first_older_message() {
        let (status, body) = send(
            app(),
            "POST",
            "/parse",
            r#"{"channel": "@example", "limit": 50, "afterDate": "2024-01-01T00:00:00Z"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        // id 1 is newer than the cutoff but sits behind the older id 2
        assert_eq!(ids(&body), vec![5, 4, 3]);
        assert_eq!(body["count"], 3);
    }

    #[tokio::test]
    async fn test_repeated_request_is_identical() {
        let app = app();
        let payload = r#"{"link": "example", "limit": 10}"#;
        let (_, first) = send(app.clone(), "POST", "/parse", payload).await;
        let (_, second) = send(app, "POST", "/parse", payload).await;
        assert_eq!(ids(&first), ids(&second));
    }

    #[tokio::test]
    async fn test_missing_credentials_is_server_error() {
        let connector = Arc::new(ScriptedConnector::new(|| {
            Ok(ScriptedClient::new("@example", history()))
        }));
        let app = app_with(Config::default(), connector.clone());

        let (status, body) = send(app, "POST", "/parse", r#"{"channel": "@example"}"#).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Server error while parsing channel");
        assert_eq!(body["details"], "API_ID/API_HASH not configured on server.");
        assert_eq!(connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_health_reports_presence_without_secrets() {
        let (status, body) = send(app(), "GET", "/health", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["config"]["api_id"], true);
        assert_eq!(body["config"]["session"], true);
        assert_eq!(body["config"]["phone"], false);
        assert!(!body.to_string().contains("tok"));

        let (status, _) = send(app(), "GET", "/", "").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_status_reports_identity() {
        let (status, body) = send(app(), "GET", "/status", "").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["connected"], true);
        assert_eq!(body["me"]["username"], "parser_bot");
    }

    #[tokio::test]
    async fn test_status_connection_failure() {
        let connector = Arc::new(ScriptedConnector::new(|| {
            Err(crate::platform::PlatformError::Network("refused".to_string()))
        }));
        let app = app_with(testing::configured(), connector);
        let (status, body) = send(app, "GET", "/test", "").await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["error"], "Connection failed");
        assert_eq!(body["details"], "Could not connect: network error: refused");
    }

    #[test]
    fn test_limit_defaults_and_clamps() {
        let now = at(2024, 5, 1);
        let request = parse_request(br#"{"channel": "@a"}"#, &parser(), now).unwrap();
        assert_eq!(request.limit, 10);

        let request = parse_request(br#"{"channel": "@a", "limit": 100000}"#, &parser(), now).unwrap();
        assert_eq!(request.limit, 200);
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let now = at(2024, 5, 1);
        for body in [
            r#"{"channel": "@a", "limit": 0}"#,
            r#"{"channel": "@a", "limit": -3}"#,
            r#"{"channel": "@a", "limit": "ten"}"#,
            r#"{"channel": "@a", "limit": 2.5}"#,
        ] {
            let err = parse_request(body.as_bytes(), &parser(), now).unwrap_err();
            assert!(matches!(err, ServiceError::Validation { ref message, .. } if message == "Invalid limit"));
        }
    }

    #[test]
    fn test_numeric_channel_id_accepted() {
        let request =
            parse_request(br#"{"channel": -1001234567890}"#, &parser(), at(2024, 5, 1)).unwrap();
        assert_eq!(request.channel, "-1001234567890");
    }

    #[test]
    fn test_date_formats() {
        let now = at(2024, 5, 1);
        for (input, expected) in [
            ("2024-01-01T00:00:00Z", at(2024, 1, 1)),
            ("2024-01-01T03:00:00+03:00", at(2024, 1, 1)),
            ("2024-01-01T00:00:00", at(2024, 1, 1)),
            ("2024-01-01", at(2024, 1, 1)),
        ] {
            let body = json!({ "channel": "@a", "date_from": input }).to_string();
            let request = parse_request(body.as_bytes(), &parser(), now).unwrap();
            assert_eq!(request.cutoff, Some(expected), "input {input}");
        }
    }

    #[test]
    fn test_bad_date_rejected() {
        let err = parse_request(
            br#"{"channel": "@a", "after_date": "last tuesday"}"#,
            &parser(),
            at(2024, 5, 1),
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::Validation { ref message, .. } if message == "Invalid date_from"));
    }

    #[test]
    fn test_days_back() {
        let request = parse_request(
            br#"{"channel": "@a", "days_back": 7}"#,
            &parser(),
            at(2024, 5, 8),
        )
        .unwrap();
        assert_eq!(request.cutoff, Some(at(2024, 5, 1)));

        let err = parse_request(
            br#"{"channel": "@a", "days_back": -1}"#,
            &parser(),
            at(2024, 5, 8),
        )
        .unwrap_err();
        assert_eq!(err, ServiceError::validation("Invalid days_back"));
    }

    #[test]
    fn test_date_and_days_back_conflict() {
        let err = parse_request(
            br#"{"channel": "@a", "afterDate": "2024-01-01", "days_back": 3}"#,
            &parser(),
            at(2024, 5, 8),
        )
        .unwrap_err();
        assert_eq!(
            err,
            ServiceError::validation("Use either date_from/afterDate or days_back, not both")
        );
    }
}
