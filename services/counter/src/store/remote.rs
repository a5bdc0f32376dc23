//! Remote counter store speaking the Upstash Redis REST protocol.
//!
//! Single command: `POST {url}` with a JSON array body such as
//! `["GET", "count:profile"]`, answered by `{"result": ...}` or
//! `{"error": "..."}`. Several commands: `POST {url}/pipeline` with an array
//! of arrays, answered by an array of such objects.

use super::{count_key, users_key, visitors_key, BackendKind, CounterStore};
use crate::error::StoreError;
use crate::model::{DayVisitors, HitOutcome, RemovalOutcome, UserOutcome};
use crate::retention::{day_stamp, RetentionPolicy};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// SADD, conditional INCR, EXPIRE and GET as one atomic server-side step.
/// KEYS: day set, count key. ARGV: fingerprint, ttl seconds.
const REGISTER_HIT_SCRIPT: &str = r#"
local added = redis.call('SADD', KEYS[1], ARGV[1])
if added == 1 then
  redis.call('INCR', KEYS[2])
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
local total = tonumber(redis.call('GET', KEYS[2]) or '0')
return {added, total}
"#;

#[derive(Debug, Deserialize)]
struct Reply {
    #[serde(default)]
    result: Value,
    error: Option<String>,
}

impl Reply {
    fn into_result(self) -> Result<Value, StoreError> {
        match self.error {
            Some(error) => Err(StoreError::Remote(error)),
            None => Ok(self.result),
        }
    }
}

/// Remote key/value + set store client
#[derive(Clone)]
pub struct RemoteStore {
    http: Client,
    base_url: String,
    token: String,
    retention: RetentionPolicy,
}

impl RemoteStore {
    /// Create a client. `timeout` bounds each HTTP round-trip.
    pub fn new(url: &str, token: &str, timeout: Duration) -> Result<Self, StoreError> {
        let http = Client::builder().timeout(timeout).build()?;
        let base_url = url.trim_end_matches('/').to_string();

        info!(url = %base_url, "Remote counter store configured");

        Ok(Self {
            http,
            base_url,
            token: token.to_string(),
            retention: RetentionPolicy::default(),
        })
    }

    async fn command(&self, args: Value) -> Result<Value, StoreError> {
        let response = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        let reply: Reply = serde_json::from_str(&body).map_err(|_| {
            StoreError::Protocol(format!("HTTP {}: {}", status, truncate(&body)))
        })?;
        reply.into_result()
    }

    async fn pipeline(&self, commands: Vec<Value>) -> Result<Vec<Value>, StoreError> {
        let expected = commands.len();
        let response = self
            .http
            .post(format!("{}/pipeline", self.base_url))
            .bearer_auth(&self.token)
            .json(&commands)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if let Ok(replies) = serde_json::from_str::<Vec<Reply>>(&body) {
            if replies.len() != expected {
                return Err(StoreError::Protocol(format!(
                    "pipeline returned {} replies for {} commands",
                    replies.len(),
                    expected
                )));
            }
            return replies.into_iter().map(Reply::into_result).collect();
        }

        // Whole-request failures come back as a single error object
        match serde_json::from_str::<Reply>(&body) {
            Ok(reply) => Err(StoreError::Remote(
                reply.error.unwrap_or_else(|| format!("HTTP {}", status)),
            )),
            Err(_) => Err(StoreError::Protocol(format!(
                "HTTP {}: {}",
                status,
                truncate(&body)
            ))),
        }
    }

    /// Cardinality-returning set update (`SADD`/`SREM` followed by `SCARD`)
    async fn set_update(
        &self,
        verb: &str,
        set: &str,
        member: &str,
    ) -> Result<(bool, u64), StoreError> {
        let replies = self
            .pipeline(vec![json!([verb, set, member]), json!(["SCARD", set])])
            .await?;
        let changed = as_u64(&replies[0])? > 0;
        let total = as_u64(&replies[1])?;
        Ok((changed, total))
    }
}

/// Redis integers arrive as JSON numbers, `GET` values as strings, missing
/// keys as null.
fn as_u64(value: &Value) -> Result<u64, StoreError> {
    match value {
        Value::Null => Ok(0),
        Value::Number(n) => n
            .as_u64()
            .or_else(|| n.as_i64().map(|v| v.max(0) as u64))
            .ok_or_else(|| StoreError::Protocol(format!("not an integer: {}", n))),
        Value::String(s) => s
            .parse()
            .map_err(|_| StoreError::Protocol(format!("not an integer: {:?}", s))),
        other => Err(StoreError::Protocol(format!("not an integer: {}", other))),
    }
}

fn truncate(body: &str) -> &str {
    let end = body
        .char_indices()
        .nth(200)
        .map_or(body.len(), |(i, _)| i);
    &body[..end]
}

#[async_trait]
impl CounterStore for RemoteStore {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    async fn ping(&self) -> Result<(), StoreError> {
        match self.command(json!(["PING"])).await? {
            Value::String(s) if s == "PONG" => Ok(()),
            other => Err(StoreError::Protocol(format!("unexpected PING reply: {}", other))),
        }
    }

    #[instrument(skip(self), level = "debug")]
    async fn register_hit(
        &self,
        key: &str,
        fingerprint: &str,
        today: NaiveDate,
    ) -> Result<HitOutcome, StoreError> {
        let day_set = visitors_key(key, &day_stamp(today));
        let ttl = self.retention.ttl_secs().to_string();

        let result = self
            .command(json!([
                "EVAL",
                REGISTER_HIT_SCRIPT,
                "2",
                day_set,
                count_key(key),
                fingerprint,
                ttl
            ]))
            .await?;

        let Value::Array(items) = &result else {
            return Err(StoreError::Protocol(format!(
                "unexpected script reply: {}",
                result
            )));
        };
        if items.len() != 2 {
            return Err(StoreError::Protocol(format!(
                "script returned {} values",
                items.len()
            )));
        }

        let outcome = HitOutcome {
            added: as_u64(&items[0])? == 1,
            total: as_u64(&items[1])?,
        };
        debug!(added = outcome.added, total = outcome.total, "Remote hit registered");
        Ok(outcome)
    }

    async fn total(&self, key: &str) -> Result<u64, StoreError> {
        as_u64(&self.command(json!(["GET", count_key(key)])).await?)
    }

    #[instrument(skip(self, identity), level = "debug")]
    async fn add_user(&self, key: &str, identity: &str) -> Result<UserOutcome, StoreError> {
        let (added, total) = self.set_update("SADD", &users_key(key), identity).await?;
        Ok(UserOutcome { added, total })
    }

    #[instrument(skip(self, identity), level = "debug")]
    async fn remove_user(&self, key: &str, identity: &str) -> Result<RemovalOutcome, StoreError> {
        let (removed, total) = self.set_update("SREM", &users_key(key), identity).await?;
        Ok(RemovalOutcome { removed, total })
    }

    async fn user_count(&self, key: &str) -> Result<u64, StoreError> {
        as_u64(&self.command(json!(["SCARD", users_key(key)])).await?)
    }

    /// Day sets are not enumerable here, so only the last
    /// `RESET_LOOKBACK_DAYS` are deleted; older ones expire through their TTL.
    #[instrument(skip(self), level = "debug")]
    async fn reset(&self, key: &str, today: NaiveDate) -> Result<(), StoreError> {
        let mut commands = vec![json!(["DEL", users_key(key)]), json!(["DEL", count_key(key)])];
        commands.extend(
            self.retention
                .reset_days(today)
                .into_iter()
                .map(|day| json!(["DEL", visitors_key(key, &day)])),
        );

        self.pipeline(commands).await?;
        Ok(())
    }

    async fn day_visitors(
        &self,
        key: &str,
        day: NaiveDate,
        sample_limit: usize,
    ) -> Result<DayVisitors, StoreError> {
        let day = day_stamp(day);
        let set = visitors_key(key, &day);
        let replies = self
            .pipeline(vec![json!(["SCARD", set]), json!(["SMEMBERS", set])])
            .await?;

        let unique_visitors = as_u64(&replies[0])?;
        let sample = match &replies[1] {
            Value::Array(members) => members
                .iter()
                .filter_map(|m| m.as_str().map(str::to_string))
                .take(sample_limit)
                .collect(),
            _ => Vec::new(),
        };

        Ok(DayVisitors {
            day,
            unique_visitors,
            sample,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    async fn store_for(server: &MockServer) -> RemoteStore {
        RemoteStore::new(&server.uri(), "tok", Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_as_u64_accepts_redis_shapes() {
        assert_eq!(as_u64(&json!(null)).unwrap(), 0);
        assert_eq!(as_u64(&json!(3)).unwrap(), 3);
        assert_eq!(as_u64(&json!("12")).unwrap(), 12);
        assert!(as_u64(&json!("abc")).is_err());
        assert!(as_u64(&json!([1])).is_err());
    }

    #[tokio::test]
    async fn test_total_sends_get_with_bearer_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(json!(["GET", "count:profile"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "17"})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert_eq!(store.total("profile").await.unwrap(), 17);
    }

    #[tokio::test]
    async fn test_total_of_missing_key_is_zero() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": null})))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert_eq!(store.total("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_register_hit_runs_script_with_ttl() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/"))
            .and(body_json(json!([
                "EVAL",
                REGISTER_HIT_SCRIPT,
                "2",
                "visitors:profile:2024-03-01",
                "count:profile",
                "fp",
                "691200"
            ])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [1, 5]})))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let outcome = store
            .register_hit("profile", "fp", date(2024, 3, 1))
            .await
            .unwrap();

        assert_eq!(outcome, HitOutcome { added: true, total: 5 });
    }

    #[tokio::test]
    async fn test_register_hit_duplicate() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": [0, 5]})))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let outcome = store
            .register_hit("profile", "fp", date(2024, 3, 1))
            .await
            .unwrap();

        assert_eq!(outcome, HitOutcome { added: false, total: 5 });
    }

    #[tokio::test]
    async fn test_error_reply_becomes_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(401).set_body_json(json!({"error": "Unauthorized"})),
            )
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        match store.total("profile").await {
            Err(StoreError::Remote(msg)) => assert_eq!(msg, "Unauthorized"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_json_reply_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(502).set_body_string("Bad Gateway"))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(matches!(
            store.total("profile").await,
            Err(StoreError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_add_user_uses_pipeline() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .and(body_json(json!([
                ["SADD", "users:profile", "id-1"],
                ["SCARD", "users:profile"]
            ])))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"result": 1}, {"result": 3}])),
            )
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let outcome = store.add_user("profile", "id-1").await.unwrap();
        assert_eq!(outcome, UserOutcome { added: true, total: 3 });
    }

    #[tokio::test]
    async fn test_remove_user_absent_member() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([{"result": 0}, {"result": 2}])),
            )
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let outcome = store.remove_user("profile", "id-9").await.unwrap();
        assert_eq!(outcome, RemovalOutcome { removed: false, total: 2 });
    }

    #[tokio::test]
    async fn test_pipeline_command_error_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                json!([{"error": "WRONGTYPE Operation against a key"}, {"result": 0}]),
            ))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        assert!(matches!(
            store.add_user("profile", "id-1").await,
            Err(StoreError::Remote(_))
        ));
    }

    #[tokio::test]
    async fn test_reset_deletes_users_total_and_lookback_days() {
        let server = MockServer::start().await;
        let today = date(2024, 3, 5);

        let mut expected = vec![
            json!(["DEL", "users:profile"]),
            json!(["DEL", "count:profile"]),
        ];
        for day in RetentionPolicy::default().reset_days(today) {
            expected.push(json!(["DEL", format!("visitors:profile:{}", day)]));
        }
        let replies: Vec<Value> = (0..expected.len()).map(|_| json!({"result": 0})).collect();

        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .and(body_json(Value::Array(expected)))
            .respond_with(ResponseTemplate::new(200).set_body_json(Value::Array(replies)))
            .expect(1)
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store.reset("profile", today).await.unwrap();
    }

    #[tokio::test]
    async fn test_day_visitors_sample() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/pipeline"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {"result": 3},
                {"result": ["a", "b", "c"]}
            ])))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        let visitors = store
            .day_visitors("profile", date(2024, 3, 1), 2)
            .await
            .unwrap();

        assert_eq!(visitors.day, "2024-03-01");
        assert_eq!(visitors.unique_visitors, 3);
        assert_eq!(visitors.sample, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn test_ping() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_json(json!(["PING"])))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": "PONG"})))
            .mount(&server)
            .await;

        let store = store_for(&server).await;
        store.ping().await.unwrap();
    }
}
