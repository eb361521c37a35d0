use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use rand::Rng;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::broadcast;
use tokio::time::{sleep, Duration};
use tracing::{error, warn};

use crate::cache::{SharedCache, TraceIdSubscriber, RELATION_EXPIRE_SECS};
use crate::error::ReceiverError;
use crate::model::{OnOffMetricGroup, Trace};

const KEY_TRACE: &str = "ps-span-trace";
const KEY_METRIC: &str = "ps-onoff-metric";
const KEY_SIGNAL: &str = "ps-signal";
const KEY_LAST_TRACE: &str = "ps-last-trace";
const KEY_SENT_RELATION: &str = "ps-sent-relation";
const KEY_TRACE_INDEX: &str = "ps-trace-index";
const KEY_SAMPLE_VALUE: &str = "ps-sample-value";
const KEY_SAMPLE_TIME: &str = "ps-sample-time";
const KEY_SAMPLE_LOCK: &str = "ps-sample-lock";

const CHANNEL_NORMAL: &str = "ps-normal-channel";
const CHANNEL_SLOW: &str = "ps-slow-channel";
const CHANNEL_ERROR: &str = "ps-error-channel";

const STREAM_REPORT: &str = "ps-report-stream";
const STREAM_GROUP: &str = "ps-report-group";

/// Shared back-end of the trace cache. Lists hold serialized traces and
/// metric groups per trace id, the report-id queue is a stream with a
/// consumer group (one replica consumes each id), sampled ids fan out over
/// pub/sub.
pub struct RedisCache {
    client: redis::Client,
    manager: ConnectionManager,
    expire_time: i64,
    consumer_name: String,
}

impl RedisCache {
    pub async fn connect(
        address: &str,
        password: &str,
        expire_time: i64,
    ) -> Result<RedisCache, ReceiverError> {
        let url = if password.is_empty() {
            format!("redis://{address}/")
        } else {
            format!("redis://:{password}@{address}/")
        };
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let expire_time = if expire_time <= 0 { 60 } else { expire_time };
        let consumer_name = format!(
            "consumer-{}-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or(0),
            rand::thread_rng().gen_range(0..100)
        );
        Ok(RedisCache {
            client,
            manager,
            expire_time,
            consumer_name,
        })
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }

    async fn store_list(&self, key: String, data: String) {
        let mut conn = self.conn();
        if let Err(err) = conn.rpush::<_, _, ()>(&key, data).await {
            warn!(key, %err, "store failed");
            return;
        }
        if let Err(err) = conn.expire::<_, ()>(&key, self.expire_time as i64).await {
            warn!(key, %err, "expire failed");
        }
    }

    async fn get_list(&self, key: String) -> Vec<String> {
        let mut conn = self.conn();
        match conn.lrange::<_, Vec<String>>(&key, 0, -1).await {
            Ok(items) => items,
            Err(err) => {
                warn!(key, %err, "lrange failed");
                Vec::new()
            }
        }
    }

    async fn get_list_size(&self, key: String) -> usize {
        let mut conn = self.conn();
        conn.llen::<_, usize>(&key).await.unwrap_or(0)
    }

    async fn set_with_expire(&self, key: &str, value: i64, expire_secs: i64) {
        let mut conn = self.conn();
        if let Err(err) = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(expire_secs.max(1))
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!(key, %err, "set failed");
        }
    }

    async fn set_nx_with_expire(&self, key: &str, value: &str, expire_secs: i64) -> bool {
        let mut conn = self.conn();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("EX")
            .arg(expire_secs.max(1))
            .query_async::<_, Option<String>>(&mut conn)
            .await
            .map(|reply| reply.is_some())
            .unwrap_or(false)
    }

    async fn get_int(&self, key: &str, default: i64) -> i64 {
        let mut conn = self.conn();
        match conn.get::<_, Option<i64>>(key).await {
            Ok(Some(value)) => value,
            Ok(None) => default,
            Err(err) => {
                warn!(key, %err, "get failed");
                default
            }
        }
    }
}

#[async_trait]
impl SharedCache for RedisCache {
    fn is_local(&self) -> bool {
        false
    }

    async fn store_trace(&self, trace: &Trace, json: Option<String>) {
        let payload = match json {
            Some(json) => json,
            None => match serde_json::to_string(trace) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%err, "serialize trace failed");
                    return;
                }
            },
        };
        self.store_list(format!("{KEY_TRACE}-{}", trace.labels.trace_id), payload)
            .await;
    }

    async fn get_traces(&self, trace_id: &str) -> Vec<Trace> {
        self.get_list(format!("{KEY_TRACE}-{trace_id}"))
            .await
            .iter()
            .filter_map(|json| match Trace::from_json(json) {
                Ok(trace) => Some(trace),
                Err(err) => {
                    warn!(trace_id, %err, "skip malformed trace payload");
                    None
                }
            })
            .collect()
    }

    async fn get_trace_size(&self, trace_id: &str) -> usize {
        self.get_list_size(format!("{KEY_TRACE}-{trace_id}")).await
    }

    async fn store_metric(&self, metric: &OnOffMetricGroup, json: Option<String>) {
        let payload = match json {
            Some(json) => json,
            None => match serde_json::to_string(metric) {
                Ok(json) => json,
                Err(err) => {
                    warn!(%err, "serialize metric failed");
                    return;
                }
            },
        };
        self.store_list(format!("{KEY_METRIC}-{}", metric.trace_id), payload)
            .await;
    }

    async fn get_metrics(&self, trace_id: &str) -> Vec<OnOffMetricGroup> {
        self.get_list(format!("{KEY_METRIC}-{trace_id}"))
            .await
            .iter()
            .filter_map(|json| OnOffMetricGroup::from_json(json).ok())
            .collect()
    }

    async fn get_metric_size(&self, trace_id: &str) -> usize {
        self.get_list_size(format!("{KEY_METRIC}-{trace_id}")).await
    }

    async fn record_trace_time(&self, trace_id: &str, nanos: i64) {
        self.set_with_expire(&format!("{KEY_LAST_TRACE}-{trace_id}"), nanos, self.expire_time)
            .await;
    }

    async fn get_trace_time(&self, trace_id: &str) -> i64 {
        self.get_int(&format!("{KEY_LAST_TRACE}-{trace_id}"), 0).await
    }

    async fn incr_trace_index(&self) -> i64 {
        let mut conn = self.conn();
        match conn.incr::<_, _, i64>(KEY_TRACE_INDEX, 1).await {
            Ok(index) => index,
            Err(err) => {
                warn!(%err, "incr trace index failed");
                -1
            }
        }
    }

    async fn get_trace_index(&self) -> i64 {
        self.get_int(KEY_TRACE_INDEX, -1).await
    }

    async fn notify_report_id(&self, trace_id: &str) {
        let mut conn = self.conn();
        if let Err(err) = conn
            .xadd::<_, _, _, _, ()>(STREAM_REPORT, "*", &[("message", trace_id)])
            .await
        {
            warn!(trace_id, %err, "notify report id failed");
        }
    }

    async fn subscribe_report_ids(
        &self,
        subscriber: Arc<dyn TraceIdSubscriber>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut stop = shutdown.subscribe();
        let options = StreamReadOptions::default()
            .group(STREAM_GROUP, &self.consumer_name)
            .count(1)
            .block(1000);
        loop {
            let mut conn = self.conn();
            let reply = tokio::select! {
                reply = conn.xread_options::<_, _, StreamReadReply>(
                    &[STREAM_REPORT],
                    &[">"],
                    &options,
                ) => reply,
                _ = stop.recv() => return,
            };
            match reply {
                Ok(reply) => {
                    for key in reply.keys {
                        for entry in key.ids {
                            if let Some(value) = entry.map.get("message") {
                                if let Ok(trace_id) = redis::from_redis_value::<String>(value) {
                                    subscriber.consume(trace_id).await;
                                }
                            }
                            if let Err(err) = conn
                                .xack::<_, _, _, ()>(
                                    STREAM_REPORT,
                                    STREAM_GROUP,
                                    &[entry.id.as_str()],
                                )
                                .await
                            {
                                error!(%err, "ack report id failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, "report stream read failed");
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn notify_sampled_ids(
        &self,
        normal: Vec<String>,
        slow: Vec<String>,
        error: Vec<String>,
    ) {
        let mut conn = self.conn();
        for (channel, ids) in [
            (CHANNEL_NORMAL, normal),
            (CHANNEL_SLOW, slow),
            (CHANNEL_ERROR, error),
        ] {
            for trace_id in ids {
                if let Err(err) = conn.publish::<_, _, ()>(channel, trace_id).await {
                    warn!(channel, %err, "publish sampled id failed");
                }
            }
        }
    }

    async fn subscribe_sampled_ids(
        &self,
        normal: Arc<dyn TraceIdSubscriber>,
        slow: Arc<dyn TraceIdSubscriber>,
        error: Arc<dyn TraceIdSubscriber>,
        shutdown: broadcast::Sender<()>,
    ) {
        let mut stop = shutdown.subscribe();
        loop {
            let pubsub = match self.client.get_async_connection().await {
                Ok(conn) => conn.into_pubsub(),
                Err(err) => {
                    warn!(%err, "pubsub connect failed");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };
            let mut pubsub = pubsub;
            for channel in [CHANNEL_NORMAL, CHANNEL_SLOW, CHANNEL_ERROR] {
                if let Err(err) = pubsub.subscribe(channel).await {
                    warn!(channel, %err, "subscribe failed");
                }
            }
            let mut messages = pubsub.on_message();
            loop {
                tokio::select! {
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let channel = message.get_channel_name().to_string();
                        let Ok(trace_id) = message.get_payload::<String>() else {
                            continue;
                        };
                        match channel.as_str() {
                            CHANNEL_NORMAL => normal.consume(trace_id).await,
                            CHANNEL_SLOW => slow.consume(trace_id).await,
                            CHANNEL_ERROR => error.consume(trace_id).await,
                            _ => {}
                        }
                    }
                    _ = stop.recv() => return,
                }
            }
            // Connection dropped, rebuild the subscription.
            sleep(Duration::from_secs(1)).await;
        }
    }

    async fn store_signal(&self, node_ip: &str, payload: String) {
        self.store_list(format!("{KEY_SIGNAL}-{node_ip}"), payload)
            .await;
    }

    async fn drain_signals(&self, node_ip: &str) -> Vec<String> {
        let key = format!("{KEY_SIGNAL}-{node_ip}");
        let signals = self.get_list(key.clone()).await;
        if !signals.is_empty() {
            let mut conn = self.conn();
            if let Err(err) = conn.ltrim::<_, ()>(&key, signals.len() as isize, -1).await {
                warn!(key, %err, "trim signals failed");
            }
        }
        signals
    }

    async fn store_relation_id(&self, key: &str, trace_id: &str) {
        self.set_nx_with_expire(
            &format!("{KEY_SENT_RELATION}-{key}"),
            trace_id,
            RELATION_EXPIRE_SECS,
        )
        .await;
    }

    async fn get_relation_id(&self, key: &str) -> Option<String> {
        let mut conn = self.conn();
        conn.get::<_, Option<String>>(format!("{KEY_SENT_RELATION}-{key}"))
            .await
            .unwrap_or(None)
    }

    async fn get_sample_value(&self) -> i64 {
        self.get_int(KEY_SAMPLE_VALUE, 0).await
    }

    async fn init_sample_value(&self, value: i64, expire_secs: i64) {
        self.set_nx_with_expire(KEY_SAMPLE_VALUE, &value.to_string(), expire_secs * 2)
            .await;
        self.set_nx_with_expire(KEY_SAMPLE_TIME, &value.to_string(), expire_secs)
            .await;
    }

    async fn set_sample_value(&self, value: i64, expire_secs: i64) {
        self.set_with_expire(KEY_SAMPLE_VALUE, value, expire_secs * 2)
            .await;
        self.set_with_expire(KEY_SAMPLE_TIME, value, expire_secs).await;
    }

    async fn sample_time_expired(&self) -> bool {
        let mut conn = self.conn();
        let exists = conn
            .exists::<_, bool>(KEY_SAMPLE_TIME)
            .await
            .unwrap_or(true);
        if exists {
            return false;
        }
        // One replica wins the decay for this window.
        self.set_nx_with_expire(KEY_SAMPLE_LOCK, "1", 10).await
    }

    async fn start(self: Arc<Self>, _shutdown: broadcast::Sender<()>) {
        let mut conn = self.conn();
        if let Err(err) = conn
            .xgroup_create_mkstream::<_, _, _, ()>(STREAM_REPORT, STREAM_GROUP, "$")
            .await
        {
            // BUSYGROUP just means another replica created it first.
            if !err.to_string().contains("BUSYGROUP") {
                error!(%err, "create report consumer group failed");
            }
        }
    }
}
