//! Redis Streams-backed bus (durable, at-least-once delivery).
//!
//! - **Groups**: `XGROUP CREATE <stream> <group> 0 MKSTREAM`, so a new group sees
//!   the stream from the beginning.
//! - **Reads**: idle pending entries are re-claimed with `XPENDING ... IDLE` +
//!   `XCLAIM` before new entries are read with `XREADGROUP ... >`.
//! - **Dead letters**: `XADD <stream>:dlq` (see [`StreamBus::dead_letter`]).
//!
//! Blocking reads hold their connection for up to `block`, so they use dedicated
//! connections while every other command shares one multiplexed connection.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use creditflow_events::StreamMessage;

use super::{BusError, ReadRequest, StreamBus};

const MAX_IDLE_READ_CONNECTIONS: usize = 32;

pub struct RedisStreamBus {
    client: redis::Client,
    shared: OnceCell<MultiplexedConnection>,
    read_connections: Mutex<Vec<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisStreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStreamBus").finish_non_exhaustive()
    }
}

impl RedisStreamBus {
    /// `redis_url` e.g. `redis://localhost:6379`. No connection is made until first use.
    pub fn new(redis_url: impl AsRef<str>) -> Result<Self, BusError> {
        let client = redis::Client::open(redis_url.as_ref()).map_err(map_redis_error)?;
        Ok(Self {
            client,
            shared: OnceCell::new(),
            read_connections: Mutex::new(Vec::new()),
        })
    }

    async fn shared(&self) -> Result<MultiplexedConnection, BusError> {
        self.shared
            .get_or_try_init(|| async {
                self.client
                    .get_multiplexed_async_connection()
                    .await
                    .map_err(map_redis_error)
            })
            .await
            .cloned()
    }

    async fn checkout_read_connection(&self) -> Result<MultiplexedConnection, BusError> {
        if let Some(conn) = self.read_connections.lock().await.pop() {
            return Ok(conn);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis_error)
    }

    async fn checkin_read_connection(&self, conn: MultiplexedConnection) {
        let mut idle = self.read_connections.lock().await;
        if idle.len() < MAX_IDLE_READ_CONNECTIONS {
            idle.push(conn);
        }
    }

    async fn claim_idle(
        &self,
        conn: &mut MultiplexedConnection,
        request: &ReadRequest,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let min_idle_ms = request.pending_idle.as_millis() as u64;
        let mut out = Vec::new();

        for stream in &request.streams {
            let remaining = request.count.saturating_sub(out.len());
            if remaining == 0 {
                break;
            }

            let pending: StreamPendingCountReply = redis::cmd("XPENDING")
                .arg(stream)
                .arg(&request.group)
                .arg("IDLE")
                .arg(min_idle_ms)
                .arg("-")
                .arg("+")
                .arg(remaining)
                .query_async(conn)
                .await
                .map_err(map_redis_error)?;

            if pending.ids.is_empty() {
                continue;
            }

            let delivered: HashMap<String, usize> = pending
                .ids
                .iter()
                .map(|p| (p.id.clone(), p.times_delivered))
                .collect();
            let ids: Vec<&str> = pending.ids.iter().map(|p| p.id.as_str()).collect();

            let claimed: StreamClaimReply = redis::cmd("XCLAIM")
                .arg(stream)
                .arg(&request.group)
                .arg(&request.consumer)
                .arg(min_idle_ms)
                .arg(&ids)
                .query_async(conn)
                .await
                .map_err(map_redis_error)?;

            for entry in claimed.ids {
                let previous = delivered.get(&entry.id).copied().unwrap_or(0);
                let mut msg = to_message(stream, entry);
                msg.delivery_count = previous as u32 + 1;
                out.push(msg);
            }
        }

        if !out.is_empty() {
            debug!(group = %request.group, claimed = out.len(), "claimed idle pending entries");
        }
        Ok(out)
    }

    async fn read_new(
        &self,
        conn: &mut MultiplexedConnection,
        request: &ReadRequest,
    ) -> Result<Vec<StreamMessage>, BusError> {
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&request.group)
            .arg(&request.consumer)
            .arg("COUNT")
            .arg(request.count)
            .arg("BLOCK")
            .arg(request.block.as_millis() as u64)
            .arg("STREAMS")
            .arg(&request.streams)
            .arg(vec![">"; request.streams.len()])
            .query_async(conn)
            .await
            .map_err(map_redis_error)?;

        Ok(reply
            .map(|r| {
                r.keys
                    .into_iter()
                    .flat_map(|key| {
                        let stream = key.key;
                        key.ids
                            .into_iter()
                            .map(move |entry| to_message(&stream, entry))
                            .collect::<Vec<_>>()
                    })
                    .collect()
            })
            .unwrap_or_default())
    }
}

fn to_message(stream: &str, entry: StreamId) -> StreamMessage {
    let fields = entry
        .map
        .iter()
        .filter_map(|(k, v)| {
            redis::from_redis_value::<String>(v)
                .ok()
                .map(|value| (k.clone(), value))
        })
        .collect();
    StreamMessage::new(stream, entry.id, fields)
}

fn map_redis_error(err: redis::RedisError) -> BusError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        BusError::Connection(err.to_string())
    } else if err.code() == Some("NOGROUP") {
        BusError::UnknownGroup {
            stream: String::new(),
            group: err.detail().unwrap_or_default().to_string(),
        }
    } else {
        BusError::Command(err.to_string())
    }
}

#[async_trait]
impl StreamBus for RedisStreamBus {
    #[instrument(skip(self), err)]
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), BusError> {
        let mut conn = self.shared().await?;
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(_) => Ok(()),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(map_redis_error(e)),
        }
    }

    async fn read_group(&self, request: &ReadRequest) -> Result<Vec<StreamMessage>, BusError> {
        let mut conn = self.checkout_read_connection().await?;

        let result = match self.claim_idle(&mut conn, request).await {
            Ok(claimed) if !claimed.is_empty() => Ok(claimed),
            Ok(_) => self.read_new(&mut conn, request).await,
            Err(e) => Err(e),
        };

        // A connection that failed mid-command is dropped rather than reused.
        if !matches!(&result, Err(BusError::Connection(_))) {
            self.checkin_read_connection(conn).await;
        }
        result
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<u64, BusError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.shared().await?;
        redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)
    }

    async fn append(&self, stream: &str, fields: Vec<(String, String)>) -> Result<String, BusError> {
        let mut conn = self.shared().await?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in &fields {
            cmd.arg(k).arg(v);
        }
        cmd.query_async(&mut conn).await.map_err(map_redis_error)
    }

    async fn ping(&self) -> Result<(), BusError> {
        let mut conn = self.shared().await?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(map_redis_error)?;
        Ok(())
    }
}
