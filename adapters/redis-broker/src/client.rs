use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use leaflet_cep::{BrokerClient, EncodedFields, Error, StreamBatch, StreamPosition};
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{AsyncCommands, Value};

use crate::error::BrokerError;

/// Redis Streams implementation of [`BrokerClient`] (§4.2 supplement):
/// `XADD` for append, `XGROUP CREATE MKSTREAM` (absorbing `BUSYGROUP`) for
/// `ensure_group`, `XREADGROUP` for `read_group`, `XACK` for `ack`,
/// `XRANGE` for `read_tail`, `XTRIM ... MINID` for `trim_min_id`, `XLEN`
/// for `length`.
#[derive(Clone)]
pub struct RedisBroker {
    conn: ConnectionManager,
}

impl RedisBroker {
    /// Connects to `url` (e.g. `redis://127.0.0.1:6379`), using a
    /// [`ConnectionManager`] that reconnects transparently on drop.
    pub async fn connect(url: &str) -> Result<Self, Error> {
        let client = redis::Client::open(url).map_err(|e| Error::from(BrokerError::from(e)))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| Error::from(BrokerError::from(e)))?;
        Ok(Self { conn })
    }
}

fn decode_value(field: &str, value: &Value) -> Result<String, BrokerError> {
    redis::from_redis_value(value).map_err(|_| BrokerError::BadValue(field.to_owned()))
}

fn decode_fields(map: HashMap<String, Value>) -> Result<EncodedFields, BrokerError> {
    map.iter()
        .map(|(k, v)| decode_value(k, v).map(|decoded| (k.clone(), decoded)))
        .collect()
}

#[async_trait]
impl BrokerClient for RedisBroker {
    async fn append(&self, stream: &str, fields: EncodedFields) -> Result<String, Error> {
        let mut conn = self.conn.clone();
        let pairs: Vec<(String, String)> = fields.into_iter().collect();
        let id: String = conn
            .xadd(stream, "*", &pairs)
            .await
            .map_err(|e| Error::from(BrokerError::from(e)))?;
        Ok(id)
    }

    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<()> = conn.xgroup_create_mkstream(stream, group, "0").await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(Error::from(BrokerError::from(err))),
        }
    }

    async fn read_group(
        &self,
        streams: &[(String, StreamPosition)],
        group: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        let mut conn = self.conn.clone();

        let keys: Vec<&str> = streams.iter().map(|(s, _)| s.as_str()).collect();
        let ids: Vec<&str> = streams
            .iter()
            .map(|(_, pos)| match pos {
                StreamPosition::New => ">",
                StreamPosition::Pending => "0",
            })
            .collect();

        let mut options = StreamReadOptions::default().group(group, consumer).count(max);
        if !block.is_zero() {
            options = options.block(block.as_millis() as usize);
        }

        let reply: StreamReadReply = conn
            .xread_options(&keys, &ids, &options)
            .await
            .map_err(|e| Error::from(BrokerError::from(e)))?;

        let mut batches = Vec::with_capacity(reply.keys.len());
        for key in reply.keys {
            let mut entries = Vec::with_capacity(key.ids.len());
            for entry in key.ids {
                let fields = decode_fields(entry.map).map_err(Error::from)?;
                entries.push((entry.id, fields));
            }
            if !entries.is_empty() {
                batches.push(StreamBatch {
                    stream: key.key,
                    entries,
                });
            }
        }

        Ok(batches)
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> Result<(), Error> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let _: i64 = conn
            .xack(stream, group, ids)
            .await
            .map_err(|e| Error::from(BrokerError::from(e)))?;
        Ok(())
    }

    async fn read_tail(
        &self,
        positions: &[(String, String)],
        max: usize,
        _block: Duration,
    ) -> Result<Vec<StreamBatch>, Error> {
        let mut conn = self.conn.clone();
        let mut batches = Vec::with_capacity(positions.len());

        for (stream, after_id) in positions {
            let start = if after_id.is_empty() || after_id == "0" {
                "-".to_owned()
            } else {
                format!("({after_id}")
            };

            let reply: redis::streams::StreamRangeReply = conn
                .xrange_count(stream, start, "+", max)
                .await
                .map_err(|e| Error::from(BrokerError::from(e)))?;

            let mut entries = Vec::with_capacity(reply.ids.len());
            for entry in reply.ids {
                let fields = decode_fields(entry.map).map_err(Error::from)?;
                entries.push((entry.id, fields));
            }

            if !entries.is_empty() {
                batches.push(StreamBatch {
                    stream: stream.clone(),
                    entries,
                });
            }
        }

        Ok(batches)
    }

    async fn trim_min_id(&self, stream: &str, min_id: &str) -> Result<(), Error> {
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = redis::cmd("XTRIM")
            .arg(stream)
            .arg("MINID")
            .arg(min_id)
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            // no-op on a stream that doesn't exist yet
            Err(err) if err.code() == Some("ERR") && err.to_string().contains("no such key") => Ok(()),
            Err(err) => Err(Error::from(BrokerError::from(err))),
        }
    }

    async fn length(&self, stream: &str) -> Result<u64, Error> {
        let mut conn = self.conn.clone();
        let len: u64 = conn
            .xlen(stream)
            .await
            .map_err(|e| Error::from(BrokerError::from(e)))?;
        Ok(len)
    }
}
