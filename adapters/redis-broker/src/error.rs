//! Backend-specific error type for the Redis broker adapter, converted
//! into [`leaflet_cep::Error`] at the [`BrokerClient`][leaflet_cep::BrokerClient]
//! trait boundary so no raw `redis` error crosses it.

use leaflet_cep::Error;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("redis command failed: {0}")]
    Redis(#[source] redis::RedisError),

    #[error("missing field `{0}` in stream entry")]
    MissingField(&'static str),

    #[error("unexpected value type for field `{0}`")]
    BadValue(String),
}

impl From<redis::RedisError> for BrokerError {
    fn from(err: redis::RedisError) -> Self {
        BrokerError::Redis(err)
    }
}

impl From<BrokerError> for Error {
    fn from(err: BrokerError) -> Self {
        match &err {
            BrokerError::Redis(redis_err) if is_transient(redis_err) => {
                Error::Transient(anyhow::Error::new(err))
            }
            BrokerError::Redis(_) => Error::Permanent(anyhow::Error::new(err)),
            BrokerError::MissingField(_) | BrokerError::BadValue(_) => Error::malformed(err.to_string()),
        }
    }
}

fn is_transient(err: &redis::RedisError) -> bool {
    err.is_connection_dropped() || err.is_timeout() || matches!(err.kind(), redis::ErrorKind::IoError)
}
