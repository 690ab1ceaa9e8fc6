use deadpool::managed;
use redis::aio::{ConnectionLike, MultiplexedConnection};

use super::RedisConnectionManager;
use crate::StoreError;

impl managed::Manager for RedisConnectionManager {
    type Type = MultiplexedConnection;
    type Error = StoreError;

    async fn create(&self) -> Result<MultiplexedConnection, StoreError> {
        match tokio::time::timeout(
            self.connect_timeout,
            self.client.get_multiplexed_tokio_connection(),
        )
        .await
        {
            Ok(conn) => conn.map_err(StoreError::from),
            Err(_) => Err(StoreError::Timeout(self.connect_timeout)),
        }
    }

    async fn recycle(
        &self,
        conn: &mut MultiplexedConnection,
        _: &managed::Metrics,
    ) -> managed::RecycleResult<StoreError> {
        conn.req_packed_command(&redis::cmd("PING"))
            .await
            .map(|_| ())
            .map_err(|err| managed::RecycleError::Backend(err.into()))
    }
}
