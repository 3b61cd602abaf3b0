use crate::store::SharedStore;
use crate::CrawlError;
use redis::{Commands, Connection};
use std::sync::Mutex;
use tracing::info;

/// `SharedStore` over a single Redis connection. Bit arrays are Redis
/// strings addressed with SETBIT/GETBIT, queues are lists (RPUSH/LPOP).
/// Batches go out as one atomic pipeline.
pub struct RedisStore {
    conn: Mutex<Connection>,
}

impl RedisStore {
    pub fn connect(url: &str) -> Result<Self, CrawlError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection()?;
        info!(url, "connected to shared store");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> redis::RedisResult<T>,
    ) -> Result<T, CrawlError> {
        let mut conn = self.conn.lock().map_err(|_| CrawlError::poisoned("redis connection"))?;
        Ok(f(&mut conn)?)
    }
}

impl SharedStore for RedisStore {
    fn set_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError> {
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for &offset in offsets {
                pipe.setbit(key, offset as usize, true);
            }
            pipe.query::<Vec<bool>>(conn)
        })
    }

    fn get_bits(&self, key: &str, offsets: &[u64]) -> Result<Vec<bool>, CrawlError> {
        if offsets.is_empty() {
            return Ok(Vec::new());
        }
        self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            for &offset in offsets {
                pipe.getbit(key, offset as usize);
            }
            pipe.query::<Vec<bool>>(conn)
        })
    }

    fn push_many(&self, key: &str, values: Vec<Vec<u8>>) -> Result<usize, CrawlError> {
        if values.is_empty() {
            return self.list_len(key);
        }
        self.with_conn(|conn| conn.rpush::<_, _, usize>(key, values))
    }

    fn pop_many(&self, key: &str, count: usize) -> Result<Vec<Vec<u8>>, CrawlError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let popped: Vec<Option<Vec<u8>>> = self.with_conn(|conn| {
            let mut pipe = redis::pipe();
            pipe.atomic();
            for _ in 0..count {
                pipe.lpop(key, None);
            }
            pipe.query(conn)
        })?;
        Ok(popped.into_iter().flatten().collect())
    }

    fn list_len(&self, key: &str) -> Result<usize, CrawlError> {
        self.with_conn(|conn| conn.llen::<_, usize>(key))
    }

    fn delete(&self, key: &str) -> Result<(), CrawlError> {
        self.with_conn(|conn| conn.del::<_, ()>(key))
    }

    fn exists(&self, key: &str) -> Result<bool, CrawlError> {
        self.with_conn(|conn| conn.exists::<_, bool>(key))
    }
}
