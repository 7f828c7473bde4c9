use bytes::Bytes;
use rustc_hash::FxHashMap;
use tokio::sync::Mutex;


/// Absorbs retransmitted requests: maps a request's cookie to the exact reply bytes that
///  were sent for it, so a duplicate delivery is answered from here instead of being
///  processed a second time.
///
/// Eviction works in two generations. [CookieCache::evict_old] is driven by an external
///  interval task; an entry survives between one and two intervals, and a lookup hit in the
///  old generation promotes the entry back into the current one.
pub struct CookieCache {
    generations: Mutex<Generations>,
}

#[derive(Default)]
struct Generations {
    current: FxHashMap<Vec<u8>, Bytes>,
    old: FxHashMap<Vec<u8>, Bytes>,
}

impl CookieCache {
    pub fn new() -> CookieCache {
        CookieCache {
            generations: Default::default(),
        }
    }

    pub async fn lookup(&self, cookie: &[u8]) -> Option<Bytes> {
        let mut generations = self.generations.lock().await;
        if let Some(reply) = generations.current.get(cookie) {
            return Some(reply.clone());
        }
        if let Some(reply) = generations.old.remove(cookie) {
            generations.current.insert(cookie.to_vec(), reply.clone());
            return Some(reply);
        }
        None
    }

    pub async fn insert(&self, cookie: &[u8], reply: Bytes) {
        self.generations.lock().await
            .current.insert(cookie.to_vec(), reply);
    }

    /// drops the old generation and demotes the current one
    pub async fn evict_old(&self) {
        let mut generations = self.generations.lock().await;
        generations.old = std::mem::take(&mut generations.current);
    }
}
