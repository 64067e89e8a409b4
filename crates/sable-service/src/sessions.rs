//! UDP session state and the session cache.
//!
//! A session is identified by the client's opaque 64-bit session ID and
//! holds separate AEAD ciphers per direction, a monotonic reply packet
//! counter, and a sliding-window replay filter for received counters.
//! Sessions live in a TTL'd cache with bounded capacity; touching a
//! session refreshes its age, and the oldest entry is evicted under
//! pressure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use rand::rngs::OsRng;
use rand::RngCore;

use sable_crypto::{session_key, AeadCipher, CounterWindow, KeyedXof, Method};
use sable_proto::ProtocolError;

/// State for one UDP session.
pub struct UdpSession {
    /// Server-chosen session ID used in replies.
    pub(crate) session_id: u64,
    /// Client's session ID, fixed at creation.
    pub(crate) remote_session_id: u64,
    /// Reply counter; the first reply carries packet ID 0.
    next_packet_id: AtomicU64,
    /// Replay filter over received packet IDs.
    window: Mutex<CounterWindow>,
    /// Seals replies. `None` in whole-packet (XChaCha) mode, where the
    /// service-wide cipher is used instead.
    pub(crate) send_cipher: Option<AeadCipher>,
    /// Opens received bodies. `None` in whole-packet mode.
    pub(crate) recv_cipher: Option<AeadCipher>,
    /// Nonce stream for whole-packet replies.
    pub(crate) rng: Option<Mutex<KeyedXof>>,
    /// Where the client last sent from; replies go here.
    remote_addr: Mutex<Option<SocketAddr>>,
}

impl UdpSession {
    /// Create session state for a newly observed remote session ID.
    ///
    /// `remote_key_material` is the 8-byte big-endian remote session ID
    /// as it appeared in the decrypted packet header; present only in
    /// the separate-header (AES) modes. `whole_packet` selects the
    /// XChaCha layout, where per-session ciphers are not used.
    pub(crate) fn new(
        method: Method,
        psk: &[u8],
        remote_session_id: u64,
        remote_key_material: Option<&[u8]>,
        whole_packet: bool,
    ) -> Result<Self, ProtocolError> {
        let (session_id, rng) = if whole_packet {
            let mut rng = KeyedXof::from_entropy();
            (rng.next_u64(), Some(Mutex::new(rng)))
        } else {
            (OsRng.next_u64(), None)
        };

        let send_cipher = if whole_packet {
            None
        } else {
            let key = session_key(psk, &session_id.to_be_bytes(), method.key_len());
            Some(method.stream_cipher(&key)?)
        };

        let recv_cipher = match remote_key_material {
            Some(material) => {
                let key = session_key(psk, material, method.key_len());
                Some(method.stream_cipher(&key)?)
            }
            None => None,
        };

        Ok(Self {
            session_id,
            remote_session_id,
            next_packet_id: AtomicU64::new(0),
            window: Mutex::new(CounterWindow::new()),
            send_cipher,
            recv_cipher,
            rng,
            remote_addr: Mutex::new(None),
        })
    }

    /// Fetch-and-increment of the reply packet ID.
    pub(crate) fn next_packet_id(&self) -> u64 {
        self.next_packet_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Admit a received packet ID, rejecting replays and wraparound.
    pub(crate) fn validate_packet_id(&self, packet_id: u64) -> bool {
        self.window
            .lock()
            .expect("replay window poisoned")
            .validate(packet_id, u64::MAX)
    }

    /// Draw a reply nonce from the session's keyed XOF (whole-packet
    /// mode only).
    pub(crate) fn fill_reply_nonce(&self, nonce: &mut [u8]) -> Result<(), ProtocolError> {
        match &self.rng {
            Some(rng) => {
                rng.lock().expect("session rng poisoned").fill(nonce);
                Ok(())
            }
            None => Err(sable_crypto::CryptoError::Seal.into()),
        }
    }

    pub(crate) fn set_remote_addr(&self, addr: SocketAddr) {
        *self.remote_addr.lock().expect("remote addr poisoned") = Some(addr);
    }

    pub(crate) fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().expect("remote addr poisoned")
    }
}

struct Entry {
    session: Arc<UdpSession>,
    last_seen: Instant,
}

/// TTL'd, capacity-bounded cache of UDP sessions.
pub(crate) struct SessionCache {
    ttl: Duration,
    capacity: usize,
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    map: HashMap<u64, Entry>,
    last_sweep: Instant,
}

impl SessionCache {
    pub(crate) fn new(ttl: Duration, capacity: usize) -> Self {
        Self {
            ttl,
            capacity,
            inner: Mutex::new(CacheInner {
                map: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Return the session for `id`, creating it if absent.
    ///
    /// The bool is true when an existing session was found. Exactly one
    /// caller per new key runs the creation closure; losers of the race
    /// observe the winner's session.
    pub(crate) fn get_or_create(
        &self,
        id: u64,
        create: impl FnOnce() -> Result<UdpSession, ProtocolError>,
    ) -> Result<(Arc<UdpSession>, bool), ProtocolError> {
        let mut inner = self.inner.lock().expect("session cache poisoned");
        let now = Instant::now();

        if now.duration_since(inner.last_sweep) >= self.ttl {
            let ttl = self.ttl;
            inner.map.retain(|_, e| now.duration_since(e.last_seen) < ttl);
            inner.last_sweep = now;
        }

        match inner.map.get_mut(&id) {
            Some(entry) if now.duration_since(entry.last_seen) < self.ttl => {
                entry.last_seen = now;
                return Ok((entry.session.clone(), true));
            }
            Some(_) => {
                inner.map.remove(&id);
            }
            None => {}
        }

        if inner.map.len() >= self.capacity {
            if let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, e)| e.last_seen)
                .map(|(id, _)| *id)
            {
                inner.map.remove(&oldest);
            }
        }

        let session = Arc::new(create()?);
        inner.map.insert(
            id,
            Entry {
                session: session.clone(),
                last_seen: now,
            },
        );
        Ok((session, false))
    }

    /// Drop a session, used when a freshly created one fails validation.
    pub(crate) fn remove(&self, id: u64) {
        self.inner
            .lock()
            .expect("session cache poisoned")
            .map
            .remove(&id);
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("session cache poisoned").map.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_session() -> Result<UdpSession, ProtocolError> {
        UdpSession::new(Method::Aes128Gcm, &[0u8; 16], 42, Some(&42u64.to_be_bytes()), false)
    }

    #[test]
    fn packet_ids_start_at_zero() {
        let session = test_session().unwrap();
        assert_eq!(session.next_packet_id(), 0);
        assert_eq!(session.next_packet_id(), 1);
        assert_eq!(session.next_packet_id(), 2);
    }

    #[test]
    fn replay_filter_rejects_duplicates() {
        let session = test_session().unwrap();
        assert!(session.validate_packet_id(1));
        assert!(!session.validate_packet_id(1));
        assert!(session.validate_packet_id(2));
    }

    #[test]
    fn cache_returns_same_session() {
        let cache = SessionCache::new(Duration::from_secs(60), 16);
        let (first, loaded) = cache.get_or_create(7, test_session).unwrap();
        assert!(!loaded);
        let (second, loaded) = cache.get_or_create(7, test_session).unwrap();
        assert!(loaded);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn cache_expires_sessions() {
        let cache = SessionCache::new(Duration::from_millis(10), 16);
        let (_, loaded) = cache.get_or_create(7, test_session).unwrap();
        assert!(!loaded);
        std::thread::sleep(Duration::from_millis(20));
        let (_, loaded) = cache.get_or_create(7, test_session).unwrap();
        assert!(!loaded, "expired session must be replaced");
    }

    #[test]
    fn cache_evicts_oldest_under_pressure() {
        let cache = SessionCache::new(Duration::from_secs(60), 2);
        cache.get_or_create(1, test_session).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_create(2, test_session).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.get_or_create(3, test_session).unwrap();

        assert_eq!(cache.len(), 2);
        // 1 was the oldest; recreating it must miss.
        let (_, loaded) = cache.get_or_create(1, test_session).unwrap();
        assert!(!loaded);
    }

    #[test]
    fn remove_deletes_entry() {
        let cache = SessionCache::new(Duration::from_secs(60), 16);
        cache.get_or_create(9, test_session).unwrap();
        assert_eq!(cache.len(), 1);
        cache.remove(9);
        assert_eq!(cache.len(), 0);
    }
}
