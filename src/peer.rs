//! The persistent link to the upstream. One `PeerLink` exists per
//! resolved `ip:port` for the lifetime of the process; sessions share it
//! through the registry. Tells ride an ordered queue drained by a single
//! worker task over one long-lived connection; asks dial fresh.

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    sync::{oneshot, Notify},
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    encryption,
    error::{BridgeError, Result},
    message::{self, MsgBuilder},
};

/// Tells beyond this bound drop the oldest queued message.
pub const TELL_QUEUE_LIMIT: usize = 4096;

static LINKS: Lazy<Mutex<HashMap<String, Arc<PeerLink>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub struct PeerLink {
    addr: String,
    modern: AtomicBool,
    /// Unix seconds of the moment the link went unhealthy; 0 while up.
    down_since: AtomicI64,
    queue: Mutex<VecDeque<String>>,
    wakeup: Notify,
    sync_pending: AtomicBool,
    op_timeout: Duration,
    iv: [u8; 16],
    source_name: String,
}

/// Returns the shared link for `addr` (`host:port` or `ip:port`),
/// creating it and its worker on first use. DNS resolution canonicalizes
/// the key so host and IP forms share one link.
pub async fn peer(addr: &str, config: &Config) -> Result<Arc<PeerLink>> {
    let resolved = resolve(addr).await?;

    let mut links = LINKS.lock();
    if let Some(link) = links.get(&resolved) {
        return Ok(Arc::clone(link));
    }

    let link = Arc::new(PeerLink {
        addr: resolved.clone(),
        modern: AtomicBool::new(false),
        down_since: AtomicI64::new(0),
        queue: Mutex::new(VecDeque::new()),
        wakeup: Notify::new(),
        sync_pending: AtomicBool::new(false),
        op_timeout: config.timeout(),
        iv: config.iv(),
        source_name: config.source_name.clone(),
    });
    links.insert(resolved, Arc::clone(&link));
    tokio::spawn(tell_worker(Arc::clone(&link)));
    Ok(link)
}

/// Registry peek for already-known links; never dials or resolves.
/// The reply shaper uses this to flag rows from peers that are down.
pub fn peer_if_known(addr: &str) -> Option<Arc<PeerLink>> {
    LINKS.lock().get(addr).cloned()
}

async fn resolve(addr: &str) -> Result<String> {
    let mut candidates = tokio::net::lookup_host(addr)
        .await
        .map_err(|err| BridgeError::Upstream(format!("cannot resolve {addr}: {err}")))?;
    candidates
        .next()
        .map(|sockaddr| sockaddr.to_string())
        .ok_or_else(|| BridgeError::Upstream(format!("no address for {addr}")))
}

impl PeerLink {
    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn set_modern(&self, modern: bool) {
        if modern {
            info!("peer {} speaks the modern dialect", self.addr);
        } else {
            info!("peer {} speaks the legacy dialect", self.addr);
        }
        self.modern.store(modern, Ordering::SeqCst);
    }

    pub fn is_modern(&self) -> bool {
        self.modern.load(Ordering::SeqCst)
    }

    /// How long the link has been unhealthy; zero while up.
    pub fn downtime(&self) -> Duration {
        let since = self.down_since.load(Ordering::SeqCst);
        if since == 0 {
            return Duration::ZERO;
        }
        let now = unix_now();
        Duration::from_secs(now.saturating_sub(since) as u64)
    }

    fn mark_down(&self) {
        let _ = self
            .down_since
            .compare_exchange(0, unix_now(), Ordering::SeqCst, Ordering::SeqCst);
    }

    fn mark_up(&self) {
        self.down_since.store(0, Ordering::SeqCst);
    }

    /// Encrypts and enqueues; returns immediately. Delivery is
    /// best-effort but FIFO relative to other tells on this link.
    pub fn tell(&self, plaintext: &str, keyword: &str) {
        debug!("telling {}: {}", self.addr, plaintext);
        let envelope = encryption::encrypt(plaintext, keyword, &self.iv);
        {
            let mut queue = self.queue.lock();
            if queue.len() >= TELL_QUEUE_LIMIT {
                warn!(
                    "tell queue for {} exceeds {} messages, dropping oldest",
                    self.addr, TELL_QUEUE_LIMIT
                );
                queue.pop_front();
            }
            queue.push_back(envelope);
        }
        self.wakeup.notify_one();

        if !self.is_modern() {
            self.schedule_legacy_sync(keyword);
        }
    }

    /// Dials a fresh connection, sends the encrypted request and reads
    /// one reply line. The returned channel always yields exactly one
    /// reply; failures arrive as a synthetic error envelope so callers
    /// shape every outcome the same way. Dropping the receiver is safe.
    pub fn ask(&self, plaintext: &str, keyword: &str) -> oneshot::Receiver<String> {
        debug!("asking {}: {}", self.addr, plaintext);
        let (tx, rx) = oneshot::channel();
        let addr = self.addr.clone();
        let iv = self.iv;
        let op_timeout = self.op_timeout;
        let source = self.source_name.clone();
        let envelope = encryption::encrypt(plaintext, keyword, &iv);
        let keyword = keyword.to_string();

        tokio::spawn(async move {
            let reply = match ask_once(&addr, &envelope, &keyword, &iv, op_timeout).await {
                Ok(reply) => reply,
                Err(err) => {
                    warn!("ask {addr} failed: {err}");
                    message::error_reply(&source, &err)
                }
            };
            let _ = tx.send(reply);
        });
        rx
    }

    /// A legacy peer does not broadcast the changes our tells cause, so
    /// shortly after a tell we pull its job list and feed it back as one
    /// synthesized full sync.
    fn schedule_legacy_sync(&self, keyword: &str) {
        if self.sync_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let addr = self.addr.clone();
        let keyword = keyword.to_string();
        tokio::spawn(async move {
            sleep(Duration::from_secs(5)).await;
            if let Some(link) = peer_if_known(&addr) {
                link.sync_pending.store(false, Ordering::SeqCst);
                link.sync_all(&keyword).await;
            }
        });
    }

    pub async fn sync_all(&self, keyword: &str) {
        info!("full sync (legacy fallback) with {}", self.addr);
        let query = MsgBuilder::new("query_jobdb", &self.source_name, &self.source_name)
            .fragment(&format!(
                "<where><clause><connector>or</connector>\
                 <phrase><siserver>localhost</siserver></phrase>\
                 <phrase><siserver>{}</siserver></phrase>\
                 <phrase><siserver>{}</siserver></phrase>\
                 </clause></where>",
                message::escape(&self.addr),
                message::escape(&self.source_name),
            ))
            .finish();

        let reply = match self.ask(&query, keyword).await {
            Ok(reply) => reply,
            Err(_) => return,
        };

        let doc = match roxmltree::Document::parse(&reply) {
            Ok(doc) => doc,
            Err(err) => {
                warn!("sync with {}: cannot parse job list: {err}", self.addr);
                return;
            }
        };
        let root = doc.root_element();
        if message::has_child(root, "error_string") {
            warn!(
                "sync with {}: peer returned error: {}",
                self.addr,
                message::child_text(root, "error_string")
            );
            return;
        }

        // keep the rows the peer itself owns, renumbered
        let mut rows = String::new();
        let mut count = 0;
        for child in root.children().filter(|c| c.is_element()) {
            if !child.tag_name().name().starts_with("answer") {
                continue;
            }
            let owner = message::child_text(child, "siserver");
            if owner == "localhost" || owner == self.addr {
                count += 1;
                rows.push_str(&reply[child.range()]);
            }
        }
        if count == 0 {
            return;
        }

        let sync = MsgBuilder::new("sync_jobdb", &self.addr, &self.source_name)
            .field("sync", "all")
            .fragment(&rows)
            .finish();
        self.tell(&sync, keyword);
    }
}

async fn ask_once(
    addr: &str,
    envelope: &str,
    keyword: &str,
    iv: &[u8; 16],
    op_timeout: Duration,
) -> std::result::Result<String, String> {
    let stream = timeout(op_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| format!("connect to {addr}: timed out"))?
        .map_err(|err| format!("connect to {addr}: {err}"))?;
    let (read_half, mut write_half) = stream.into_split();

    let mut line = envelope.to_string();
    line.push('\n');
    timeout(op_timeout, write_half.write_all(line.as_bytes()))
        .await
        .map_err(|_| format!("send to {addr}: timed out"))?
        .map_err(|err| format!("send to {addr}: {err}"))?;

    let mut reader = BufReader::new(read_half);
    let mut reply = String::new();
    let n = timeout(op_timeout, reader.read_line(&mut reply))
        .await
        .map_err(|_| format!("reply from {addr}: timed out"))?
        .map_err(|err| format!("reply from {addr}: {err}"))?;
    if n == 0 {
        return Err(format!("{addr} closed the connection without a reply"));
    }

    encryption::decrypt(reply.trim_end(), keyword, iv)
        .ok_or_else(|| format!("cannot decrypt reply from {addr}"))
}

/// Drains the tell queue over one persistent connection, redialing as
/// needed. The message in flight is only dropped once written, so queue
/// order survives reconnects.
async fn tell_worker(link: Arc<PeerLink>) {
    let mut conn: Option<TcpStream> = None;
    let mut failures: u32 = 0;

    loop {
        let envelope = loop {
            let front = link.queue.lock().pop_front();
            match front {
                Some(envelope) => break envelope,
                None => link.wakeup.notified().await,
            }
        };

        loop {
            if conn.is_none() {
                match timeout(link.op_timeout, TcpStream::connect(&link.addr)).await {
                    Ok(Ok(stream)) => {
                        enable_keepalive(&stream, &link.addr);
                        link.mark_up();
                        failures = 0;
                        conn = Some(stream);
                    }
                    Ok(Err(err)) => {
                        failures += 1;
                        if failures > 1 {
                            link.mark_down();
                        }
                        warn!("dial {} failed: {err}", link.addr);
                        sleep(backoff(failures)).await;
                        continue;
                    }
                    Err(_) => {
                        failures += 1;
                        if failures > 1 {
                            link.mark_down();
                        }
                        warn!("dial {} timed out", link.addr);
                        sleep(backoff(failures)).await;
                        continue;
                    }
                }
            }

            let stream = match conn.as_mut() {
                Some(stream) => stream,
                None => continue,
            };
            let mut line = envelope.clone();
            line.push('\n');
            match timeout(link.op_timeout, stream.write_all(line.as_bytes())).await {
                Ok(Ok(())) => break,
                _ => {
                    warn!("write to {} failed, reconnecting", link.addr);
                    conn = None;
                }
            }
        }
    }
}

fn enable_keepalive(stream: &TcpStream, addr: &str) {
    let sock = socket2::SockRef::from(stream);
    if let Err(err) = sock.set_keepalive(true) {
        warn!("cannot enable keepalive towards {addr}: {err}");
    }
}

fn backoff(failures: u32) -> Duration {
    match failures {
        0 | 1 => Duration::from_secs(1),
        2 => Duration::from_secs(2),
        3 => Duration::from_secs(4),
        _ => Duration::from_secs(10),
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
