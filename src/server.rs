use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{Name, Record};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable, BinEncoder};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info};

use crate::cache::ResolveCache;
use crate::entry::{LocalEntries, RecordKey, canonical_name};
use crate::resolver::{RecursiveResolver, SystemUpstream, Upstream};

const UDP_PACKET_SIZE: usize = 512;
const RESTART_DELAY: Duration = Duration::from_secs(5);

/// UDP DNS front for the redirector. Local entries win unconditionally;
/// everything else goes through the cache-backed recursive resolver when
/// recursion is enabled, and gets an NXDOMAIN otherwise.
pub struct DnsServer {
    port: u16,
    local: LocalEntries,
    cache: Arc<ResolveCache>,
    upstream: Arc<dyn Upstream>,
    recursive: Arc<AtomicBool>,
    strip_suffix: Option<String>,
    running: Mutex<Option<Listener>>,
}

struct Listener {
    shutdown: watch::Sender<bool>,
    addr: SocketAddr,
    supervisor: JoinHandle<()>,
}

/// Everything a spawned handler needs, shared across the listener's life.
struct HandlerCtx {
    local: Arc<LocalEntries>,
    resolver: RecursiveResolver,
    recursive: Arc<AtomicBool>,
    strip_suffix: Option<String>,
}

/// Closed set of outcomes a handler can answer with.
enum Answer {
    Local(Record),
    Recursive(Vec<Record>),
    Negative,
}

impl DnsServer {
    pub fn new(port: u16, cache_size: usize) -> Self {
        Self::with_upstream(port, cache_size, Arc::new(SystemUpstream::from_system_conf()))
    }

    pub fn with_upstream(port: u16, cache_size: usize, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            port,
            local: LocalEntries::new(),
            cache: Arc::new(ResolveCache::new(cache_size)),
            upstream,
            recursive: Arc::new(AtomicBool::new(false)),
            strip_suffix: None,
            running: Mutex::new(None),
        }
    }

    /// Seed an authoritative override with default TTL and class. Only
    /// meaningful before `start()`; the table is immutable afterwards.
    pub fn put_local_entry(
        &mut self,
        rtype: hickory_proto::rr::RecordType,
        domain: &str,
        record: &str,
    ) -> bool {
        self.local.register(rtype, domain, record)
    }

    pub fn put_local_entry_full(
        &mut self,
        rtype: hickory_proto::rr::RecordType,
        domain: &str,
        record: &str,
        ttl: u32,
        class: hickory_proto::rr::DNSClass,
    ) -> bool {
        self.local.register_full(rtype, domain, record, ttl, class)
    }

    pub fn set_recursive(&self, recursive: bool) {
        self.recursive.store(recursive, Ordering::Relaxed);
    }

    pub fn set_strip_suffix(&mut self, suffix: Option<String>) {
        self.strip_suffix = suffix;
    }

    /// Bind the UDP socket and spawn the supervised receive loop. A bind
    /// failure here is the one fatal error and surfaces to the caller.
    pub fn start(&self) -> anyhow::Result<()> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if running.is_some() {
            return Ok(());
        }

        let socket = bind_udp(self.port).with_context(|| format!("bind udp 0.0.0.0:{}", self.port))?;
        let addr = socket.local_addr().context("socket local addr")?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let ctx = Arc::new(HandlerCtx {
            local: Arc::new(self.local.clone()),
            resolver: RecursiveResolver::new(Arc::clone(&self.cache), Arc::clone(&self.upstream)),
            recursive: Arc::clone(&self.recursive),
            strip_suffix: self.strip_suffix.clone(),
        });

        info!(
            event = "dns_started",
            bind = %addr,
            recursive = self.recursive.load(Ordering::Relaxed),
            cache_size = self.cache.capacity(),
            local_entries = self.local.len(),
            "dns server listening"
        );

        let port = self.port;
        let supervisor = tokio::spawn(supervise(socket, port, ctx, shutdown_rx));
        *running = Some(Listener {
            shutdown,
            addr,
            supervisor,
        });
        Ok(())
    }

    /// Interrupt the receive loop and wait for the supervisor to exit, so the
    /// socket is released before this returns and the port can be rebound
    /// immediately. Safe to call when already stopped.
    pub async fn stop(&self) {
        let listener = {
            let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
            running.take()
        };
        if let Some(listener) = listener {
            let _ = listener.shutdown.send(true);
            let _ = listener.supervisor.await;
            info!(event = "dns_stopped", "dns server stopped");
        }
    }

    /// Bound address while running; handy when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.as_ref().map(|listener| listener.addr)
    }
}

fn bind_udp(port: u16) -> anyhow::Result<UdpSocket> {
    let addr: SocketAddr = SocketAddr::from(([0, 0, 0, 0], port));
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).context("create socket")?;
    let _ = socket.set_recv_buffer_size(1024 * 1024);
    let _ = socket.set_send_buffer_size(1024 * 1024);
    socket.set_nonblocking(true).context("set nonblocking")?;
    socket.bind(&addr.into()).context("bind socket")?;
    UdpSocket::from_std(socket.into()).context("register socket")
}

/// Keep the receive loop alive: on a transport error, wait a fixed delay,
/// rebind and resume. No backoff growth and no retry ceiling.
async fn supervise(
    socket: UdpSocket,
    port: u16,
    ctx: Arc<HandlerCtx>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut socket = Arc::new(socket);
    loop {
        tokio::select! {
            err = serve_loop(Arc::clone(&socket), Arc::clone(&ctx)) => {
                error!(event = "dns_loop_error", error = %err, "receive loop failed, restarting in 5s");
                // The failed socket must be closed before the same port can
                // be bound again.
                drop(socket);
                socket = match rebind(port, &mut shutdown).await {
                    Some(rebound) => rebound,
                    None => return,
                };
                info!(event = "dns_restarted", port = port, "receive loop restarted");
            }
            _ = shutdown.changed() => return,
        }
    }
}

/// Wait the fixed delay and rebind the port, retrying until it succeeds.
/// Returns `None` if a shutdown arrives while waiting.
async fn rebind(port: u16, shutdown: &mut watch::Receiver<bool>) -> Option<Arc<UdpSocket>> {
    loop {
        tokio::select! {
            _ = sleep(RESTART_DELAY) => {}
            _ = shutdown.changed() => return None,
        }
        match bind_udp(port) {
            Ok(rebound) => return Some(Arc::new(rebound)),
            Err(err) => {
                error!(event = "dns_rebind_failed", error = %err, "rebind failed, retrying in 5s");
            }
        }
    }
}

/// Block on the next datagram and hand each one to its own task, so a slow
/// recursive lookup never stalls reception. Returns the transport error that
/// broke the loop.
async fn serve_loop(socket: Arc<UdpSocket>, ctx: Arc<HandlerCtx>) -> std::io::Error {
    let mut buf = [0u8; UDP_PACKET_SIZE];
    loop {
        let (len, peer) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(err) => return err,
        };
        let packet = Bytes::copy_from_slice(&buf[..len]);
        let socket = Arc::clone(&socket);
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_query(&packet, peer, socket, ctx).await {
                debug!(event = "query_dropped", peer = %peer, error = %err, "request handling failed");
            }
        });
    }
}

async fn handle_query(
    packet: &[u8],
    peer: SocketAddr,
    socket: Arc<UdpSocket>,
    ctx: Arc<HandlerCtx>,
) -> anyhow::Result<()> {
    let request = Message::from_bytes(packet).context("decode request")?;
    let question = request.queries().first().context("empty question")?.clone();
    let name = normalize_name(question.name(), ctx.strip_suffix.as_deref())?;
    let key = RecordKey::new(question.query_type(), &name);

    info!(event = "dns_query", qname = %key.name, qtype = %key.rtype, client = %peer);

    let recursive = ctx.recursive.load(Ordering::Relaxed);
    let answer = if let Some(record) = ctx.local.find(&key) {
        Answer::Local(record.clone())
    } else if recursive {
        match ctx.resolver.resolve(&key).await {
            Some(records) => Answer::Recursive(records),
            None => Answer::Negative,
        }
    } else {
        Answer::Negative
    };

    let response = match answer {
        Answer::Local(record) => {
            build_response(&request, recursive, ResponseCode::NoError, vec![record])
        }
        Answer::Recursive(records) => {
            build_response(&request, recursive, ResponseCode::NoError, records)
        }
        Answer::Negative => build_response(&request, recursive, ResponseCode::NXDomain, Vec::new()),
    }?;

    socket.send_to(&response, peer).await.context("send response")?;
    Ok(())
}

/// Canonicalize a queried name, optionally stripping a configured local
/// pseudo-suffix before lookup.
fn normalize_name(name: &Name, strip_suffix: Option<&str>) -> anyhow::Result<Name> {
    let name = canonical_name(name);
    let Some(suffix) = strip_suffix else {
        return Ok(name);
    };

    let mut suffix = suffix.trim_start_matches('.').to_ascii_lowercase();
    if !suffix.ends_with('.') {
        suffix.push('.');
    }
    let text = name.to_string();
    if text.len() > suffix.len() && text.ends_with(&suffix) {
        let stripped = &text[..text.len() - suffix.len()];
        // Only strip on a label boundary, never mid-label.
        if stripped.ends_with('.') {
            return Ok(canonical_name(&Name::from_str(stripped)?));
        }
    }
    Ok(name)
}

fn build_response(
    req: &Message,
    recursion_available: bool,
    rcode: ResponseCode,
    answers: Vec<Record>,
) -> anyhow::Result<Bytes> {
    let mut msg = Message::new();
    msg.set_id(req.id());
    msg.set_message_type(MessageType::Response);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(req.recursion_desired());
    msg.set_recursion_available(recursion_available);
    msg.set_authoritative(false);
    msg.set_response_code(rcode);

    let queries: Vec<Query> = req.queries().iter().cloned().collect();
    msg.add_queries(queries);
    for answer in answers {
        msg.add_answer(answer);
    }

    let mut out = Vec::with_capacity(512);
    {
        let mut encoder = BinEncoder::new(&mut out);
        msg.emit(&mut encoder)?;
    }
    Ok(Bytes::from(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{DNSClass, RData, RecordType};

    use crate::resolver::UpstreamAnswer;

    struct CountingUpstream {
        calls: AtomicUsize,
        fail: bool,
    }

    impl CountingUpstream {
        fn answering() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: false,
            })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: true,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Upstream for CountingUpstream {
        async fn query(&self, name: &Name, _rtype: RecordType) -> anyhow::Result<UpstreamAnswer> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("upstream refused");
            }
            let record = Record::from_rdata(
                name.clone(),
                300,
                RData::A(A(Ipv4Addr::new(198, 51, 100, 42))),
            );
            Ok(UpstreamAnswer {
                records: vec![record],
                aliases: Vec::new(),
            })
        }
    }

    fn test_server(upstream: Arc<CountingUpstream>) -> DnsServer {
        DnsServer::with_upstream(0, 16, upstream)
    }

    async fn query_server(addr: SocketAddr, name: &str, rtype: RecordType, id: u16) -> Message {
        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        let mut msg = Message::new();
        msg.set_id(id);
        msg.set_message_type(MessageType::Query);
        msg.set_op_code(OpCode::Query);
        msg.set_recursion_desired(true);
        let mut query = Query::new();
        query.set_name(Name::from_str(name).expect("query name"));
        query.set_query_type(rtype);
        query.set_query_class(DNSClass::IN);
        msg.add_query(query);

        let bytes = msg.to_vec().expect("encode query");
        socket.send_to(&bytes, target).await.expect("send query");

        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .expect("response in time")
            .expect("recv response");
        Message::from_bytes(&buf[..len]).expect("decode response")
    }

    #[tokio::test]
    async fn local_entry_wins_and_echoes_transaction_id() {
        let upstream = CountingUpstream::answering();
        let mut server = test_server(Arc::clone(&upstream));
        assert!(server.put_local_entry(RecordType::A, "play.example.net.", "203.0.113.5"));
        // Recursion on: the local table must still win without upstream I/O.
        server.set_recursive(true);
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let response = query_server(addr, "play.example.net.", RecordType::A, 0x4242).await;
        assert_eq!(response.id(), 0x4242);
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert!(response.recursion_available());
        assert_eq!(response.answers().len(), 1);
        match response.answers()[0].data() {
            Some(RData::A(addr)) => assert_eq!(addr.0, Ipv4Addr::new(203, 0, 113, 5)),
            other => panic!("unexpected rdata: {other:?}"),
        }
        assert_eq!(upstream.calls(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn unregistered_name_without_recursion_is_nxdomain() {
        let upstream = CountingUpstream::answering();
        let server = test_server(Arc::clone(&upstream));
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let response = query_server(addr, "unknown.example.net.", RecordType::A, 7).await;
        assert_eq!(response.id(), 7);
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(!response.recursion_available());
        assert!(response.answers().is_empty());
        assert_eq!(upstream.calls(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn recursive_answer_is_cached_for_the_next_query() {
        let upstream = CountingUpstream::answering();
        let server = test_server(Arc::clone(&upstream));
        server.set_recursive(true);
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let first = query_server(addr, "www.example.net.", RecordType::A, 1).await;
        assert_eq!(first.response_code(), ResponseCode::NoError);
        assert_eq!(first.answers().len(), 1);
        assert_eq!(upstream.calls(), 1);

        // Give the fire-and-forget cache write a moment to land.
        sleep(Duration::from_millis(50)).await;
        let second = query_server(addr, "www.example.net.", RecordType::A, 2).await;
        assert_eq!(second.response_code(), ResponseCode::NoError);
        assert_eq!(upstream.calls(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn upstream_failure_yields_nxdomain() {
        let upstream = CountingUpstream::failing();
        let server = test_server(Arc::clone(&upstream));
        server.set_recursive(true);
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let response = query_server(addr, "down.example.net.", RecordType::A, 9).await;
        assert_eq!(response.response_code(), ResponseCode::NXDomain);
        assert!(response.answers().is_empty());
        assert_eq!(upstream.calls(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_then_start_serves_identically() {
        let upstream = CountingUpstream::answering();
        let mut server = test_server(Arc::clone(&upstream));
        assert!(server.put_local_entry(RecordType::A, "play.example.net.", "203.0.113.5"));
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let before = query_server(addr, "play.example.net.", RecordType::A, 11).await;
        assert_eq!(before.response_code(), ResponseCode::NoError);

        server.stop().await;
        assert!(server.local_addr().is_none());

        server.start().expect("restart");
        let addr = server.local_addr().expect("rebound addr");
        let after = query_server(addr, "play.example.net.", RecordType::A, 12).await;
        assert_eq!(after.response_code(), ResponseCode::NoError);
        assert_eq!(after.answers().len(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_releases_the_port_for_an_immediate_rebind() {
        let upstream = CountingUpstream::answering();
        let first = test_server(Arc::clone(&upstream));
        first.start().expect("start");
        let port = first.local_addr().expect("bound addr").port();
        first.stop().await;

        // The port just vacated must be bindable right away.
        let second = DnsServer::with_upstream(port, 16, upstream);
        second.start().expect("rebind same port");
        assert_eq!(second.local_addr().expect("rebound addr").port(), port);

        second.stop().await;
    }

    #[tokio::test]
    async fn shutdown_interrupts_the_rebind_wait() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("signal shutdown");

        // The rebind delay alone is far longer than this timeout, so a
        // prompt `None` proves the shutdown branch was taken.
        let outcome = tokio::time::timeout(Duration::from_secs(1), rebind(0, &mut rx)).await;
        assert!(outcome.expect("rebind wait returned").is_none());
    }

    #[tokio::test]
    async fn malformed_datagram_is_dropped_and_the_listener_keeps_serving() {
        let upstream = CountingUpstream::answering();
        let mut server = test_server(Arc::clone(&upstream));
        assert!(server.put_local_entry(RecordType::A, "play.example.net.", "203.0.113.5"));
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");
        let target = SocketAddr::from(([127, 0, 0, 1], addr.port()));

        let socket = UdpSocket::bind("127.0.0.1:0").await.expect("bind client");
        socket
            .send_to(&[0xff, 0x00, 0xde, 0xad], target)
            .await
            .expect("send garbage");

        // The undecodable datagram gets no reply.
        let mut buf = [0u8; 512];
        let silent =
            tokio::time::timeout(Duration::from_millis(200), socket.recv_from(&mut buf)).await;
        assert!(silent.is_err());

        // And a well-formed query on the same listener is still answered.
        let response = query_server(addr, "play.example.net.", RecordType::A, 33).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);

        server.stop().await;
    }

    #[tokio::test]
    async fn configured_suffix_is_stripped_before_lookup() {
        let upstream = CountingUpstream::answering();
        let mut server = test_server(Arc::clone(&upstream));
        assert!(server.put_local_entry(RecordType::A, "play.example.net.", "203.0.113.5"));
        server.set_strip_suffix(Some(".lan".to_string()));
        server.start().expect("start");
        let addr = server.local_addr().expect("bound addr");

        let response = query_server(addr, "play.example.net.lan.", RecordType::A, 21).await;
        assert_eq!(response.response_code(), ResponseCode::NoError);
        assert_eq!(response.answers().len(), 1);
        assert_eq!(upstream.calls(), 0);

        server.stop().await;
    }

    #[test]
    fn normalize_name_strips_only_matching_suffix() {
        let name = Name::from_str("play.example.net.lan.").expect("name");
        let stripped = normalize_name(&name, Some("lan")).expect("normalize");
        assert_eq!(stripped.to_string(), "play.example.net.");

        let untouched = normalize_name(&name, Some("home")).expect("normalize");
        assert_eq!(untouched.to_string(), "play.example.net.lan.");

        let mid_label = Name::from_str("foo.milan.").expect("name");
        let kept = normalize_name(&mid_label, Some("lan")).expect("normalize");
        assert_eq!(kept.to_string(), "foo.milan.");

        let plain = normalize_name(&name, None).expect("normalize");
        assert_eq!(plain.to_string(), "play.example.net.lan.");
    }
}
