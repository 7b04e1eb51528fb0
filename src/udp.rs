// Datagram command channel
//
// A blocking UDP receiver on its own OS thread. Each source address gets a
// token bucket; accepted payloads are parsed and pushed into a bounded queue
// which the control task drains. The queue is the only state shared between
// this thread and the control task.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{CAPACITY, RATE, UDP_READ_TIMEOUT, UDP_RECV_BUF};
use crate::messages::Command;

// Past this many sources, buckets that have fully refilled are forgotten
const MAX_TRACKED_SOURCES: usize = 256;

#[derive(Debug, Clone, Copy)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

/// Per-source token bucket: `rate` tokens/sec, at most `capacity` banked
#[derive(Debug)]
pub struct RateLimiter {
    rate: f64,
    capacity: f64,
    buckets: HashMap<IpAddr, TokenBucket>,
}

impl RateLimiter {
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            buckets: HashMap::new(),
        }
    }

    /// Take one token for `source`, false if its bucket is empty
    pub fn allow(&mut self, source: IpAddr, now: Instant) -> bool {
        if self.buckets.len() >= MAX_TRACKED_SOURCES && !self.buckets.contains_key(&source) {
            self.forget_idle(now);
        }

        let capacity = self.capacity;
        let bucket = self.buckets.entry(source).or_insert(TokenBucket {
            tokens: capacity,
            last_refill: now,
        });

        let elapsed = now.saturating_duration_since(bucket.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            bucket.tokens = (bucket.tokens + elapsed * self.rate).min(capacity);
            bucket.last_refill = now;
        }

        if bucket.tokens < 1.0 {
            return false;
        }
        bucket.tokens -= 1.0;
        true
    }

    pub fn tracked_sources(&self) -> usize {
        self.buckets.len()
    }

    // A bucket idle long enough to be full again is the same as a new one
    fn forget_idle(&mut self, now: Instant) {
        let refill_time = Duration::from_secs_f64(self.capacity / self.rate);
        self.buckets
            .retain(|_, b| now.saturating_duration_since(b.last_refill) < refill_time);
    }
}

/// Bounded FIFO between the receiver thread and the control task
///
/// When full, new commands are dropped and queued ones are kept.
#[derive(Debug)]
pub struct CommandQueue {
    items: Mutex<VecDeque<Command>>,
    capacity: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    /// False if the queue was full and `cmd` was dropped
    pub fn push(&self, cmd: Command) -> bool {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return false;
        }
        items.push_back(cmd);
        true
    }

    /// Take everything queued, oldest first
    pub fn drain(&self) -> Vec<Command> {
        self.items.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

/// Rate limiting + parsing for received datagrams
pub struct DatagramReceiver {
    limiter: RateLimiter,
    queue: Arc<CommandQueue>,
}

impl DatagramReceiver {
    pub fn new(limiter: RateLimiter, queue: Arc<CommandQueue>) -> Self {
        Self { limiter, queue }
    }

    /// Handle one datagram, returns how many commands were queued
    pub fn handle(&mut self, payload: &[u8], source: IpAddr, now: Instant) -> usize {
        if !self.limiter.allow(source, now) {
            debug!("Rate limited datagram from {}", source);
            return 0;
        }

        let commands = match Command::parse_batch(payload) {
            Ok(commands) => commands,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", source, e);
                return 0;
            }
        };

        let mut queued = 0;
        for cmd in commands {
            if self.queue.push(cmd) {
                queued += 1;
            } else {
                debug!("Command queue full, dropping command from {}", source);
            }
        }
        queued
    }
}

/// Handle to the receiver thread. Dropping it stops the thread.
pub struct DatagramListener {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl DatagramListener {
    /// Bind `addr` and start receiving into `queue`
    pub fn bind(addr: SocketAddr, queue: Arc<CommandQueue>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        // Bounded blocking so the thread notices shutdown
        socket.set_read_timeout(Some(UDP_READ_TIMEOUT))?;
        let local_addr = socket.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let receiver = DatagramReceiver::new(RateLimiter::new(RATE, CAPACITY), queue);
        let flag = Arc::clone(&shutdown);
        let thread = std::thread::Builder::new()
            .name("udp-listener".to_string())
            .spawn(move || receive_loop(socket, receiver, flag))?;

        info!("UDP listener started on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl Drop for DatagramListener {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("UDP listener thread panicked");
            }
        }
    }
}

fn receive_loop(socket: UdpSocket, mut receiver: DatagramReceiver, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; UDP_RECV_BUF];
    while !shutdown.load(Ordering::Relaxed) {
        match socket.recv_from(&mut buf) {
            Ok((0, _)) => continue,
            Ok((len, src)) => {
                receiver.handle(&buf[..len], src.ip(), Instant::now());
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                warn!("UDP listener error: {}", e);
                std::thread::sleep(UDP_READ_TIMEOUT);
            }
        }
    }
    debug!("UDP listener stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(192, 168, 4, last))
    }

    #[test]
    fn test_burst_then_refill() {
        let mut limiter = RateLimiter::new(50.0, 100.0);
        let now = Instant::now();

        let accepted = (0..150).filter(|_| limiter.allow(ip(2), now)).count();
        assert_eq!(accepted, 100);

        let later = now + Duration::from_secs(1);
        let accepted = (0..150).filter(|_| limiter.allow(ip(2), later)).count();
        assert!(accepted >= 50, "only {} accepted after refill", accepted);
    }

    #[test]
    fn test_sources_are_independent() {
        let mut limiter = RateLimiter::new(50.0, 100.0);
        let now = Instant::now();
        for _ in 0..100 {
            assert!(limiter.allow(ip(2), now));
        }
        assert!(!limiter.allow(ip(2), now));
        assert!(limiter.allow(ip(3), now));
    }

    #[test]
    fn test_refill_is_capped() {
        let mut limiter = RateLimiter::new(50.0, 100.0);
        let now = Instant::now();
        assert!(limiter.allow(ip(2), now));

        let much_later = now + Duration::from_secs(60);
        let accepted = (0..500).filter(|_| limiter.allow(ip(2), much_later)).count();
        assert_eq!(accepted, 100);
    }

    #[test]
    fn test_idle_sources_are_forgotten() {
        let mut limiter = RateLimiter::new(50.0, 100.0);
        let now = Instant::now();
        for i in 0..MAX_TRACKED_SOURCES {
            let addr = IpAddr::V4(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8));
            limiter.allow(addr, now);
        }
        assert_eq!(limiter.tracked_sources(), MAX_TRACKED_SOURCES);

        limiter.allow(ip(9), now + Duration::from_secs(10));
        assert_eq!(limiter.tracked_sources(), 1);
    }

    #[test]
    fn test_queue_keeps_oldest_when_full() {
        let queue = CommandQueue::new(2);
        assert!(queue.push(Command::Stop { name: "a".into() }));
        assert!(queue.push(Command::Stop { name: "b".into() }));
        assert!(!queue.push(Command::Stop { name: "c".into() }));

        assert_eq!(
            queue.drain(),
            vec![Command::Stop { name: "a".into() }, Command::Stop { name: "b".into() }]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_receiver_handles_lists_and_garbage() {
        let queue = Arc::new(CommandQueue::new(100));
        let mut receiver = DatagramReceiver::new(RateLimiter::new(50.0, 100.0), Arc::clone(&queue));
        let now = Instant::now();

        let n = receiver.handle(
            br#"[{"action":"set","name":"left","power":40},{"action":"stop_all"}]"#,
            ip(2),
            now,
        );
        assert_eq!(n, 2);
        assert_eq!(receiver.handle(b"{oops", ip(2), now), 0);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_receiver_drops_rate_limited_packets() {
        let queue = Arc::new(CommandQueue::new(1000));
        let mut receiver = DatagramReceiver::new(RateLimiter::new(50.0, 100.0), Arc::clone(&queue));
        let now = Instant::now();
        for _ in 0..150 {
            receiver.handle(br#"{"action":"stop_all"}"#, ip(2), now);
        }
        assert_eq!(queue.len(), 100);
    }

    #[test]
    fn test_listener_receives_over_loopback() {
        let queue = Arc::new(CommandQueue::new(100));
        let listener =
            DatagramListener::bind("127.0.0.1:0".parse().unwrap(), Arc::clone(&queue)).unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .send_to(br#"{"action":"stop","name":"bed"}"#, listener.local_addr())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while queue.is_empty() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(queue.drain(), vec![Command::Stop { name: "bed".into() }]);
        drop(listener);
    }
}
