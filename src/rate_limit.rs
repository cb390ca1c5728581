use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    time::Duration,
};

use tokio::time::Instant;

use crate::{message::Message, settings::FloodSettings};

/// Commands that cost no flood tokens while the client is registering.
pub fn is_exempt(command: &str) -> bool {
    matches!(command, "NICK" | "USER" | "CAP" | "PASS" | "PING" | "PONG")
}

/// Refills continuously at `capacity / per`, capped at `capacity`.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    updated_at: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, per: Duration, now: Instant) -> Self {
        let per = if per.is_zero() {
            Duration::from_secs(1)
        } else {
            per
        };
        let capacity = f64::from(capacity.max(1));

        TokenBucket {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / per.as_secs_f64(),
            updated_at: now,
        }
    }

    fn tokens_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.updated_at).as_secs_f64();
        (self.tokens + elapsed * self.refill_per_sec).min(self.capacity)
    }

    fn refill(&mut self, now: Instant) {
        if now > self.updated_at {
            self.tokens = self.tokens_at(now);
            self.updated_at = now;
        }
    }

    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// When the next whole token will be there.
    pub fn next_available(&self, now: Instant) -> Instant {
        let tokens = self.tokens_at(now);
        if tokens >= 1.0 {
            now
        } else {
            now + Duration::from_secs_f64((1.0 - tokens) / self.refill_per_sec)
        }
    }

    pub fn is_full(&self, now: Instant) -> bool {
        self.tokens_at(now) >= self.capacity
    }
}

#[derive(Debug, PartialEq)]
pub enum Admission {
    Ready(Message),
    Queued,
    Flooded,
}

#[derive(Debug)]
struct Waiting {
    message: Message,
    free: bool,
}

/// Per-connection flood control. Messages over the budget wait in a short
/// queue; overflowing the queue is excess flood. Lines always leave in the
/// order they arrived, free ones included.
#[derive(Debug)]
pub struct FloodGate {
    bucket: TokenBucket,
    queue: VecDeque<Waiting>,
    max_queue: usize,
}

impl FloodGate {
    pub fn new(settings: &FloodSettings, now: Instant) -> Self {
        FloodGate {
            bucket: TokenBucket::new(
                settings.messages,
                Duration::from_secs(settings.interval_secs),
                now,
            ),
            queue: VecDeque::new(),
            max_queue: settings.queue_depth,
        }
    }

    /// Exempt commands are only free before registration.
    pub fn admit(&mut self, message: Message, registered: bool, now: Instant) -> Admission {
        let free = !registered && is_exempt(message.command());

        if self.queue.is_empty() && (free || self.bucket.try_acquire(now)) {
            return Admission::Ready(message);
        }

        if self.queue.len() >= self.max_queue {
            return Admission::Flooded;
        }

        self.queue.push_back(Waiting { message, free });
        Admission::Queued
    }

    /// Queued messages whose turn has come, oldest first.
    pub fn release(&mut self, now: Instant) -> Vec<Message> {
        let mut released = vec![];
        while let Some(front) = self.queue.front() {
            if !front.free && !self.bucket.try_acquire(now) {
                break;
            }
            if let Some(waiting) = self.queue.pop_front() {
                released.push(waiting.message);
            }
        }
        released
    }

    pub fn next_release(&self, now: Instant) -> Option<Instant> {
        match self.queue.front() {
            None => None,
            Some(front) if front.free => Some(now),
            Some(_) => Some(self.bucket.next_available(now)),
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }
}

/// Accept-time throttle: a token bucket per remote address.
#[derive(Debug)]
pub struct ConnectionThrottle {
    capacity: u32,
    per: Duration,
    buckets: HashMap<IpAddr, TokenBucket>,
}

impl ConnectionThrottle {
    pub fn new(settings: &FloodSettings) -> Self {
        ConnectionThrottle {
            capacity: settings.connections_per_address,
            per: Duration::from_secs(settings.connection_interval_secs),
            buckets: HashMap::new(),
        }
    }

    pub fn allow(&mut self, address: IpAddr, now: Instant) -> bool {
        let (capacity, per) = (self.capacity, self.per);
        self.buckets
            .entry(address)
            .or_insert_with(|| TokenBucket::new(capacity, per, now))
            .try_acquire(now)
    }

    /// Forgets addresses whose bucket has refilled completely.
    pub fn prune(&mut self, now: Instant) {
        self.buckets.retain(|_, bucket| !bucket.is_full(now));
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }
}
