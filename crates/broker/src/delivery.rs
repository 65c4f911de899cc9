/// Broker-assigned handle used to ack or reject one delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryTag(u64);

impl DeliveryTag {
    pub fn new(tag: u64) -> Self {
        Self(tag)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for DeliveryTag {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message handed to a consumer.
///
/// Notes:
/// - The consumer owns the delivery until it calls `ack` or `reject` with its tag.
/// - **At-least-once**: an unacknowledged delivery can show up again, with
///   `redelivered` set.
/// - `body` is the raw message body; decoding is the consumer's job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    tag: DeliveryTag,
    queue: String,
    redelivered: bool,
    body: Vec<u8>,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, queue: impl Into<String>, redelivered: bool, body: Vec<u8>) -> Self {
        Self {
            tag,
            queue: queue.into(),
            redelivered,
            body,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}
