//! The unit of transport

use bytes::Bytes;
use uuid::Uuid;

use super::QUERY_RESPONSE_CHANNEL;

/// One transport-level unit: a logical channel id and an opaque body.
///
/// A packet carries a correlation id iff it is a query or the reply to one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    channel: u32,
    prioritized: bool,
    correlation_id: Option<Uuid>,
    body: Bytes,
}

impl Packet {
    pub fn new(channel: u32, body: impl Into<Bytes>) -> Self {
        Self {
            channel,
            prioritized: false,
            correlation_id: None,
            body: body.into(),
        }
    }

    /// Create a packet that may jump ahead of bulk traffic
    pub fn prioritized(channel: u32, body: impl Into<Bytes>) -> Self {
        Self {
            prioritized: true,
            ..Self::new(channel, body)
        }
    }

    /// Create a reply carrying the request's correlation id
    pub fn response_to(request: &Packet, body: impl Into<Bytes>) -> Self {
        Self {
            channel: QUERY_RESPONSE_CHANNEL,
            prioritized: request.prioritized,
            correlation_id: request.correlation_id,
            body: body.into(),
        }
    }

    /// Reply meaning "nothing to report", used to release remote waiters
    pub fn empty_response_to(request: &Packet) -> Self {
        Self::response_to(request, Bytes::new())
    }

    pub fn with_priority(mut self, prioritized: bool) -> Self {
        self.prioritized = prioritized;
        self
    }

    pub fn with_correlation(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub(crate) fn from_parts(
        channel: u32,
        prioritized: bool,
        correlation_id: Option<Uuid>,
        body: Bytes,
    ) -> Self {
        Self {
            channel,
            prioritized,
            correlation_id,
            body,
        }
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub fn is_prioritized(&self) -> bool {
        self.prioritized
    }

    pub fn correlation_id(&self) -> Option<Uuid> {
        self.correlation_id
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn into_body(self) -> Bytes {
        self.body
    }

    /// Whether the body is empty
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_response_keeps_correlation() {
        let id = Uuid::new_v4();
        let request = Packet::prioritized(70, &b"ping"[..]).with_correlation(id);
        let response = Packet::response_to(&request, &b"pong"[..]);

        assert_eq!(response.channel(), QUERY_RESPONSE_CHANNEL);
        assert_eq!(response.correlation_id(), Some(id));
        assert!(response.is_prioritized());
        assert_eq!(response.body().as_ref(), b"pong");
        assert!(Packet::empty_response_to(&request).is_empty());
    }
}
