//! Message filters.
//!
//! Filters see wire messages only, never decoded envelopes. The chain runs
//! forward for outbound messages and in reverse for inbound ones, so the last
//! filter to touch a request is the first to touch its reply.

use std::sync::Arc;

use super::message::Message;

/// Shared mutable view of a message in flight.
pub struct FilterContext<'a> {
    pub message: &'a mut Message,
    /// True for outbound traffic.
    pub is_send: bool,
}

impl FilterContext<'_> {
    pub fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    pub fn payload_mut(&mut self) -> &mut Vec<u8> {
        &mut self.message.payload
    }
}

pub trait Filter: Send + Sync {
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    fn execute(&self, ctx: &mut FilterContext<'_>);
}

/// Immutable ordered list of filters; replaced wholesale on change.
#[derive(Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of this chain with `filter` appended.
    pub fn with(&self, filter: Arc<dyn Filter>) -> Self {
        let mut filters = self.filters.clone();
        filters.push(filter);
        Self { filters }
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<String> {
        self.filters.iter().map(|f| f.name().to_string()).collect()
    }

    pub fn apply(&self, message: &mut Message, is_send: bool) {
        let mut ctx = FilterContext { message, is_send };
        if is_send {
            for filter in &self.filters {
                filter.execute(&mut ctx);
            }
        } else {
            for filter in self.filters.iter().rev() {
                filter.execute(&mut ctx);
            }
        }
    }
}

/// Logs every message at trace level.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceFilter;

impl Filter for TraceFilter {
    fn name(&self) -> &str {
        "trace"
    }

    fn execute(&self, ctx: &mut FilterContext<'_>) {
        tracing::trace!(
            direction = if ctx.is_send { "send" } else { "receive" },
            sequence = ctx.message.sequence,
            reply = ctx.message.reply,
            bytes = ctx.message.payload.len(),
            "Message"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Append(u8);

    impl Filter for Append {
        fn execute(&self, ctx: &mut FilterContext<'_>) {
            ctx.payload_mut().push(self.0);
        }
    }

    #[test]
    fn chain_is_symmetric() {
        let chain = FilterChain::new()
            .with(Arc::new(Append(b'a')))
            .with(Arc::new(Append(b'b')))
            .with(Arc::new(Append(b'c')));

        let mut out = Message::request(1, Vec::new());
        chain.apply(&mut out, true);
        assert_eq!(out.payload, b"abc");

        let mut back = out.create_reply();
        chain.apply(&mut back, false);
        assert_eq!(back.payload, b"cba");
    }

    #[test]
    fn names_follow_insertion_order() {
        let chain = FilterChain::new()
            .with(Arc::new(TraceFilter))
            .with(Arc::new(Append(b'a')));

        let names = chain.names();
        assert_eq!(chain.len(), 2);
        assert_eq!(names[0], "trace");
        assert!(names[1].ends_with("Append"));
    }
}
