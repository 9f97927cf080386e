use super::event_loop::LoopHandle;
use mio::event::Event as MioEvent;
use mio::{Events, Poll, Registry, Token};
use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::time::Duration;
use tracing::debug;

/// Token reserved for the loop's waker.
pub const WAKER: Token = Token(usize::MAX);

/// What a source saw on its file descriptor this turn.
#[derive(Debug, Clone, Copy, Default)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub read_closed: bool,
    pub error: bool,
}

impl Readiness {
    pub fn readable() -> Self {
        Self {
            readable: true,
            ..Default::default()
        }
    }

    fn from_event(event: &MioEvent) -> Self {
        Self {
            readable: event.is_readable(),
            writable: event.is_writable(),
            read_closed: event.is_read_closed(),
            error: event.is_error(),
        }
    }
}

/// What the multiplexer should do with a source after `ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    /// Read budget exhausted; call `ready` again next turn without waiting.
    Resume,
    /// Deregister and drop the source.
    Close,
}

/// Anything that can sit in a multiplexer: listeners, sockets.
pub trait Selectable: Send {
    fn register(&mut self, registry: &Registry, token: Token) -> io::Result<()>;

    fn deregister(&mut self, registry: &Registry) -> io::Result<()>;

    fn ready(&mut self, readiness: Readiness) -> Step;

    /// Called once when the owning loop stops.
    fn shutdown(&mut self) {}
}

/// Readiness selector owned by exactly one event loop thread.
pub struct Multiplexer {
    poll: Poll,
    events: Events,
    sources: HashMap<Token, Box<dyn Selectable>>,
    next_token: usize,
    resume: Vec<Token>,
    handle: LoopHandle,
}

impl Multiplexer {
    pub(crate) fn new(poll: Poll, handle: LoopHandle) -> Self {
        Self {
            poll,
            events: Events::with_capacity(1024),
            sources: HashMap::new(),
            next_token: 0,
            resume: Vec::new(),
            handle,
        }
    }

    /// Handle of the loop this multiplexer belongs to.
    pub fn handle(&self) -> &LoopHandle {
        &self.handle
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn contains(&self, token: Token) -> bool {
        self.sources.contains_key(&token)
    }

    /// Register a source and return its token. Tokens are never reused.
    pub fn register(&mut self, mut source: Box<dyn Selectable>) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        source.register(self.poll.registry(), token)?;
        self.sources.insert(token, source);
        Ok(token)
    }

    pub fn deregister(&mut self, token: Token) -> Option<Box<dyn Selectable>> {
        let mut source = self.sources.remove(&token)?;
        if let Err(e) = source.deregister(self.poll.registry()) {
            debug!("Deregister of {:?} failed: {}", token, e);
        }
        self.resume.retain(|t| *t != token);
        Some(source)
    }

    /// One poll pass: wait at most `timeout`, then run every ready source and
    /// every source that asked to be resumed.
    pub(crate) fn turn(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = if self.resume.is_empty() {
            timeout
        } else {
            Duration::ZERO
        };

        if let Err(e) = self.poll.poll(&mut self.events, Some(timeout)) {
            if e.kind() == ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(e);
        }

        let mut ready: Vec<(Token, Readiness)> = self
            .events
            .iter()
            .filter(|event| event.token() != WAKER)
            .map(|event| (event.token(), Readiness::from_event(event)))
            .collect();

        for token in self.resume.drain(..) {
            match ready.iter_mut().find(|(t, _)| *t == token) {
                Some((_, readiness)) => readiness.readable = true,
                None => ready.push((token, Readiness::readable())),
            }
        }

        for (token, readiness) in ready {
            let step = match self.sources.get_mut(&token) {
                Some(source) => source.ready(readiness),
                None => continue,
            };

            match step {
                Step::Continue => {}
                Step::Resume => self.resume.push(token),
                Step::Close => {
                    self.deregister(token);
                }
            }
        }

        Ok(())
    }

    /// Deregister and shut down every source.
    pub(crate) fn shutdown_all(&mut self) {
        let tokens: Vec<Token> = self.sources.keys().copied().collect();
        for token in tokens {
            if let Some(mut source) = self.deregister(token) {
                source.shutdown();
            }
        }
    }
}
