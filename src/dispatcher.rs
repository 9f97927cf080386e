//! Event dispatch: decode, handle, encode, send.
//!
//! Events for a bound session are queued on its event loop at
//! [`PRIORITY_EVENT`] so they run on one thread in arrival order. Sessions not
//! yet bound to a loop are processed on the calling thread.

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::message::Message;
use crate::network::tls::HandshakeState;
use crate::network::{IoSession, SessionState};
use crate::protocol::SplitOutcome;
use crate::reactor::{wait_until, Selectable, TimerAction, PRIORITY_CONTROL, PRIORITY_EVENT};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

const MIN_IDLE_TICK: Duration = Duration::from_millis(10);
const MAX_IDLE_TICK: Duration = Duration::from_secs(1);

/// Run one event on the current thread.
pub fn process(event: Event) {
    let Event { session, kind } = event;

    if session.is_closed() && !matches!(kind, EventKind::Disconnected) {
        trace!("Session {} closed, dropping event", session.id());
        return;
    }

    match kind {
        EventKind::Accepted(source) => accepted(&session, source),
        EventKind::Connected => connected(&session),
        EventKind::Received => received(&session),
        EventKind::Sent(message) => sent(&session, message),
        EventKind::Idle => session.handler().on_idle(&session),
        EventKind::Exception(error) => exception(&session, error),
        EventKind::Disconnected => disconnected(&session),
    }
}

fn fire(event: Event) {
    if event.session.is_closed() && !matches!(event.kind, EventKind::Disconnected) {
        return;
    }

    let Some(handle) = event.session.event_loop().cloned() else {
        process(event);
        return;
    };

    let session = Arc::clone(&event.session);
    let terminal = matches!(event.kind, EventKind::Disconnected);
    if let Err(e) = handle.submit(PRIORITY_EVENT, move |_| process(event)) {
        if terminal {
            // The loop is gone; the handler must still see the disconnect.
            process(Event::new(session, EventKind::Disconnected));
        } else {
            debug!("Dropped event for session {}: {}", session.id(), e);
        }
    }
}

/// Hand a freshly accepted socket to an I/O loop.
pub fn fire_accepted(session: &Arc<IoSession>, source: Box<dyn Selectable>) {
    process(Event::new(Arc::clone(session), EventKind::Accepted(source)));
}

pub fn fire_connect(session: &Arc<IoSession>) {
    fire(Event::new(Arc::clone(session), EventKind::Connected));
}

pub fn fire_receive(session: &Arc<IoSession>) {
    fire(Event::new(Arc::clone(session), EventKind::Received));
}

pub fn fire_sent(session: &Arc<IoSession>, message: Message) {
    fire(Event::new(Arc::clone(session), EventKind::Sent(message)));
}

pub fn fire_idle(session: &Arc<IoSession>) {
    fire(Event::new(Arc::clone(session), EventKind::Idle));
}

pub fn fire_exception(session: &Arc<IoSession>, error: Error) {
    fire(Event::new(Arc::clone(session), EventKind::Exception(error)));
}

pub fn fire_disconnect(session: &Arc<IoSession>) {
    fire(Event::new(Arc::clone(session), EventKind::Disconnected));
}

/// Report `error` to the handler and close, unless the session already closed.
pub(crate) fn fail(session: &Arc<IoSession>, error: Error) {
    if session.is_closed() {
        debug!("Session {} already closed, ignoring: {}", session.id(), error);
        return;
    }
    warn!("Session {} failed: {}", session.id(), error);
    session.handler().on_exception(session, &error);
    session.close();
}

fn accepted(session: &Arc<IoSession>, source: Box<dyn Selectable>) {
    if let Err(e) = session.init_tls() {
        fail(session, e);
        return;
    }

    let handle = session.config().runtime().io_group().next().clone();
    let target = handle.clone();
    let bound = Arc::clone(session);
    let result = handle.submit(PRIORITY_CONTROL, move |multiplexer| {
        match multiplexer.register(source) {
            Ok(token) => {
                bound.bind(target, Some(token));
                if bound.mark_connected() {
                    fire_connect(&bound);
                }
            }
            Err(e) => fail(&bound, e.into()),
        }
    });

    if let Err(e) = result {
        warn!("Could not register session {}: {}", session.id(), e);
        session.close();
    }
}

fn connected(session: &Arc<IoSession>) {
    if let Some(tls) = session.tls() {
        match tls.state() {
            HandshakeState::Done => {}
            HandshakeState::Failed => return,
            HandshakeState::NotStarted | HandshakeState::Handshaking => {
                if let Err(e) = session.begin_handshake() {
                    fail(session, e);
                }
                return;
            }
        }
    }

    if !session.establish() {
        return;
    }
    session.touch();
    debug!("Session {} established", session.id());

    if let Some(reply) = session.handler().on_connect(session) {
        send(session, reply);
    }
    start_idle_timer(session);

    if matches!(session.channel().is_empty(), Ok(false)) {
        fire_receive(session);
    }
}

fn received(session: &Arc<IoSession>) {
    // A pass is already draining the channel.
    let Some(_permit) = session.try_begin_receive() else {
        return;
    };
    let config = Arc::clone(session.config());

    while !session.is_closed() {
        let outcome = session.channel().with_view(|view| {
            if view.is_empty() {
                return None;
            }
            match config.splitter().can_split(session, view) {
                SplitOutcome::Complete(n) if n == 0 || n > view.len() => Some(SplitOutcome::Invalid),
                outcome => Some(outcome),
            }
        });

        let frame_len = match outcome {
            Ok(Some(SplitOutcome::Complete(n))) => n,
            Ok(Some(SplitOutcome::Invalid)) => {
                fail(session, Error::Protocol("unparseable frame".into()));
                break;
            }
            Ok(Some(SplitOutcome::NeedMoreData)) | Ok(None) | Err(_) => break,
        };

        let frame = match session.channel().read_head(frame_len) {
            Ok(frame) => frame,
            Err(_) => break,
        };
        session.touch();

        match config.filters().decode(session, Message::Bytes(frame)) {
            Ok(Some(message)) => {
                if let Some(reply) = config.handler().on_receive(session, message) {
                    send(session, reply);
                }
            }
            Ok(None) => {
                debug!("Session {} decoded nothing, closing", session.id());
                session.close();
                break;
            }
            Err(e) => {
                warn!("Session {} decode failed: {}", session.id(), e);
                config.handler().on_exception(session, &e);
            }
        }
    }

    // A datagram session with no reply on the way is finished.
    if session.transport().is_datagram() && !session.has_queued_sends() {
        session.close();
    }
}

fn sent(session: &Arc<IoSession>, message: Message) {
    session.handler().on_sent(session, &message);
    if session.transport().is_datagram() {
        session.close();
    }
}

fn exception(session: &Arc<IoSession>, error: Error) {
    session.handler().on_exception(session, &error);
    if error.is_fatal() {
        session.close();
    }
}

fn disconnected(session: &Arc<IoSession>) {
    session.handler().on_disconnect(session);
    session.config().session_finished();
    // A running receive pass releases the buffers when it ends.
    if !session.is_receiving() {
        session.release_buffers();
    }
    debug!("Session {} disconnected", session.id());
}

/// Encode and send `message` on the worker pool. Failures are reported to the
/// handler as exceptions; a full pool drops the message.
pub fn send(session: &Arc<IoSession>, message: Message) {
    if session.is_closed() {
        debug!("Session {} closed, not sending", session.id());
        return;
    }

    let target = Arc::clone(session);
    session.send_queued();
    let job = Box::new(move || {
        if let Err(e) = send_now(&target, message) {
            fire_exception(&target, e);
        }
        target.send_finished();
        if target.transport().is_datagram() && !target.has_queued_sends() {
            target.close_deferred();
        }
    });
    if let Err(e) = session.config().runtime().workers().submit(job) {
        session.send_finished();
        warn!("Send for session {} dropped: {}", session.id(), e);
    }
}

/// Encode and write `message` on the calling thread, then fire `Sent`.
/// Returns the number of plaintext bytes written.
pub fn send_now(session: &Arc<IoSession>, message: Message) -> Result<usize> {
    if session.is_closed() {
        return Err(Error::ConnectionClosed);
    }
    let config = session.config();

    let Some(bytes) = config.filters().encode(session, message.clone())? else {
        return Ok(0);
    };

    if let Some(tls) = session.tls() {
        let timeout = config.settings().read_timeout();
        // Handshake records may still be queued; write them from here too.
        let mut flushed = Ok(());
        let settled = wait_until(timeout, || {
            flushed = session.flush_outbox();
            flushed.is_err() || tls.is_settled() || session.is_closed()
        });
        flushed?;
        if !settled {
            return Err(Error::Timeout(timeout));
        }
        if session.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        if !tls.is_done() {
            return Err(Error::Tls("handshake failed".into()));
        }
    }

    let permit = session.acquire_send(config.settings().send_timeout())?;
    let written = session.write_message(&bytes)?;
    session.touch();
    drop(permit);

    trace!("Session {} sent {} bytes", session.id(), written);
    fire_sent(session, message);
    Ok(written)
}

/// Schedule the recurring idle check. Datagram sessions end after one reply
/// and never idle.
pub(crate) fn start_idle_timer(session: &Arc<IoSession>) {
    if session.transport().is_datagram() {
        return;
    }
    let Some(interval) = session.config().settings().idle_interval() else {
        return;
    };

    let tick = (interval / 10).clamp(MIN_IDLE_TICK, MAX_IDLE_TICK);
    let weak = Arc::downgrade(session);
    let handle = session
        .config()
        .runtime()
        .timer()
        .schedule_repeating(tick, move || {
            let Some(session) = weak.upgrade() else {
                return TimerAction::Stop;
            };
            if session.is_closed() {
                return TimerAction::Stop;
            }
            if session.state() == SessionState::Idle && session.idle_due(interval) {
                session.mark_idle();
                fire_idle(&session);
            }
            TimerAction::Continue
        });
    session.set_idle_timer(handle);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::byte::ByteFilter;
    use crate::filter::string::StringFilter;
    use crate::filter::IoFilter;
    use crate::protocol::fixed::{self, FixedHeaderSplitter};
    use crate::network::transport::Transport;
    use crate::protocol::LineSplitter;
    use crate::testing::{self, Recorder};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn establish(session: &Arc<IoSession>) {
        assert!(session.mark_connected());
        fire_connect(session);
        assert!(session.is_established());
    }

    struct Discard;

    impl IoFilter for Discard {
        fn decode(&self, _session: &IoSession, _message: Message) -> Result<Option<Message>> {
            Ok(None)
        }

        fn encode(&self, _session: &IoSession, message: Message) -> Result<Option<Message>> {
            Ok(Some(message))
        }
    }

    #[test]
    fn nested_receive_is_dropped_while_permit_held() {
        let nested = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&nested);
        let recorder = Arc::new(Recorder::replying(move |session, _message| {
            counter.fetch_add(1, Ordering::SeqCst);
            fire_receive(session);
            None
        }));
        let (_runtime, session) = testing::memory_session(|builder| {
            builder
                .splitter(LineSplitter)
                .filter(StringFilter)
                .handler(Arc::clone(&recorder))
        });

        session.channel().write_tail(b"a\nb\n").unwrap();
        establish(&session);

        assert_eq!(recorder.received_texts(), vec!["a\n", "b\n"]);
        assert_eq!(nested.load(Ordering::SeqCst), 2);
        assert!(!session.is_receiving());
        assert!(session.channel().is_empty().unwrap());
    }

    #[test]
    fn partial_frame_waits_for_more_bytes() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) = testing::memory_session(|builder| {
            builder.splitter(LineSplitter).handler(Arc::clone(&recorder))
        });
        establish(&session);

        session.channel().write_tail(b"hel").unwrap();
        fire_receive(&session);
        assert!(recorder.received_texts().is_empty());

        session.channel().write_tail(b"lo\n").unwrap();
        fire_receive(&session);
        assert_eq!(recorder.received_texts(), vec!["hello\n"]);
    }

    #[test]
    fn nothing_dispatched_after_close() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) =
            testing::memory_session(|builder| builder.handler(Arc::clone(&recorder)));
        establish(&session);
        assert!(session.close());

        fire_receive(&session);
        fire_idle(&session);
        fire_exception(&session, Error::Protocol("late".into()));
        fire_sent(&session, Message::from("late"));
        process(Event::new(Arc::clone(&session), EventKind::Received));

        assert_eq!(recorder.connects(), 1);
        assert_eq!(recorder.disconnects(), 1);
        assert_eq!(recorder.idles(), 0);
        assert!(recorder.exceptions().is_empty());
        assert!(recorder.sent_count() == 0);
        assert!(matches!(session.channel().size(), Err(Error::Released)));
    }

    #[test]
    fn invalid_frame_reports_once_and_closes() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session, transport) = testing::memory_session_with_transport(|builder| {
            builder
                .splitter(FixedHeaderSplitter)
                .filter(ByteFilter)
                .handler(Arc::clone(&recorder))
        });
        establish(&session);

        session
            .channel()
            .write_tail(&[0x81, 0x80, 0, 0, 0, 1, 0x80, b'x'])
            .unwrap();
        fire_receive(&session);

        assert_eq!(recorder.exceptions().len(), 1);
        assert!(recorder.exceptions()[0].contains("Protocol"));
        assert!(session.is_closed());
        assert!(!transport.is_open());
        assert_eq!(recorder.disconnects(), 1);
        assert!(recorder.received_texts().is_empty());
    }

    #[test]
    fn decoded_nothing_closes_the_session() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) = testing::memory_session(|builder| {
            builder
                .splitter(LineSplitter)
                .filter(Discard)
                .handler(Arc::clone(&recorder))
        });
        establish(&session);

        session.channel().write_tail(b"one\ntwo\n").unwrap();
        fire_receive(&session);

        assert!(session.is_closed());
        assert!(recorder.received_texts().is_empty());
        assert_eq!(recorder.disconnects(), 1);
        assert!(session.channel().is_released());
    }

    #[test]
    fn filter_error_does_not_stop_the_pass() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) = testing::memory_session(|builder| {
            builder
                .splitter(LineSplitter)
                .filter(StringFilter)
                .handler(Arc::clone(&recorder))
        });
        establish(&session);

        session.channel().write_tail(b"\xff\xfe\nok\n").unwrap();
        fire_receive(&session);

        assert_eq!(recorder.exceptions().len(), 1);
        assert_eq!(recorder.received_texts(), vec!["ok\n"]);
        assert!(!session.is_closed());
    }

    #[test]
    fn send_encodes_writes_and_reports() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session, transport) = testing::memory_session_with_transport(|builder| {
            builder.filter(ByteFilter).handler(Arc::clone(&recorder))
        });
        establish(&session);

        session.send("hi");
        assert!(wait_until(Duration::from_secs(2), || recorder.sent_count() == 1));
        assert_eq!(transport.written(), fixed::encode_frame(b"hi").unwrap().to_vec());
    }

    #[test]
    fn on_connect_reply_is_sent() {
        let recorder = Arc::new(Recorder::default().greeting(&b"welcome\n"[..]));
        let (_runtime, session, transport) =
            testing::memory_session_with_transport(|builder| builder.handler(Arc::clone(&recorder)));
        establish(&session);

        assert!(wait_until(Duration::from_secs(2), || transport.written() == b"welcome\n"));
    }

    #[test]
    fn send_to_closed_session_fails() {
        let (_runtime, session) = testing::memory_session(|builder| builder);
        establish(&session);
        session.close();
        assert!(matches!(
            session.sync_send("late"),
            Err(Error::ConnectionClosed)
        ));
    }

    #[test]
    fn datagram_session_closes_after_reply() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session, transport) = testing::memory_session_with_transport(|builder| {
            builder.handler(Arc::clone(&recorder))
        });
        transport.set_datagram(true);
        establish(&session);

        assert_eq!(session.sync_send(&b"pong"[..]).unwrap(), 4);
        assert_eq!(recorder.sent_count(), 1);
        assert!(session.is_closed());
        assert_eq!(recorder.disconnects(), 1);
    }

    #[test]
    fn datagram_session_without_reply_closes_after_receive() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session, transport) = testing::memory_session_with_transport(|builder| {
            builder.handler(Arc::clone(&recorder))
        });
        transport.set_datagram(true);
        session.channel().write_tail(b"ping").unwrap();
        establish_datagram(&session);

        assert_eq!(recorder.received_texts(), vec!["ping"]);
        assert!(session.is_closed());
        assert_eq!(recorder.disconnects(), 1);
        assert_eq!(session.config().active_sessions(), 0);
    }

    #[test]
    fn datagram_session_with_reply_closes_once_sent() {
        let recorder = Arc::new(Recorder::replying(|_session, message| Some(message.clone())));
        let (_runtime, session, transport) = testing::memory_session_with_transport(|builder| {
            builder.handler(Arc::clone(&recorder))
        });
        transport.set_datagram(true);
        session.channel().write_tail(b"ping").unwrap();
        establish_datagram(&session);

        assert!(wait_until(Duration::from_secs(2), || recorder.disconnects() == 1));
        assert_eq!(transport.written(), b"ping");
        assert_eq!(recorder.sent_count(), 1);
    }

    fn establish_datagram(session: &Arc<IoSession>) {
        assert!(session.mark_connected());
        fire_connect(session);
    }

    #[test]
    fn idle_fires_once_per_interval() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) = testing::memory_session(|builder| {
            builder
                .idle_interval(Duration::from_secs(1))
                .handler(Arc::clone(&recorder))
        });
        establish(&session);

        std::thread::sleep(Duration::from_millis(3500));
        let idles = recorder.idles();
        assert!((2..=4).contains(&idles), "{} idle events in 3.5s", idles);
        session.close();
    }

    #[test]
    fn idle_fires_for_quiet_sessions_only() {
        let recorder = Arc::new(Recorder::default());
        let (_runtime, session) = testing::memory_session(|builder| {
            builder
                .idle_interval(Duration::from_secs(1))
                .handler(Arc::clone(&recorder))
        });
        establish(&session);

        assert!(wait_until(Duration::from_secs(3), || recorder.idles() >= 1));
        session.close();
        let seen = recorder.idles();
        std::thread::sleep(Duration::from_millis(1300));
        assert_eq!(recorder.idles(), seen);
    }
}
