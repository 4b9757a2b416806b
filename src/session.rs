//! The session: one worker thread driving capture, encoding and the
//! server connection, reporting progress through a callback.
//!
//! A session owns the long-lived pieces (metadata store, server
//! configuration, segment queue) and builds the per-segment pipeline when
//! a segment connects. The worker loop moves data into the network sink,
//! meters the signal, swaps segments as they run dry and reconnects after
//! a connection loss according to the configured profile.
//!
//! Callbacks are always invoked with the session lock released, so a
//! callback may call back into the session freely. `ThreadStart` is
//! emitted by the thread calling [`Session::start`] while
//! `ThreadPostStart` is emitted by the worker itself; since those run
//! concurrently they may be observed in either order.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::capture::Capture;
use crate::common::{ChannelCount, Direction, SampleRate};
use crate::encoder::{CodecKind, Encoder};
use crate::icecast::{IcecastConfig, IcecastSink};
use crate::metadata::Metadata;
use crate::tee::Tee;
use crate::transform::Transform;
use crate::vumeter::{VuMeter, VuMeterResult};
use crate::Error;

mod segment;
pub use segment::{Segment, SegmentPipeline};

/// Granularity of the reconnect sleep; the worker re-checks for a stop
/// request every quantum.
const RECONNECT_QUANTUM: Duration = Duration::from_millis(250);

/// Constant back-off of the `flat` reconnection profile.
const FLAT_BACKOFF: Duration = Duration::from_secs(10);

/// How many vu-meter reads make up one result window by default.
const DEFAULT_VUMETER_INTERVAL: usize = 4;

/// Connection progress as reported through [`Event::StreamState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The worker is connecting to the server.
    Connecting,
    /// The mount was accepted; audio is flowing.
    Connected,
    /// The worker is closing the connection.
    Disconnecting,
    /// The connection is closed.
    Disconnected,
    /// The connection failed; a state change follows.
    ConnectionError,
}

/// Automatic reconnection policy after a stream loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectionProfile {
    /// Do not reconnect; the session stops on loss.
    #[default]
    Disabled,
    /// Retry every 10 seconds.
    Flat,
}

impl ReconnectionProfile {
    /// Parses a profile name. `enabled` is an alias of `flat`, `default`
    /// of `disabled`; unknown names quietly disable reconnection.
    pub fn parse(name: &str) -> Self {
        match name {
            "flat" | "enabled" => ReconnectionProfile::Flat,
            "disabled" | "default" => ReconnectionProfile::Disabled,
            other => {
                tracing::warn!(profile = other, "unknown reconnection profile, disabling");
                ReconnectionProfile::Disabled
            }
        }
    }

    /// The canonical name of this profile.
    pub fn as_str(self) -> &'static str {
        match self {
            ReconnectionProfile::Disabled => "disabled",
            ReconnectionProfile::Flat => "flat",
        }
    }
}

/// Notifications delivered to the session callback.
///
/// Payloads are snapshots; they borrow nothing from the session.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum Event {
    /// Something failed; a more specific event usually follows.
    Error {
        /// What failed.
        error: Error,
    },
    /// A worker thread was started (emitted by the starting thread).
    ThreadStart,
    /// The worker thread is running (emitted by the worker).
    ThreadPostStart,
    /// The worker was asked to stop (emitted by the stopping thread).
    ThreadStop,
    /// The worker thread is about to exit (emitted by the worker).
    ThreadPreStop,
    /// A metering window is complete.
    VuMeterResult {
        /// The measurement.
        result: VuMeterResult,
    },
    /// The connection changed state.
    StreamState {
        /// The new state.
        state: ConnectionState,
        /// The error that caused it, for [`ConnectionState::ConnectionError`].
        error: Option<Error>,
    },
    /// Waiting before a reconnection attempt.
    Reconnect {
        /// Time left until the attempt.
        remaining: Duration,
    },
    /// A segment was wired into the stream.
    SegmentConnect {
        /// The pipeline kind of the segment.
        pipeline: SegmentPipeline,
    },
    /// A segment was taken out of the stream.
    SegmentDisconnect {
        /// The pipeline kind of the segment.
        pipeline: SegmentPipeline,
    },
}

type EventCallback = dyn Fn(&Event) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Stopped,
    Started,
    Stopping,
    Lost,
    Error,
}

/// The per-segment stages. Everything is optional: a file segment wires
/// none of them.
#[derive(Default)]
struct Pipeline {
    capture: Option<Capture>,
    transform: Option<Transform>,
    tee: Option<Tee>,
    encoder: Option<Encoder>,
    vumeter: Option<VuMeter>,
}

struct SessionInner {
    state: SessionState,
    need_reset: bool,
    worker: Option<thread::JoinHandle<()>>,
    callback: Option<Arc<EventCallback>>,

    codec: CodecKind,
    rate: SampleRate,
    channels: ChannelCount,
    buffer_hint: Option<usize>,
    quality: f64,
    vumeter_interval: usize,
    reconnection_profile: ReconnectionProfile,

    metadata: Metadata,
    sink: IcecastSink,

    segments: VecDeque<Arc<Segment>>,
    current: Option<Arc<Segment>>,
    switch_requested: bool,
    pipeline: Pipeline,
}

struct SessionShared {
    inner: Mutex<SessionInner>,
}

impl SessionShared {
    /// Invokes the callback with the lock released.
    fn emit(&self, event: Event) {
        let callback = self.inner.lock().unwrap().callback.clone();
        if let Some(callback) = callback {
            callback(&event);
        }
    }
}

impl SessionInner {
    /// Builds the pipeline for `segment` and wires it into the sink.
    fn segment_connect(&mut self, segment: Arc<Segment>) -> Result<(), Error> {
        tracing::info!(pipeline = ?segment.pipeline(), "connecting segment");

        match segment.pipeline() {
            SegmentPipeline::Live => {
                let capture = Capture::open(
                    segment.driver().unwrap_or("auto"),
                    segment.device(),
                    self.rate,
                    self.channels,
                    Direction::Record,
                    self.buffer_hint,
                )?;

                let transform = Transform::new(self.rate, self.channels)?;
                transform.attach(Some(capture.get_output()));

                let tee = Tee::new(2)?;
                tee.attach(Some(transform.get_output()));

                let encoder = Encoder::new(self.codec, self.rate, self.channels)?;
                encoder.set_quality(self.quality)?;
                encoder.set_metadata(Some(self.metadata.clone()));
                encoder.attach(Some(tee.get_output(Some(0))?));

                let vumeter = VuMeter::new(self.rate, self.channels)?;
                vumeter.attach(Some(tee.get_output(Some(1))?));

                self.sink.attach(Some(encoder.get_output()));
                self.pipeline = Pipeline {
                    capture: Some(capture),
                    transform: Some(transform),
                    tee: Some(tee),
                    encoder: Some(encoder),
                    vumeter: Some(vumeter),
                };
            }
            SegmentPipeline::FileSimple => {
                let handle = match segment.take_handle() {
                    Some(handle) => handle,
                    None => Capture::open(
                        segment.driver().unwrap_or("stdio"),
                        segment.device(),
                        self.rate,
                        self.channels,
                        Direction::Record,
                        None,
                    )?
                    .get_output(),
                };

                self.sink.attach(Some(handle));
                self.pipeline = Pipeline::default();
            }
        }

        self.current = Some(segment);
        Ok(())
    }

    /// Detaches every stage in reverse order and drops the pipeline.
    fn segment_disconnect(&mut self) -> Option<SegmentPipeline> {
        let current = self.current.take()?;
        tracing::info!(pipeline = ?current.pipeline(), "disconnecting segment");

        self.sink.attach(None);
        if let Some(vumeter) = &self.pipeline.vumeter {
            vumeter.attach(None);
        }
        if let Some(encoder) = &self.pipeline.encoder {
            encoder.attach(None);
        }
        if let Some(tee) = &self.pipeline.tee {
            tee.attach(None);
        }
        if let Some(transform) = &self.pipeline.transform {
            transform.attach(None);
        }
        self.pipeline = Pipeline::default();

        Some(current.pipeline())
    }

    /// Applies a pending encoder reset.
    fn reset(&mut self) -> Result<(), Error> {
        if let Some(encoder) = &self.pipeline.encoder {
            encoder.reset()?;
        }
        self.need_reset = false;
        Ok(())
    }
}

/// An audio streaming session.
///
/// Dropping the session stops the worker and closes the connection.
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    /// Creates a session streaming `codec` at the given signal parameters
    /// to the server described by `config`.
    ///
    /// An initial live segment (driver `auto`) is queued; nothing runs
    /// until [`Session::start`].
    pub fn new(
        codec: CodecKind,
        rate: SampleRate,
        channels: ChannelCount,
        buffer_hint: Option<usize>,
        config: &IcecastConfig,
    ) -> Result<Self, Error> {
        if rate == 0 || channels == 0 {
            return Err(Error::Inval);
        }

        let sink = IcecastSink::new();
        sink.set_config(config)?;

        let mut segments = VecDeque::new();
        segments.push_back(Arc::new(Segment::new(SegmentPipeline::Live, None, None)));

        Ok(Session {
            shared: Arc::new(SessionShared {
                inner: Mutex::new(SessionInner {
                    state: SessionState::Stopped,
                    need_reset: false,
                    worker: None,
                    callback: None,
                    codec,
                    rate,
                    channels,
                    buffer_hint,
                    quality: 0.1,
                    vumeter_interval: DEFAULT_VUMETER_INTERVAL,
                    reconnection_profile: ReconnectionProfile::Disabled,
                    metadata: Metadata::new(),
                    sink,
                    segments,
                    current: None,
                    switch_requested: false,
                    pipeline: Pipeline::default(),
                }),
            }),
        })
    }

    /// Sets the event callback. Events fire on the worker thread and on
    /// the thread calling [`Session::start`]/[`Session::stop`].
    pub fn set_callback<F>(&self, callback: F)
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        self.shared.inner.lock().unwrap().callback = Some(Arc::new(callback));
    }

    /// Starts the worker thread. Does nothing when it is already running.
    pub fn start(&self) -> Result<(), Error> {
        // Reap a worker that exited on its own (connection lost with
        // reconnection disabled) so the session can start again. The join
        // happens with the lock released; the exiting worker still needs
        // it for its final events.
        let finished = {
            let mut inner = self.shared.inner.lock().unwrap();
            match inner.state {
                SessionState::Started | SessionState::Stopping | SessionState::Lost => {
                    return Ok(())
                }
                SessionState::Stopped | SessionState::Error => inner.worker.take(),
            }
        };
        if let Some(finished) = finished {
            let _ = finished.join();
        }

        {
            let mut inner = self.shared.inner.lock().unwrap();

            if inner.worker.is_some() {
                // Someone else started the session in the meantime.
                return Ok(());
            }

            let shared = Arc::clone(&self.shared);
            let worker = thread::Builder::new()
                .name("oggcast-session".to_string())
                .spawn(move || worker_main(shared))
                .map_err(|err| {
                    tracing::error!(%err, "can not spawn session worker");
                    Error::Generic
                })?;

            inner.worker = Some(worker);
            inner.state = SessionState::Started;
        }

        self.shared.emit(Event::ThreadStart);
        Ok(())
    }

    /// Stops the worker and waits for it to exit.
    ///
    /// After this returns no further events are delivered.
    pub fn stop(&self) -> Result<(), Error> {
        let worker = {
            let mut inner = self.shared.inner.lock().unwrap();
            let Some(worker) = inner.worker.take() else {
                return Ok(());
            };
            inner.state = SessionState::Stopping;
            worker
        };

        self.shared.emit(Event::ThreadStop);
        let _ = worker.join();

        let mut inner = self.shared.inner.lock().unwrap();
        inner.state = SessionState::Stopped;
        Ok(())
    }

    /// Sets how many meter reads make up one `VuMeterResult` event; zero
    /// disables the events.
    pub fn set_vumeter_interval(&self, interval: usize) {
        self.shared.inner.lock().unwrap().vumeter_interval = interval;
    }

    /// The current vu-meter interval.
    pub fn vumeter_interval(&self) -> usize {
        self.shared.inner.lock().unwrap().vumeter_interval
    }

    /// Sets the encoder quality, in `[-0.1, 1.0]`. Takes full effect at
    /// the next encoder restart (see [`Session::restart_encoder`]).
    pub fn set_quality(&self, quality: f64) -> Result<(), Error> {
        let mut inner = self.shared.inner.lock().unwrap();
        if let Some(encoder) = &inner.pipeline.encoder {
            encoder.set_quality(quality)?;
        } else if !(-0.1..=1.0).contains(&quality) {
            return Err(Error::Inval);
        }
        inner.quality = quality;
        Ok(())
    }

    /// The configured encoder quality.
    pub fn quality(&self) -> f64 {
        self.shared.inner.lock().unwrap().quality
    }

    /// Adds (`replace == false`) or replaces (`replace == true`) a
    /// metadata value. Call [`Session::restart_encoder`] to get the change
    /// onto the wire.
    pub fn set_meta(&self, key: &str, value: &str, replace: bool) {
        let metadata = self.shared.inner.lock().unwrap().metadata.clone();
        if replace {
            metadata.set(key, value);
        } else {
            metadata.add(key, value);
        }
    }

    /// The session's metadata store.
    pub fn metadata(&self) -> Metadata {
        self.shared.inner.lock().unwrap().metadata.clone()
    }

    /// Restarts the encoder at the next page-group boundary, applying
    /// pending quality and metadata changes without reconnecting.
    pub fn restart_encoder(&self) -> Result<(), Error> {
        let inner = self.shared.inner.lock().unwrap();
        match &inner.pipeline.encoder {
            Some(encoder) => encoder.restart(),
            // Nothing running; changes apply when the next segment
            // connects anyway.
            None => Ok(()),
        }
    }

    /// The live transform stage, for gain control. Present while a live
    /// segment is connected.
    pub fn transform(&self) -> Option<Transform> {
        self.shared.inner.lock().unwrap().pipeline.transform.clone()
    }

    /// Sets the reconnection profile by name (see
    /// [`ReconnectionProfile::parse`]).
    pub fn set_reconnection_profile(&self, profile: &str) {
        self.shared.inner.lock().unwrap().reconnection_profile = ReconnectionProfile::parse(profile);
    }

    /// The active reconnection profile.
    pub fn reconnection_profile(&self) -> ReconnectionProfile {
        self.shared.inner.lock().unwrap().reconnection_profile
    }

    /// The currently connected segment.
    pub fn segment(&self) -> Option<Arc<Segment>> {
        self.shared.inner.lock().unwrap().current.clone()
    }

    /// The queued (not yet connected) segments, in order.
    pub fn segment_list(&self) -> Vec<Arc<Segment>> {
        self.shared
            .inner
            .lock()
            .unwrap()
            .segments
            .iter()
            .cloned()
            .collect()
    }

    /// Appends a segment to the queue and returns its shared reference.
    pub fn queue_segment(&self, segment: Segment) -> Arc<Segment> {
        let segment = Arc::new(segment);
        self.shared
            .inner
            .lock()
            .unwrap()
            .segments
            .push_back(Arc::clone(&segment));
        segment
    }

    /// Asks the worker to move to the next queued segment at the next
    /// opportunity, without waiting for the current one to run dry.
    pub fn switch_segment(&self) {
        self.shared.inner.lock().unwrap().switch_requested = true;
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let _ = self.stop();
    }
}

/// Outcome of one connect-and-stream attempt.
enum AttemptEnd {
    /// The connection is gone; consult the reconnection profile.
    ConnectionLost,
    /// The session is shutting down or failed internally.
    Exit,
}

fn worker_main(shared: Arc<SessionShared>) {
    tracing::debug!("session worker running");
    shared.emit(Event::ThreadPostStart);

    loop {
        let end = stream_attempt(&shared);

        // Tear the connection down; this runs on every way out of the
        // streaming loop.
        {
            let mut inner = shared.inner.lock().unwrap();
            if inner.state != SessionState::Stopping && inner.state != SessionState::Error {
                inner.state = SessionState::Lost;
            }
            inner.need_reset = true;
        }

        let sink = shared.inner.lock().unwrap().sink.clone();
        shared.emit(Event::StreamState {
            state: ConnectionState::Disconnecting,
            error: None,
        });
        sink.stop();
        shared.emit(Event::StreamState {
            state: ConnectionState::Disconnected,
            error: None,
        });

        if matches!(end, AttemptEnd::Exit) {
            break;
        }

        let (state, profile) = {
            let inner = shared.inner.lock().unwrap();
            (inner.state, inner.reconnection_profile)
        };

        if state != SessionState::Lost {
            break;
        }

        match profile {
            ReconnectionProfile::Disabled => {
                let mut inner = shared.inner.lock().unwrap();
                inner.state = SessionState::Stopped;
                break;
            }
            ReconnectionProfile::Flat => {
                if !reconnect_sleep(&shared, FLAT_BACKOFF) {
                    break;
                }
                let mut inner = shared.inner.lock().unwrap();
                if inner.state != SessionState::Lost {
                    // A stop request slipped in after the sleep ended.
                    break;
                }
                inner.state = SessionState::Started;
            }
        }
    }

    let mut inner = shared.inner.lock().unwrap();
    if inner.state != SessionState::Stopping && inner.state != SessionState::Error {
        inner.state = SessionState::Stopped;
    }
    drop(inner);

    tracing::debug!("session worker exiting");
    shared.emit(Event::ThreadPreStop);
}

/// One full connect-and-stream attempt, from CONNECTING to the loss or
/// stop that ends it.
fn stream_attempt(shared: &Arc<SessionShared>) -> AttemptEnd {
    // Apply pending resets and make sure a segment is wired up.
    let (sink, mut vumeter) = {
        let mut inner = shared.inner.lock().unwrap();

        if inner.need_reset && inner.reset().is_err() {
            inner.state = SessionState::Error;
            return AttemptEnd::Exit;
        }

        if inner.current.is_none() {
            let next = inner.segments.pop_front();
            let Some(next) = next else {
                tracing::error!("no segment to stream");
                inner.state = SessionState::Error;
                return AttemptEnd::Exit;
            };
            if let Err(err) = inner.segment_connect(Arc::clone(&next)) {
                tracing::error!(%err, "segment connect failed");
                inner.state = SessionState::Error;
                drop(inner);
                shared.emit(Event::Error { error: err });
                return AttemptEnd::Exit;
            }
            drop(inner);
            shared.emit(Event::SegmentConnect {
                pipeline: next.pipeline(),
            });
            let inner = shared.inner.lock().unwrap();
            (inner.sink.clone(), inner.pipeline.vumeter.clone())
        } else {
            (inner.sink.clone(), inner.pipeline.vumeter.clone())
        }
    };

    shared.emit(Event::StreamState {
        state: ConnectionState::Connecting,
        error: None,
    });

    if let Err(err) = sink.start() {
        shared.emit(Event::Error { error: err });
        shared.emit(Event::StreamState {
            state: ConnectionState::ConnectionError,
            error: Some(err),
        });
        return AttemptEnd::ConnectionLost;
    }

    shared.emit(Event::StreamState {
        state: ConnectionState::Connected,
        error: None,
    });

    let mut vumeter_iter = 1usize;
    let mut vumeter_interval = shared.inner.lock().unwrap().vumeter_interval;

    loop {
        let moved = match sink.iter() {
            Ok(moved) => moved,
            Err(err) => {
                shared.emit(Event::Error { error: err });
                shared.emit(Event::StreamState {
                    state: ConnectionState::ConnectionError,
                    error: Some(err),
                });
                return AttemptEnd::ConnectionLost;
            }
        };

        maybe_switch_segment(shared, &sink, &mut vumeter);

        let mut metered = 0;
        if let Some(vu) = &vumeter {
            match vu.read(None) {
                Err(_) => {
                    shared.emit(Event::Error {
                        error: Error::Generic,
                    });
                    return AttemptEnd::ConnectionLost;
                }
                Ok(n) if n > 0 => {
                    metered = n;
                    vumeter_iter += 1;
                }
                Ok(_) => {}
            }

            if vumeter_interval > 0 && vumeter_iter >= vumeter_interval {
                vumeter_iter = 0;
                let result = vu.result();
                shared.emit(Event::VuMeterResult { result });
            }
        }

        if moved == 0 && metered == 0 {
            // Congested socket or dry input; yield a little instead of
            // spinning on the lock.
            thread::sleep(Duration::from_millis(1));
        }

        {
            let mut inner = shared.inner.lock().unwrap();
            vumeter_interval = inner.vumeter_interval;

            if inner.need_reset && inner.reset().is_err() {
                inner.state = SessionState::Error;
            }

            match inner.state {
                SessionState::Started => {}
                SessionState::Error | SessionState::Stopping => return AttemptEnd::Exit,
                _ => return AttemptEnd::ConnectionLost,
            }
        }
    }
}

/// Swaps to the next queued segment when the sink has drained the current
/// one (or a switch was requested explicitly).
fn maybe_switch_segment(
    shared: &Arc<SessionShared>,
    sink: &IcecastSink,
    vumeter: &mut Option<VuMeter>,
) {
    let forced = shared.inner.lock().unwrap().switch_requested;
    if !sink.need_next_segment() && !forced {
        return;
    }

    let mut events = Vec::new();
    {
        let mut inner = shared.inner.lock().unwrap();

        // A live encoder keeps its segment until its bitstream is fully
        // drained, unless the client forced the switch.
        if !forced {
            if let Some(encoder) = &inner.pipeline.encoder {
                if !encoder.output_at_eof() {
                    return;
                }
            }
        }

        let Some(next) = inner.segments.pop_front() else {
            // Nothing queued; keep the current segment wired.
            return;
        };

        inner.switch_requested = false;

        if let Some(pipeline) = inner.segment_disconnect() {
            events.push(Event::SegmentDisconnect { pipeline });
        }

        match inner.segment_connect(Arc::clone(&next)) {
            Ok(()) => {
                events.push(Event::SegmentConnect {
                    pipeline: next.pipeline(),
                });
            }
            Err(err) => {
                tracing::error!(%err, "segment connect failed");
                inner.state = SessionState::Error;
                events.push(Event::Error { error: err });
            }
        }

        // The new segment may or may not have a meter.
        *vumeter = inner.pipeline.vumeter.clone();
    }

    for event in events {
        shared.emit(event);
    }
}

/// Sleeps `total` in quanta, emitting the remaining time and watching for
/// a stop request. Returns false when the session should exit instead of
/// reconnecting.
fn reconnect_sleep(shared: &Arc<SessionShared>, total: Duration) -> bool {
    let mut remaining = total;

    while remaining > Duration::ZERO {
        shared.emit(Event::Reconnect { remaining });

        let quantum = remaining.min(RECONNECT_QUANTUM);
        let before = Instant::now();
        thread::sleep(quantum);
        remaining = remaining.saturating_sub(before.elapsed());

        let state = shared.inner.lock().unwrap().state;
        if state != SessionState::Lost {
            return false;
        }
    }

    true
}
