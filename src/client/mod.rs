// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP client session: handshake, keep-alive, reconnect, packet dispatch.
//!
//! [`Controller`] is the state machine proper. It performs no I/O: inbound
//! units are pushed into it, outbound request bytes accumulate in a queue the
//! event loop drains, and timer policy is expressed as data the loop reads.
//! This keeps the whole handshake testable with canned responses.
//!
//! [`RtspClient`] is the application-facing handle. It spawns the event loop
//! on the current tokio runtime; `start`/`stop`/`play`/`pause` marshal
//! commands into the loop over a channel, and all progress is observed
//! through the [`ClientDelegate`], invoked synchronously on the loop task.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use log::{debug, error, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time;
use url::Url;

use crate::codec::CodecTag;
use crate::rtp::RtpPacket;
use crate::rtsp::{self, RequestFactory};
use crate::tokio::{Connection, ReceivedUnit};
use crate::Error;

pub mod parse;

use parse::SessionMedia;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

/// Sent this many seconds before the server's session timeout would expire.
const KEEPALIVE_MARGIN_SECS: u32 = 5;

/// The session's lifecycle states.
///
/// `Sending*` states double as the record of which request is awaiting a
/// response; at most one request is ever outstanding.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ClientState {
    Initialized,
    Connecting,
    Connected,
    SendingOptions,
    OptionsOk,
    SendingDescribe,
    DescribeOk,
    SendingSetup,
    SetupOk,
    SendingPlay,
    PlayOk,
    SendingPause,
    PauseOk,
    SendingTeardown,
    SendingKeepAlive,
    ReceivedResponse,
    Disconnected,
    Timeout,
    Error,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Callbacks observed by the application.
///
/// All methods are invoked synchronously on the session loop task, in the
/// order events occurred; a slow delegate stalls further packet processing.
pub trait ClientDelegate {
    fn on_state_change(&mut self, old: ClientState, new: ClientState) {
        let _ = (old, new);
    }

    /// One complete reassembled frame (access unit).
    fn on_payload(&mut self, frame: &[u8]) {
        let _ = frame;
    }

    /// An RTP header extension, surfaced as-is.
    fn on_rtp_extension(&mut self, id: u16, data: &[u8]) {
        let _ = (id, data);
    }

    /// The codec resolved from the DESCRIBE handshake.
    fn on_codec(&mut self, codec: CodecTag) {
        let _ = codec;
    }
}

pub(crate) struct WriteOp {
    pub(crate) data: Bytes,

    /// Arms the response deadline; false for fire-and-forget requests
    /// (keep-alives, TEARDOWN).
    pub(crate) await_response: bool,
}

/// The session state machine. I/O-free; see the module docs.
pub(crate) struct Controller {
    factory: RequestFactory,
    delegate: Box<dyn ClientDelegate + Send>,
    state: ClientState,
    media: Option<SessionMedia>,
    session: Option<String>,
    server_allows_aggregate: bool,
    keepalive_interval: Option<Duration>,
    rtp_channel: u8,
    rtcp_channel: u8,
    last_seq: Option<u16>,
    is_first_payload: bool,
    frame: Vec<u8>,
    in_flight: Option<(&'static str, u32)>,
    writes: VecDeque<WriteOp>,
}

impl Controller {
    pub(crate) fn new(url: &Url, delegate: Box<dyn ClientDelegate + Send>) -> Self {
        Controller {
            factory: RequestFactory::new(url),
            delegate,
            state: ClientState::Initialized,
            media: None,
            session: None,
            // Some servers (gstreamer's rtsp-server among them) reject
            // aggregate control URLs for requests after SETUP; the rewrite
            // below is only applied when this is flipped on.
            server_allows_aggregate: false,
            keepalive_interval: None,
            rtp_channel: 0,
            rtcp_channel: 1,
            last_seq: None,
            is_first_payload: true,
            frame: Vec::new(),
            in_flight: None,
            writes: VecDeque::new(),
        }
    }

    pub(crate) fn state(&self) -> ClientState {
        self.state
    }

    pub(crate) fn take_writes(&mut self) -> VecDeque<WriteOp> {
        std::mem::take(&mut self.writes)
    }

    pub(crate) fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval
    }

    fn set_state(&mut self, new: ClientState) {
        let old = self.state;
        self.state = new;
        debug!("state change: {old} -> {new}");
        self.delegate.on_state_change(old, new);
    }

    fn queue(&mut self, request: rtsp::Request, await_response: bool) {
        debug!("sending {} CSeq={}", request.method(), request.cseq());
        self.in_flight = await_response.then(|| (request.method(), request.cseq()));
        self.writes.push_back(WriteOp {
            data: request.encode(),
            await_response,
        });
    }

    pub(crate) fn on_connecting(&mut self) {
        self.set_state(ClientState::Connecting);
    }

    /// Transport is up; the handshake begins with a capability probe.
    pub(crate) fn on_connected(&mut self) {
        self.set_state(ClientState::Connected);
        self.send_options();
    }

    pub(crate) fn on_connect_failed(&mut self, state: ClientState) {
        self.set_state(state);
    }

    pub(crate) fn on_transport_error(&mut self) {
        self.set_state(ClientState::Error);
    }

    pub(crate) fn on_response_timeout(&mut self) {
        if let Some((method, cseq)) = self.in_flight.take() {
            error!("no response to {method} CSeq={cseq}: {}", Error::Timeout);
        }
        self.set_state(ClientState::Timeout);
    }

    pub(crate) fn on_disconnected(&mut self) {
        self.set_state(ClientState::Disconnected);
        self.session = None;
        self.keepalive_interval = None;
        self.last_seq = None;
        self.is_first_payload = true;
        self.in_flight = None;
        self.frame.clear();
    }

    fn send_options(&mut self) {
        self.set_state(ClientState::SendingOptions);
        let request = self.factory.options();
        self.queue(request, true);
    }

    fn send_describe(&mut self) {
        self.set_state(ClientState::SendingDescribe);
        let request = self.factory.describe();
        self.queue(request, true);
    }

    fn send_setup(&mut self) {
        let media = match &self.media {
            Some(m) => m,
            None => {
                self.set_state(ClientState::Error);
                return;
            }
        };
        if media.codec() == CodecTag::Unknown {
            error!(
                "{}",
                Error::UnknownCodec(media.encoding_name().to_owned())
            );
            self.set_state(ClientState::Error);
            return;
        }
        let control = media.control().map(str::to_owned);
        self.set_state(ClientState::SendingSetup);

        // The control URL is where subsequent requests are directed. Relative
        // controls are only adopted when the server accepts aggregate
        // control; absolute ones always replace the path.
        if let Some(control) = control {
            let absolute = control.contains("://");
            let setup_url = if absolute {
                control.to_owned()
            } else {
                format!("{}/{}", self.factory.path(), control)
            };
            if absolute || self.server_allows_aggregate {
                self.factory.set_path(setup_url);
            }
        }

        let transport = format!(
            "RTP/AVP/TCP;unicast;interleaved={}-{}",
            self.rtp_channel, self.rtcp_channel
        );
        let request = self.factory.setup(&transport);
        self.queue(request, true);
    }

    pub(crate) fn send_play(&mut self) {
        let session = match &self.session {
            Some(s) => s.clone(),
            None => {
                warn!("play requested without a session");
                return;
            }
        };
        self.set_state(ClientState::SendingPlay);
        let request = self.factory.play(&session);
        self.queue(request, true);
    }

    pub(crate) fn send_pause(&mut self) {
        let session = match &self.session {
            Some(s) => s.clone(),
            None => {
                warn!("pause requested without a session");
                return;
            }
        };
        self.set_state(ClientState::SendingPause);
        let request = self.factory.pause(&session);
        self.queue(request, true);
    }

    /// Queues a TEARDOWN if a session is established. Fire-and-forget; the
    /// caller shuts the transport down after the write drains.
    pub(crate) fn send_teardown(&mut self) {
        let session = match &self.session {
            Some(s) => s.clone(),
            None => return,
        };
        self.set_state(ClientState::SendingTeardown);
        let request = self.factory.teardown(&session);
        self.queue(request, false);
    }

    /// The keep-alive reuses the capability probe. No response deadline; a
    /// lost keep-alive surfaces later as a server-side session timeout.
    pub(crate) fn send_keepalive(&mut self) {
        self.set_state(ClientState::SendingKeepAlive);
        let request = self.factory.options();
        self.queue(request, false);
    }

    pub(crate) fn on_response(&mut self, response: &rtsp::Response) {
        let prev = self.state;
        self.set_state(ClientState::ReceivedResponse);
        if let Some((method, cseq)) = self.in_flight.take() {
            if !response.ok() {
                error!(
                    "{}",
                    Error::RtspStatus {
                        method,
                        cseq,
                        status: response.status(),
                    }
                );
            }
        }
        match prev {
            ClientState::SendingOptions => self.on_options_response(response),
            ClientState::SendingDescribe => self.on_describe_response(response),
            ClientState::SendingSetup => self.on_setup_response(response),
            ClientState::SendingPlay => self.set_state(if response.ok() {
                ClientState::PlayOk
            } else {
                ClientState::Error
            }),
            ClientState::SendingPause => self.set_state(if response.ok() {
                ClientState::PauseOk
            } else {
                ClientState::Error
            }),
            _ => {
                // Keep-alive replies and any response arriving outside a
                // Sending* state land here.
                trace!("response outside a request state ({prev}): {response:?}");
                if !response.ok() {
                    self.set_state(ClientState::Error);
                }
            }
        }
    }

    fn on_options_response(&mut self, response: &rtsp::Response) {
        if !response.ok() {
            self.set_state(ClientState::Error);
            return;
        }
        self.set_state(ClientState::OptionsOk);
        if self.session.is_none() {
            self.send_describe();
        }
    }

    fn on_describe_response(&mut self, response: &rtsp::Response) {
        if !response.ok() {
            self.set_state(ClientState::Error);
            return;
        }
        self.set_state(ClientState::DescribeOk);
        let medias = match parse::parse_describe(response.body()) {
            Ok(m) => m,
            Err(e) => {
                error!("{}", Error::RtspFraming { description: e });
                self.set_state(ClientState::Error);
                return;
            }
        };
        // Multiple media sections can be offered; the first is used.
        let media = match medias.into_iter().next() {
            Some(m) => m,
            None => {
                error!("DESCRIBE response has no media sections");
                self.set_state(ClientState::Error);
                return;
            }
        };
        info!(
            "session media: codec={} control={:?} frame_rate={:?} dimensions={:?}",
            media.codec(),
            media.control(),
            media.frame_rate(),
            media.dimensions()
        );
        self.delegate.on_codec(media.codec());
        self.media = Some(media);
        self.send_setup();
    }

    fn on_setup_response(&mut self, response: &rtsp::Response) {
        if !response.ok() {
            self.set_state(ClientState::Error);
            return;
        }
        let fields = match rtsp::parse_setup(response) {
            Ok(f) => f,
            Err(e) => {
                error!("{}", Error::RtspFraming { description: e });
                self.set_state(ClientState::Error);
                return;
            }
        };
        self.set_state(ClientState::SetupOk);
        self.session = Some(fields.session);
        if let Some((rtp, rtcp)) = fields.interleaved {
            self.rtp_channel = rtp;
            self.rtcp_channel = rtcp;
        }
        let interval = fields
            .timeout_secs
            .saturating_sub(KEEPALIVE_MARGIN_SECS)
            .max(1);
        self.keepalive_interval = Some(Duration::from_secs(u64::from(interval)));
        self.send_play();
    }

    /// Dispatches one interleaved data unit.
    ///
    /// Units on the companion (RTCP) channel or any other unexpected channel
    /// are ignored. Undecodable packets are dropped and logged; they never
    /// fail the session.
    pub(crate) fn on_data(&mut self, channel: u8, data: Bytes) {
        if channel != self.rtp_channel {
            trace!("ignoring {} bytes on channel {channel}", data.len());
            return;
        }
        let packet = match RtpPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("{}", Error::Packet(e.to_string()));
                return;
            }
        };

        if let Some(last) = self.last_seq {
            if last.wrapping_add(1) != packet.sequence_number() {
                error!(
                    "out of sequence rtp-packets: {last}[LAST] - {}[CURRENT]",
                    packet.sequence_number()
                );
            }
        }
        self.last_seq = Some(packet.sequence_number());

        if let Some((id, ext)) = packet.extension() {
            self.delegate.on_rtp_extension(id, ext);
        }

        let media = match &self.media {
            Some(m) => m,
            None => {
                warn!("media packet before a session description; dropping");
                return;
            }
        };
        if media.codec() == CodecTag::Unknown {
            error!("{}", Error::UnknownCodec(media.encoding_name().to_owned()));
            self.set_state(ClientState::Error);
            return;
        }
        if let Err(e) = crate::codec::depacketize(
            media.codec(),
            media,
            &packet,
            self.is_first_payload,
            &mut self.frame,
        ) {
            warn!("{}", Error::Depacketize(e));
            return;
        }
        self.is_first_payload = false;

        if packet.mark() {
            self.delegate.on_payload(&self.frame);
            self.frame.clear();
        }
    }
}

/// Commands marshaled from the application thread into the session loop.
enum Command {
    Start,
    Play,
    Pause,
    Stop,
}

/// Handle to a session loop running on the tokio runtime.
///
/// Dropping the handle tears the session down (a TEARDOWN is sent if a
/// session is established).
#[derive(Debug)]
pub struct RtspClient {
    tx: mpsc::UnboundedSender<Command>,
}

impl RtspClient {
    /// Validates `url` and spawns the session loop. The loop is idle until
    /// [`RtspClient::start`].
    ///
    /// Must be called within a tokio runtime.
    pub fn new(url: &str, delegate: Box<dyn ClientDelegate + Send>) -> Result<Self, Error> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidArgument(format!("bad URL {url:?}: {e}")))?;
        if url.scheme() != "rtsp" {
            return Err(Error::InvalidArgument(format!(
                "expected rtsp URL, got {:?}",
                url.scheme()
            )));
        }
        if url.host().is_none() {
            return Err(Error::InvalidArgument("URL has no host".to_owned()));
        }
        let controller = Controller::new(&url, delegate);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run(url, controller, rx));
        Ok(RtspClient { tx })
    }

    /// Connects and drives the handshake through PLAY. Asynchronous;
    /// completion is observed via [`ClientDelegate::on_state_change`].
    pub fn start(&self) -> Result<(), Error> {
        self.send(Command::Start)
    }

    /// Sends TEARDOWN (when a session is established) and disconnects. The
    /// handle stays usable; a later [`RtspClient::start`] reconnects.
    pub fn stop(&self) -> Result<(), Error> {
        self.send(Command::Stop)
    }

    pub fn play(&self) -> Result<(), Error> {
        self.send(Command::Play)
    }

    pub fn pause(&self) -> Result<(), Error> {
        self.send(Command::Pause)
    }

    fn send(&self, command: Command) -> Result<(), Error> {
        self.tx
            .send(command)
            .map_err(|_| Error::InvalidArgument("session loop has exited".to_owned()))
    }
}

async fn next_unit(connection: &mut Option<Connection>) -> Option<Result<ReceivedUnit, Error>> {
    match connection {
        Some(c) => c.next().await,
        None => futures::future::pending().await,
    }
}

async fn tick(interval: &mut Option<time::Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => futures::future::pending().await,
    }
}

async fn expired(sleep: &mut Option<Pin<Box<time::Sleep>>>) {
    match sleep {
        Some(s) => s.as_mut().await,
        None => futures::future::pending().await,
    }
}

fn reconnect_timer() -> time::Interval {
    time::interval_at(
        time::Instant::now() + RECONNECT_INTERVAL,
        RECONNECT_INTERVAL,
    )
}

async fn try_connect(url: &Url, controller: &mut Controller) -> Option<Connection> {
    controller.on_connecting();
    match time::timeout(CONNECT_TIMEOUT, Connection::connect(url)).await {
        Ok(Ok(connection)) => {
            controller.on_connected();
            Some(connection)
        }
        Ok(Err(e)) => {
            error!("{}", Error::Connect(e));
            controller.on_connect_failed(ClientState::Error);
            None
        }
        Err(_) => {
            error!("timed out connecting to {url}");
            controller.on_connect_failed(ClientState::Timeout);
            None
        }
    }
}

/// The session event loop: sole owner of the transport, the timers, and the
/// controller. All suspension happens in the `select!`; the decode and
/// dispatch path below it never blocks.
async fn run(url: Url, mut controller: Controller, mut commands: mpsc::UnboundedReceiver<Command>) {
    let mut connection: Option<Connection> = None;
    let mut keepalive: Option<time::Interval> = None;
    let mut armed_keepalive: Option<Duration> = None;
    let mut reconnect: Option<time::Interval> = None;
    let mut response_deadline: Option<Pin<Box<time::Sleep>>> = None;
    let mut pending_stop = false;
    let mut closed = false;

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Start) => {
                    if connection.is_none() {
                        reconnect = None;
                        connection = try_connect(&url, &mut controller).await;
                        if connection.is_none() {
                            reconnect = Some(reconnect_timer());
                        }
                    } else {
                        debug!("start requested while already connected");
                    }
                }
                Some(Command::Play) => controller.send_play(),
                Some(Command::Pause) => controller.send_pause(),
                Some(Command::Stop) => {
                    controller.send_teardown();
                    pending_stop = true;
                }
                None => {
                    // Handle dropped: tear down and exit.
                    controller.send_teardown();
                    pending_stop = true;
                    closed = true;
                }
            },
            unit = next_unit(&mut connection) => match unit {
                Some(Ok(ReceivedUnit::Response(response))) => {
                    response_deadline = None;
                    controller.on_response(&response);
                }
                Some(Ok(ReceivedUnit::Data { channel, data })) => {
                    controller.on_data(channel, data);
                }
                Some(Err(e)) => {
                    error!("transport error: {e}");
                    controller.on_transport_error();
                    connection = None;
                    response_deadline = None;
                    controller.on_disconnected();
                    if reconnect.is_none() {
                        reconnect = Some(reconnect_timer());
                    }
                }
                None => {
                    info!("server closed the connection");
                    connection = None;
                    response_deadline = None;
                    controller.on_disconnected();
                    if reconnect.is_none() {
                        reconnect = Some(reconnect_timer());
                    }
                }
            },
            _ = tick(&mut keepalive) => controller.send_keepalive(),
            _ = tick(&mut reconnect) => {
                info!("attempting reconnect to {url}");
                connection = try_connect(&url, &mut controller).await;
                if connection.is_some() {
                    reconnect = None;
                }
            },
            _ = expired(&mut response_deadline) => {
                response_deadline = None;
                controller.on_response_timeout();
                connection = None;
                controller.on_disconnected();
                if reconnect.is_none() {
                    reconnect = Some(reconnect_timer());
                }
            },
        }

        // Drain queued writes.
        let mut transport_failed = false;
        for op in controller.take_writes() {
            match connection.as_mut() {
                Some(c) => {
                    let await_response = op.await_response;
                    if let Err(e) = c.send(op.data).await {
                        error!("{e}");
                        transport_failed = true;
                        break;
                    }
                    if await_response {
                        response_deadline = Some(Box::pin(time::sleep(RESPONSE_TIMEOUT)));
                    }
                }
                None => warn!("dropping {} byte write; not connected", op.data.len()),
            }
        }
        if transport_failed {
            controller.on_transport_error();
            connection = None;
            response_deadline = None;
            controller.on_disconnected();
            if !pending_stop && reconnect.is_none() {
                reconnect = Some(reconnect_timer());
            }
        }

        if pending_stop {
            pending_stop = false;
            connection = None;
            reconnect = None;
            response_deadline = None;
            if controller.state() != ClientState::Disconnected {
                controller.on_disconnected();
            }
            if closed {
                break;
            }
        }

        // Arm or adjust the keep-alive timer from the negotiated interval.
        if controller.keepalive_interval() != armed_keepalive {
            armed_keepalive = controller.keepalive_interval();
            keepalive =
                armed_keepalive.map(|d| time::interval_at(time::Instant::now() + d, d));
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Debug, PartialEq)]
    enum Event {
        State(ClientState, ClientState),
        Payload(Vec<u8>),
        Extension(u16, Vec<u8>),
        Codec(CodecTag),
    }

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Event>>>);

    impl Recorder {
        fn events(&self) -> Vec<Event> {
            std::mem::take(&mut *self.0.lock().unwrap())
        }

        fn states(&self) -> Vec<ClientState> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    Event::State(_, new) => Some(new),
                    _ => None,
                })
                .collect()
        }
    }

    impl ClientDelegate for Recorder {
        fn on_state_change(&mut self, old: ClientState, new: ClientState) {
            self.0.lock().unwrap().push(Event::State(old, new));
        }
        fn on_payload(&mut self, frame: &[u8]) {
            self.0.lock().unwrap().push(Event::Payload(frame.to_vec()));
        }
        fn on_rtp_extension(&mut self, id: u16, data: &[u8]) {
            self.0
                .lock()
                .unwrap()
                .push(Event::Extension(id, data.to_vec()));
        }
        fn on_codec(&mut self, codec: CodecTag) {
            self.0.lock().unwrap().push(Event::Codec(codec));
        }
    }

    fn controller() -> (Controller, Recorder) {
        let recorder = Recorder::default();
        let url = Url::parse("rtsp://host:554/test.264").unwrap();
        let controller = Controller::new(&url, Box::new(recorder.clone()));
        (controller, recorder)
    }

    fn response(text: &[u8]) -> rtsp::Response {
        rtsp::Response::parse(Bytes::copy_from_slice(text)).unwrap()
    }

    fn take_request(controller: &mut Controller) -> String {
        let mut writes = controller.take_writes();
        assert_eq!(writes.len(), 1, "expected exactly one queued request");
        String::from_utf8(writes.pop_front().unwrap().data.to_vec()).unwrap()
    }

    const DESCRIBE_OK: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: 192\r\n\r\n\
        v=0\r\n\
        o=- 1 1 IN IP4 192.168.0.10\r\n\
        s=streamed by test\r\n\
        t=0 0\r\n\
        m=video 0 RTP/AVP 96\r\n\
        a=rtpmap:96 H264/90000\r\n\
        a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z2QA,aO48gA==\r\n\
        a=control:track1\r\n";

    const SETUP_OK: &[u8] = b"RTSP/1.0 200 OK\r\nCSeq: 3\r\n\
        Session: 12345678;timeout=60\r\n\
        Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n";

    /// Drives OPTIONS through PLAY with canned responses, returning after
    /// PlayOk.
    fn handshake(controller: &mut Controller) {
        controller.on_connected();
        let options = take_request(controller);
        assert!(options.starts_with("OPTIONS rtsp://host:554/test.264 RTSP/1.0\r\n"));

        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"));
        let describe = take_request(controller);
        assert!(describe.starts_with("DESCRIBE rtsp://host:554/test.264 RTSP/1.0\r\n"));
        assert!(describe.contains("Accept: application/sdp\r\n"));

        controller.on_response(&response(DESCRIBE_OK));
        let setup = take_request(controller);
        // Relative control and no aggregate support: SETUP still goes to the
        // base path.
        assert!(setup.starts_with("SETUP rtsp://host:554/test.264 RTSP/1.0\r\n"));
        assert!(setup.contains("Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n"));

        controller.on_response(&response(SETUP_OK));
        let play = take_request(controller);
        assert!(play.starts_with("PLAY rtsp://host:554/test.264 RTSP/1.0\r\n"));
        assert!(play.contains("Session: 12345678\r\n"));

        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 4\r\n\r\n"));
        assert_eq!(controller.state(), ClientState::PlayOk);
    }

    /// Builds a raw interleaved RTP payload: fixed 12-byte header, no CSRCs.
    fn raw_packet(seq: u16, mark: bool, payload: &[u8]) -> Bytes {
        let mut data = vec![0x80, if mark { 0x80 | 96 } else { 96 }];
        data.extend_from_slice(&seq.to_be_bytes());
        data.extend_from_slice(&[0, 0, 0, 0]); // timestamp
        data.extend_from_slice(&[0, 0, 0, 0]); // ssrc
        data.extend_from_slice(payload);
        Bytes::from(data)
    }

    #[test]
    fn handshake_reaches_play_ok() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let states = recorder.states();
        for expected in [
            ClientState::Connected,
            ClientState::SendingOptions,
            ClientState::OptionsOk,
            ClientState::SendingDescribe,
            ClientState::DescribeOk,
            ClientState::SendingSetup,
            ClientState::SetupOk,
            ClientState::SendingPlay,
            ClientState::PlayOk,
        ] {
            assert!(states.contains(&expected), "missing {expected} in {states:?}");
        }
        assert_eq!(
            controller.keepalive_interval(),
            Some(Duration::from_secs(55))
        );
    }

    #[test]
    fn codec_is_reported_to_delegate() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        assert!(recorder
            .events()
            .contains(&Event::Codec(CodecTag::H264)));
    }

    #[test]
    fn failure_at_any_stage_drives_error() {
        for stage in 0..3 {
            let (mut controller, _recorder) = controller();
            controller.on_connected();
            let _ = controller.take_writes();
            let canned: [&[u8]; 3] = [
                b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n",
                DESCRIBE_OK,
                SETUP_OK,
            ];
            for ok in &canned[..stage] {
                controller.on_response(&response(ok));
                let _ = controller.take_writes();
            }
            controller.on_response(&response(b"RTSP/1.0 401 Unauthorized\r\nCSeq: 9\r\n\r\n"));
            assert_eq!(controller.state(), ClientState::Error, "stage {stage}");
            assert!(controller.take_writes().is_empty(), "stage {stage}");
        }
    }

    #[test]
    fn unknown_codec_is_fatal() {
        let (mut controller, recorder) = controller();
        controller.on_connected();
        let _ = controller.take_writes();
        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"));
        let _ = controller.take_writes();
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=s\r\n\
            t=0 0\r\n\
            m=audio 0 RTP/AVP 97\r\n\
            a=rtpmap:97 MPEG4-GENERIC/8000\r\n";
        let head = format!("RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n", body.len());
        let mut describe = head.into_bytes();
        describe.extend_from_slice(body);
        controller.on_response(&response(&describe));
        assert_eq!(controller.state(), ClientState::Error);
        assert!(controller.take_writes().is_empty());
        assert!(recorder.events().contains(&Event::Codec(CodecTag::Unknown)));
    }

    #[test]
    fn absolute_control_url_replaces_request_path() {
        let (mut controller, _recorder) = controller();
        controller.on_connected();
        let _ = controller.take_writes();
        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\n\r\n"));
        let _ = controller.take_writes();
        let body = b"v=0\r\n\
            o=- 1 1 IN IP4 0.0.0.0\r\n\
            s=s\r\n\
            t=0 0\r\n\
            m=video 0 RTP/AVP 26\r\n\
            a=rtpmap:26 JPEG/90000\r\n\
            a=control:rtsp://host:554/other/track1\r\n";
        let head = format!("RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n", body.len());
        let mut describe = head.into_bytes();
        describe.extend_from_slice(body);
        controller.on_response(&response(&describe));
        let setup = take_request(&mut controller);
        assert!(setup.starts_with("SETUP rtsp://host:554/other/track1 RTSP/1.0\r\n"));
    }

    #[test]
    fn teardown_drives_disconnected() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();
        controller.send_teardown();
        let teardown = take_request(&mut controller);
        assert!(teardown.starts_with("TEARDOWN rtsp://host:554/test.264 RTSP/1.0\r\n"));
        assert!(teardown.contains("Session: 12345678\r\n"));
        controller.on_disconnected();
        assert_eq!(controller.state(), ClientState::Disconnected);
        assert_eq!(controller.keepalive_interval(), None);
        // The session is gone; a new play is refused.
        controller.send_play();
        assert!(controller.take_writes().is_empty());
    }

    #[test]
    fn keepalive_response_is_not_an_error() {
        let (mut controller, _recorder) = controller();
        handshake(&mut controller);
        controller.send_keepalive();
        let keepalive = take_request(&mut controller);
        assert!(keepalive.starts_with("OPTIONS "));
        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n"));
        assert_eq!(controller.state(), ClientState::ReceivedResponse);
    }

    #[test]
    fn packets_reassemble_into_frames() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();

        // One IDR slice fragmented over three FU-A packets.
        controller.on_data(0, raw_packet(10, false, &[0x7c, 0x85, 1, 2]));
        controller.on_data(0, raw_packet(11, false, &[0x7c, 0x05, 3, 4]));
        controller.on_data(0, raw_packet(12, true, &[0x7c, 0x45, 5, 6]));

        let events = recorder.events();
        assert_eq!(events.len(), 1);
        match &events[0] {
            Event::Payload(frame) => {
                // sprop parameter sets first (4-byte start codes), then the
                // reassembled NAL.
                let mut expected = vec![0, 0, 0, 1, 0x67, 0x64, 0x00];
                expected.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xee, 0x3c, 0x80]);
                expected.extend_from_slice(&[0, 0, 1, 0x65, 1, 2, 3, 4, 5, 6]);
                assert_eq!(frame, &expected);
            }
            e => panic!("unexpected {e:?}"),
        }

        // The next frame must not repeat the parameter sets.
        controller.on_data(0, raw_packet(13, true, &[0x65, 0xaa]));
        let events = recorder.events();
        assert_eq!(events, [Event::Payload(vec![0, 0, 1, 0x65, 0xaa])]);
    }

    #[test]
    fn companion_channel_is_ignored() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();
        controller.on_data(1, Bytes::from_static(&[0x80, 0xc8, 0, 0])); // RTCP-ish
        controller.on_data(5, Bytes::from_static(b"junk"));
        assert!(recorder.events().is_empty());
        assert_eq!(controller.state(), ClientState::PlayOk);
    }

    #[test]
    fn undecodable_packet_is_dropped() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();
        controller.on_data(0, Bytes::from_static(&[0x40, 0, 0])); // bad version, short
        assert!(recorder.events().is_empty());
        assert_eq!(controller.state(), ClientState::PlayOk);
    }

    #[test]
    fn extension_is_surfaced() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();
        let packet = crate::rtp::RtpPacketBuilder {
            sequence_number: 1,
            extension: Some((0xbead, vec![1, 2, 3, 4])),
            ..Default::default()
        }
        .build(&[0x65, 0x01])
        .unwrap();
        controller.on_data(0, packet.into_data());
        assert!(recorder
            .events()
            .contains(&Event::Extension(0xbead, vec![1, 2, 3, 4])));
    }

    #[test]
    fn pause_response_drives_pause_ok() {
        let (mut controller, _recorder) = controller();
        handshake(&mut controller);
        controller.send_pause();
        let pause = take_request(&mut controller);
        assert!(pause.starts_with("PAUSE "));
        controller.on_response(&response(b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n"));
        assert_eq!(controller.state(), ClientState::PauseOk);
    }

    #[test]
    fn response_timeout_drives_timeout_then_disconnected() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        controller.send_pause();
        let _ = controller.take_writes();
        let _ = recorder.events();
        controller.on_response_timeout();
        controller.on_disconnected();
        assert_eq!(
            recorder.states(),
            [ClientState::Timeout, ClientState::Disconnected]
        );
        assert_eq!(controller.keepalive_interval(), None);
        // Session state is gone; a new play is refused.
        controller.send_play();
        assert!(controller.take_writes().is_empty());
    }

    #[test]
    fn transport_error_drives_error_then_disconnected() {
        let (mut controller, recorder) = controller();
        handshake(&mut controller);
        let _ = recorder.events();
        controller.on_transport_error();
        controller.on_disconnected();
        assert_eq!(
            recorder.states(),
            [ClientState::Error, ClientState::Disconnected]
        );
        assert_eq!(controller.keepalive_interval(), None);
        controller.send_play();
        assert!(controller.take_writes().is_empty());
    }

    #[derive(Debug)]
    enum LoopEvent {
        State(ClientState),
        Payload(Vec<u8>),
        Codec(CodecTag),
    }

    struct ChannelDelegate(mpsc::UnboundedSender<LoopEvent>);

    impl ClientDelegate for ChannelDelegate {
        fn on_state_change(&mut self, _old: ClientState, new: ClientState) {
            let _ = self.0.send(LoopEvent::State(new));
        }
        fn on_payload(&mut self, frame: &[u8]) {
            let _ = self.0.send(LoopEvent::Payload(frame.to_vec()));
        }
        fn on_codec(&mut self, codec: CodecTag) {
            let _ = self.0.send(LoopEvent::Codec(codec));
        }
    }

    /// Minimal in-process server: answers the handshake with canned
    /// responses and pushes one interleaved packet after PLAY.
    async fn serve(listener: tokio::net::TcpListener) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (mut stream, _) = match listener.accept().await {
            Ok(s) => s,
            Err(_) => return,
        };
        let mut buf: Vec<u8> = Vec::new();
        let mut chunk = [0u8; 2048];
        loop {
            while buf.starts_with(b"\r\n") {
                buf.drain(..2);
            }
            let head_end = buf.windows(4).position(|w| w == b"\r\n\r\n");
            let head_end = match head_end {
                Some(i) => i,
                None => {
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                    continue;
                }
            };
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            buf.drain(..head_end + 4);
            let method = head.split_ascii_whitespace().next().unwrap_or("").to_owned();

            let reply: Vec<u8> = match method.as_str() {
                "OPTIONS" => b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nPublic: DESCRIBE, SETUP, PLAY, TEARDOWN\r\n\r\n".to_vec(),
                "DESCRIBE" => {
                    let body = "v=0\r\n\
                        o=- 1 1 IN IP4 127.0.0.1\r\n\
                        s=test\r\n\
                        t=0 0\r\n\
                        m=video 0 RTP/AVP 96\r\n\
                        a=rtpmap:96 H264/90000\r\n\
                        a=fmtp:96 packetization-mode=1;sprop-parameter-sets=Z2QA,aO48gA==\r\n\
                        a=control:track1\r\n";
                    format!(
                        "RTSP/1.0 200 OK\r\nCSeq: 2\r\nContent-Length: {}\r\n\r\n{}",
                        body.len(),
                        body
                    )
                    .into_bytes()
                }
                "SETUP" => b"RTSP/1.0 200 OK\r\nCSeq: 3\r\nSession: 4c331c7;timeout=60\r\n\
                    Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\r\n"
                    .to_vec(),
                "PLAY" => {
                    let mut reply =
                        b"RTSP/1.0 200 OK\r\nCSeq: 4\r\nRange: npt=now-\r\n\r\n".to_vec();
                    let rtp = raw_packet(1, true, &[0x65, 1, 2]);
                    reply.extend_from_slice(&[b'$', 0]);
                    reply.extend_from_slice(&(rtp.len() as u16).to_be_bytes());
                    reply.extend_from_slice(&rtp);
                    reply
                }
                "TEARDOWN" => b"RTSP/1.0 200 OK\r\nCSeq: 5\r\n\r\n".to_vec(),
                _ => b"RTSP/1.0 405 Method Not Allowed\r\nCSeq: 0\r\n\r\n".to_vec(),
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    async fn next_loop_event(events: &mut mpsc::UnboundedReceiver<LoopEvent>) -> LoopEvent {
        time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out awaiting delegate event")
            .expect("session loop dropped the delegate")
    }

    #[tokio::test]
    async fn end_to_end_session() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve(listener));

        let (tx, mut events) = mpsc::unbounded_channel();
        let client = RtspClient::new(
            &format!("rtsp://{}:{}/test.264", addr.ip(), addr.port()),
            Box::new(ChannelDelegate(tx)),
        )
        .unwrap();
        client.start().unwrap();

        let mut saw_codec = false;
        loop {
            match next_loop_event(&mut events).await {
                LoopEvent::Codec(c) => {
                    assert_eq!(c, CodecTag::H264);
                    saw_codec = true;
                }
                LoopEvent::State(ClientState::PlayOk) => break,
                LoopEvent::State(ClientState::Error) => panic!("session failed"),
                _ => {}
            }
        }
        assert!(saw_codec);

        loop {
            if let LoopEvent::Payload(frame) = next_loop_event(&mut events).await {
                let mut expected = vec![0, 0, 0, 1, 0x67, 0x64, 0x00];
                expected.extend_from_slice(&[0, 0, 0, 1, 0x68, 0xee, 0x3c, 0x80]);
                expected.extend_from_slice(&[0, 0, 1, 0x65, 1, 2]);
                assert_eq!(frame, expected);
                break;
            }
        }

        client.stop().unwrap();
        loop {
            if let LoopEvent::State(ClientState::Disconnected) = next_loop_event(&mut events).await
            {
                break;
            }
        }
    }

    /// The loop arms a recurring reconnect timer once the transport drops; a
    /// server that closes every connection sees repeated connect attempts.
    #[tokio::test]
    async fn reconnects_after_server_disconnect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (accepted_tx, mut accepted) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let _ = accepted_tx.send(());
                        drop(stream);
                    }
                    Err(_) => return,
                }
            }
        });

        let (tx, mut events) = mpsc::unbounded_channel();
        let client = RtspClient::new(
            &format!("rtsp://{}:{}/test.264", addr.ip(), addr.port()),
            Box::new(ChannelDelegate(tx)),
        )
        .unwrap();
        client.start().unwrap();

        time::timeout(Duration::from_secs(5), accepted.recv())
            .await
            .expect("timed out awaiting the first connect")
            .unwrap();
        loop {
            if let LoopEvent::State(ClientState::Disconnected) = next_loop_event(&mut events).await
            {
                break;
            }
        }
        // A second attempt arrives once the reconnect interval elapses.
        time::timeout(RECONNECT_INTERVAL + Duration::from_secs(5), accepted.recv())
            .await
            .expect("timed out awaiting a reconnect attempt")
            .unwrap();
    }

    #[tokio::test]
    async fn rejects_non_rtsp_url() {
        let e = RtspClient::new("http://host/stream", Box::new(Recorder::default()))
            .unwrap_err();
        assert!(matches!(e, Error::InvalidArgument(_)));
    }
}
