use crate::{
    amf::{self, Value},
    chunk::{self, channel, Packet, DEFAULT_CHUNK_SIZE, DEFAULT_SERVER_BANDWIDTH},
    endpoint::{replace_tokens, Direction, Endpoint, Kind},
    handshake::{Exchange, EXCHANGE_SIZE, PROTOCOL_VERSION},
    next_id,
    socket::Socket,
    stream::Stream,
    types::{is_codec_header, AudioCodec, DecodeError, MessageType, UserControlType, VideoCodec, VideoFrameType},
    wire,
};
use bytes::Bytes;
use log::{debug, info, trace, warn};
use num_traits::FromPrimitive;
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::Write as _,
    rc::{Rc, Weak},
};

const IDLE_TIMEOUT: f32 = 5.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum HandshakeState {
    #[display(fmt = "UNINITIALIZED")]
    Uninitialized,
    #[display(fmt = "VERSION_RECEIVED")]
    VersionReceived,
    #[display(fmt = "VERSION_SENT")]
    VersionSent,
    #[display(fmt = "ACK_SENT")]
    AckSent,
    #[display(fmt = "HANDSHAKE_DONE")]
    HandshakeDone,
}

/// Work a connection cannot finish on its own because it needs the server
/// and stream tables; the scheduler executes these after the dispatch that
/// produced them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConnectionEvent {
    /// A host peer sent `publish`; bind it as an input.
    BindPublish { transaction_id: f64 },
    /// A host peer sent `play`; bind it as an output.
    BindPlay { transaction_id: f64 },
    /// A client connection's far end confirmed publish/play; attach it to
    /// its stream.
    StreamingStarted,
}

pub struct Connection {
    id: u64,
    kind: Kind,
    state: HandshakeState,
    socket: Socket,
    data: Vec<u8>,

    in_chunk_size: u32,
    out_chunk_size: u32,
    server_bandwidth: u32,
    received_headers: HashMap<u32, chunk::Header>,
    sent_headers: HashMap<u32, chunk::Header>,

    invoke_id: u32,
    invokes: HashMap<u32, String>,
    stream_id: u32,

    direction: Direction,
    application_name: String,
    stream_name: String,
    connected: bool,
    closed: bool,
    streaming: bool,
    video_frame_sent: bool,

    ping_interval: f32,
    buffer_size: u32,
    reconnect_count: u32,
    connect_count: u32,
    address_index: usize,

    time_since_last_data: f32,
    time_since_ping: f32,
    time_since_pong: f32,
    time_since_connect: f32,
    time_since_measure: f32,

    current_audio_bytes: u64,
    current_video_bytes: u64,
    audio_rate: u64,
    video_rate: u64,

    amf_version: amf::Version,
    endpoint: Option<Rc<Endpoint>>,
    stream: Weak<RefCell<Stream>>,
    meta_data: Option<Value>,

    pending_stream_stop: bool,
    id_string: String,
}

impl Connection {
    pub fn new_host(socket: Socket) -> Self {
        let mut connection = Self::with_socket(Kind::Host, socket);
        connection.update_id_string();
        info!("{}create connection", connection.id_string);
        connection
    }

    pub fn new_client(
        stream: Weak<RefCell<Stream>>,
        application_name: &str,
        stream_name: &str,
        endpoint: Rc<Endpoint>,
    ) -> Self {
        let mut connection = Self::with_socket(Kind::Client, Socket::disconnected());
        connection.direction = endpoint.direction;
        connection.amf_version = endpoint.amf_version;
        connection.reconnect_count = endpoint.reconnect_count;
        connection.buffer_size = endpoint.buffer_size;
        connection.ping_interval = endpoint.ping_interval;
        connection.stream = stream;
        connection.resolve_names(&endpoint, application_name, stream_name);
        connection.endpoint = Some(endpoint);
        connection.update_id_string();
        info!("{}create connection", connection.id_string);
        connection
    }

    fn with_socket(kind: Kind, socket: Socket) -> Self {
        Self {
            id: next_id(),
            kind,
            state: HandshakeState::Uninitialized,
            socket,
            data: Vec::new(),
            in_chunk_size: DEFAULT_CHUNK_SIZE,
            out_chunk_size: DEFAULT_CHUNK_SIZE,
            server_bandwidth: DEFAULT_SERVER_BANDWIDTH,
            received_headers: HashMap::new(),
            sent_headers: HashMap::new(),
            invoke_id: 0,
            invokes: HashMap::new(),
            stream_id: 0,
            direction: Direction::None,
            application_name: String::new(),
            stream_name: String::new(),
            connected: false,
            closed: false,
            streaming: false,
            video_frame_sent: false,
            ping_interval: 60.0,
            buffer_size: 3000,
            reconnect_count: 0,
            connect_count: 0,
            address_index: 0,
            time_since_last_data: 0.0,
            time_since_ping: 0.0,
            time_since_pong: 0.0,
            time_since_connect: 0.0,
            time_since_measure: 0.0,
            current_audio_bytes: 0,
            current_video_bytes: 0,
            audio_rate: 0,
            video_rate: 0,
            amf_version: amf::Version::Amf0,
            endpoint: None,
            stream: Weak::new(),
            meta_data: None,
            pending_stream_stop: false,
            id_string: String::new(),
        }
    }

    /// Client connections derive their names from the stream they serve,
    /// run through the endpoint's templates.
    fn resolve_names(&mut self, endpoint: &Endpoint, application_name: &str, stream_name: &str) {
        let address = endpoint.addresses.first();
        let tokens = [
            ("id", self.id.to_string()),
            ("streamName", stream_name.to_owned()),
            ("applicationName", application_name.to_owned()),
            (
                "ipAddress",
                address.map_or_else(String::new, |a| a.addr.ip().to_string()),
            ),
            (
                "port",
                address.map_or_else(String::new, |a| a.addr.port().to_string()),
            ),
        ];

        self.application_name = if endpoint.application_name.is_empty() {
            application_name.to_owned()
        } else {
            replace_tokens(&endpoint.application_name, &tokens)
        };
        self.stream_name = if endpoint.stream_name.is_empty() {
            stream_name.to_owned()
        } else {
            replace_tokens(&endpoint.stream_name, &tokens)
        };
    }

    fn update_id_string(&mut self) {
        self.id_string = format!(
            "[CON:{} {}/{}] ",
            self.id, self.application_name, self.stream_name
        );
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.local_addr()
    }

    pub fn is_closed(&self) -> bool {
        // A host connection is finished the moment its peer is gone.
        (self.kind == Kind::Host && !self.socket.is_ready()) || self.closed
    }

    pub fn is_dependable(&self) -> bool {
        self.kind == Kind::Host
            || (self.direction == Direction::Input
                && self.endpoint.as_ref().map_or(false, |e| e.is_name_known()))
    }

    pub fn set_stream(&mut self, stream: Weak<RefCell<Stream>>) {
        self.stream = stream;
    }

    pub fn stream(&self) -> Option<Rc<RefCell<Stream>>> {
        self.stream.upgrade()
    }

    pub fn set_endpoint(&mut self, endpoint: Rc<Endpoint>) {
        self.ping_interval = endpoint.ping_interval;
        self.endpoint = Some(endpoint);
    }

    pub fn begin_streaming(&mut self) {
        self.streaming = true;
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: HandshakeState) {
        self.state = state;
    }

    #[cfg(test)]
    pub(crate) fn force_direction(&mut self, direction: Direction) {
        self.direction = direction;
    }

    pub fn take_pending_stream_stop(&mut self) -> Option<Rc<RefCell<Stream>>> {
        if self.pending_stream_stop {
            self.pending_stream_stop = false;
            self.stream.upgrade()
        } else {
            None
        }
    }

    /// Starts the dial-out for a client connection.
    pub fn connect(&mut self) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        if let Some(address) = endpoint.addresses.get(self.address_index) {
            trace!("{}connecting to {}", self.id_string, address.addr);
            if let Err(err) = self.socket.connect(address.addr) {
                info!("{}connect to {} failed: {}", self.id_string, address.addr, err);
            }
        }
    }

    /// Connect completion: a client opens the handshake.
    pub fn handle_connect(&mut self) {
        if self.kind != Kind::Client {
            return;
        }
        info!(
            "{}connected to {}",
            self.id_string,
            self.socket
                .remote_addr()
                .map_or_else(|| "?".to_owned(), |a| a.to_string())
        );

        self.socket.send(&[PROTOCOL_VERSION]);
        let mut buffer = Vec::with_capacity(EXCHANGE_SIZE);
        Exchange::challenge().encode(&mut buffer);
        self.socket.send(&buffer);
        trace!("{}sent version and challenge", self.id_string);

        self.state = HandshakeState::VersionSent;
        self.time_since_last_data = 0.0;
    }

    /// Transport close; indistinguishable from an error on the socket.
    pub fn handle_socket_closed(&mut self) {
        info!("{}peer disconnected", self.id_string);
        self.socket.close();
        self.reset();
        self.time_since_ping = 0.0;
        self.time_since_pong = 0.0;
        self.time_since_connect = 0.0;
    }

    pub fn close(&mut self, force: bool) {
        if self.closed {
            return;
        }
        info!("{}close", self.id_string);
        self.closed |= force;
        self.socket.close();
        self.reset();
    }

    /// Teardown initiated by the owning stream; does not notify it back.
    pub fn shutdown(&mut self) {
        self.closed = true;
        self.streaming = false;
        self.socket.close();
    }

    fn reset(&mut self) {
        if self.streaming && self.stream.upgrade().is_some() {
            self.pending_stream_stop = true;
        }
        self.streaming = false;

        self.state = HandshakeState::Uninitialized;
        self.data.clear();
        self.received_headers.clear();
        self.sent_headers.clear();
        self.in_chunk_size = DEFAULT_CHUNK_SIZE;
        self.out_chunk_size = DEFAULT_CHUNK_SIZE;
        self.server_bandwidth = DEFAULT_SERVER_BANDWIDTH;
        self.invoke_id = 0;
        self.invokes.clear();
        self.connected = false;
        self.video_frame_sent = false;
        self.meta_data = None;
        self.time_since_measure = 0.0;
        self.current_audio_bytes = 0;
        self.current_video_bytes = 0;
        self.audio_rate = 0;
        self.video_rate = 0;
        self.amf_version = self
            .endpoint
            .as_ref()
            .map_or(amf::Version::Amf0, |e| e.amf_version);

        if self.kind == Kind::Host {
            self.endpoint = None;
            self.direction = Direction::None;
            self.application_name.clear();
            self.stream_name.clear();
            self.update_id_string();
        }
    }

    /// Advances all timers; called once per scheduler tick.
    pub fn update(&mut self, delta: f32) {
        if self.closed {
            return;
        }

        if self.socket.is_ready() {
            self.time_since_last_data += delta;
            if self.time_since_last_data > IDLE_TIMEOUT {
                info!("{}no data for {}s, disconnecting", self.id_string, IDLE_TIMEOUT);
                self.time_since_last_data = 0.0;
                self.close(self.kind == Kind::Host);
                return;
            }
        }

        match self.kind {
            Kind::Host => {
                if self.connected && self.ping_interval > 0.0 {
                    self.time_since_ping += delta;
                    self.time_since_pong += delta;

                    if self.time_since_ping >= self.ping_interval {
                        self.time_since_ping = 0.0;
                        self.send_user_control(UserControlType::Ping, 0, 0, 0);
                    }
                    if self.time_since_pong >= 2.0 * self.ping_interval {
                        info!("{}no pong, disconnecting", self.id_string);
                        self.close(true);
                        return;
                    }
                }
            }
            Kind::Client => {
                let Some(endpoint) = self.endpoint.clone() else {
                    return;
                };

                if self.socket.is_ready() && self.state == HandshakeState::HandshakeDone {
                    self.time_since_connect = 0.0;
                } else {
                    // A pending connect has the shorter connect deadline; a
                    // connected but unhandshaken socket has until the
                    // reconnect interval.
                    let deadline = if self.socket.is_connecting() {
                        endpoint.connection_timeout
                    } else {
                        endpoint.reconnect_interval
                    };

                    self.time_since_connect += delta;
                    if self.time_since_connect >= deadline {
                        self.time_since_connect = 0.0;
                        self.state = HandshakeState::Uninitialized;

                        if self.connect_count >= self.reconnect_count {
                            self.connect_count = 0;
                            self.address_index =
                                (self.address_index + 1) % endpoint.addresses.len().max(1);
                        } else {
                            self.connect_count += 1;
                        }
                        self.connect();
                    }
                }
            }
        }

        self.time_since_measure += delta;
        if self.time_since_measure >= 1.0 {
            self.time_since_measure = 0.0;
            self.audio_rate = self.current_audio_bytes;
            self.video_rate = self.current_video_bytes;
            self.current_audio_bytes = 0;
            self.current_video_bytes = 0;
        }
    }

    /// Appends received bytes and runs the state machine; whole packets are
    /// dispatched and any work needing the server tables is pushed to
    /// `events`.
    pub fn handle_read(&mut self, new_data: &[u8], events: &mut Vec<ConnectionEvent>) {
        self.data.extend_from_slice(new_data);
        if !new_data.is_empty() {
            self.time_since_last_data = 0.0;
        }
        trace!("{}got {} bytes", self.id_string, new_data.len());

        let mut offset = 0;
        while offset < self.data.len() && !self.closed {
            if self.state == HandshakeState::HandshakeDone {
                match chunk::decode_packet(
                    &self.data,
                    offset,
                    self.in_chunk_size,
                    &mut self.received_headers,
                ) {
                    Ok((packet, read)) => {
                        offset += read;
                        self.handle_packet(&packet, events);
                    }
                    Err(DecodeError::ShortRead) => break,
                    Err(err) => {
                        warn!("{}bad chunk: {}", self.id_string, err);
                        self.close(self.kind == Kind::Host);
                        break;
                    }
                }
            } else if !self.advance_handshake(&mut offset) {
                break;
            }
        }

        self.data.drain(..offset.min(self.data.len()));
    }

    /// One handshake step; false means more bytes are needed.
    fn advance_handshake(&mut self, offset: &mut usize) -> bool {
        let available = &self.data[*offset..];
        match (self.kind, self.state) {
            (Kind::Host, HandshakeState::Uninitialized) => {
                let Some(&version) = available.first() else {
                    return false;
                };
                *offset += 1;
                if version != PROTOCOL_VERSION {
                    warn!("{}unsupported version {}, disconnecting", self.id_string, version);
                    self.close(false);
                    return false;
                }
                self.socket.send(&[PROTOCOL_VERSION]);
                self.state = HandshakeState::VersionSent;
                true
            }
            (Kind::Host, HandshakeState::VersionSent) => {
                let Some(challenge) = Exchange::decode(available) else {
                    return false;
                };
                *offset += EXCHANGE_SIZE;
                trace!("{}got challenge, time {}", self.id_string, challenge.time);

                let mut reply = Vec::with_capacity(2 * EXCHANGE_SIZE);
                Exchange::challenge().encode(&mut reply);
                Exchange::ack(&challenge).encode(&mut reply);
                self.socket.send(&reply);

                self.state = HandshakeState::AckSent;
                true
            }
            (Kind::Host, HandshakeState::AckSent) => {
                if Exchange::decode(available).is_none() {
                    return false;
                }
                *offset += EXCHANGE_SIZE;
                trace!("{}handshake done", self.id_string);
                self.state = HandshakeState::HandshakeDone;
                true
            }
            (Kind::Client, HandshakeState::VersionSent) => {
                let Some(&version) = available.first() else {
                    return false;
                };
                *offset += 1;
                if version != PROTOCOL_VERSION {
                    warn!("{}unsupported version {}, disconnecting", self.id_string, version);
                    self.close(false);
                    return false;
                }
                self.state = HandshakeState::VersionReceived;
                true
            }
            (Kind::Client, HandshakeState::VersionReceived) => {
                let Some(challenge) = Exchange::decode(available) else {
                    return false;
                };
                *offset += EXCHANGE_SIZE;

                let mut reply = Vec::with_capacity(EXCHANGE_SIZE);
                Exchange::ack(&challenge).encode(&mut reply);
                self.socket.send(&reply);

                self.state = HandshakeState::AckSent;
                true
            }
            (Kind::Client, HandshakeState::AckSent) => {
                if Exchange::decode(available).is_none() {
                    return false;
                }
                *offset += EXCHANGE_SIZE;
                trace!("{}handshake done", self.id_string);
                self.state = HandshakeState::HandshakeDone;

                debug!("{}connecting to application {}", self.id_string, self.application_name);
                self.send_connect();
                true
            }
            _ => {
                warn!("{}unexpected bytes in state {}", self.id_string, self.state);
                self.close(self.kind == Kind::Host);
                false
            }
        }
    }

    fn handle_packet(&mut self, packet: &Packet, events: &mut Vec<ConnectionEvent>) {
        let Some(message_type) = MessageType::from_u8(packet.message_type) else {
            debug!("{}unhandled message {}", self.id_string, packet.message_type);
            return;
        };

        let result = match message_type {
            MessageType::SetChunkSize => self.on_set_chunk_size(packet),
            MessageType::Abort => {
                trace!("{}received ABORT", self.id_string);
                Ok(())
            }
            MessageType::BytesRead => {
                let bytes_read = wire::decode_int_be(&packet.data, 0, 4);
                trace!("{}received BYTES_READ {:?}", self.id_string, bytes_read);
                bytes_read.map(|_| ())
            }
            MessageType::UserControl => self.on_user_control(packet),
            MessageType::ServerBandwidth => {
                let bandwidth = wire::decode_int_be(&packet.data, 0, 4);
                trace!("{}received SERVER_BANDWIDTH {:?}", self.id_string, bandwidth);
                bandwidth.map(|_| ())
            }
            MessageType::ClientBandwidth => {
                let bandwidth = wire::decode_int_be(&packet.data, 0, 4);
                trace!("{}received CLIENT_BANDWIDTH {:?}", self.id_string, bandwidth);
                bandwidth.map(|_| ())
            }
            MessageType::AudioPacket => self.on_audio(packet),
            MessageType::VideoPacket => self.on_video(packet),
            MessageType::Data | MessageType::FlexData => self.on_data(packet, message_type),
            MessageType::Invoke | MessageType::FlexInvoke => {
                self.on_invoke(packet, message_type, events)
            }
            MessageType::SharedObject | MessageType::FlexSharedObject => {
                trace!("{}received shared object", self.id_string);
                Ok(())
            }
            MessageType::Aggregate => {
                trace!("{}received aggregated messages", self.id_string);
                Ok(())
            }
        };

        if let Err(err) = result {
            warn!("{}bad {:?} packet: {}", self.id_string, message_type, err);
            self.close(self.kind == Kind::Host);
        }
    }

    fn on_set_chunk_size(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        self.in_chunk_size = wire::decode_int_be(&packet.data, 0, 4)? as u32;
        trace!("{}received SET_CHUNK_SIZE {}", self.id_string, self.in_chunk_size);
        if self.kind == Kind::Client {
            self.send_set_chunk_size();
        }
        Ok(())
    }

    fn on_user_control(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        let raw_type = wire::decode_int_be(&packet.data, 0, 2)? as u16;
        let parameter = wire::decode_int_be(&packet.data, 2, 4)? as u32;
        let control = UserControlType::from_u16(raw_type);
        trace!(
            "{}received USER_CONTROL {:?} parameter {}",
            self.id_string,
            control,
            parameter
        );

        match control {
            Some(UserControlType::Ping) => {
                // A ping is answered with a pong carrying the same parameter.
                self.send_user_control(UserControlType::Pong, packet.timestamp, parameter, 0);
            }
            Some(UserControlType::Pong) => self.time_since_pong = 0.0,
            _ => {}
        }
        Ok(())
    }

    fn on_audio(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        if self.direction != Direction::Input {
            warn!("{}audio packet on a non-input connection, disconnecting", self.id_string);
            self.close(self.kind == Kind::Host);
            return Ok(());
        }

        self.current_audio_bytes += packet.data.len() as u64;

        let Some(stream) = self.stream.upgrade() else {
            warn!("{}audio packet without a stream, disconnecting", self.id_string);
            self.close(false);
            return Ok(());
        };

        if is_codec_header(&packet.data) {
            let format = packet.data[0];
            if let Some(codec) = AudioCodec::from_u8((format & 0xf0) >> 4) {
                let channels = (format & 0x01) + 1;
                let sample_size = if format & 0x02 != 0 { 16 } else { 8 };
                trace!(
                    "{}audio header, codec {}, {} channel(s), {} bit",
                    self.id_string,
                    codec.name(),
                    channels,
                    sample_size
                );
            }
            stream.borrow_mut().send_audio_header(&packet.data);
        } else {
            stream
                .borrow_mut()
                .send_audio_frame(packet.timestamp, &packet.data);
        }
        Ok(())
    }

    fn on_video(&mut self, packet: &Packet) -> Result<(), DecodeError> {
        if self.direction != Direction::Input {
            warn!("{}video packet on a non-input connection, disconnecting", self.id_string);
            self.close(self.kind == Kind::Host);
            return Ok(());
        }

        self.current_video_bytes += packet.data.len() as u64;
        let frame_type = VideoFrameType::of(&packet.data);

        let Some(stream) = self.stream.upgrade() else {
            warn!("{}video packet without a stream, disconnecting", self.id_string);
            self.close(false);
            return Ok(());
        };

        if is_codec_header(&packet.data) {
            if let Some(codec) = VideoCodec::from_u8(packet.data[0] & 0x0f) {
                trace!("{}video header, codec {}", self.id_string, codec.name());
            }
            stream.borrow_mut().send_video_header(&packet.data);
        } else {
            stream
                .borrow_mut()
                .send_video_frame(packet.timestamp, &packet.data, frame_type);
        }
        Ok(())
    }

    fn on_data(&mut self, packet: &Packet, message_type: MessageType) -> Result<(), DecodeError> {
        let mut offset = 0;
        if message_type == MessageType::FlexData {
            // One encoding-tag byte precedes the body; it is always zero.
            let tag = wire::decode_int_be(&packet.data, 0, 1)?;
            if tag != 0 {
                return Err(DecodeError::Malformed("non-zero encoding tag"));
            }
            offset += 1;
        }

        if self.direction != Direction::Input {
            warn!("{}data packet on a non-input connection, disconnecting", self.id_string);
            self.close(self.kind == Kind::Host);
            return Ok(());
        }

        let (command, read) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
        offset += read;
        let command = command
            .as_str()
            .ok_or(DecodeError::Malformed("command name is not a string"))?
            .to_owned();
        trace!("{}received data command {}", self.id_string, command);

        let argument1 = match Value::decode(amf::Version::Amf0, &packet.data, offset) {
            Ok((value, read)) => {
                offset += read;
                Some(value)
            }
            Err(_) => None,
        };
        let argument2 = match Value::decode(amf::Version::Amf0, &packet.data, offset) {
            Ok((value, _)) => Some(value),
            Err(_) => None,
        };

        let Some(stream) = self.stream.upgrade() else {
            warn!("{}data command without a stream, disconnecting", self.id_string);
            self.close(false);
            return Ok(());
        };

        match (command.as_str(), &argument1, &argument2) {
            ("@setDataFrame", Some(Value::String(name)), Some(meta))
                if name == "onMetaData" && meta.is_map() =>
            {
                self.log_metadata_codecs(meta);
                self.meta_data = Some(meta.clone());
                stream.borrow_mut().send_meta_data(meta);
            }
            ("onMetaData", Some(meta), _) if meta.is_map() => {
                self.log_metadata_codecs(meta);
                self.meta_data = Some(meta.clone());
                stream.borrow_mut().send_meta_data(meta);
            }
            ("onTextData", Some(text), _) => {
                stream.borrow_mut().send_text_data(packet.timestamp, text);
            }
            _ => trace!("{}ignoring data command {}", self.id_string, command),
        }
        Ok(())
    }

    fn log_metadata_codecs(&self, meta: &Value) {
        if let Some(id) = meta.get("audiocodecid").and_then(Value::as_number) {
            if let Some(codec) = AudioCodec::from_u8(id as u8) {
                debug!("{}audio codec: {}", self.id_string, codec.name());
            }
        }
        if let Some(id) = meta.get("videocodecid").and_then(Value::as_number) {
            if let Some(codec) = VideoCodec::from_u8(id as u8) {
                debug!("{}video codec: {}", self.id_string, codec.name());
            }
        }
    }

    fn on_invoke(
        &mut self,
        packet: &Packet,
        message_type: MessageType,
        events: &mut Vec<ConnectionEvent>,
    ) -> Result<(), DecodeError> {
        let mut offset = 0;
        if message_type == MessageType::FlexInvoke {
            let tag = wire::decode_int_be(&packet.data, 0, 1)?;
            if tag != 0 {
                return Err(DecodeError::Malformed("non-zero encoding tag"));
            }
            offset += 1;
        }

        let (command, read) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
        offset += read;
        let command = command
            .as_str()
            .ok_or(DecodeError::Malformed("command name is not a string"))?
            .to_owned();

        let (transaction, read) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
        offset += read;
        let transaction_id = transaction
            .as_number()
            .ok_or(DecodeError::Malformed("transaction id is not a number"))?;

        let argument1 = match Value::decode(amf::Version::Amf0, &packet.data, offset) {
            Ok((value, read)) => {
                offset += read;
                Some(value)
            }
            Err(_) => None,
        };

        debug!(
            "{}received invoke {} (transaction {})",
            self.id_string, command, transaction_id
        );

        match command.as_str() {
            "connect" => {
                if self.kind != Kind::Host {
                    warn!("{}unexpected \"connect\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                let Some(argument) = argument1 else {
                    return Err(DecodeError::Malformed("connect without an argument"));
                };
                self.application_name = argument
                    .get("app")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_owned();
                if let Some(encoding) = argument.get("objectEncoding").and_then(Value::as_number) {
                    self.amf_version = if encoding == 3.0 {
                        amf::Version::Amf3
                    } else {
                        amf::Version::Amf0
                    };
                }
                self.update_id_string();

                self.send_server_bandwidth();
                self.send_client_bandwidth();
                self.send_user_control(UserControlType::ClearStream, 0, 0, 0);
                self.send_set_chunk_size();
                self.send_connect_result(transaction_id);
                self.send_on_bw_done();
                self.connected = true;

                info!(
                    "{}peer connected to application \"{}\"",
                    self.id_string, self.application_name
                );
            }
            "onBWDone" => {
                if self.kind != Kind::Client {
                    warn!("{}unexpected \"onBWDone\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.send_check_bw();
            }
            "_checkbw" => {
                if self.kind != Kind::Host {
                    warn!("{}unexpected \"_checkbw\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.send_check_bw_result(transaction_id);
            }
            "createStream" => {
                if self.kind != Kind::Host {
                    warn!("{}unexpected \"createStream\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.send_create_stream_result(transaction_id);
            }
            "releaseStream" => {
                if self.kind != Kind::Host {
                    warn!("{}unexpected \"releaseStream\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.send_release_stream_result(transaction_id);
            }
            "deleteStream" => {
                if self.kind != Kind::Host {
                    warn!("{}unexpected \"deleteStream\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                if self.stream.upgrade().is_some() {
                    self.close(false);
                }
            }
            "FCPublish" => match self.direction {
                Direction::None | Direction::Input => {
                    self.send_on_fc_publish();
                }
                Direction::Output => {
                    warn!("{}unexpected \"FCPublish\", disconnecting", self.id_string);
                    self.close(false);
                }
            },
            "onFCPublish" => {}
            "FCUnpublish" => {
                if self.direction == Direction::Input {
                    info!("{}peer unpublished \"{}\"", self.id_string, self.stream_name);
                    self.send_on_fc_unpublish();
                    self.close(false);
                } else {
                    warn!("{}unexpected \"FCUnpublish\", disconnecting", self.id_string);
                    self.close(false);
                }
            }
            "onFCUnpublish" => {
                if self.direction != Direction::Input {
                    warn!("{}unexpected \"onFCUnpublish\", disconnecting", self.id_string);
                    self.close(false);
                }
            }
            "FCSubscribe" => match self.direction {
                Direction::None | Direction::Output => {
                    self.send_on_fc_subscribe();
                }
                Direction::Input => {
                    warn!("{}unexpected \"FCSubscribe\", disconnecting", self.id_string);
                    self.close(false);
                }
            },
            "onFCSubscribe" => {}
            "publish" => {
                if self.direction == Direction::Output {
                    warn!("{}unexpected \"publish\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.direction = Direction::Input;
                let (name, _) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
                self.stream_name = name
                    .as_str()
                    .ok_or(DecodeError::Malformed("publish stream name is not a string"))?
                    .to_owned();
                self.update_id_string();
                events.push(ConnectionEvent::BindPublish { transaction_id });
            }
            "unpublish" => {
                if self.direction != Direction::Input {
                    warn!("{}unexpected \"unpublish\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                info!("{}peer unpublished \"{}\"", self.id_string, self.stream_name);
                self.send_unpublish_status(transaction_id);
                self.close(false);
            }
            "play" => {
                if self.direction == Direction::Input {
                    warn!("{}unexpected \"play\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.direction = Direction::Output;
                let (name, _) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
                self.stream_name = name
                    .as_str()
                    .ok_or(DecodeError::Malformed("play stream name is not a string"))?
                    .to_owned();
                self.update_id_string();
                events.push(ConnectionEvent::BindPlay { transaction_id });
            }
            "getStreamLength" => {
                if self.direction == Direction::Input {
                    warn!("{}unexpected \"getStreamLength\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.send_get_stream_length_result(transaction_id);
            }
            "stop" => {
                if self.direction != Direction::Output {
                    warn!("{}unexpected \"stop\", disconnecting", self.id_string);
                    self.close(false);
                    return Ok(());
                }
                self.close(false);
            }
            "onStatus" => {
                let (status, _) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
                let code = status.get("code").and_then(Value::as_str).unwrap_or_default();
                debug!("{}status {}", self.id_string, code);

                match code {
                    "NetStream.Publish.Start" => {
                        if self.direction != Direction::Output || self.stream.upgrade().is_none() {
                            warn!("{}misdirected publish status, disconnecting", self.id_string);
                            self.close(false);
                            return Ok(());
                        }
                        self.streaming = true;
                        events.push(ConnectionEvent::StreamingStarted);
                    }
                    "NetStream.Play.Start" => {
                        if self.direction != Direction::Input || self.stream.upgrade().is_none() {
                            warn!("{}misdirected play status, disconnecting", self.id_string);
                            self.close(false);
                            return Ok(());
                        }
                        self.streaming = true;
                        events.push(ConnectionEvent::StreamingStarted);
                    }
                    _ => {}
                }
            }
            "_error" => match self.invokes.remove(&(transaction_id as u32)) {
                Some(invoked) => debug!("{}{} error", self.id_string, invoked),
                None => debug!(
                    "{}unmatched _error, transaction {}",
                    self.id_string, transaction_id
                ),
            },
            "_result" => self.on_result(transaction_id, packet, offset)?,
            _ => debug!("{}ignoring invoke {}", self.id_string, command),
        }
        Ok(())
    }

    fn on_result(
        &mut self,
        transaction_id: f64,
        packet: &Packet,
        offset: usize,
    ) -> Result<(), DecodeError> {
        let Some(invoked) = self.invokes.remove(&(transaction_id as u32)) else {
            // Unmatched results are logged, not an error.
            debug!(
                "{}unmatched _result, transaction {}",
                self.id_string, transaction_id
            );
            return Ok(());
        };
        debug!("{}{} result", self.id_string, invoked);

        match invoked.as_str() {
            "connect" => {
                self.connected = true;
                if !self.stream_name.is_empty() {
                    match self.direction {
                        Direction::Output => {
                            debug!("{}publishing stream {}", self.id_string, self.stream_name);
                            self.send_release_stream();
                            self.send_fc_publish();
                        }
                        Direction::Input => {
                            debug!("{}subscribing to stream {}", self.id_string, self.stream_name);
                            self.send_fc_subscribe();
                        }
                        Direction::None => {}
                    }
                    self.send_create_stream();
                }
            }
            "createStream" => {
                let (value, _) = Value::decode(amf::Version::Amf0, &packet.data, offset)?;
                self.stream_id = value
                    .as_number()
                    .ok_or(DecodeError::Malformed("stream id is not a number"))?
                    as u32;
                debug!("{}created stream {}", self.id_string, self.stream_id);

                match self.direction {
                    Direction::Input => {
                        self.send_get_stream_length();
                        self.send_play();
                        let (stream_id, buffer_size) = (self.stream_id, self.buffer_size);
                        self.send_user_control(
                            UserControlType::ClientBufferTime,
                            0,
                            stream_id,
                            buffer_size,
                        );
                    }
                    Direction::Output => {
                        self.send_publish();
                    }
                    Direction::None => {}
                }
            }
            _ => {}
        }
        Ok(())
    }

    // Outgoing messages. Every command body starts with the encoding tag
    // when the peer negotiated typed-value version 3, then the name and
    // parts in version-0 encoding.

    fn send_packet(&mut self, packet: &Packet) -> bool {
        let mut buffer = Vec::new();
        chunk::encode_packet(&mut buffer, self.out_chunk_size, packet, &mut self.sent_headers);
        self.socket.send(&buffer)
    }

    fn invoke_message_type(&self) -> MessageType {
        match self.amf_version {
            amf::Version::Amf0 => MessageType::Invoke,
            amf::Version::Amf3 => MessageType::FlexInvoke,
        }
    }

    fn data_message_type(&self) -> MessageType {
        match self.amf_version {
            amf::Version::Amf0 => MessageType::Data,
            amf::Version::Amf3 => MessageType::FlexData,
        }
    }

    fn send_invoke(
        &mut self,
        channel: u32,
        message_stream_id: u32,
        name: &str,
        parts: &[Value],
    ) -> bool {
        let mut packet = Packet::new(channel, self.invoke_message_type());
        packet.message_stream_id = message_stream_id;
        let mut data = Vec::new();
        if self.amf_version == amf::Version::Amf3 {
            data.push(0);
        }
        Value::String(name.to_owned()).encode(&mut data);
        for part in parts {
            part.encode(&mut data);
        }
        packet.data = data.into();
        trace!("{}sending invoke {}", self.id_string, name);
        self.send_packet(&packet)
    }

    /// Allocates the next transaction id and records the command for
    /// `_result` correlation.
    fn track_invoke(&mut self, name: &str) -> f64 {
        self.invoke_id += 1;
        self.invokes.insert(self.invoke_id, name.to_owned());
        f64::from(self.invoke_id)
    }

    fn send_server_bandwidth(&mut self) -> bool {
        let mut packet = Packet::new(channel::NETWORK, MessageType::ServerBandwidth);
        let mut data = Vec::new();
        wire::encode_int_be(&mut data, 4, u64::from(self.server_bandwidth));
        packet.data = data.into();
        self.send_packet(&packet)
    }

    fn send_client_bandwidth(&mut self) -> bool {
        let mut packet = Packet::new(channel::NETWORK, MessageType::ClientBandwidth);
        let mut data = Vec::new();
        wire::encode_int_be(&mut data, 4, u64::from(self.server_bandwidth));
        wire::encode_int_be(&mut data, 1, 2); // dynamic limit
        packet.data = data.into();
        self.send_packet(&packet)
    }

    pub fn send_user_control(
        &mut self,
        control: UserControlType,
        timestamp: u32,
        parameter1: u32,
        parameter2: u32,
    ) -> bool {
        let mut packet = Packet::new(channel::NETWORK, MessageType::UserControl);
        packet.timestamp = timestamp;
        let mut data = Vec::new();
        wire::encode_int_be(&mut data, 2, control as u64);
        wire::encode_int_be(&mut data, 4, u64::from(parameter1));
        if parameter2 != 0 {
            wire::encode_int_be(&mut data, 4, u64::from(parameter2));
        }
        packet.data = data.into();
        trace!("{}sending USER_CONTROL {:?}", self.id_string, control);
        self.send_packet(&packet)
    }

    fn send_set_chunk_size(&mut self) -> bool {
        let mut packet = Packet::new(channel::SYSTEM, MessageType::SetChunkSize);
        let mut data = Vec::new();
        wire::encode_int_be(&mut data, 4, u64::from(self.out_chunk_size));
        packet.data = data.into();
        self.send_packet(&packet)
    }

    fn send_on_bw_done(&mut self) -> bool {
        let transaction = self.track_invoke("onBWDone");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "onBWDone",
            &[Value::Number(transaction), Value::Null, Value::Number(0.0)],
        )
    }

    fn send_check_bw(&mut self) -> bool {
        let transaction = self.track_invoke("_checkbw");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_checkbw",
            &[Value::Number(transaction), Value::Null],
        )
    }

    fn send_check_bw_result(&mut self, transaction_id: f64) -> bool {
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_result",
            &[Value::Number(transaction_id), Value::Null],
        )
    }

    fn send_connect(&mut self) -> bool {
        let Some(endpoint) = self.endpoint.clone() else {
            return false;
        };
        let Some(address) = endpoint.addresses.get(self.address_index) else {
            return false;
        };

        let mut argument = Value::new_object();
        argument.insert("app", self.application_name.as_str());
        argument.insert("type", "nonprivate");
        argument.insert("flashVer", "FMLE/3.0 (compatible; Lavf56.16.0)");
        argument.insert(
            "tcUrl",
            format!("rtmp://{}/{}", address.url, self.application_name),
        );
        argument.insert(
            "objectEncoding",
            if self.amf_version == amf::Version::Amf3 { 3.0 } else { 0.0 },
        );

        let transaction = self.track_invoke("connect");
        self.time_since_last_data = 0.0;
        self.send_invoke(
            channel::SYSTEM,
            0,
            "connect",
            &[Value::Number(transaction), argument],
        )
    }

    fn send_connect_result(&mut self, transaction_id: f64) -> bool {
        let mut properties = Value::new_object();
        properties.insert("fmsVer", "FMS/3,5,7,7009");
        properties.insert("capabilities", 31.0);

        let mut information = Value::new_object();
        information.insert("level", "status");
        information.insert("code", "NetConnection.Connect.Success");
        information.insert("description", "Connection succeeded.");
        information.insert(
            "objectEncoding",
            if self.amf_version == amf::Version::Amf3 { 3.0 } else { 0.0 },
        );

        self.time_since_last_data = 0.0;
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_result",
            &[Value::Number(transaction_id), properties, information],
        )
    }

    fn send_create_stream(&mut self) -> bool {
        let transaction = self.track_invoke("createStream");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "createStream",
            &[Value::Number(transaction), Value::Null],
        )
    }

    fn send_create_stream_result(&mut self, transaction_id: f64) -> bool {
        self.stream_id += 1;
        // Stream ids 0 and 2 are reserved.
        if self.stream_id == 0 || self.stream_id == 2 {
            self.stream_id += 1;
        }
        let stream_id = self.stream_id;
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_result",
            &[
                Value::Number(transaction_id),
                Value::Null,
                Value::Number(f64::from(stream_id)),
            ],
        )
    }

    fn send_release_stream(&mut self) -> bool {
        let transaction = self.track_invoke("releaseStream");
        let name = self.stream_name.clone();
        self.send_invoke(
            channel::SYSTEM,
            0,
            "releaseStream",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    fn send_release_stream_result(&mut self, transaction_id: f64) -> bool {
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_result",
            &[Value::Number(transaction_id), Value::Null],
        )
    }

    fn send_fc_publish(&mut self) -> bool {
        let transaction = self.track_invoke("FCPublish");
        let name = self.stream_name.clone();
        self.send_invoke(
            channel::SYSTEM,
            0,
            "FCPublish",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    fn send_on_fc_publish(&mut self) -> bool {
        self.send_invoke(channel::SYSTEM, 0, "onFCPublish", &[])
    }

    /// Graceful goodbye for a push connection about to be torn down.
    pub fn unpublish_stream(&mut self) {
        if self.kind == Kind::Client && self.connected && self.direction == Direction::Output {
            self.send_fc_unpublish();
        }
    }

    fn send_fc_unpublish(&mut self) -> bool {
        let transaction = self.track_invoke("FCUnpublish");
        let name = self.stream_name.clone();
        self.send_invoke(
            channel::SYSTEM,
            0,
            "FCUnpublish",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    fn send_on_fc_unpublish(&mut self) -> bool {
        self.send_invoke(channel::SYSTEM, 0, "onFCUnpublish", &[])
    }

    fn send_fc_subscribe(&mut self) -> bool {
        let transaction = self.track_invoke("FCSubscribe");
        let name = self.stream_name.clone();
        self.send_invoke(
            channel::SYSTEM,
            0,
            "FCSubscribe",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    fn send_on_fc_subscribe(&mut self) -> bool {
        let mut status = Value::new_object();
        status.insert("clientid", "Lavf57.1.0");
        status.insert("code", "NetStream.Play.Start");
        status.insert("description", format!("Subscribed to {}", self.stream_name));
        status.insert("level", "status");
        self.send_invoke(channel::SYSTEM, 0, "onFCSubscribe", &[Value::Null, status])
    }

    fn send_publish(&mut self) -> bool {
        let transaction = self.track_invoke("publish");
        let name = self.stream_name.clone();
        let stream_id = self.stream_id;
        let sent = self.send_invoke(
            channel::SOURCE,
            stream_id,
            "publish",
            &[
                Value::Number(transaction),
                Value::Null,
                Value::String(name),
                Value::String("live".to_owned()),
            ],
        );
        if sent {
            info!(
                "{}published stream \"{}\" (id {})",
                self.id_string, self.stream_name, self.stream_id
            );
            self.time_since_last_data = 0.0;
        }
        sent
    }

    pub fn send_publish_status(&mut self, transaction_id: f64) -> bool {
        let mut status = Value::new_object();
        status.insert("clientid", "Lavf57.1.0");
        status.insert("code", "NetStream.Publish.Start");
        status.insert("description", format!("{} is now published", self.stream_name));
        status.insert("details", self.stream_name.as_str());
        status.insert("level", "status");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "onStatus",
            &[Value::Number(transaction_id), Value::Null, status],
        )
    }

    fn send_unpublish_status(&mut self, transaction_id: f64) -> bool {
        let mut status = Value::new_object();
        status.insert("clientid", "Lavf57.1.0");
        status.insert("code", "NetStream.Unpublish.Success");
        status.insert("description", format!("{} stopped publishing", self.stream_name));
        status.insert("details", self.stream_name.as_str());
        status.insert("level", "status");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "onStatus",
            &[Value::Number(transaction_id), Value::Null, status],
        )
    }

    fn send_get_stream_length(&mut self) -> bool {
        let transaction = self.track_invoke("getStreamLength");
        let name = self.stream_name.clone();
        self.send_invoke(
            channel::SYSTEM,
            0,
            "getStreamLength",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    fn send_get_stream_length_result(&mut self, transaction_id: f64) -> bool {
        self.send_invoke(
            channel::SYSTEM,
            0,
            "_result",
            &[Value::Number(transaction_id), Value::Null, Value::Number(0.0)],
        )
    }

    fn send_play(&mut self) -> bool {
        let transaction = self.track_invoke("play");
        let name = self.stream_name.clone();
        let stream_id = self.stream_id;
        self.time_since_last_data = 0.0;
        self.send_invoke(
            channel::SYSTEM,
            stream_id,
            "play",
            &[Value::Number(transaction), Value::Null, Value::String(name)],
        )
    }

    pub fn send_play_status(&mut self, transaction_id: f64) -> bool {
        let mut status = Value::new_object();
        status.insert("clientid", "Lavf57.1.0");
        status.insert("code", "NetStream.Play.Start");
        status.insert("description", format!("{} is now playing", self.stream_name));
        status.insert("details", self.stream_name.as_str());
        status.insert("level", "status");
        self.send_invoke(
            channel::SYSTEM,
            0,
            "onStatus",
            &[Value::Number(transaction_id), Value::Null, status],
        )
    }

    // Media paths, called by the stream during fan-out.

    pub fn send_audio_header(&mut self, header: &Bytes) -> bool {
        if self.state != HandshakeState::HandshakeDone {
            return false;
        }
        self.send_audio_data(0, header)
    }

    pub fn send_video_header(&mut self, header: &Bytes) -> bool {
        if self.state != HandshakeState::HandshakeDone {
            return false;
        }
        // A delivered codec header unlocks the video gate.
        let sent = self.send_video_data(0, header);
        if sent {
            self.video_frame_sent = true;
            self.time_since_last_data = 0.0;
        }
        sent
    }

    pub fn send_audio_frame(&mut self, timestamp: u32, frame: &Bytes) -> bool {
        if !self.streaming {
            return false;
        }
        self.time_since_last_data = 0.0;
        self.send_audio_data(timestamp, frame)
    }

    /// Video is keyframe-gated: nothing goes out until the output has seen
    /// a cached codec header or a key frame.
    pub fn send_video_frame(
        &mut self,
        timestamp: u32,
        frame: &Bytes,
        frame_type: VideoFrameType,
    ) -> bool {
        if !self.streaming {
            return false;
        }
        let Some(endpoint) = &self.endpoint else {
            return false;
        };
        if endpoint.video_stream && (self.video_frame_sent || frame_type == VideoFrameType::Key) {
            self.video_frame_sent = true;
            self.time_since_last_data = 0.0;
            return self.send_video_data(timestamp, frame);
        }
        true
    }

    pub fn send_meta_data(&mut self, new_meta_data: &Value) -> bool {
        if self.state != HandshakeState::HandshakeDone {
            return false;
        }
        let Some(endpoint) = self.endpoint.clone() else {
            return false;
        };
        let Some(map) = new_meta_data.as_map() else {
            return true;
        };

        let mut filtered = Value::new_object();
        for (key, value) in map {
            if endpoint.meta_data_blacklist.contains(key) {
                continue;
            }
            if !endpoint.audio_stream && matches!(key.as_str(), "audiocodecid" | "audiodatarate") {
                continue;
            }
            if !endpoint.video_stream
                && matches!(
                    key.as_str(),
                    "fps" | "framerate" | "gopsize" | "level" | "profile" | "videocodecid"
                        | "videodatarate"
                )
            {
                continue;
            }
            filtered.insert(key, value.clone());
        }
        self.meta_data = Some(filtered.clone());

        let mut packet = Packet::new(channel::AUDIO, self.data_message_type());
        packet.message_stream_id = self.stream_id;
        let mut data = Vec::new();
        if self.amf_version == amf::Version::Amf3 {
            data.push(0);
        }
        Value::String("@setDataFrame".to_owned()).encode(&mut data);
        Value::String("onMetaData".to_owned()).encode(&mut data);
        filtered.encode(&mut data);
        packet.data = data.into();

        trace!("{}sending metadata {}", self.id_string, filtered);
        self.time_since_last_data = 0.0;
        self.send_packet(&packet)
    }

    pub fn send_text_data(&mut self, timestamp: u32, text_data: &Value) -> bool {
        if !self.streaming {
            return false;
        }
        let Some(endpoint) = &self.endpoint else {
            return false;
        };
        if !endpoint.data_stream {
            return true;
        }

        let mut packet = Packet::new(channel::AUDIO, self.data_message_type());
        packet.message_stream_id = self.stream_id;
        packet.timestamp = timestamp;
        let mut data = Vec::new();
        if self.amf_version == amf::Version::Amf3 {
            data.push(0);
        }
        Value::String("onTextData".to_owned()).encode(&mut data);
        text_data.encode(&mut data);
        packet.data = data.into();

        self.time_since_last_data = 0.0;
        self.send_packet(&packet)
    }

    fn send_audio_data(&mut self, timestamp: u32, audio_data: &Bytes) -> bool {
        if !self.streaming {
            return false;
        }
        let Some(endpoint) = &self.endpoint else {
            return false;
        };
        if !endpoint.audio_stream {
            return true;
        }

        let mut packet = Packet::new(channel::AUDIO, MessageType::AudioPacket);
        packet.message_stream_id = self.stream_id;
        packet.timestamp = timestamp;
        packet.data = audio_data.clone();
        self.send_packet(&packet)
    }

    fn send_video_data(&mut self, timestamp: u32, video_data: &Bytes) -> bool {
        if !self.streaming {
            return false;
        }
        let Some(endpoint) = &self.endpoint else {
            return false;
        };
        if !endpoint.video_stream {
            return true;
        }

        let mut packet = Packet::new(channel::VIDEO, MessageType::VideoPacket);
        packet.message_stream_id = self.stream_id;
        packet.timestamp = timestamp;
        packet.data = video_data.clone();
        self.send_packet(&packet)
    }

    // Stats reporting.

    pub fn stats_text(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "    {:>5} {:>20} {:>20} {:>15} {:>22} {:>7} {:>17} {:>7}",
            self.id,
            self.application_name,
            self.stream_name,
            if self.socket.is_ready() { "connected" } else { "not connected" },
            self.socket
                .remote_addr()
                .map_or_else(String::new, |a| a.to_string()),
            self.kind.to_string(),
            self.state.to_string(),
            self.direction.to_string(),
        );
    }

    pub fn stats_html(&self, out: &mut String) {
        let _ = write!(
            out,
            "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            self.id,
            self.application_name,
            self.stream_name,
            if self.socket.is_ready() { "connected" } else { "not connected" },
            self.socket
                .remote_addr()
                .map_or_else(String::new, |a| a.to_string()),
            self.kind,
            self.state,
            self.direction,
        );
    }

    pub fn stats_json(&self) -> serde_json::Value {
        let mut value = serde_json::json!({
            "id": self.id,
            "name": self.stream_name,
            "application": self.application_name,
            "status": if self.socket.is_ready() { "connected" } else { "not connected" },
            "address": self.socket.remote_addr().map(|a| a.to_string()),
            "connection": self.kind.to_string(),
            "state": self.state.to_string(),
            "direction": self.direction.to_string(),
            "audioRate": self.audio_rate,
            "videoRate": self.video_rate,
        });
        if let Some(meta) = &self.meta_data {
            value["metaData"] = crate::status::amf_to_json(meta);
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Address;
    use std::collections::BTreeSet;

    fn client_endpoint(direction: Direction, addresses: &[&str]) -> Rc<Endpoint> {
        Rc::new(Endpoint {
            kind: Kind::Client,
            direction,
            addresses: addresses
                .iter()
                .map(|text| Address {
                    url: (*text).to_owned(),
                    addr: text.parse().unwrap(),
                })
                .collect(),
            connection_timeout: 2.0,
            reconnect_interval: 2.0,
            reconnect_count: 3,
            ping_interval: 60.0,
            buffer_size: 3000,
            amf_version: amf::Version::Amf0,
            video_stream: true,
            audio_stream: true,
            data_stream: true,
            application_name: String::new(),
            stream_name: String::new(),
            meta_data_blacklist: BTreeSet::new(),
        })
    }

    fn host_connection() -> Connection {
        Connection::new_host(Socket::detached())
    }

    fn encode_from_peer(packet: &Packet) -> Vec<u8> {
        let mut wire = Vec::new();
        chunk::encode_packet(&mut wire, DEFAULT_CHUNK_SIZE, packet, &mut HashMap::new());
        wire
    }

    fn invoke_packet(name: &str, transaction_id: f64, parts: &[Value]) -> Packet {
        let mut data = Vec::new();
        Value::String(name.to_owned()).encode(&mut data);
        Value::Number(transaction_id).encode(&mut data);
        for part in parts {
            part.encode(&mut data);
        }
        let mut packet = Packet::new(channel::SYSTEM, MessageType::Invoke);
        packet.data = data.into();
        packet
    }

    #[test]
    fn host_handshake_is_byte_exact() {
        let mut connection = host_connection();
        let mut events = Vec::new();

        connection.handle_read(&[0x03], &mut events);
        assert_eq!(connection.state, HandshakeState::VersionSent);
        assert_eq!(connection.socket.sent_bytes(), &[0x03]);

        let mut challenge = [7u8; EXCHANGE_SIZE];
        challenge[0..4].copy_from_slice(&[0, 0, 0, 9]);
        challenge[4..8].copy_from_slice(&[1, 2, 3, 4]);
        connection.handle_read(&challenge, &mut events);
        assert_eq!(connection.state, HandshakeState::AckSent);

        let sent = connection.socket.sent_bytes();
        assert_eq!(sent.len(), 1 + 2 * EXCHANGE_SIZE);
        let s1 = &sent[1..1 + EXCHANGE_SIZE];
        let s2 = &sent[1 + EXCHANGE_SIZE..];
        // S1: zero time, fixed server version.
        assert_eq!(&s1[0..4], &[0, 0, 0, 0]);
        assert_eq!(&s1[4..8], &crate::handshake::SERVER_VERSION);
        // S2 echoes the peer's challenge in full.
        assert_eq!(&s2[0..4], &challenge[0..4]);
        assert_eq!(&s2[4..8], &challenge[4..8]);
        assert_eq!(&s2[8..], &challenge[8..]);

        connection.handle_read(&[9u8; EXCHANGE_SIZE], &mut events);
        assert_eq!(connection.state, HandshakeState::HandshakeDone);
        assert!(events.is_empty());
    }

    #[test]
    fn host_rejects_wrong_version_byte() {
        let mut connection = host_connection();
        connection.handle_read(&[0x06], &mut Vec::new());
        assert!(connection.is_closed());
    }

    #[test]
    fn chunk_size_negotiation_then_large_message() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;
        connection.direction = Direction::Input;

        let stream = Stream::new(
            "live".to_owned(),
            "cam1".to_owned(),
            Rc::new(Vec::new()),
            Rc::new(std::cell::Cell::new(false)),
        );
        connection.set_stream(Rc::downgrade(&stream));

        let mut set_chunk_size = Packet::new(channel::SYSTEM, MessageType::SetChunkSize);
        set_chunk_size.data = vec![0x00, 0x00, 0x10, 0x00].into();
        connection.handle_read(&encode_from_peer(&set_chunk_size), &mut Vec::new());
        assert_eq!(connection.in_chunk_size, 4096);

        // A 5000-byte audio message now spans exactly two chunks.
        let mut audio = Packet::new(channel::AUDIO, MessageType::AudioPacket);
        audio.data = vec![0xaf; 5000].into();
        let mut wire_bytes = Vec::new();
        chunk::encode_packet(&mut wire_bytes, 4096, &audio, &mut HashMap::new());
        connection.handle_read(&wire_bytes, &mut Vec::new());

        assert!(!connection.is_closed());
        assert!(connection.data.is_empty(), "all bytes consumed");
        assert_eq!(connection.current_audio_bytes, 5000);
    }

    #[test]
    fn media_on_output_direction_closes_connection() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;
        connection.direction = Direction::Output;

        let mut audio = Packet::new(channel::AUDIO, MessageType::AudioPacket);
        audio.data = vec![0xaf, 0x01, 0x02].into();
        connection.handle_read(&encode_from_peer(&audio), &mut Vec::new());
        assert!(connection.is_closed());
    }

    #[test]
    fn ping_is_answered_with_pong_carrying_the_parameter() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;

        let mut ping = Packet::new(channel::NETWORK, MessageType::UserControl);
        let mut data = Vec::new();
        wire::encode_int_be(&mut data, 2, UserControlType::Ping as u64);
        wire::encode_int_be(&mut data, 4, 0xdead);
        ping.data = data.into();
        connection.handle_read(&encode_from_peer(&ping), &mut Vec::new());

        let sent = connection.socket.sent_bytes().to_vec();
        let (reply, _) =
            chunk::decode_packet(&sent, 0, DEFAULT_CHUNK_SIZE, &mut HashMap::new()).unwrap();
        assert_eq!(reply.message_type, MessageType::UserControl as u8);
        assert_eq!(
            wire::decode_int_be(&reply.data, 0, 2).unwrap(),
            UserControlType::Pong as u64
        );
        assert_eq!(wire::decode_int_be(&reply.data, 2, 4).unwrap(), 0xdead);
    }

    #[test]
    fn matched_result_clears_outstanding_invoke() {
        let endpoint = client_endpoint(Direction::Output, &["127.0.0.1:19350"]);
        let mut connection = Connection::new_client(Weak::new(), "live", "cam1", endpoint);
        connection.socket = Socket::detached();
        connection.state = HandshakeState::HandshakeDone;

        connection.send_connect();
        assert_eq!(connection.invokes.get(&1).map(String::as_str), Some("connect"));

        let result = invoke_packet("_result", 1.0, &[Value::Null, Value::Null]);
        connection.handle_read(&encode_from_peer(&result), &mut Vec::new());

        assert!(!connection.invokes.contains_key(&1));
        assert!(connection.connected);
        // The publish-side follow-ups are now outstanding.
        assert!(connection.invokes.values().any(|name| name == "releaseStream"));
        assert!(connection.invokes.values().any(|name| name == "FCPublish"));
        assert!(connection.invokes.values().any(|name| name == "createStream"));
    }

    #[test]
    fn unmatched_result_is_not_an_error() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;

        let result = invoke_packet("_result", 42.0, &[Value::Null]);
        connection.handle_read(&encode_from_peer(&result), &mut Vec::new());
        assert!(!connection.is_closed());
    }

    #[test]
    fn create_stream_result_skips_reserved_ids() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;

        for expected in [1u32, 3, 4] {
            let create = invoke_packet("createStream", 5.0, &[Value::Null]);
            connection.handle_read(&encode_from_peer(&create), &mut Vec::new());
            assert_eq!(connection.stream_id, expected);
        }
    }

    #[test]
    fn publish_produces_bind_event() {
        let mut connection = host_connection();
        connection.state = HandshakeState::HandshakeDone;
        connection.application_name = "live".to_owned();

        let mut events = Vec::new();
        let publish = invoke_packet(
            "publish",
            3.0,
            &[Value::Null, Value::String("cam1".to_owned())],
        );
        connection.handle_read(&encode_from_peer(&publish), &mut events);

        assert_eq!(
            events,
            vec![ConnectionEvent::BindPublish { transaction_id: 3.0 }]
        );
        assert_eq!(connection.direction, Direction::Input);
        assert_eq!(connection.stream_name, "cam1");
    }

    #[test]
    fn reconnect_cycles_addresses_after_the_attempt_budget() {
        let endpoint = client_endpoint(
            Direction::Output,
            &["127.0.0.1:19350", "127.0.0.1:19351"],
        );
        let addr1: std::net::SocketAddr = "127.0.0.1:19350".parse().unwrap();
        let addr2: std::net::SocketAddr = "127.0.0.1:19351".parse().unwrap();
        let mut connection = Connection::new_client(Weak::new(), "live", "cam1", endpoint);

        connection.connect();
        assert_eq!(connection.socket.remote_addr(), Some(addr1));

        // Three retries on the first address, then the second.
        for _ in 0..3 {
            connection.update(2.0);
            assert_eq!(connection.socket.remote_addr(), Some(addr1));
        }
        connection.update(2.0);
        assert_eq!(connection.socket.remote_addr(), Some(addr2));
        assert_eq!(connection.address_index, 1);

        // The cycle continues until told otherwise.
        for _ in 0..4 {
            connection.update(2.0);
        }
        assert_eq!(connection.socket.remote_addr(), Some(addr1));
    }

    #[test]
    fn idle_connection_closes_after_five_seconds() {
        let mut connection = host_connection();
        connection.update(4.0);
        assert!(!connection.closed);
        connection.update(1.5);
        assert!(connection.is_closed());
    }

    #[test]
    fn client_names_resolve_through_endpoint_templates() {
        let mut endpoint = (*client_endpoint(Direction::Output, &["127.0.0.1:19350"])).clone();
        endpoint.application_name = "backup".to_owned();
        endpoint.stream_name = "{streamName}-{applicationName}".to_owned();
        let connection = Connection::new_client(Weak::new(), "live", "cam1", Rc::new(endpoint));
        assert_eq!(connection.application_name(), "backup");
        assert_eq!(connection.stream_name(), "cam1-live");
    }
}
