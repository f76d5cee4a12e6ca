use crate::{
    amf::Value,
    connection::Connection,
    endpoint::{Direction, Endpoint, Kind},
    next_id,
    types::VideoFrameType,
};
use bytes::Bytes;
use log::{info, warn};
use std::{
    cell::{Cell, RefCell},
    fmt::Write as _,
    rc::{Rc, Weak},
};

/// Couples one input connection to many output connections for a single
/// (application, stream name) pair. Codec headers and metadata are cached so
/// late subscribers can be bootstrapped mid-stream.
pub struct Stream {
    id: u64,
    application_name: String,
    stream_name: String,

    /// The owning server's endpoint slice, for creating pull/push
    /// connections on demand.
    endpoints: Rc<Vec<Rc<Endpoint>>>,
    /// Shared with the owning server; set when this stream wants reaping.
    needs_cleanup: Rc<Cell<bool>>,

    input: Option<Weak<RefCell<Connection>>>,
    outputs: Vec<Weak<RefCell<Connection>>>,
    /// Client connections this stream requested; it owns their lifetime.
    connections: Vec<Rc<RefCell<Connection>>>,

    streaming: bool,
    closed: bool,
    input_connection_created: bool,

    audio_header: Option<Bytes>,
    video_header: Option<Bytes>,
    meta_data: Option<Value>,

    id_string: String,
}

impl Stream {
    pub fn new(
        application_name: String,
        stream_name: String,
        endpoints: Rc<Vec<Rc<Endpoint>>>,
        needs_cleanup: Rc<Cell<bool>>,
    ) -> Rc<RefCell<Self>> {
        let id = next_id();
        let id_string = format!("[ST:{} {}/{}] ", id, application_name, stream_name);
        info!("{}create", id_string);
        Rc::new(RefCell::new(Self {
            id,
            application_name,
            stream_name,
            endpoints,
            needs_cleanup,
            input: None,
            outputs: Vec::new(),
            connections: Vec::new(),
            streaming: false,
            closed: false,
            input_connection_created: false,
            audio_header: None,
            video_header: None,
            meta_data: None,
            id_string,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn application_name(&self) -> &str {
        &self.application_name
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn input_connection(&self) -> Option<Rc<RefCell<Connection>>> {
        self.input.as_ref().and_then(Weak::upgrade)
    }

    pub fn owned_connections(&self) -> Vec<Rc<RefCell<Connection>>> {
        self.connections.clone()
    }

    /// Every connection this stream references, owned or attached; used for
    /// teardown and reports.
    pub fn all_connections(&self) -> Vec<Rc<RefCell<Connection>>> {
        let mut connections: Vec<Rc<RefCell<Connection>>> = self.connections.clone();
        let mut push_unique = |candidate: Rc<RefCell<Connection>>| {
            if !connections.iter().any(|c| Rc::ptr_eq(c, &candidate)) {
                connections.push(candidate);
            }
        };
        if let Some(input) = self.input.as_ref().and_then(Weak::upgrade) {
            push_unique(input);
        }
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            push_unique(output);
        }
        connections
    }

    /// Attaches a connection. An input starts streaming and spins up push
    /// connections; an output joins the fan-out list and is bootstrapped
    /// from the caches when the stream is already live.
    pub fn start(this: &Rc<RefCell<Self>>, connection: &Rc<RefCell<Connection>>) {
        if this.borrow().closed {
            return;
        }
        let direction = connection.borrow().direction();
        info!(
            "{}start, connection {}",
            this.borrow().id_string,
            connection.borrow().id()
        );

        match direction {
            Direction::Input => {
                {
                    let mut stream = this.borrow_mut();
                    if stream.input.is_none() {
                        stream.input = Some(Rc::downgrade(connection));
                        stream.streaming = true;
                    }
                }
                let endpoints = this.borrow().endpoints.clone();
                for endpoint in endpoints
                    .iter()
                    .filter(|e| e.kind == Kind::Client && e.direction == Direction::Output)
                {
                    let push = Self::create_connection(this, endpoint.clone());
                    push.borrow_mut().connect();
                    this.borrow_mut().connections.push(push);
                }
            }
            Direction::Output => {
                let wants_pull = {
                    let stream = this.borrow();
                    stream.input.is_none() && !stream.input_connection_created
                };
                if wants_pull {
                    // Only endpoints with unknown names can serve an
                    // arbitrary stream; fully named ones pull on their own.
                    let endpoints = this.borrow().endpoints.clone();
                    for endpoint in endpoints.iter().filter(|e| {
                        e.kind == Kind::Client
                            && e.direction == Direction::Input
                            && !e.is_name_known()
                    }) {
                        let pull = Self::create_connection(this, endpoint.clone());
                        pull.borrow_mut().connect();
                        let mut stream = this.borrow_mut();
                        stream.input_connection_created = true;
                        stream.connections.push(pull);
                    }
                }

                {
                    let id = connection.borrow().id();
                    let mut stream = this.borrow_mut();
                    let already_attached = stream
                        .outputs
                        .iter()
                        .filter_map(Weak::upgrade)
                        .any(|c| c.borrow().id() == id);
                    if !already_attached {
                        stream.outputs.push(Rc::downgrade(connection));
                    }
                }

                let (streaming, video, audio, meta) = {
                    let stream = this.borrow();
                    (
                        stream.streaming,
                        stream.video_header.clone(),
                        stream.audio_header.clone(),
                        stream.meta_data.clone(),
                    )
                };
                if streaming {
                    let mut output = connection.borrow_mut();
                    output.set_stream(Rc::downgrade(this));
                    if let Some(header) = video {
                        output.send_video_header(&header);
                    }
                    if let Some(header) = audio {
                        output.send_audio_header(&header);
                    }
                    if let Some(meta) = meta {
                        output.send_meta_data(&meta);
                    }
                }
            }
            Direction::None => {
                warn!("{}start without a direction", this.borrow().id_string);
            }
        }
    }

    /// Detaches a connection. Losing the input stops streaming and tears
    /// down the push connections this stream created; when nothing
    /// dependable remains the stream closes itself.
    pub fn stop(this: &Rc<RefCell<Self>>, connection: &Rc<RefCell<Connection>>) {
        if this.borrow().closed {
            return;
        }
        let connection_id = connection.borrow().id();
        info!("{}stop, connection {}", this.borrow().id_string, connection_id);

        let is_input = this
            .borrow()
            .input
            .as_ref()
            .and_then(Weak::upgrade)
            .map_or(false, |c| c.borrow().id() == connection_id);

        if is_input {
            let to_close = {
                let mut stream = this.borrow_mut();
                stream.streaming = false;
                if connection.borrow().kind() == Kind::Host {
                    stream.input = None;
                }

                let mut to_close = Vec::new();
                let mut index = 0;
                while index < stream.connections.len() {
                    let is_push = {
                        let candidate = stream.connections[index].borrow();
                        candidate.kind() == Kind::Client
                            && candidate.direction() == Direction::Output
                    };
                    if is_push {
                        let removed = stream.connections.remove(index);
                        stream
                            .outputs
                            .retain(|w| w.upgrade().map_or(false, |c| !Rc::ptr_eq(&c, &removed)));
                        to_close.push(removed);
                    } else {
                        index += 1;
                    }
                }
                to_close
            };
            for push in to_close {
                let mut push = push.borrow_mut();
                push.unpublish_stream();
                push.shutdown();
            }
        } else if connection.borrow().kind() == Kind::Host {
            this.borrow_mut()
                .outputs
                .retain(|w| w.upgrade().map_or(false, |c| c.borrow().id() != connection_id));
        }

        if !Self::has_dependable_connections(this) {
            Self::close(this);
        }
    }

    fn has_dependable_connections(this: &Rc<RefCell<Self>>) -> bool {
        this.borrow()
            .all_connections()
            .iter()
            .any(|connection| connection.borrow().is_dependable())
    }

    /// Marks the stream finished; the owning server reaps it (and every
    /// connection it references) before the tick returns.
    pub fn close(this: &Rc<RefCell<Self>>) {
        let mut stream = this.borrow_mut();
        if stream.closed {
            return;
        }
        info!("{}close", stream.id_string);
        stream.closed = true;
        stream.needs_cleanup.set(true);
    }

    fn create_connection(
        this: &Rc<RefCell<Self>>,
        endpoint: Rc<Endpoint>,
    ) -> Rc<RefCell<Connection>> {
        let (application_name, stream_name) = {
            let stream = this.borrow();
            (stream.application_name.clone(), stream.stream_name.clone())
        };
        Rc::new(RefCell::new(Connection::new_client(
            Rc::downgrade(this),
            &application_name,
            &stream_name,
            endpoint,
        )))
    }

    // Fan-out. Frames arriving while nobody listens, or after close, are
    // dropped here.

    pub fn send_audio_header(&mut self, header_data: &Bytes) {
        if self.closed {
            return;
        }
        self.audio_header = Some(header_data.clone());
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output.borrow_mut().send_audio_header(header_data);
        }
    }

    pub fn send_video_header(&mut self, header_data: &Bytes) {
        if self.closed {
            return;
        }
        self.video_header = Some(header_data.clone());
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output.borrow_mut().send_video_header(header_data);
        }
    }

    pub fn send_audio_frame(&mut self, timestamp: u32, audio_data: &Bytes) {
        if self.closed {
            return;
        }
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output.borrow_mut().send_audio_frame(timestamp, audio_data);
        }
    }

    pub fn send_video_frame(&mut self, timestamp: u32, video_data: &Bytes, frame_type: VideoFrameType) {
        if self.closed {
            return;
        }
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output
                .borrow_mut()
                .send_video_frame(timestamp, video_data, frame_type);
        }
    }

    pub fn send_meta_data(&mut self, new_meta_data: &Value) {
        if self.closed {
            return;
        }
        self.meta_data = Some(new_meta_data.clone());
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output.borrow_mut().send_meta_data(new_meta_data);
        }
    }

    pub fn send_text_data(&mut self, timestamp: u32, text_data: &Value) {
        if self.closed {
            return;
        }
        for output in self.outputs.iter().filter_map(Weak::upgrade) {
            output.borrow_mut().send_text_data(timestamp, text_data);
        }
    }

    // Stats reporting.

    pub fn stats_text(&self, out: &mut String) {
        let _ = writeln!(
            out,
            "  Stream[{}]: {}/{}",
            self.id, self.application_name, self.stream_name
        );
        for connection in self.all_connections() {
            connection.borrow().stats_text(out);
        }
    }

    pub fn stats_html(&self, out: &mut String) {
        let _ = write!(
            out,
            "<h3>Stream[{}]: {}/{}</h3><table><tr><th>ID</th><th>Application</th>\
             <th>Stream</th><th>Status</th><th>Address</th><th>Type</th><th>State</th>\
             <th>Direction</th></tr>",
            self.id, self.application_name, self.stream_name
        );
        for connection in self.all_connections() {
            connection.borrow().stats_html(out);
        }
        out.push_str("</table>");
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "applicationName": self.application_name,
            "streamName": self.stream_name,
            "connections": self
                .all_connections()
                .iter()
                .map(|connection| connection.borrow().stats_json())
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        amf,
        chunk::{self, DEFAULT_CHUNK_SIZE},
        connection::HandshakeState,
        endpoint::Address,
        socket::Socket,
        types::MessageType,
    };
    use std::collections::{BTreeSet, HashMap};

    fn output_endpoint() -> Rc<Endpoint> {
        Rc::new(Endpoint {
            kind: Kind::Host,
            direction: Direction::Output,
            addresses: vec![Address {
                url: "0.0.0.0:1935".to_owned(),
                addr: "0.0.0.0:1935".parse().unwrap(),
            }],
            connection_timeout: 5.0,
            reconnect_interval: 5.0,
            reconnect_count: 0,
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

    fn test_stream() -> Rc<RefCell<Stream>> {
        Stream::new(
            "live".to_owned(),
            "cam1".to_owned(),
            Rc::new(Vec::new()),
            Rc::new(Cell::new(false)),
        )
    }

    fn output_connection(stream: &Rc<RefCell<Stream>>) -> Rc<RefCell<Connection>> {
        let connection = Connection::new_host(Socket::detached());
        let connection = Rc::new(RefCell::new(connection));
        {
            let mut c = connection.borrow_mut();
            c.force_state(HandshakeState::HandshakeDone);
            c.force_direction(Direction::Output);
            c.set_endpoint(output_endpoint());
            c.set_stream(Rc::downgrade(stream));
            c.begin_streaming();
        }
        connection
    }

    fn input_connection(stream: &Rc<RefCell<Stream>>) -> Rc<RefCell<Connection>> {
        let connection = Rc::new(RefCell::new(Connection::new_host(Socket::detached())));
        {
            let mut c = connection.borrow_mut();
            c.force_state(HandshakeState::HandshakeDone);
            c.force_direction(Direction::Input);
            c.set_stream(Rc::downgrade(stream));
            c.begin_streaming();
        }
        connection
    }

    fn sent_packets(connection: &Rc<RefCell<Connection>>) -> Vec<chunk::Packet> {
        let mut connection = connection.borrow_mut();
        let bytes = connection.socket_mut().sent_bytes().to_vec();
        let mut packets = Vec::new();
        let mut received = HashMap::new();
        let mut offset = 0;
        while offset < bytes.len() {
            let (packet, read) =
                chunk::decode_packet(&bytes, offset, DEFAULT_CHUNK_SIZE, &mut received).unwrap();
            packets.push(packet);
            offset += read;
        }
        packets
    }

    #[test]
    fn output_attachment_is_idempotent() {
        let stream = test_stream();
        let output = output_connection(&stream);
        Stream::start(&stream, &output);
        Stream::start(&stream, &output);
        assert_eq!(stream.borrow().outputs.len(), 1);
    }

    #[test]
    fn fan_out_reaches_every_output_in_order() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);

        let outputs: Vec<_> = (0..3).map(|_| output_connection(&stream)).collect();
        for output in &outputs {
            Stream::start(&stream, output);
        }
        let attached: Vec<u64> = stream
            .borrow()
            .outputs
            .iter()
            .filter_map(Weak::upgrade)
            .map(|c| c.borrow().id())
            .collect();
        let expected: Vec<u64> = outputs.iter().map(|c| c.borrow().id()).collect();
        assert_eq!(attached, expected, "deterministic insertion order");

        let frame: Bytes = vec![0xaf, 0x01, 0x02, 0x03].into();
        stream.borrow_mut().send_audio_frame(100, &frame);

        for output in &outputs {
            let packets = sent_packets(output);
            assert_eq!(packets.len(), 1);
            assert_eq!(packets[0].message_type, MessageType::AudioPacket as u8);
            assert_eq!(packets[0].timestamp, 100);
            assert_eq!(packets[0].data, frame);
        }
    }

    #[test]
    fn late_subscriber_gets_headers_before_frames() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);

        let video_header: Bytes = vec![0x17, 0x00, 0x01].into();
        let audio_header: Bytes = vec![0xaf, 0x00, 0x02].into();
        stream.borrow_mut().send_video_header(&video_header);
        stream.borrow_mut().send_audio_header(&audio_header);
        let mut meta = Value::new_object();
        meta.insert("width", 1920.0);
        stream.borrow_mut().send_meta_data(&meta);

        let late = output_connection(&stream);
        Stream::start(&stream, &late);

        let packets = sent_packets(&late);
        assert_eq!(packets.len(), 3);
        assert_eq!(packets[0].message_type, MessageType::VideoPacket as u8);
        assert_eq!(packets[0].data, video_header);
        assert_eq!(packets[1].message_type, MessageType::AudioPacket as u8);
        assert_eq!(packets[1].data, audio_header);
        assert_eq!(packets[2].message_type, MessageType::Data as u8);
    }

    #[test]
    fn video_is_gated_until_a_key_frame() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);

        // Output attaches before any header is cached.
        let output = output_connection(&stream);
        Stream::start(&stream, &output);

        let inter: Bytes = vec![0x27, 0x01].into();
        stream
            .borrow_mut()
            .send_video_frame(10, &inter, VideoFrameType::Inter);
        assert!(sent_packets(&output).is_empty(), "inter frame must be gated");

        let key: Bytes = vec![0x17, 0x01].into();
        stream
            .borrow_mut()
            .send_video_frame(20, &key, VideoFrameType::Key);
        stream
            .borrow_mut()
            .send_video_frame(30, &inter, VideoFrameType::Inter);

        let packets = sent_packets(&output);
        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].timestamp, 20);
        assert_eq!(packets[1].timestamp, 30);
    }

    #[test]
    fn metadata_propagates_to_all_outputs_identically() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);
        let first = output_connection(&stream);
        let second = output_connection(&stream);
        Stream::start(&stream, &first);
        Stream::start(&stream, &second);

        let mut meta = Value::new_object();
        meta.insert("width", 1920.0);
        meta.insert("height", 1080.0);
        stream.borrow_mut().send_meta_data(&meta);

        let first_packets = sent_packets(&first);
        let second_packets = sent_packets(&second);
        assert_eq!(first_packets.len(), 1);
        assert_eq!(first_packets[0].data, second_packets[0].data);

        // The payload carries the three typed values in order.
        let data = &first_packets[0].data;
        let (command, read) = Value::decode(amf::Version::Amf0, data, 0).unwrap();
        assert_eq!(command.as_str(), Some("@setDataFrame"));
        let (name, read2) = Value::decode(amf::Version::Amf0, data, read).unwrap();
        assert_eq!(name.as_str(), Some("onMetaData"));
        let (object, _) = Value::decode(amf::Version::Amf0, data, read + read2).unwrap();
        assert_eq!(object.get("width"), Some(&Value::Number(1920.0)));
        assert_eq!(object.get("height"), Some(&Value::Number(1080.0)));
    }

    #[test]
    fn text_data_respects_endpoint_data_switch() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);

        let silent = output_connection(&stream);
        {
            let mut endpoint = (*output_endpoint()).clone();
            endpoint.data_stream = false;
            silent.borrow_mut().set_endpoint(Rc::new(endpoint));
        }
        let chatty = output_connection(&stream);
        Stream::start(&stream, &silent);
        Stream::start(&stream, &chatty);

        stream
            .borrow_mut()
            .send_text_data(5, &Value::String("caption".to_owned()));

        assert!(sent_packets(&silent).is_empty());
        assert_eq!(sent_packets(&chatty).len(), 1);
    }

    #[test]
    fn losing_a_host_input_detaches_it_and_closes_an_undependable_stream() {
        let cleanup = Rc::new(Cell::new(false));
        let stream = Stream::new(
            "live".to_owned(),
            "cam1".to_owned(),
            Rc::new(Vec::new()),
            cleanup.clone(),
        );
        let input = input_connection(&stream);
        Stream::start(&stream, &input);
        assert!(stream.borrow().streaming);

        // Shut the input's socket first so it no longer counts as
        // dependable, then detach it.
        input.borrow_mut().shutdown();
        Stream::stop(&stream, &input);

        assert!(stream.borrow().input.is_none());
        assert!(!stream.borrow().streaming);
        assert!(stream.borrow().is_closed());
        assert!(cleanup.get());
    }

    #[test]
    fn frames_after_close_are_dropped() {
        let stream = test_stream();
        let input = input_connection(&stream);
        Stream::start(&stream, &input);
        let output = output_connection(&stream);
        Stream::start(&stream, &output);

        Stream::close(&stream);
        let key: Bytes = vec![0x17, 0x01].into();
        stream
            .borrow_mut()
            .send_video_frame(10, &key, VideoFrameType::Key);
        assert!(sent_packets(&output).is_empty());
    }
}
