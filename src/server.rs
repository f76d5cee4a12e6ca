use crate::{connection::Connection, endpoint::Endpoint, next_id, stream::Stream};
use log::info;
use std::{
    cell::{Cell, RefCell},
    fmt::Write as _,
    net::SocketAddr,
    rc::Rc,
};

/// Owns the streams of one configured server and the endpoint slice that
/// routes peers onto them.
pub struct Server {
    id: u64,
    listen: Vec<SocketAddr>,
    endpoints: Rc<Vec<Rc<Endpoint>>>,
    streams: Vec<Rc<RefCell<Stream>>>,
    needs_cleanup: Rc<Cell<bool>>,
}

impl Server {
    pub fn new(listen: Vec<SocketAddr>, endpoints: Vec<Endpoint>) -> Self {
        let id = next_id();
        info!("[SRV:{}] create", id);
        Self {
            id,
            listen,
            endpoints: Rc::new(endpoints.into_iter().map(Rc::new).collect()),
            streams: Vec::new(),
            needs_cleanup: Rc::new(Cell::new(false)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn listen_addresses(&self) -> &[SocketAddr] {
        &self.listen
    }

    pub fn endpoints(&self) -> &Rc<Vec<Rc<Endpoint>>> {
        &self.endpoints
    }

    pub fn find_stream(&self, application_name: &str, stream_name: &str) -> Option<Rc<RefCell<Stream>>> {
        self.streams
            .iter()
            .find(|stream| {
                let stream = stream.borrow();
                !stream.is_closed()
                    && stream.application_name() == application_name
                    && stream.stream_name() == stream_name
            })
            .cloned()
    }

    pub fn create_stream(&mut self, application_name: &str, stream_name: &str) -> Rc<RefCell<Stream>> {
        let stream = Stream::new(
            application_name.to_owned(),
            stream_name.to_owned(),
            self.endpoints.clone(),
            self.needs_cleanup.clone(),
        );
        self.streams.push(stream.clone());
        stream
    }

    /// Every client connection owned by this server's streams.
    pub fn client_connections(&self) -> Vec<Rc<RefCell<Connection>>> {
        self.streams
            .iter()
            .flat_map(|stream| stream.borrow().owned_connections())
            .collect()
    }

    /// Advances owned connections and services the stream detachments they
    /// request.
    pub fn update(&mut self, delta: f32) {
        for connection in self.client_connections() {
            connection.borrow_mut().update(delta);
            loop {
                // Taken in its own statement so the connection is not
                // borrowed while the stream detaches it.
                let stream = connection.borrow_mut().take_pending_stream_stop();
                let Some(stream) = stream else { break };
                Stream::stop(&stream, &connection);
            }
        }
    }

    /// Reaps closed streams at the tick boundary, children before parents:
    /// every connection a dead stream references is shut down before the
    /// stream itself is dropped.
    pub fn cleanup(&mut self) {
        if !self.needs_cleanup.replace(false) {
            return;
        }

        let mut keep = Vec::with_capacity(self.streams.len());
        for stream in self.streams.drain(..) {
            if stream.borrow().is_closed() {
                let connections = stream.borrow().all_connections();
                for connection in connections {
                    let mut connection = connection.borrow_mut();
                    connection.unpublish_stream();
                    connection.shutdown();
                }
                info!("[SRV:{}] reaped stream {}", self.id, stream.borrow().id());
            } else {
                keep.push(stream);
            }
        }
        self.streams = keep;
    }

    pub fn stats_text(&self, out: &mut String) {
        let _ = writeln!(out, "Server[{}]:", self.id);
        for stream in &self.streams {
            stream.borrow().stats_text(out);
        }
    }

    pub fn stats_html(&self, out: &mut String) {
        let _ = write!(out, "<h2>Server[{}]</h2>", self.id);
        for stream in &self.streams {
            stream.borrow().stats_html(out);
        }
    }

    pub fn stats_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "streams": self
                .streams
                .iter()
                .map(|stream| stream.borrow().stats_json())
                .collect::<Vec<_>>(),
        })
    }
}
