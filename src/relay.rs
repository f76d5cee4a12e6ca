use crate::{
    config::Config,
    connection::{Connection, ConnectionEvent},
    endpoint::{Direction, Endpoint, Kind},
    server::Server,
    socket::Socket,
    status::{StatsRequest, StatusClient},
    stream::Stream,
    ReportType,
};
use anyhow::Context;
use log::{debug, info, trace, warn};
use mio::{net::TcpListener, Events, Interest, Poll, Token};
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt::Write as _,
    net::{SocketAddr, ToSocketAddrs},
    rc::{Rc, Weak},
    time::{Duration, Instant},
};

const TICK: Duration = Duration::from_millis(10);

enum Target {
    Acceptor(usize),
    Connection(Weak<RefCell<Connection>>),
    StatusAcceptor,
    StatusClient(u64),
}

/// Owns the servers, acceptors, host connections, and the status endpoint,
/// and drives the fixed-interval tick. The poll at the top of each tick is
/// the only suspension point.
pub struct Relay {
    poll: Poll,
    active: bool,
    servers: Vec<Server>,
    acceptors: Vec<TcpListener>,
    connections: Vec<Rc<RefCell<Connection>>>,
    status_listener: Option<TcpListener>,
    status_clients: Vec<StatusClient>,
    tokens: HashMap<Token, Target>,
    previous_tick: Instant,
}

impl Relay {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let poll = Poll::new().context("failed to create poller")?;
        let mut relay = Self {
            poll,
            active: true,
            servers: Vec::new(),
            acceptors: Vec::new(),
            connections: Vec::new(),
            status_listener: None,
            status_clients: Vec::new(),
            tokens: HashMap::new(),
            previous_tick: Instant::now(),
        };

        for server_config in &config.servers {
            let resolved = server_config.resolve()?;
            for address in &resolved.listen {
                let mut listener = TcpListener::bind(*address)
                    .with_context(|| format!("failed to bind {}", address))?;
                let token = Token(crate::next_id() as usize);
                relay
                    .poll
                    .registry()
                    .register(&mut listener, token, Interest::READABLE)
                    .context("failed to register listener")?;
                relay.tokens.insert(token, Target::Acceptor(relay.acceptors.len()));
                relay.acceptors.push(listener);
                info!("listening on {}", address);
            }
            relay
                .servers
                .push(Server::new(resolved.listen, resolved.endpoints));
        }

        if let Some(address) = &config.status_address {
            let address: SocketAddr = address
                .to_socket_addrs()
                .ok()
                .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
                .with_context(|| format!("bad status address \"{}\"", address))?;
            let mut listener = TcpListener::bind(address)
                .with_context(|| format!("failed to bind status endpoint {}", address))?;
            let token = Token(crate::next_id() as usize);
            relay
                .poll
                .registry()
                .register(&mut listener, token, Interest::READABLE)
                .context("failed to register status listener")?;
            relay.tokens.insert(token, Target::StatusAcceptor);
            relay.status_listener = Some(listener);
            info!("status endpoint on {}", address);
        }

        Ok(relay)
    }

    /// Runs until deactivated. Each iteration: poll, deliver readiness,
    /// advance timers by the elapsed delta, reap the dead.
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.previous_tick = Instant::now();
        let mut events = Events::with_capacity(256);

        while self.active {
            self.poll
                .poll(&mut events, Some(TICK))
                .context("poll failed")?;

            let ready: Vec<(Token, bool, bool)> = events
                .iter()
                .map(|event| (event.token(), event.is_readable(), event.is_writable()))
                .collect();
            for (token, readable, writable) in ready {
                self.dispatch(token, readable, writable);
            }

            let now = Instant::now();
            let delta = now.duration_since(self.previous_tick).as_secs_f32();
            self.previous_tick = now;

            self.update(delta);
            self.register_pending();
            self.cleanup();
        }

        info!("shutting down");
        Ok(())
    }

    /// Breaks the run loop after the current iteration.
    pub fn shutdown(&mut self) {
        self.active = false;
    }

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool) {
        // Copy the routing decision out so the token map is not borrowed
        // across the handlers.
        enum Resolved {
            Acceptor(usize),
            StatusAcceptor,
            StatusClient(u64),
            Connection(Weak<RefCell<Connection>>),
        }
        let resolved = match self.tokens.get(&token) {
            Some(Target::Acceptor(index)) => Resolved::Acceptor(*index),
            Some(Target::StatusAcceptor) => Resolved::StatusAcceptor,
            Some(Target::StatusClient(id)) => Resolved::StatusClient(*id),
            Some(Target::Connection(weak)) => Resolved::Connection(weak.clone()),
            None => return,
        };

        let target = match resolved {
            Resolved::Acceptor(index) => {
                self.accept_peers(index);
                return;
            }
            Resolved::StatusAcceptor => {
                self.accept_status_peers();
                return;
            }
            Resolved::StatusClient(id) => {
                self.serve_status_client(id);
                return;
            }
            Resolved::Connection(weak) => match weak.upgrade() {
                Some(connection) => connection,
                None => {
                    self.tokens.remove(&token);
                    return;
                }
            },
        };

        if writable {
            if target.borrow_mut().socket_mut().is_connecting() {
                let completed = target.borrow_mut().socket_mut().finish_connect();
                match completed {
                    Ok(true) => target.borrow_mut().handle_connect(),
                    Ok(false) => {}
                    Err(err) => info!("connect failed: {}", err),
                }
            } else {
                target.borrow_mut().socket_mut().flush();
            }
        }

        if readable {
            let mut buffer = Vec::new();
            let outcome = target.borrow_mut().socket_mut().read_available(&mut buffer);

            if !buffer.is_empty() {
                let mut events = Vec::new();
                target.borrow_mut().handle_read(&buffer, &mut events);
                for event in events {
                    self.handle_connection_event(&target, event);
                }
            }
            if outcome.closed {
                target.borrow_mut().handle_socket_closed();
            }
        }

        self.service_connection(&target);
    }

    fn accept_peers(&mut self, acceptor_index: usize) {
        loop {
            let accepted = self.acceptors[acceptor_index].accept();
            match accepted {
                Ok((stream, peer)) => {
                    debug!("accepted connection from {}", peer);
                    let socket = Socket::from_stream(stream, peer);
                    let connection = Rc::new(RefCell::new(Connection::new_host(socket)));
                    self.connections.push(connection);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
        self.register_pending();
    }

    fn accept_status_peers(&mut self) {
        let Some(listener) = &self.status_listener else {
            return;
        };
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("status peer {}", peer);
                    let socket = Socket::from_stream(stream, peer);
                    self.status_clients.push(StatusClient::new(socket));
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("status accept failed: {}", err);
                    break;
                }
            }
        }
        self.register_pending();
    }

    fn serve_status_client(&mut self, id: u64) {
        let Some(index) = self.status_clients.iter().position(|c| c.id() == id) else {
            return;
        };
        let request = self.status_clients[index].handle_read();
        match request {
            Some(StatsRequest::Report(report_type)) => {
                let mut body = String::new();
                self.get_stats(&mut body, report_type);
                self.status_clients[index].respond(report_type, &body);
            }
            Some(StatsRequest::NotFound) => self.status_clients[index].respond_not_found(),
            None => {}
        }
    }

    /// Executes work a connection produced during dispatch but could not do
    /// itself: publish/play binding and client stream attachment.
    fn handle_connection_event(
        &mut self,
        connection: &Rc<RefCell<Connection>>,
        event: ConnectionEvent,
    ) {
        match event {
            ConnectionEvent::BindPublish { transaction_id } => {
                self.bind_publish(connection, transaction_id);
            }
            ConnectionEvent::BindPlay { transaction_id } => {
                self.bind_play(connection, transaction_id);
            }
            ConnectionEvent::StreamingStarted => {
                let stream = connection.borrow().stream();
                if let Some(stream) = stream {
                    // A pull connection may only feed a stream that has no
                    // other input.
                    if connection.borrow().direction() == Direction::Input {
                        let existing = stream.borrow().input_connection();
                        if let Some(existing) = existing {
                            if !Rc::ptr_eq(&existing, connection) {
                                warn!("stream already has an input, disconnecting");
                                connection.borrow_mut().close(true);
                                self.service_connection(connection);
                                return;
                            }
                        }
                    }
                    Stream::start(&stream, connection);
                }
            }
        }
    }

    fn bind_publish(&mut self, connection: &Rc<RefCell<Connection>>, transaction_id: f64) {
        let (local, application_name, stream_name) = {
            let connection = connection.borrow();
            (
                connection.local_addr(),
                connection.application_name().to_owned(),
                connection.stream_name().to_owned(),
            )
        };

        let matched = local.and_then(|local| {
            self.find_endpoint(local, Direction::Input, &application_name, &stream_name)
        });
        let Some((server_index, endpoint)) = matched else {
            warn!(
                "no endpoint for input {}/{}, disconnecting",
                application_name, stream_name
            );
            connection.borrow_mut().close(false);
            return;
        };

        {
            let mut connection = connection.borrow_mut();
            connection.set_endpoint(endpoint);
            connection.send_user_control(crate::types::UserControlType::ClearStream, 0, 0, 0);
            connection.send_publish_status(transaction_id);
        }

        // A second publisher displaces a host input; a client pull input is
        // not displaced and the newcomer is rejected instead.
        if let Some(existing_stream) = self.servers[server_index].find_stream(&application_name, &stream_name)
        {
            let existing_input = existing_stream.borrow().input_connection();
            if let Some(existing) = existing_input {
                if !Rc::ptr_eq(&existing, connection) {
                    if existing.borrow().kind() == Kind::Host {
                        // Force-closing the old publisher detaches it and
                        // tears down its push connections; if nothing
                        // dependable is left the stream closes too and a
                        // fresh one is created below.
                        warn!(
                            "stream {}/{} already has a publisher, displacing it",
                            application_name, stream_name
                        );
                        existing.borrow_mut().close(true);
                        self.service_connection(&existing);
                    } else {
                        warn!(
                            "stream {}/{} is fed by a pull connection, disconnecting publisher",
                            application_name, stream_name
                        );
                        connection.borrow_mut().close(true);
                        self.service_connection(connection);
                        return;
                    }
                }
            }
        }

        let server = &mut self.servers[server_index];
        let stream = server
            .find_stream(&application_name, &stream_name)
            .unwrap_or_else(|| server.create_stream(&application_name, &stream_name));

        info!("publisher bound to {}/{}", application_name, stream_name);
        {
            let mut connection = connection.borrow_mut();
            connection.set_stream(Rc::downgrade(&stream));
            connection.begin_streaming();
        }
        Stream::start(&stream, connection);
        self.register_pending();
    }

    fn bind_play(&mut self, connection: &Rc<RefCell<Connection>>, transaction_id: f64) {
        let (local, application_name, stream_name) = {
            let connection = connection.borrow();
            (
                connection.local_addr(),
                connection.application_name().to_owned(),
                connection.stream_name().to_owned(),
            )
        };

        let matched = local.and_then(|local| {
            self.find_endpoint(local, Direction::Output, &application_name, &stream_name)
        });
        let Some((server_index, endpoint)) = matched else {
            warn!(
                "no endpoint for output {}/{}, disconnecting",
                application_name, stream_name
            );
            connection.borrow_mut().close(false);
            return;
        };

        {
            let mut connection = connection.borrow_mut();
            connection.set_endpoint(endpoint);
            connection.send_user_control(crate::types::UserControlType::ClearStream, 0, 0, 0);
            connection.send_play_status(transaction_id);
        }

        let server = &mut self.servers[server_index];
        let stream = server
            .find_stream(&application_name, &stream_name)
            .unwrap_or_else(|| server.create_stream(&application_name, &stream_name));

        info!("subscriber bound to {}/{}", application_name, stream_name);
        {
            let mut connection = connection.borrow_mut();
            connection.set_stream(Rc::downgrade(&stream));
            connection.begin_streaming();
        }
        Stream::start(&stream, connection);
        self.register_pending();
    }

    /// Every (server, endpoint) pair served by `local` whose direction and
    /// templated names match; placeholders in templates act as wildcards.
    pub fn get_endpoints(
        &self,
        local: SocketAddr,
        direction: Direction,
        application_name: &str,
        stream_name: &str,
    ) -> Vec<(usize, Rc<Endpoint>)> {
        let mut matches = Vec::new();
        for (server_index, server) in self.servers.iter().enumerate() {
            for endpoint in server.endpoints().iter() {
                if endpoint.kind == Kind::Host
                    && endpoint.serves_address(local)
                    && endpoint.matches(direction, application_name, stream_name)
                {
                    matches.push((server_index, endpoint.clone()));
                }
            }
        }
        matches
    }

    fn find_endpoint(
        &self,
        local: SocketAddr,
        direction: Direction,
        application_name: &str,
        stream_name: &str,
    ) -> Option<(usize, Rc<Endpoint>)> {
        self.get_endpoints(local, direction, application_name, stream_name)
            .into_iter()
            .next()
    }

    fn service_connection(&mut self, connection: &Rc<RefCell<Connection>>) {
        loop {
            // Taken in its own statement so the connection is not borrowed
            // while the stream detaches it.
            let stream = connection.borrow_mut().take_pending_stream_stop();
            let Some(stream) = stream else { break };
            Stream::stop(&stream, connection);
        }
    }

    fn update(&mut self, delta: f32) {
        let hosts = self.connections.clone();
        for connection in hosts {
            connection.borrow_mut().update(delta);
            self.service_connection(&connection);
        }
        for index in 0..self.servers.len() {
            self.servers[index].update(delta);
        }
        self.status_clients.retain(|client| !client.is_finished());
    }

    /// Registers every socket the dispatch round created or reconnected.
    fn register_pending(&mut self) {
        let mut register = |tokens: &mut HashMap<Token, Target>,
                            poll: &Poll,
                            connection: &Rc<RefCell<Connection>>| {
            let mut borrowed = connection.borrow_mut();
            let id = borrowed.id();
            let socket = borrowed.socket_mut();
            if !socket.needs_register {
                return;
            }
            socket.needs_register = false;
            if let Some(stream) = socket.stream_mut() {
                let token = Token(id as usize);
                if poll
                    .registry()
                    .register(stream, token, Interest::READABLE | Interest::WRITABLE)
                    .is_ok()
                {
                    tokens.insert(token, Target::Connection(Rc::downgrade(connection)));
                }
            }
        };

        for connection in &self.connections {
            register(&mut self.tokens, &self.poll, connection);
        }
        for server in &self.servers {
            for connection in server.client_connections() {
                register(&mut self.tokens, &self.poll, &connection);
            }
        }

        for client in &mut self.status_clients {
            let id = client.id();
            let socket = client.socket_mut();
            if socket.needs_register {
                socket.needs_register = false;
                if let Some(stream) = socket.stream_mut() {
                    let token = Token(id as usize);
                    if self
                        .poll
                        .registry()
                        .register(stream, token, Interest::READABLE)
                        .is_ok()
                    {
                        self.tokens.insert(token, Target::StatusClient(id));
                    }
                }
            }
        }
    }

    /// Reaps closed streams and host connections at the tick boundary.
    fn cleanup(&mut self) {
        for server in &mut self.servers {
            server.cleanup();
        }

        let mut dead = Vec::new();
        self.connections.retain(|connection| {
            let connection = connection.borrow();
            if connection.is_closed() {
                dead.push(connection.id());
                false
            } else {
                true
            }
        });
        for id in dead {
            self.tokens.remove(&Token(id as usize));
        }
    }

    /// Renders the relay → server → stream → connection hierarchy.
    pub fn get_stats(&self, out: &mut String, report_type: ReportType) {
        match report_type {
            ReportType::Text => {
                let _ = writeln!(
                    out,
                    "    {:>5} {:>20} {:>20} {:>15} {:>22} {:>7} {:>17} {:>7}",
                    "id", "application", "stream", "status", "address", "type", "state", "dir"
                );
                for server in &self.servers {
                    server.stats_text(out);
                }
            }
            ReportType::Html => {
                out.push_str("<html><head><title>Relay status</title></head><body>");
                for server in &self.servers {
                    server.stats_html(out);
                }
                out.push_str("</body></html>");
            }
            ReportType::Json => {
                let value = serde_json::json!({
                    "servers": self
                        .servers
                        .iter()
                        .map(Server::stats_json)
                        .collect::<Vec<_>>(),
                });
                out.push_str(&value.to_string());
            }
        }
    }
}
