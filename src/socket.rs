use log::{debug, trace};
use mio::net::TcpStream;
use std::{
    io::{self, Read, Write},
    net::SocketAddr,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    NotConnected,
    Connecting,
    Ready,
    Closed,
}

/// Outcome of draining a readable socket.
pub struct ReadOutcome {
    pub bytes: usize,
    /// Peer performed an orderly shutdown, or the read errored; either way
    /// the socket is done.
    pub closed: bool,
}

/// A non-blocking TCP stream with a send buffer. Sends enqueue and flush
/// opportunistically so a slow peer never blocks the tick; the event loop
/// flushes again on writable readiness.
pub struct Socket {
    stream: Option<TcpStream>,
    state: State,
    send_buffer: Vec<u8>,
    remote_addr: Option<SocketAddr>,
    local_addr: Option<SocketAddr>,
    /// Set whenever a fresh stream exists that the poll registry has not
    /// seen yet; cleared by the event loop.
    pub needs_register: bool,
}

impl Socket {
    pub fn from_stream(stream: TcpStream, remote_addr: SocketAddr) -> Self {
        let local_addr = stream.local_addr().ok();
        Self {
            stream: Some(stream),
            state: State::Ready,
            send_buffer: Vec::new(),
            remote_addr: Some(remote_addr),
            local_addr,
            needs_register: true,
        }
    }

    pub fn disconnected() -> Self {
        Self {
            stream: None,
            state: State::NotConnected,
            send_buffer: Vec::new(),
            remote_addr: None,
            local_addr: None,
            needs_register: false,
        }
    }

    /// Starts a non-blocking connect; completion arrives as writable
    /// readiness and is confirmed by `finish_connect`.
    pub fn connect(&mut self, addr: SocketAddr) -> io::Result<()> {
        self.close();
        let stream = TcpStream::connect(addr)?;
        self.stream = Some(stream);
        self.state = State::Connecting;
        self.remote_addr = Some(addr);
        self.needs_register = true;
        Ok(())
    }

    /// Confirms an in-progress connect. `Ok(true)` once the stream is
    /// usable, `Ok(false)` while still pending.
    pub fn finish_connect(&mut self) -> io::Result<bool> {
        let stream = match (&self.state, &self.stream) {
            (State::Connecting, Some(stream)) => stream,
            _ => return Ok(self.state == State::Ready),
        };

        if let Some(err) = stream.take_error()? {
            self.close();
            return Err(err);
        }
        match stream.peer_addr() {
            Ok(_) => {
                self.local_addr = stream.local_addr().ok();
                self.state = State::Ready;
                Ok(true)
            }
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(err) if err.raw_os_error() == Some(libc_einprogress()) => Ok(false),
            Err(err) => {
                self.close();
                Err(err)
            }
        }
    }

    /// Drains everything currently readable into `into`.
    pub fn read_available(&mut self, into: &mut Vec<u8>) -> ReadOutcome {
        let mut outcome = ReadOutcome {
            bytes: 0,
            closed: false,
        };
        let stream = match &mut self.stream {
            Some(stream) if self.state == State::Ready => stream,
            _ => return outcome,
        };

        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    outcome.closed = true;
                    break;
                }
                Ok(n) => {
                    into.extend_from_slice(&chunk[..n]);
                    outcome.bytes += n;
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    trace!("read error: {}", err);
                    outcome.closed = true;
                    break;
                }
            }
        }

        if outcome.closed {
            self.close();
        }
        outcome
    }

    /// Enqueues `data` and attempts to flush. Returns false once the socket
    /// is closed.
    pub fn send(&mut self, data: &[u8]) -> bool {
        if self.state == State::Closed {
            return false;
        }
        self.send_buffer.extend_from_slice(data);
        if self.state == State::Ready {
            self.flush();
        }
        true
    }

    /// Writes buffered bytes until the kernel pushes back.
    pub fn flush(&mut self) {
        let stream = match &mut self.stream {
            Some(stream) if self.state == State::Ready => stream,
            _ => return,
        };

        let mut written = 0;
        while written < self.send_buffer.len() {
            match stream.write(&self.send_buffer[written..]) {
                Ok(0) => break,
                Ok(n) => written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    debug!("write error: {}", err);
                    self.send_buffer.clear();
                    self.close();
                    return;
                }
            }
        }
        self.send_buffer.drain(..written);
    }

    pub fn close(&mut self) {
        self.stream = None;
        self.state = State::Closed;
        self.send_buffer.clear();
        self.needs_register = false;
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn is_connecting(&self) -> bool {
        self.state == State::Connecting
    }

    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    #[cfg(test)]
    pub fn sent_bytes(&self) -> &[u8] {
        &self.send_buffer
    }

    /// A socket that accepts sends into its buffer without a peer; unit
    /// tests inspect the buffer instead of the wire.
    #[cfg(test)]
    pub fn detached() -> Self {
        Self {
            stream: None,
            state: State::Ready,
            send_buffer: Vec::new(),
            remote_addr: None,
            local_addr: None,
            needs_register: false,
        }
    }
}

fn libc_einprogress() -> i32 {
    // EINPROGRESS is 36 on the BSDs and macOS, 115 on Linux; mio surfaces a
    // pending connect this way on some platforms instead of NotConnected.
    if cfg!(any(target_os = "macos", target_os = "freebsd")) {
        36
    } else {
        115
    }
}
