use crate::{amf::Value, next_id, socket::Socket};
use log::debug;

/// Rendering of the stats report (§ status endpoint paths).
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum ReportType {
    #[display(fmt = "TEXT")]
    Text,
    #[display(fmt = "HTML")]
    Html,
    #[display(fmt = "JSON")]
    Json,
}

/// What a status peer asked for once its request header is complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatsRequest {
    Report(ReportType),
    NotFound,
}

/// One accepted status-endpoint peer: a minimal HTTP/1.1 request reader and
/// a single-shot response writer.
pub struct StatusClient {
    id: u64,
    socket: Socket,
    data: Vec<u8>,
    start_line: String,
    headers: Vec<String>,
    finished: bool,
}

impl StatusClient {
    pub fn new(socket: Socket) -> Self {
        Self {
            id: next_id(),
            socket,
            data: Vec::new(),
            start_line: String::new(),
            headers: Vec::new(),
            finished: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.finished || !self.socket.is_ready()
    }

    pub(crate) fn socket_mut(&mut self) -> &mut Socket {
        &mut self.socket
    }

    /// Consumes readable bytes; returns the request once the header block
    /// is complete.
    pub fn handle_read(&mut self) -> Option<StatsRequest> {
        let outcome = {
            let mut buffer = Vec::new();
            let outcome = self.socket.read_available(&mut buffer);
            self.data.extend_from_slice(&buffer);
            outcome
        };
        if outcome.closed {
            self.finished = true;
        }

        while let Some(line_end) = find_crlf(&self.data) {
            let line = String::from_utf8_lossy(&self.data[..line_end]).into_owned();
            self.data.drain(..line_end + 2);

            if line.is_empty() {
                // End of the header block.
                if !self.start_line.is_empty() {
                    return Some(self.parse_request());
                }
            } else if self.start_line.is_empty() {
                self.start_line = line;
            } else {
                self.headers.push(line);
            }
        }
        None
    }

    fn parse_request(&self) -> StatsRequest {
        let mut fields = self.start_line.split_whitespace();
        let method = fields.next().unwrap_or_default();
        let path = fields.next().unwrap_or_default();
        debug!("[STA:{}] {} {}", self.id, method, path);

        if method != "GET" {
            return StatsRequest::NotFound;
        }
        match path {
            "/stats" | "/stats.html" => StatsRequest::Report(ReportType::Html),
            "/stats.txt" => StatsRequest::Report(ReportType::Text),
            "/stats.json" => StatsRequest::Report(ReportType::Json),
            _ => StatsRequest::NotFound,
        }
    }

    /// Writes the single-shot response and closes.
    pub fn respond(&mut self, report_type: ReportType, body: &str) {
        let content_type = match report_type {
            ReportType::Text => "text/plain",
            ReportType::Html => "text/html",
            ReportType::Json => "application/json",
        };
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Cache-Control: no-cache, no-store, must-revalidate\r\n\
             Pragma: no-cache\r\n\
             Expires: 0\r\n\
             Content-Type: {}\r\n\
             Content-Length: {}\r\n\
             \r\n{}",
            content_type,
            body.len(),
            body
        );
        self.socket.send(response.as_bytes());
        self.socket.close();
        self.finished = true;
    }

    pub fn respond_not_found(&mut self) {
        let body = "Not Found";
        let response = format!(
            "HTTP/1.1 404 Not Found\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             \r\n{}",
            body.len(),
            body
        );
        self.socket.send(response.as_bytes());
        self.socket.close();
        self.finished = true;
    }
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == b"\r\n")
}

/// Typed values as they appear in the JSON report.
pub fn amf_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Number(number) => serde_json::Number::from_f64(*number)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
        Value::Boolean(boolean) => serde_json::Value::Bool(*boolean),
        Value::String(string) | Value::XmlDocument(string) => {
            serde_json::Value::String(string.clone())
        }
        Value::Object(map) | Value::EcmaArray(map) => serde_json::Value::Object(
            map.iter()
                .map(|(key, value)| (key.clone(), amf_to_json(value)))
                .collect(),
        ),
        Value::StrictArray(values) => {
            serde_json::Value::Array(values.iter().map(amf_to_json).collect())
        }
        Value::Null | Value::Undefined => serde_json::Value::Null,
        Value::Date { ms, .. } => serde_json::Number::from_f64(*ms)
            .map_or(serde_json::Value::Null, serde_json::Value::Number),
    }
}
