//! TCP decision surface for out-of-band approvals.
//!
//! Listens on 127.0.0.1:0 (auto-assign port) and brokers one pending
//! decision at a time between the PTY loop and whatever UI is attached.
//!
//! ## Protocol
//!
//! 1. Client connects to the decision port
//! 2. While a request is pending, the server sends it as one line of
//!    camelCase JSON (also sent immediately to late-connecting clients)
//! 3. Client answers with one line: `y`, `n`, or
//!    `{"approved": bool, "remember": bool}`
//! 4. First valid answer resolves the pending reply; malformed answers
//!    are logged and ignored
//!
//! Dropping the server (session teardown) drops any unresolved reply,
//! which the awaiting side reads as denial.

use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::fd::AsRawFd;

use crate::approval::{ApprovalDecision, DecisionReply};
use crate::log::{log_debug, log_info, log_warn};
use crate::parse::ToolUseRequest;

/// Errors on the decision wire. Answer parse failures are recoverable
/// (the client may retry); transport failures drop the client.
#[derive(Debug, thiserror::Error)]
pub enum DecisionError {
    #[error("malformed answer: {0}")]
    MalformedAnswer(String),

    #[error("io error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
}

/// Parse one answer line from a client.
fn parse_answer(line: &str) -> Result<ApprovalDecision, DecisionError> {
    let line = line.trim();
    match line {
        "y" | "Y" => return Ok(ApprovalDecision::approved()),
        "n" | "N" => return Ok(ApprovalDecision::denied()),
        _ => {}
    }
    if line.starts_with('{') {
        return serde_json::from_str(line)
            .map_err(|e| DecisionError::MalformedAnswer(format!("{}: {}", line, e)));
    }
    Err(DecisionError::MalformedAnswer(line.to_string()))
}

/// TCP server brokering the single outstanding decision.
pub struct DecisionServer {
    listener: TcpListener,
    port: u16,
    clients: Vec<(TcpStream, Vec<u8>)>,
    /// The request currently awaiting an answer, as a JSON line.
    pending_line: Option<String>,
    /// Reply handle for the pending request.
    pending_reply: Option<DecisionReply>,
}

impl DecisionServer {
    /// Create a new decision server on localhost.
    pub fn new() -> anyhow::Result<Self> {
        use anyhow::Context;
        let listener =
            TcpListener::bind("127.0.0.1:0").context("Failed to bind decision server")?;
        let port = listener.local_addr()?.port();
        listener.set_nonblocking(true)?;

        Ok(Self {
            listener,
            port,
            clients: Vec::new(),
            pending_line: None,
            pending_reply: None,
        })
    }

    /// Get the port the server is listening on
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Get the listener raw file descriptor for polling
    pub fn listener_raw_fd(&self) -> i32 {
        self.listener.as_raw_fd()
    }

    /// Get raw file descriptors for active clients
    pub fn client_raw_fds(&self) -> impl Iterator<Item = i32> + '_ {
        self.clients.iter().map(|(stream, _)| stream.as_raw_fd())
    }

    pub fn has_pending(&self) -> bool {
        self.pending_reply.is_some()
    }

    /// Publish a request for decision. At most one may be outstanding;
    /// the agent cannot produce a second prompt before the first answer
    /// reaches its stdin, so a second publish indicates a caller bug.
    pub fn publish(&mut self, request: &ToolUseRequest, reply: DecisionReply) {
        debug_assert!(self.pending_reply.is_none(), "decision already outstanding");

        let line = match serde_json::to_string(request) {
            Ok(json) => json,
            Err(e) => {
                // Unserializable request: resolve as denial rather than
                // leave the agent waiting on an answer nobody can give.
                log_warn("decision", "publish.serialize_fail", &format!("{}", e));
                let mut reply = reply;
                reply.resolve(ApprovalDecision::denied());
                return;
            }
        };

        log_info("decision", "publish", &request.summary);

        // Send to already-connected clients; drop the ones that are gone
        self.clients
            .retain_mut(|(stream, _)| writeln!(stream, "{}", line).is_ok());

        self.pending_line = Some(line);
        self.pending_reply = Some(reply);
    }

    /// Abandon the pending decision without resolving it (the dropped
    /// reply disconnects the receiver, which reads as denial).
    pub fn abandon_pending(&mut self) {
        if self.pending_reply.take().is_some() {
            log_info("decision", "abandon", "pending decision dropped at teardown");
        }
        self.pending_line = None;
    }

    /// Accept a new connection. Late-connecting clients immediately
    /// receive the pending request, if any.
    pub fn accept(&mut self) -> anyhow::Result<()> {
        match self.listener.accept() {
            Ok((mut stream, addr)) => {
                stream.set_nonblocking(true)?;
                log_debug("decision", "client.accept", &format!("{}", addr));
                if let Some(ref line) = self.pending_line {
                    let _ = writeln!(stream, "{}", line);
                }
                self.clients.push((stream, Vec::new()));
                Ok(())
            }
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Read from a client by index. A complete line is parsed as an
    /// answer; the first valid one resolves the pending decision.
    /// Returns the resolved decision, if this read produced one.
    pub fn read_client(&mut self, index: usize) -> Option<ApprovalDecision> {
        if index >= self.clients.len() {
            return None;
        }

        let mut buf = [0u8; 1024];
        let mut closed = false;

        loop {
            let (stream, linebuf) = &mut self.clients[index];
            match stream.read(&mut buf) {
                Ok(0) => {
                    closed = true;
                    break;
                }
                Ok(n) => {
                    linebuf.extend_from_slice(&buf[..n]);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(_) => {
                    closed = true;
                    break;
                }
            }
        }

        let decision = self.drain_answer(index);
        if closed {
            self.clients.remove(index);
        }
        decision
    }

    /// Pull complete lines out of a client's buffer and try each as an
    /// answer until one resolves the pending decision.
    fn drain_answer(&mut self, index: usize) -> Option<ApprovalDecision> {
        loop {
            let line = {
                let (_, linebuf) = &mut self.clients[index];
                let pos = linebuf.iter().position(|&b| b == b'\n')?;
                let line: Vec<u8> = linebuf.drain(..=pos).collect();
                String::from_utf8_lossy(&line).into_owned()
            };

            if self.pending_reply.is_none() {
                // Stale answer, nothing pending
                continue;
            }

            match parse_answer(&line) {
                Ok(decision) => {
                    if let Some(mut reply) = self.pending_reply.take() {
                        reply.resolve(decision);
                    }
                    self.pending_line = None;
                    return Some(decision);
                }
                Err(e) => {
                    log_warn("decision", "answer.malformed", &format!("{}", e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_prompt;
    use std::io::{BufRead, BufReader};
    use std::net::TcpStream;

    fn request() -> ToolUseRequest {
        parse_prompt("Allow Bash to run this command?\ncommand: echo hi\n(Y)es / (N)o\n")
    }

    /// Drive accept/read until the client's answer resolves
    fn pump_until_decision(server: &mut DecisionServer) -> ApprovalDecision {
        for _ in 0..200 {
            let _ = server.accept();
            for i in (0..server.clients.len()).rev() {
                if let Some(d) = server.read_client(i) {
                    return d;
                }
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("no decision arrived");
    }

    // ---- answer parsing ----

    #[test]
    fn parses_shorthand_answers() {
        assert_eq!(parse_answer("y\n").unwrap(), ApprovalDecision::approved());
        assert_eq!(parse_answer("n").unwrap(), ApprovalDecision::denied());
    }

    #[test]
    fn parses_json_answer() {
        let d = parse_answer("{\"approved\":true,\"remember\":true}").unwrap();
        assert!(d.approved);
        assert!(d.remember);
    }

    #[test]
    fn rejects_malformed_answer() {
        assert!(matches!(
            parse_answer("maybe"),
            Err(DecisionError::MalformedAnswer(_))
        ));
        assert!(matches!(
            parse_answer("{not json"),
            Err(DecisionError::MalformedAnswer(_))
        ));
    }

    // ---- request/answer round trip ----

    #[test]
    fn client_receives_request_and_answer_resolves() {
        let mut server = DecisionServer::new().unwrap();
        let (reply, rx) = DecisionReply::channel();
        server.publish(&request(), reply);
        assert!(server.has_pending());

        let stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        let mut reader = BufReader::new(stream.try_clone().unwrap());

        // Server must push the pending request to the late-connecting client
        for _ in 0..200 {
            let _ = server.accept();
            if !server.clients.is_empty() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert!(line.contains("\"toolName\":\"Bash\""));
        assert!(line.contains("\"command\":\"echo hi\""));

        // Answer and confirm resolution
        let mut writer = stream;
        writer.write_all(b"y\n").unwrap();
        writer.flush().unwrap();

        let decision = pump_until_decision(&mut server);
        assert!(decision.approved);
        assert!(!server.has_pending());
        assert_eq!(rx.recv().unwrap(), ApprovalDecision::approved());
    }

    #[test]
    fn json_answer_carries_remember() {
        let mut server = DecisionServer::new().unwrap();
        let (reply, rx) = DecisionReply::channel();
        server.publish(&request(), reply);

        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        stream
            .write_all(b"{\"approved\":true,\"remember\":true}\n")
            .unwrap();

        let decision = pump_until_decision(&mut server);
        assert!(decision.approved && decision.remember);
        assert_eq!(rx.recv().unwrap(), decision);
    }

    #[test]
    fn malformed_answer_keeps_pending() {
        let mut server = DecisionServer::new().unwrap();
        let (reply, _rx) = DecisionReply::channel();
        server.publish(&request(), reply);

        let mut stream = TcpStream::connect(("127.0.0.1", server.port())).unwrap();
        stream.write_all(b"whatever\n").unwrap();

        // Let the server chew on the bad answer
        for _ in 0..20 {
            let _ = server.accept();
            for i in (0..server.clients.len()).rev() {
                assert!(server.read_client(i).is_none());
            }
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(server.has_pending());
    }

    // ---- teardown ----

    #[test]
    fn dropping_server_denies_pending() {
        let server_rx = {
            let mut server = DecisionServer::new().unwrap();
            let (reply, rx) = DecisionReply::channel();
            server.publish(&request(), reply);
            rx
            // server dropped here with the reply unresolved
        };
        assert!(server_rx.recv().is_err());
    }

    #[test]
    fn abandon_pending_drops_reply() {
        let mut server = DecisionServer::new().unwrap();
        let (reply, rx) = DecisionReply::channel();
        server.publish(&request(), reply);
        server.abandon_pending();
        assert!(!server.has_pending());
        assert!(rx.recv().is_err());
    }
}
