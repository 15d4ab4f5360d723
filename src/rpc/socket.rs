//! UDP socket layer managing incoming/outgoing requests and responses.

use std::net::{SocketAddr, SocketAddrV4, UdpSocket};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::common::Id;
use crate::messages::{Message, MessageType, RequestSpecific, ResponseSpecific};
use crate::Result;

use super::config::Config;

const MTU: usize = 16 * 1024;

/// Default request timeout before abandoning an inflight request to a
/// non-responding node and presuming it departed.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);
/// The maximum duration to backoff checking the [UdpSocket] buffer after it is empty.
/// Lower values increase CPU usage, but reduce latency and drain the buffer
/// faster, reducing the risk of packet loss.
const MAX_THREAD_BLOCK_DURATION: Duration = Duration::from_millis(10);

/// A UdpSocket wrapper that formats and correlates DHT requests and responses.
#[derive(Debug)]
pub(crate) struct KrpcSocket {
    next_tid: u16,
    socket: UdpSocket,
    id: Id,
    local_addr: SocketAddrV4,
    request_timeout: Duration,
    /// Sorted by transaction id.
    inflight_requests: Vec<InflightRequest>,
}

#[derive(Debug, Clone)]
pub(crate) struct InflightRequest {
    pub tid: u16,
    pub to: SocketAddrV4,
    /// Set when the request went to a known routing table contact, so a
    /// timeout can evict it.
    pub node_id: Option<Id>,
    sent_at: Instant,
}

impl KrpcSocket {
    pub fn new(config: &Config, id: Id) -> Result<Self, std::io::Error> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], config.port.unwrap_or(0))))?;

        let local_addr = match socket.local_addr()? {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unimplemented!("KrpcSocket does not support Ipv6"),
        };

        socket.set_nonblocking(true)?;

        Ok(Self {
            socket,
            next_tid: 0,
            id,
            local_addr,
            request_timeout: config.request_timeout,
            inflight_requests: Vec::new(),
        })
    }

    // === Getters ===

    /// Returns the address the socket is listening to.
    #[inline]
    pub fn local_addr(&self) -> SocketAddrV4 {
        self.local_addr
    }

    // === Public Methods ===

    /// Returns true if this transaction_id is still inflight.
    pub fn inflight(&self, transaction_id: &u16) -> bool {
        if let Ok(index) = self.find_index(transaction_id) {
            if let Some(request) = self.inflight_requests.get(index) {
                return request.sent_at.elapsed() <= self.request_timeout;
            }
        }

        false
    }

    /// Send a request to the given address and return the transaction_id.
    pub fn request(
        &mut self,
        address: SocketAddrV4,
        node_id: Option<Id>,
        request: RequestSpecific,
    ) -> u16 {
        let message = Message {
            transaction_id: self.tid(),
            sender_id: self.id,
            message_type: MessageType::Request(request),
        };

        let tid = message.transaction_id;
        self.insert_inflight(InflightRequest {
            tid,
            to: address,
            node_id,
            sent_at: Instant::now(),
        });

        trace!(context = "socket_message_sending", message = ?message);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending request message");
        });

        tid
    }

    /// Send a response to the given address.
    pub fn response(
        &mut self,
        address: SocketAddrV4,
        transaction_id: u16,
        response: ResponseSpecific,
    ) {
        let message = Message {
            transaction_id,
            sender_id: self.id,
            message_type: MessageType::Response(response),
        };

        trace!(context = "socket_message_sending", message = ?message);
        let _ = self.send(address, message).map_err(|e| {
            debug!(?e, "Error sending response message");
        });
    }

    /// Remove and return every inflight request that exceeded its deadline.
    /// Their targets are presumed departed.
    pub fn take_expired(&mut self) -> Vec<InflightRequest> {
        let timeout = self.request_timeout;

        let (expired, live): (Vec<_>, Vec<_>) = self
            .inflight_requests
            .drain(..)
            .partition(|request| request.sent_at.elapsed() > timeout);

        self.inflight_requests = live;

        expired
    }

    /// Receives a single message on the socket.
    /// On success, returns the message and the origin.
    pub fn recv_from(&mut self) -> Option<(Message, SocketAddrV4)> {
        let mut buf = [0_u8; MTU];

        match self.socket.recv_from(&mut buf) {
            Ok((amt, SocketAddr::V4(from))) => {
                let bytes = &buf[..amt];

                if from.port() == 0 {
                    trace!(
                        context = "socket_validation",
                        message = "Response from port 0"
                    );
                    return None;
                }

                match Message::from_bytes(bytes) {
                    Ok(message) => {
                        let should_return = match message.message_type {
                            MessageType::Request(_) => {
                                trace!(
                                    context = "socket_message_receiving",
                                    ?message,
                                    ?from,
                                    "Received request message"
                                );
                                true
                            }
                            MessageType::Response(_) => {
                                trace!(
                                    context = "socket_message_receiving",
                                    ?message,
                                    ?from,
                                    "Received response message"
                                );
                                self.is_expected_response(&message, &from)
                            }
                        };

                        if should_return {
                            return Some((message, from));
                        }
                    }
                    Err(error) => {
                        trace!(
                            context = "socket_error",
                            ?error,
                            ?from,
                            message = ?String::from_utf8_lossy(bytes),
                            "Received invalid bencode message."
                        );
                    }
                }
            }
            Ok((_, SocketAddr::V6(_))) => {
                trace!(
                    context = "socket_validation",
                    message = "Received IPv6 packet"
                );
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(MAX_THREAD_BLOCK_DURATION);
            }
            Err(e) => {
                trace!(
                    context = "socket_error",
                    ?e,
                    "recv_from failed unexpectedly"
                );
            }
        }

        None
    }

    // === Private Methods ===

    fn is_expected_response(&mut self, message: &Message, from: &SocketAddrV4) -> bool {
        match self.find_index(&message.transaction_id) {
            Ok(index) => {
                if compare_socket_addr(&self.inflight_requests[index].to, from) {
                    self.inflight_requests.remove(index);
                    true
                } else {
                    trace!(
                        context = "socket_validation",
                        message = "Response from wrong address"
                    );
                    false
                }
            }
            Err(_) => {
                trace!(
                    context = "socket_validation",
                    message = "Unexpected response id"
                );
                false
            }
        }
    }

    /// Increments self.next_tid and returns the previous value.
    ///
    /// We don't bother much with reusing freed transaction ids, since
    /// the timeout is short enough that we are unlikely to run out of
    /// 65536 ids before the oldest expire.
    fn tid(&mut self) -> u16 {
        let tid = self.next_tid;
        self.next_tid = self.next_tid.wrapping_add(1);
        tid
    }

    fn insert_inflight(&mut self, request: InflightRequest) {
        match self.find_index(&request.tid) {
            // The tid space wrapped before the old entry expired; replace it.
            Ok(index) => self.inflight_requests[index] = request,
            Err(index) => self.inflight_requests.insert(index, request),
        }
    }

    fn find_index(&self, tid: &u16) -> Result<usize, usize> {
        self.inflight_requests
            .binary_search_by(|request| request.tid.cmp(tid))
    }

    /// Send a raw message.
    fn send(&mut self, address: SocketAddrV4, message: Message) -> Result<()> {
        self.socket.send_to(&message.to_bytes()?, address)?;
        Ok(())
    }
}

// Same as SocketAddr::eq but ignores the ip if it is unspecified for testing reasons.
fn compare_socket_addr(a: &SocketAddrV4, b: &SocketAddrV4) -> bool {
    if a.port() != b.port() {
        return false;
    }

    if a.ip().is_unspecified() {
        return true;
    }

    a.ip() == b.ip()
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    fn test_socket(timeout: Duration) -> KrpcSocket {
        KrpcSocket::new(
            &Config {
                request_timeout: timeout,
                ..Config::default()
            },
            Id::random(),
        )
        .expect("socket binds")
    }

    #[test]
    fn tid() {
        let mut socket = test_socket(DEFAULT_REQUEST_TIMEOUT);

        assert_eq!(socket.tid(), 0);
        assert_eq!(socket.tid(), 1);
        assert_eq!(socket.tid(), 2);

        socket.next_tid = u16::MAX;

        assert_eq!(socket.tid(), 65535);
        assert_eq!(socket.tid(), 0);
    }

    #[test]
    fn recv_request() {
        let mut server = test_socket(DEFAULT_REQUEST_TIMEOUT);
        let server_address = server.local_addr();

        let mut client = test_socket(DEFAULT_REQUEST_TIMEOUT);
        client.next_tid = 120;

        let client_address = client.local_addr();
        let client_id = client.id;

        let server_thread = thread::spawn(move || loop {
            if let Some((message, from)) = server.recv_from() {
                assert_eq!(from.port(), client_address.port());
                assert_eq!(message.transaction_id, 120);
                assert_eq!(message.sender_id, client_id);
                assert_eq!(
                    message.message_type,
                    MessageType::Request(RequestSpecific::Ping)
                );
                break;
            }
        });

        client.request(server_address, None, RequestSpecific::Ping);

        server_thread.join().expect("server thread finishes");
    }

    #[test]
    fn recv_response() {
        let (tx, rx) = flume::bounded(1);

        let mut client = test_socket(DEFAULT_REQUEST_TIMEOUT);
        let client_address = client.local_addr();

        let server_thread = thread::spawn(move || {
            let mut server = test_socket(DEFAULT_REQUEST_TIMEOUT);
            tx.send(server.local_addr()).expect("sends address");

            // Expect the response.
            server.insert_inflight(InflightRequest {
                tid: 8,
                to: client_address,
                node_id: None,
                sent_at: Instant::now(),
            });

            loop {
                if let Some((message, from)) = server.recv_from() {
                    assert_eq!(from.port(), client_address.port());
                    assert_eq!(message.transaction_id, 8);
                    assert_eq!(
                        message.message_type,
                        MessageType::Response(ResponseSpecific::Pong)
                    );
                    assert!(
                        server.inflight_requests.is_empty(),
                        "receiving removes the inflight request"
                    );
                    break;
                }
            }
        });

        let server_address = rx.recv().expect("receives address");

        client.response(server_address, 8, ResponseSpecific::Pong);

        server_thread.join().expect("server thread finishes");
    }

    #[test]
    fn inflight_request_timeout() {
        let mut socket = test_socket(Duration::from_millis(10));

        let tid = socket.request(
            SocketAddrV4::new([127, 0, 0, 1].into(), 1),
            None,
            RequestSpecific::Ping,
        );

        assert!(socket.inflight(&tid));

        thread::sleep(Duration::from_millis(20));

        assert!(!socket.inflight(&tid));

        let expired = socket.take_expired();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].tid, tid);
        assert!(socket.inflight_requests.is_empty());
    }

    #[test]
    fn ignore_response_from_wrong_address() {
        let mut server = test_socket(DEFAULT_REQUEST_TIMEOUT);
        let server_address = server.local_addr();

        let mut client = test_socket(DEFAULT_REQUEST_TIMEOUT);
        let client_address = client.local_addr();

        server.insert_inflight(InflightRequest {
            tid: 8,
            to: SocketAddrV4::new([127, 0, 0, 1].into(), client_address.port() + 1),
            node_id: None,
            sent_at: Instant::now(),
        });

        let server_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert!(
                server.recv_from().is_none(),
                "Should not receive a response from wrong address"
            );
        });

        client.response(server_address, 8, ResponseSpecific::Pong);

        server_thread.join().expect("server thread finishes");
    }

    #[test]
    fn ignore_unexpected_response_id() {
        let mut server = test_socket(DEFAULT_REQUEST_TIMEOUT);
        let server_address = server.local_addr();

        let mut client = test_socket(DEFAULT_REQUEST_TIMEOUT);

        let server_thread = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert!(
                server.recv_from().is_none(),
                "Should not receive a response with no matching inflight request"
            );
        });

        client.response(server_address, 42, ResponseSpecific::Pong);

        server_thread.join().expect("server thread finishes");
    }
}
