//! Message transport for the rendezvous. Two patterns are needed: request/response (READY then
//! OK) and fan-out (SYNC). The traits keep the rendezvous logic transport-agnostic, the TCP types
//! below carry one JSON object per line.

use failure::{bail, Error};
use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Sleep between accept/connect attempts
const RETRY_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusMessage {
    Ready { node_id: String },
    Ok,
    Sync,
}

pub trait Requester {
    /// Send `msg` and wait for the reply. `None` if no reply arrived within `timeout`
    fn request(&mut self, msg: &BusMessage, timeout: Duration) -> Result<Option<BusMessage>, Error>;
}

pub trait Replier {
    /// Wait up to `timeout` for one request and answer it with whatever `handler` returns. A
    /// handler returning `None` closes the exchange without a reply. Returns whether a request
    /// was handled.
    fn serve_one(
        &mut self,
        timeout: Duration,
        handler: &mut dyn FnMut(BusMessage) -> Option<BusMessage>,
    ) -> Result<bool, Error>;
}

pub trait Publisher {
    /// Deliver `msg` to every connected subscriber. Returns how many received it
    fn publish(&mut self, msg: &BusMessage) -> Result<usize, Error>;
}

pub trait Subscriber {
    /// Next broadcast message, or `None` after `timeout`
    fn recv(&mut self, timeout: Duration) -> Result<Option<BusMessage>, Error>;
}

fn encode(msg: &BusMessage) -> Result<Vec<u8>, Error> {
    let mut line = serde_json::to_vec(msg)?;
    line.push(b'\n');
    Ok(line)
}

fn is_timeout(e: &std::io::Error) -> bool {
    e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut
}

/// Socket timeouts of zero are rejected by the OS, so clamp to something tiny
fn socket_timeout(d: Duration) -> Option<Duration> {
    Some(d.max(Duration::from_millis(1)))
}

fn connect_until<A: ToSocketAddrs>(addr: A, deadline: Instant) -> Result<Option<TcpStream>, Error> {
    let addrs: Vec<SocketAddr> = addr.to_socket_addrs()?.collect();
    if addrs.is_empty() {
        bail!("address resolved to nothing");
    }
    loop {
        for a in &addrs {
            match TcpStream::connect(a) {
                Ok(stream) => return Ok(Some(stream)),
                Err(e) if e.kind() == ErrorKind::ConnectionRefused => (),
                Err(e) => return Err(e.into()),
            }
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        std::thread::sleep(RETRY_INTERVAL);
    }
}

/// Reads newline-terminated JSON. Partial lines survive a read timeout.
struct LineReader {
    reader: BufReader<TcpStream>,
    partial: Vec<u8>,
}

impl LineReader {
    fn new(stream: TcpStream) -> Self {
        Self {
            reader: BufReader::new(stream),
            partial: Vec::new(),
        }
    }

    fn read_message(&mut self, timeout: Duration) -> Result<Option<BusMessage>, Error> {
        self.reader.get_ref().set_read_timeout(socket_timeout(timeout))?;
        match self.reader.read_until(b'\n', &mut self.partial) {
            Ok(0) => bail!("peer closed the connection"),
            Ok(_) if self.partial.last() != Some(&b'\n') => bail!("peer closed mid-message"),
            Ok(_) => {
                let line = std::mem::replace(&mut self.partial, Vec::new());
                Ok(Some(serde_json::from_slice(&line)?))
            }
            Err(ref e) if is_timeout(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// Connects for every request, retrying while the replier is not up yet
pub struct TcpRequester {
    addr: String,
}

impl TcpRequester {
    pub fn new(addr: &str) -> Self {
        Self {
            addr: addr.to_string(),
        }
    }
}

impl Requester for TcpRequester {
    fn request(&mut self, msg: &BusMessage, timeout: Duration) -> Result<Option<BusMessage>, Error> {
        let deadline = Instant::now() + timeout;
        let mut stream = match connect_until(self.addr.as_str(), deadline)? {
            Some(stream) => stream,
            None => return Ok(None),
        };
        stream.write_all(&encode(msg)?)?;
        stream.flush()?;
        let remaining = deadline.saturating_duration_since(Instant::now());
        LineReader::new(stream).read_message(remaining)
    }
}

/// Answers one request per connection
pub struct TcpReplier {
    listener: TcpListener,
}

impl TcpReplier {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }
}

impl Replier for TcpReplier {
    fn serve_one(
        &mut self,
        timeout: Duration,
        handler: &mut dyn FnMut(BusMessage) -> Option<BusMessage>,
    ) -> Result<bool, Error> {
        let deadline = Instant::now() + timeout;
        let (stream, peer) = loop {
            match self.listener.accept() {
                Ok(conn) => break conn,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                    std::thread::sleep(RETRY_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        };
        stream.set_nonblocking(false)?;
        let mut writer = stream.try_clone()?;
        let request = match LineReader::new(stream).read_message(Duration::from_secs(1)) {
            Ok(Some(msg)) => msg,
            Ok(None) => {
                warn!(%peer, "request not received in time");
                return Ok(false);
            }
            Err(e) => {
                warn!(%peer, "bad request: {}", e);
                return Ok(false);
            }
        };
        debug!(%peer, ?request, "request");
        if let Some(reply) = handler(request) {
            writer.write_all(&encode(&reply)?)?;
            writer.flush()?;
        }
        Ok(true)
    }
}

pub struct TcpPublisher {
    listener: TcpListener,
    subscribers: Vec<TcpStream>,
}

impl TcpPublisher {
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            subscribers: Vec::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    fn accept_pending(&mut self) -> Result<(), Error> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    debug!(%peer, "subscriber connected");
                    self.subscribers.push(stream);
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Publisher for TcpPublisher {
    fn publish(&mut self, msg: &BusMessage) -> Result<usize, Error> {
        self.accept_pending()?;
        let line = encode(msg)?;
        self.subscribers.retain(|s| {
            let mut s = s;
            match s.write_all(&line).and_then(|_| s.flush()) {
                Ok(()) => true,
                Err(e) => {
                    debug!("dropping subscriber: {}", e);
                    false
                }
            }
        });
        Ok(self.subscribers.len())
    }
}

pub struct TcpSubscriber {
    reader: LineReader,
}

impl TcpSubscriber {
    /// Connects, retrying for up to `timeout` while the publisher is not up yet
    pub fn connect<A: ToSocketAddrs>(addr: A, timeout: Duration) -> Result<Self, Error> {
        match connect_until(addr, Instant::now() + timeout)? {
            Some(stream) => Ok(Self {
                reader: LineReader::new(stream),
            }),
            None => bail!("publisher not reachable within {:?}", timeout),
        }
    }
}

impl Subscriber for TcpSubscriber {
    fn recv(&mut self, timeout: Duration) -> Result<Option<BusMessage>, Error> {
        self.reader.read_message(timeout)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn wire_format_is_one_json_line() {
        let line = encode(&BusMessage::Ready {
            node_id: "node-a".into(),
        })
        .unwrap();
        assert_eq!(
            std::str::from_utf8(&line).unwrap(),
            "{\"kind\":\"READY\",\"node_id\":\"node-a\"}\n"
        );
        assert_eq!(encode(&BusMessage::Sync).unwrap(), b"{\"kind\":\"SYNC\"}\n".to_vec());
    }

    #[test]
    fn request_reply_over_tcp() {
        let mut replier = TcpReplier::bind("127.0.0.1:0").unwrap();
        let addr = replier.local_addr().unwrap().to_string();
        let client = std::thread::spawn(move || {
            TcpRequester::new(&addr)
                .request(
                    &BusMessage::Ready {
                        node_id: "x".into(),
                    },
                    Duration::from_secs(5),
                )
                .unwrap()
        });
        let mut seen = None;
        let handled = replier
            .serve_one(Duration::from_secs(5), &mut |msg| {
                seen = Some(msg);
                Some(BusMessage::Ok)
            })
            .unwrap();
        assert!(handled);
        assert_eq!(seen, Some(BusMessage::Ready { node_id: "x".into() }));
        assert_eq!(client.join().unwrap(), Some(BusMessage::Ok));
    }

    #[test]
    fn replier_times_out_without_requests() {
        let mut replier = TcpReplier::bind("127.0.0.1:0").unwrap();
        let handled = replier
            .serve_one(Duration::from_millis(50), &mut |_| Some(BusMessage::Ok))
            .unwrap();
        assert!(!handled);
    }

    #[test]
    fn subscriber_sees_each_broadcast_once() {
        let mut publisher = TcpPublisher::bind("127.0.0.1:0").unwrap();
        let addr = publisher.local_addr().unwrap();
        let mut sub = TcpSubscriber::connect(addr, Duration::from_secs(1)).unwrap();
        assert_eq!(sub.recv(Duration::from_millis(20)).unwrap(), None);
        assert_eq!(publisher.publish(&BusMessage::Sync).unwrap(), 1);
        assert_eq!(sub.recv(Duration::from_secs(1)).unwrap(), Some(BusMessage::Sync));
        assert_eq!(sub.recv(Duration::from_millis(50)).unwrap(), None);
    }
}
