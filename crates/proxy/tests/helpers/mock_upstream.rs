#![allow(dead_code)]
//! Scripted upstream DNS servers for exercising the proxy end to end.

use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use hickory_proto::op::{Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, SOA};
use hickory_proto::rr::{Name, RData, Record};
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;

pub fn encode(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder).expect("encode mock message");
    buf
}

pub fn zone_name() -> Name {
    Name::from_str("example.com.").unwrap()
}

pub fn a_record(octet: u8) -> Record {
    Record::from_rdata(zone_name(), 60, RData::A(A(Ipv4Addr::new(192, 0, 2, octet))))
}

pub fn soa_record() -> Record {
    let soa = SOA::new(
        Name::from_str("ns1.example.com.").unwrap(),
        Name::from_str("hostmaster.example.com.").unwrap(),
        2024_01_01_01,
        7200,
        3600,
        1_209_600,
        300,
    );
    Record::from_rdata(zone_name(), 300, RData::SOA(soa))
}

fn answer_for(query: &Message) -> Message {
    let mut resp = Message::new();
    resp.set_id(query.id());
    resp.set_message_type(MessageType::Response);
    resp.set_op_code(OpCode::Query);
    resp.add_queries(query.queries().iter().cloned());
    resp.add_answer(a_record(1));
    resp.set_response_code(ResponseCode::NoError);
    resp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UdpScript {
    /// One well-formed answer per query.
    Answer,
    /// A stale frame with the wrong id, then the real answer.
    WrongIdFirst,
}

pub struct MockUdpUpstream {
    addr: SocketAddr,
    seen_ids: Arc<Mutex<Vec<u16>>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockUdpUpstream {
    pub async fn start(script: UdpScript) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let seen_ids: Arc<Mutex<Vec<u16>>> = Arc::default();
        let seen = Arc::clone(&seen_ids);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((len, peer)) = result else { break };
                        let Ok(query) = Message::from_vec(&buf[..len]) else { continue };
                        seen.lock().unwrap().push(query.id());

                        if script == UdpScript::WrongIdFirst {
                            let mut stale = answer_for(&query);
                            stale.set_id(query.id().wrapping_add(1));
                            let _ = socket.send_to(&encode(&stale), peer).await;
                        }
                        let _ = socket.send_to(&encode(&answer_for(&query)), peer).await;
                    }
                }
            }
        });

        Self {
            addr,
            seen_ids,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn seen_ids(&self) -> Vec<u16> {
        self.seen_ids.lock().unwrap().clone()
    }
}

impl Drop for MockUdpUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpScript {
    /// Serve any number of exchanges per connection.
    Answer,
    /// Serve one exchange, then hang up.
    CloseAfterFirst,
    /// Serve AXFR frame sequences: a single-SOA frame, a data frame,
    /// then a frame ending with the closing SOA.
    Axfr,
    /// A malformed transfer whose first frame does not lead with SOA.
    AxfrNoSoa,
}

pub struct MockTcpUpstream {
    addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl MockTcpUpstream {
    pub async fn start(script: TcpScript) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let accept_count = Arc::clone(&accepted);

        let (shutdown_tx, mut shutdown_rx) = oneshot::channel();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    result = listener.accept() => {
                        let Ok((stream, _)) = result else { break };
                        accept_count.fetch_add(1, Ordering::SeqCst);
                        tokio::spawn(serve_conn(stream, script));
                    }
                }
            }
        });

        Self {
            addr,
            accepted,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Number of TCP connections the upstream has accepted.
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockTcpUpstream {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

async fn serve_conn(mut stream: TcpStream, script: TcpScript) {
    loop {
        let Ok(bytes) = read_frame(&mut stream).await else {
            return;
        };
        let Ok(query) = Message::from_vec(&bytes) else {
            return;
        };

        match script {
            TcpScript::Answer => {
                if write_frame(&mut stream, &answer_for(&query)).await.is_err() {
                    return;
                }
            }
            TcpScript::CloseAfterFirst => {
                let _ = write_frame(&mut stream, &answer_for(&query)).await;
                return;
            }
            TcpScript::Axfr => {
                for frame in axfr_frames(&query) {
                    if write_frame(&mut stream, &frame).await.is_err() {
                        return;
                    }
                }
            }
            TcpScript::AxfrNoSoa => {
                let mut frame = transfer_frame(&query, vec![a_record(1), a_record(2)]);
                frame.set_response_code(ResponseCode::NoError);
                if write_frame(&mut stream, &frame).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn transfer_frame(query: &Message, answers: Vec<Record>) -> Message {
    let mut frame = Message::new();
    frame.set_id(query.id());
    frame.set_message_type(MessageType::Response);
    frame.set_op_code(OpCode::Query);
    frame.add_queries(query.queries().iter().cloned());
    for record in answers {
        frame.add_answer(record);
    }
    frame
}

/// Leading single-SOA frame, a middle data frame, and the closing
/// frame whose last record is the SOA again.
fn axfr_frames(query: &Message) -> Vec<Message> {
    vec![
        transfer_frame(query, vec![soa_record()]),
        transfer_frame(query, vec![a_record(1), a_record(2)]),
        transfer_frame(query, vec![a_record(3), soa_record()]),
    ]
}

async fn read_frame(stream: &mut TcpStream) -> std::io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}

async fn write_frame(stream: &mut TcpStream, msg: &Message) -> std::io::Result<()> {
    let bytes = encode(msg);
    let len = (bytes.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await
}
