use std::{io, net::{Ipv4Addr, SocketAddr}, time::Duration};
use bytes::{Buf, BufMut, BytesMut};
use tokio::{net::UdpSocket, time};
use url::Url;
use super::{AnnounceParams, AnnounceResponse, Event, Result, Tracker, TrackerError};

// Reference: https://www.bittorrent.org/beps/bep_0015.html

const PROTOCOL_ID: i64      = 0x41727101980;
const ACTION_CONNECT: i32   = 0;
const ACTION_ANNOUNCE: i32  = 1;
const ACTION_ERROR: i32     = 3;

const CONNECT_RESPONSE_LEN: usize = 16;
const ANNOUNCE_HEADER_LEN: usize = 20;

// The datagram operations the tracker exchange needs, so it can run
// against something other than a real socket.
#[async_trait::async_trait]
pub trait DatagramSocket: Send + Sync {

    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize>;

}

#[async_trait::async_trait]
impl DatagramSocket for UdpSocket {

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        UdpSocket::send(self, buf).await
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        UdpSocket::recv(self, buf).await
    }
}

pub struct UdpTracker {

    url: Url,

    // Applies to each response we wait on.
    timeout: Duration,

}

impl UdpTracker {

    pub fn new(url: Url, timeout: Duration) -> Self {
        Self { url, timeout }
    }

    async fn connect_socket(&self) -> Result<UdpSocket> {
        let host = self.url.host_str().ok_or(TrackerError::InvalidUrl)?;
        let port = self.url.port().ok_or(TrackerError::InvalidUrl)?;
        let addr = time::timeout(self.timeout, tokio::net::lookup_host((host, port)))
            .await??
            .min_by_key(|addr| !addr.is_ipv4())
            .ok_or(TrackerError::InvalidUrl)?;

        // Uses first available local port.
        let local: SocketAddr = if addr.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).await?;
        socket.connect(addr).await?;
        Ok(socket)
    }
}

#[async_trait::async_trait]
impl Tracker for UdpTracker {

    async fn announce(&mut self, params: &AnnounceParams) -> Result<AnnounceResponse> {
        let socket = self.connect_socket().await?;
        let response = exchange(&socket, params, self.timeout).await?;
        tracing::debug!("provided {} peers", response.peers.len());
        Ok(response)
    }

    fn url(&self) -> &Url { &self.url }
}

// Connect then announce, two round trips over `socket`.
pub async fn exchange<S>(socket: &S, params: &AnnounceParams, timeout: Duration) -> Result<AnnounceResponse>
where
    S: DatagramSocket + ?Sized,
{
    let mut buf = vec![0u8; 4096];

    let trans_id = rand::random();
    socket.send(&connect_request(trans_id)).await?;
    let n = time::timeout(timeout, socket.recv(&mut buf)).await??;
    let conn_id = parse_connect_response(&buf[..n], trans_id)?;
    tracing::trace!("connected to tracker");

    let trans_id = rand::random();
    socket.send(&announce_request(conn_id, trans_id, params, rand::random())).await?;
    let n = time::timeout(timeout, socket.recv(&mut buf)).await??;
    parse_announce_response(&buf[..n], trans_id)
}

// connect: <protocol_id><action=0><transaction_id>
pub fn connect_request(trans_id: i32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_i64(PROTOCOL_ID);
    buf.put_i32(ACTION_CONNECT);
    buf.put_i32(trans_id);
    buf
}

// announce: <connection_id><action=1><transaction_id><info_hash><peer_id><downloaded>
// <left><uploaded><event><ip><key><num_want><port>
pub fn announce_request(conn_id: i64, trans_id: i32, params: &AnnounceParams, key: i32) -> BytesMut {
    let mut buf = BytesMut::with_capacity(98);
    buf.put_i64(conn_id);
    buf.put_i32(ACTION_ANNOUNCE);
    buf.put_i32(trans_id);
    buf.put(&params.info_hash[..]);
    buf.put(&params.client_id[..]);
    buf.put_u64(params.downloaded);
    buf.put_u64(params.left);
    buf.put_u64(params.uploaded);
    buf.put_i32(Event::code(params.event));
    buf.put_i32(0); // IP address, default = 0.
    buf.put_i32(key);
    buf.put_i32(params.num_want.map_or(-1, |n| n as i32));
    buf.put_u16(params.port);
    buf
}

// Checks the action and transaction id common to every response,
// returns the rest of the packet.
fn check_header(mut resp: &[u8], expected_action: i32, trans_id: i32) -> Result<&[u8]> {
    if resp.len() < 8 {
        return Err(TrackerError::InvalidResponse(format!("{} byte response", resp.len())));
    }
    let action = resp.get_i32();
    let actual = resp.get_i32();
    if actual != trans_id {
        return Err(TrackerError::TransactionMismatch { expected: trans_id, actual });
    }
    if action == ACTION_ERROR {
        return Err(TrackerError::Failure(String::from_utf8_lossy(resp).into_owned()));
    }
    if action != expected_action {
        return Err(TrackerError::InvalidResponse(format!("expected action {}, got {}", expected_action, action)));
    }
    Ok(resp)
}

pub fn parse_connect_response(resp: &[u8], trans_id: i32) -> Result<i64> {
    let mut rest = check_header(resp, ACTION_CONNECT, trans_id)?;
    if resp.len() < CONNECT_RESPONSE_LEN {
        return Err(TrackerError::InvalidResponse("connect response too short".into()));
    }
    Ok(rest.get_i64())
}

pub fn parse_announce_response(resp: &[u8], trans_id: i32) -> Result<AnnounceResponse> {
    let mut rest = check_header(resp, ACTION_ANNOUNCE, trans_id)?;
    if resp.len() < ANNOUNCE_HEADER_LEN {
        return Err(TrackerError::InvalidResponse("announce response too short".into()));
    }
    let interval = rest.get_i32().max(0) as u64;
    let leechers = rest.get_i32().max(0) as u32;
    let seeders = rest.get_i32().max(0) as u32;

    // A trailing partial entry is ignored.
    let peers = rest
        .chunks_exact(6)
        .map(|mut chunk| {
            let ip = chunk.get_u32();
            let port = chunk.get_u16();
            SocketAddr::new(Ipv4Addr::from(ip).into(), port)
        })
        .collect();

    Ok(AnnounceResponse::new(Duration::from_secs(interval), seeders, leechers, peers))
}
