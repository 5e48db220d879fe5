use log::info;
use socket2::{SockRef, TcpKeepalive};
use std::{io, pin::Pin, time::Duration};
use tokio::net::TcpStream;
use tokio_io_timeout::TimeoutStream;

pub const IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(60);

pub type OriginStream = Pin<Box<TimeoutStream<TcpStream>>>;

/// Connects straight to the destination.
///
/// The socket has Nagle disabled, keepalive probes every 60s and a 5s idle
/// timeout on both directions. Shutting down the write half leaves the read
/// half open, so the peer may keep sending after we finish.
pub async fn connect_origin(host: &str, port: u16) -> io::Result<OriginStream> {
    info!("Connecting to target {}:{}", host, port);
    let stream = TcpStream::connect((host, port)).await?;
    tune(&stream)?;

    let mut stream = TimeoutStream::new(stream);
    stream.set_read_timeout(Some(IDLE_TIMEOUT));
    stream.set_write_timeout(Some(IDLE_TIMEOUT));
    Ok(Box::pin(stream))
}

fn tune(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)?;
    let keepalive = TcpKeepalive::new().with_time(KEEPALIVE_INTERVAL);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}
