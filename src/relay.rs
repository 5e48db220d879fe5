use futures::future::try_select;
use log::debug;
use std::io;
use tokio::{
    io::{copy, split, AsyncRead, AsyncWrite, AsyncWriteExt},
    pin, select,
};

/// Connect two streams. Unlike `copy_bidirectional`, it closes the other side once one side is done.
pub async fn connect_tcp(
    t1: impl AsyncRead + AsyncWrite,
    t2: impl AsyncRead + AsyncWrite,
) -> io::Result<()> {
    let (mut read_1, mut write_1) = split(t1);
    let (mut read_2, mut write_2) = split(t2);

    let fut1 = async {
        let r = copy(&mut read_1, &mut write_2).await;
        write_2.shutdown().await?;
        r
    };
    let fut2 = async {
        let r = copy(&mut read_2, &mut write_1).await;
        write_1.shutdown().await?;
        r
    };

    pin!(fut1, fut2);

    match try_select(fut1, fut2).await {
        Ok(_) => {}
        Err(e) => return Err(e.factor_first().0),
    };

    Ok(())
}

/// Pipe a local reader/writer pair (stdin and stdout, say) through a tunnel.
///
/// Local EOF only half-closes the tunnel, the answer is still read to the end.
/// Returns the number of bytes received from the tunnel.
pub async fn pipe<R, W, T>(mut local_read: R, mut local_write: W, tunnel: T) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    T: AsyncRead + AsyncWrite,
{
    let (mut tunnel_read, mut tunnel_write) = split(tunnel);

    let upload = async {
        let n = copy(&mut local_read, &mut tunnel_write).await?;
        tunnel_write.shutdown().await?;
        Ok::<_, io::Error>(n)
    };
    let download = async {
        let n = copy(&mut tunnel_read, &mut local_write).await?;
        local_write.flush().await?;
        Ok::<_, io::Error>(n)
    };

    pin!(upload, download);

    select! {
        sent = &mut upload => {
            let sent = sent?;
            debug!("local side closed after {} bytes", sent);
            download.await
        }
        received = &mut download => received,
    }
}
