use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    time::timeout,
};

use crate::error::RpcError;

/// Budget for one whole request/reply exchange, dial included. A peer
/// that misses it counts as a non-vote.
pub(crate) const RPC_TIMEOUT: Duration = Duration::from_millis(300);

pub(crate) async fn send_message<M>(conn: &mut TcpStream, message: &M) -> Result<(), RpcError>
where
    M: Serialize,
{
    let content = bincode::serialize(message)?;
    let len = (content.len() as u64).to_be_bytes();

    conn.write_all(&len).await?;
    conn.write_all(&content).await?;
    Ok(())
}

pub(crate) async fn recv_message<M>(conn: &mut TcpStream) -> Result<M, RpcError>
where
    M: DeserializeOwned,
{
    let mut len_buf: [u8; 8] = [0; 8];
    conn.read_exact(&mut len_buf).await?;

    let expected_len = u64::from_be_bytes(len_buf);
    let mut buf = vec![0u8; expected_len as usize];
    conn.read_exact(&mut buf).await?;

    Ok(bincode::deserialize(&buf)?)
}

/// One request/reply exchange with a peer. Returns None when the peer did
/// not answer in time, whether by dial failure, dropped connection,
/// garbled frame or timeout. The caller treats all of those the same way.
pub(crate) async fn call<Req, Rep>(addr: &str, request: &Req) -> Option<Rep>
where
    Req: Serialize,
    Rep: DeserializeOwned,
{
    let exchange = async {
        let mut stream = TcpStream::connect(addr).await.ok()?;
        send_message(&mut stream, request).await.ok()?;
        recv_message(&mut stream).await.ok()
    };
    timeout(RPC_TIMEOUT, exchange).await.ok().flatten()
}
