//! Line echo protocol.
//!
//! Each line a client sends is written back unchanged. The connection ends when
//! the client closes its side.

use std::net::SocketAddr;
use std::time::Instant;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::telemetry::metrics;

/// Echoes lines back to the client.
#[derive(Debug, Clone, Default)]
pub struct EchoHandler;

impl moult::ConnectionHandler for EchoHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let started = Instant::now();
        metrics::connections_accepted().add(1, &[]);

        match echo_lines(stream).await {
            Ok(lines) => debug!(peer = %peer, lines, "Client disconnected"),
            Err(e) => warn!(peer = %peer, error = %e, "Echo connection failed"),
        }

        metrics::connection_duration().record(started.elapsed().as_secs_f64() * 1000.0, &[]);
    }
}

async fn echo_lines(stream: TcpStream) -> std::io::Result<u64> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut echoed = 0;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        writer.write_all(&line).await?;
        echoed += 1;
        metrics::lines_echoed().add(1, &[]);
    }

    writer.shutdown().await?;
    Ok(echoed)
}
