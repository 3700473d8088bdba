// A small TFTP-style file server (stop-and-wait ARQ over UDP).
//
// A transfer begins with a request to read or write a file. The file moves
// in blocks of 512 bytes; each DATA packet carries one block and must be
// acked before the next one goes out. On loss, the waiting side times out
// and retransmits its last packet, up to a fixed retry limit. A DATA packet
// shorter than 512 bytes of payload marks the end of the transfer.
//
// Packets (all wire fields big-endian):
//
// opcode   operation               payload
// 1        Read request (RRQ)      filename\0 mode\0
// 2        Write request (WRQ)     filename\0 mode\0
// 3        Data (DATA)             block:u16, 0..512 bytes
// 4        ACK                     block:u16
// 5        ERROR                   code:u16, message\0
//
// Errors this server reports: 1 = file not found (RRQ), 6 = file already
// exists (WRQ). Error packets are a courtesy, never acked or retransmitted.
//
// This server deliberately runs every transfer over its single bound socket,
// one session at a time; there are no per-transfer ephemeral ports, so a
// second peer's request waits until the current transfer finishes.

mod dispatch;
mod retry;
mod session;
mod wire;

use anyhow::{bail, Context, Result};
use dispatch::Server;
use std::env;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;
use wire::UdpChannel;

const USAGE: &str = "usage: tftpd-lite <port> <timeout-seconds> [serve-dir]";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let port: u16 = args
        .next()
        .context(USAGE)?
        .parse()
        .context("invalid port")?;
    let timeout_secs: f64 = args
        .next()
        .context(USAGE)?
        .parse()
        .context("invalid timeout, expected seconds (e.g. 0.5)")?;
    if !timeout_secs.is_finite() || timeout_secs <= 0.0 {
        bail!("timeout must be a positive number of seconds");
    }
    let root = args.next().map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));

    let channel = UdpChannel::bind((Ipv4Addr::UNSPECIFIED, port).into())
        .with_context(|| format!("couldn't bind UDP port {port}"))?;

    let server = Server::new(channel, root, Duration::from_secs_f64(timeout_secs));
    server.run().await
}
