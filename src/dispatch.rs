// The request dispatcher.
//
// The server owns the single bound socket for its whole lifetime. It waits
// (untimed) for a request packet, runs the matching transfer session all the
// way to its terminal outcome over that same socket, and goes back to
// waiting. Traffic that is not a well-formed read or write request is
// discarded without a response. One transfer at a time: a second peer's
// request is not observed until the current session ends.

use crate::retry::RetryPolicy;
use crate::session::{
    AbortReason, Outcome, ReadSession, RequestError, Step, Transfer, WriteSession,
};
use crate::wire::{ChannelError, ErrorCode, Packet, UdpChannel};
use anyhow::{Context, Result};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

enum Op {
    Read,
    Write,
}

pub struct Server {
    channel: UdpChannel,
    root: PathBuf,
    timeout: Duration,
}

impl Server {
    pub fn new(channel: UdpChannel, root: PathBuf, timeout: Duration) -> Server {
        Server {
            channel,
            root,
            timeout,
        }
    }

    /// Accepts and serves requests until the receive channel itself fails.
    pub async fn run(&self) -> Result<()> {
        let addr = self
            .channel
            .local_addr()
            .context("socket has no local address")?;
        log::info!("Serving {:?} on {addr} (timeout {:?})", self.root, self.timeout);

        loop {
            let (packet, peer) = match self.channel.recv().await {
                Ok(received) => received,
                Err(ChannelError::Decode(e, src)) => {
                    log::debug!("Discarding undecodable datagram from {src}: {e}");
                    continue;
                }
                Err(e) => {
                    return Err(e).context("receive channel failed");
                }
            };

            match packet {
                Packet::ReadReq { filename, mode } => {
                    log::info!("RRQ for {filename:?} (mode {mode:?}) from {peer}");
                    self.serve(Op::Read, &filename, &mode, peer).await;
                }
                Packet::WriteReq { filename, mode } => {
                    log::info!("WRQ for {filename:?} (mode {mode:?}) from {peer}");
                    self.serve(Op::Write, &filename, &mode, peer).await;
                }
                other => {
                    log::debug!("Discarding non-request packet from {peer}: {other:?}");
                }
            }
        }
    }

    async fn serve(&self, op: Op, filename: &str, mode: &str, peer: SocketAddr) {
        if !mode.eq_ignore_ascii_case("octet") {
            log::warn!("Ignoring request for {filename:?}: unsupported mode {mode:?}");
            return;
        }

        let open_path = filename.trim_start_matches('/');
        let path = self.root.join(open_path);

        let mut transfer = match op {
            Op::Read => match ReadSession::open(&path).await {
                Ok(session) => Transfer::Read(session),
                Err(e) => return self.reject(e, peer).await,
            },
            Op::Write => match WriteSession::create(&path).await {
                Ok(session) => Transfer::Write(session),
                Err(e) => return self.reject(e, peer).await,
            },
        };

        match self.run_transfer(&mut transfer, peer).await {
            Outcome::Success => {
                if let Err(e) = transfer.finish().await {
                    log::warn!("Transfer of {path:?} with {peer} finished, but finalizing the file failed: {e}");
                } else {
                    log::info!("Transfer of {path:?} with {peer} completed");
                }
            }
            Outcome::Aborted(reason) => {
                log::warn!("Transfer of {path:?} with {peer} aborted: {reason}");
                transfer.abort().await;
            }
        }
    }

    /// Tells the peer why its request was refused. The error packet is a
    /// courtesy; it is neither acknowledged nor retransmitted.
    async fn reject(&self, err: RequestError, peer: SocketAddr) {
        log::warn!("Rejecting request from {peer}: {err}");
        let (code, message) = match &err {
            RequestError::FileNotFound => (ErrorCode::FileNotFound, "File not found".to_string()),
            RequestError::FileAlreadyExists => {
                (ErrorCode::FileAlreadyExists, "File already exists".to_string())
            }
            RequestError::Io(e) => (e.kind().into(), format!("{e}")),
        };
        let _ = self.channel.send(&Packet::Error { code, message }, peer).await;
    }

    /// Drives one session to its terminal outcome: sends whatever the session
    /// decides, waits for the peer within the retry budget, and feeds
    /// responses back into the session. The last packet put on the wire is
    /// kept verbatim so timeout and stale-ack retransmissions are identical
    /// to the original send.
    async fn run_transfer(&self, transfer: &mut Transfer, peer: SocketAddr) -> Outcome {
        let mut policy = RetryPolicy::new(self.timeout);
        let mut last_sent: Option<Packet> = None;

        let mut step = match transfer.begin().await {
            Ok(step) => step,
            Err(e) => return Outcome::Aborted(AbortReason::File(e.to_string())),
        };

        loop {
            match step {
                Step::SendAndAwait(packet) => {
                    if let Err(e) = self.channel.send(&packet, peer).await {
                        return Outcome::Aborted(AbortReason::Transport(e.to_string()));
                    }
                    last_sent = Some(packet);
                    policy.reset();
                }
                Step::ResendAndAwait => {
                    if let Some(packet) = &last_sent {
                        if let Err(e) = self.channel.send(packet, peer).await {
                            return Outcome::Aborted(AbortReason::Transport(e.to_string()));
                        }
                    }
                }
                Step::AwaitAgain => {}
                Step::SendAndFinish(packet, outcome) => {
                    if let Err(e) = self.channel.send(&packet, peer).await {
                        return Outcome::Aborted(AbortReason::Transport(e.to_string()));
                    }
                    return outcome;
                }
                Step::Finish(outcome) => return outcome,
            }

            let response = loop {
                match self.channel.recv_with_timeout(policy.timeout()).await {
                    Ok((packet, src)) if src == peer => break packet,
                    Ok((packet, src)) => {
                        // The session is bound to the peer captured at
                        // request time; a stranger's packet does not count
                        // as a response.
                        log::debug!("Ignoring {packet:?} from unexpected peer {src}");
                    }
                    Err(ChannelError::Timeout(_)) => {
                        if policy.register_timeout().is_err() {
                            return Outcome::Aborted(AbortReason::RetriesExhausted);
                        }
                        if let Some(packet) = &last_sent {
                            log::debug!("Timed out waiting for {peer}, retransmitting");
                            if let Err(e) = self.channel.send(packet, peer).await {
                                return Outcome::Aborted(AbortReason::Transport(e.to_string()));
                            }
                        }
                    }
                    Err(ChannelError::Decode(e, src)) if src == peer => {
                        return Outcome::Aborted(AbortReason::Malformed(e.to_string()));
                    }
                    Err(ChannelError::Decode(e, src)) => {
                        // A stranger's garbage is not the peer's response;
                        // keep waiting, retry budget untouched.
                        log::debug!("Ignoring undecodable datagram from {src}: {e}");
                    }
                    Err(ChannelError::Io(e)) => {
                        return Outcome::Aborted(AbortReason::Transport(e.to_string()));
                    }
                }
            };

            step = match transfer.on_packet(&response).await {
                Ok(step) => step,
                Err(e) => return Outcome::Aborted(AbortReason::File(e.to_string())),
            };
        }
    }
}
