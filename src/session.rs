// Per-request transfer state machines.
//
// A session is created by the dispatcher for exactly one request and driven
// to a terminal outcome. Each transition consumes one packet (or the initial
// kick-off) and tells the driver what to put on the wire next; the driver
// owns the socket, the retry policy, and the last packet sent, so timeout
// retransmission never re-enters the session itself.

use crate::retry::MAX_RETRIES;
use crate::wire::{ErrorCode, Packet, BLOCK_SIZE};
use std::error;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Why a request could not be turned into a running session. Reported to the
/// peer as a single ERROR packet, never retried.
#[derive(Debug)]
pub enum RequestError {
    FileNotFound,
    FileAlreadyExists,
    Io(io::Error),
}

impl error::Error for RequestError {}

impl fmt::Display for RequestError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RequestError::FileNotFound => write!(f, "File not found"),
            RequestError::FileAlreadyExists => write!(f, "File already exists"),
            RequestError::Io(e) => write!(f, "file access failed: {e}"),
        }
    }
}

/// Why a running session ended without completing the transfer.
#[derive(Debug, PartialEq)]
pub enum AbortReason {
    /// The peer sent a packet kind the session was not waiting for.
    UnexpectedPacket(&'static str),
    /// A block number from the future; ordering is unrecoverable.
    FutureBlock { expected: u16, got: u16 },
    /// The peer reported an error of its own.
    PeerError { code: ErrorCode, message: String },
    RetriesExhausted,
    /// The response could not be decoded.
    Malformed(String),
    /// A send or non-timeout receive failure on the channel.
    Transport(String),
    /// A local read/write failure on the transferred file.
    File(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            AbortReason::UnexpectedPacket(kind) => write!(f, "unexpected {kind} packet"),
            AbortReason::FutureBlock { expected, got } => {
                write!(f, "peer skipped ahead: expected block {expected}, got {got}")
            }
            AbortReason::PeerError { code, message } => {
                write!(f, "peer sent error {code:?}: '{message}'")
            }
            AbortReason::RetriesExhausted => {
                write!(f, "no response after {MAX_RETRIES} retransmissions")
            }
            AbortReason::Malformed(msg) => write!(f, "undecodable response: {msg}"),
            AbortReason::Transport(msg) => write!(f, "transport failure: {msg}"),
            AbortReason::File(msg) => write!(f, "file IO failure: {msg}"),
        }
    }
}

/// Terminal state of a session.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    Success,
    Aborted(AbortReason),
}

/// What the driver should do next, as decided by a session transition.
#[derive(Debug, PartialEq)]
pub enum Step {
    /// Send this packet and wait for the peer's response. Starts a new block
    /// exchange, so the retry budget resets.
    SendAndAwait(Packet),

    /// Retransmit the last packet sent, unchanged, and re-enter the wait.
    /// Taken on a stale acknowledgment; does not consume a retry.
    ResendAndAwait,

    /// Send nothing and keep waiting. Taken when a duplicate DATA block is
    /// discarded; does not consume a retry.
    AwaitAgain,

    /// Send this final packet; the session then terminates.
    SendAndFinish(Packet, Outcome),

    /// The session terminates without sending anything further.
    Finish(Outcome),
}

fn packet_kind(packet: &Packet) -> &'static str {
    match packet {
        Packet::ReadReq { .. } => "RRQ",
        Packet::WriteReq { .. } => "WRQ",
        Packet::Data { .. } => "DATA",
        Packet::Ack { .. } => "ACK",
        Packet::Error { .. } => "ERROR",
    }
}

/// One running transfer, either direction.
#[derive(Debug)]
pub enum Transfer {
    Read(ReadSession),
    Write(WriteSession),
}

impl Transfer {
    /// Produces the session's opening packet (DATA 1 for reads, ACK 0 for
    /// writes).
    pub async fn begin(&mut self) -> io::Result<Step> {
        match self {
            Transfer::Read(s) => s.next_data().await,
            Transfer::Write(s) => Ok(s.begin()),
        }
    }

    pub async fn on_packet(&mut self, packet: &Packet) -> io::Result<Step> {
        match self {
            Transfer::Read(s) => s.on_packet(packet).await,
            Transfer::Write(s) => s.on_packet(packet).await,
        }
    }

    /// Finalizes a successful transfer.
    pub async fn finish(self) -> io::Result<()> {
        match self {
            Transfer::Read(_) => Ok(()),
            Transfer::Write(s) => s.finish().await,
        }
    }

    /// Tears down an aborted transfer. A failed upload must not leave a
    /// partial file behind; an aborted download leaves the source untouched.
    pub async fn abort(self) {
        match self {
            Transfer::Read(_) => {}
            Transfer::Write(s) => s.abort().await,
        }
    }
}

/// Serves a file to the peer: send DATA n, await ACK n, advance.
#[derive(Debug)]
pub struct ReadSession {
    file: File,
    block: u16,
    last_block: bool,
}

impl ReadSession {
    pub async fn open(path: &Path) -> Result<ReadSession, RequestError> {
        match File::open(path).await {
            Ok(file) => Ok(ReadSession {
                file,
                block: 0,
                last_block: false,
            }),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(RequestError::FileNotFound),
            Err(e) => Err(RequestError::Io(e)),
        }
    }

    /// Reads the next chunk and advances to its block number. A short chunk
    /// (possibly empty, for files sized an exact multiple of the block size)
    /// is the final one.
    async fn next_data(&mut self) -> io::Result<Step> {
        let data = read_chunk(&mut self.file).await?;
        self.block = self.block.wrapping_add(1);
        self.last_block = data.len() < BLOCK_SIZE;
        Ok(Step::SendAndAwait(Packet::Data {
            block: self.block,
            data,
        }))
    }

    async fn on_packet(&mut self, packet: &Packet) -> io::Result<Step> {
        match packet {
            &Packet::Ack { block } => {
                if block == self.block {
                    if self.last_block {
                        Ok(Step::Finish(Outcome::Success))
                    } else {
                        self.next_data().await
                    }
                } else if block < self.block {
                    // An ack for a block we already advanced past; the peer
                    // is behind, so put the current DATA on the wire again.
                    Ok(Step::ResendAndAwait)
                } else {
                    Ok(Step::Finish(Outcome::Aborted(AbortReason::FutureBlock {
                        expected: self.block,
                        got: block,
                    })))
                }
            }
            Packet::Error { code, message } => {
                Ok(Step::Finish(Outcome::Aborted(AbortReason::PeerError {
                    code: *code,
                    message: message.clone(),
                })))
            }
            other => Ok(Step::Finish(Outcome::Aborted(
                AbortReason::UnexpectedPacket(packet_kind(other)),
            ))),
        }
    }
}

/// Accepts a file from the peer: ack block 0, await DATA n, write, ack n.
#[derive(Debug)]
pub struct WriteSession {
    file: File,
    path: PathBuf,
    expected: u16,
}

impl WriteSession {
    pub async fn create(path: &Path) -> Result<WriteSession, RequestError> {
        match File::create_new(path).await {
            Ok(file) => Ok(WriteSession {
                file,
                path: path.to_path_buf(),
                expected: 1,
            }),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                Err(RequestError::FileAlreadyExists)
            }
            Err(e) => Err(RequestError::Io(e)),
        }
    }

    fn begin(&self) -> Step {
        Step::SendAndAwait(Packet::Ack { block: 0 })
    }

    async fn on_packet(&mut self, packet: &Packet) -> io::Result<Step> {
        match packet {
            Packet::Data { block, data } => {
                if *block == self.expected {
                    self.file.write_all(data).await?;
                    let ack = Packet::Ack {
                        block: self.expected,
                    };
                    self.expected = self.expected.wrapping_add(1);
                    if data.len() < BLOCK_SIZE {
                        // Short payload marks end-of-file.
                        Ok(Step::SendAndFinish(ack, Outcome::Success))
                    } else {
                        Ok(Step::SendAndAwait(ack))
                    }
                } else if *block < self.expected {
                    // Stale retransmission from the peer; its ack is already
                    // on the wire, so just keep waiting.
                    Ok(Step::AwaitAgain)
                } else {
                    Ok(Step::Finish(Outcome::Aborted(AbortReason::FutureBlock {
                        expected: self.expected,
                        got: *block,
                    })))
                }
            }
            Packet::Error { code, message } => {
                Ok(Step::Finish(Outcome::Aborted(AbortReason::PeerError {
                    code: *code,
                    message: message.clone(),
                })))
            }
            other => Ok(Step::Finish(Outcome::Aborted(
                AbortReason::UnexpectedPacket(packet_kind(other)),
            ))),
        }
    }

    async fn finish(mut self) -> io::Result<()> {
        self.file.flush().await
    }

    async fn abort(self) {
        drop(self.file);
        if let Err(e) = fs::remove_file(&self.path).await {
            log::warn!("Couldn't remove partial upload {:?}: {e}", self.path);
        }
    }
}

/// Reads up to one block from the file. Loops because a single read call may
/// return fewer bytes than the buffer holds without being at end-of-file.
async fn read_chunk(f: &mut File) -> io::Result<Vec<u8>> {
    let mut buf = vec![0_u8; BLOCK_SIZE];
    let mut filled = 0;

    loop {
        let n = f.read(&mut buf[filled..]).await?;
        if n == 0 {
            buf.truncate(filled);
            return Ok(buf);
        }
        filled += n;
        if filled == buf.len() {
            return Ok(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempdir::TempDir;
    use tokio_test::assert_ok;

    async fn file_with_contents(dir: &TempDir, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = File::create(&path).await.unwrap();
        file.write_all(contents).await.unwrap();
        file.flush().await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_read_open_missing_file() {
        let err = ReadSession::open(Path::new("/some/invalid/file.txt"))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RequestError::FileNotFound));
    }

    #[tokio::test]
    async fn test_read_single_short_block() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.txt", b"testing").await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        assert_eq!(
            assert_ok!(session.begin().await),
            Step::SendAndAwait(Packet::Data {
                block: 1,
                data: b"testing".to_vec()
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::Finish(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn test_read_multiple_blocks() {
        let dir = TempDir::new("scratch").unwrap();
        let mut contents = vec![0x78; 1024];
        contents.extend_from_slice(b"testing");
        let path = file_with_contents(&dir, "test.txt", &contents).await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        assert_eq!(
            assert_ok!(session.begin().await),
            Step::SendAndAwait(Packet::Data {
                block: 1,
                data: vec![0x78; 512]
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::SendAndAwait(Packet::Data {
                block: 2,
                data: vec![0x78; 512]
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 2 }).await),
            Step::SendAndAwait(Packet::Data {
                block: 3,
                data: b"testing".to_vec()
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 3 }).await),
            Step::Finish(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn test_read_exact_multiple_sends_trailing_empty_block() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.bin", &[0x41; 512]).await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        assert_eq!(
            assert_ok!(session.begin().await),
            Step::SendAndAwait(Packet::Data {
                block: 1,
                data: vec![0x41; 512]
            })
        );
        // The peer can only detect end-of-file from a short block, so a
        // zero-payload DATA 2 must follow.
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::SendAndAwait(Packet::Data {
                block: 2,
                data: vec![]
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 2 }).await),
            Step::Finish(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn test_read_empty_file() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "empty.txt", b"").await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        assert_eq!(
            assert_ok!(session.begin().await),
            Step::SendAndAwait(Packet::Data {
                block: 1,
                data: vec![]
            })
        );
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::Finish(Outcome::Success)
        );
    }

    #[tokio::test]
    async fn test_read_stale_ack_resends_current_block() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.bin", &vec![0x42; 1200]).await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        let second = assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await);
        assert!(matches!(second, Step::SendAndAwait(Packet::Data { block: 2, .. })));

        // A duplicate of the already-consumed ack must neither advance nor
        // abort: the current block goes out again.
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::ResendAndAwait
        );
        // Progress is still possible afterwards.
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 2 }).await),
            Step::SendAndAwait(Packet::Data {
                block: 3,
                data: vec![0x42; 1200 - 1024]
            })
        );
    }

    #[tokio::test]
    async fn test_read_future_ack_aborts() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.txt", b"testing").await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 2 }).await),
            Step::Finish(Outcome::Aborted(AbortReason::FutureBlock {
                expected: 1,
                got: 2
            }))
        );
    }

    #[tokio::test]
    async fn test_read_non_ack_aborts() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.txt", b"testing").await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 1,
                        data: vec![0x01]
                    })
                    .await
            ),
            Step::Finish(Outcome::Aborted(AbortReason::UnexpectedPacket("DATA")))
        );
    }

    #[tokio::test]
    async fn test_read_peer_error_aborts() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "test.txt", b"testing").await;

        let mut session = Transfer::Read(ReadSession::open(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Error {
                        code: ErrorCode::DiskFull,
                        message: "whoops".to_string()
                    })
                    .await
            ),
            Step::Finish(Outcome::Aborted(AbortReason::PeerError {
                code: ErrorCode::DiskFull,
                message: "whoops".to_string()
            }))
        );
    }

    #[tokio::test]
    async fn test_write_create_existing_file() {
        let dir = TempDir::new("scratch").unwrap();
        let path = file_with_contents(&dir, "taken.txt", b"already here").await;

        let err = WriteSession::create(&path).await.err().unwrap();
        assert!(matches!(err, RequestError::FileAlreadyExists));
        // The original file must survive the rejected request.
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"already here");
    }

    #[tokio::test]
    async fn test_write_then_read_back_round_trip() {
        let dir = TempDir::new("scratch").unwrap();
        let path = dir.path().join("upload.bin");
        let mut payload = vec![0x78; 512];
        payload.extend_from_slice(b"testing");

        let mut session = Transfer::Write(WriteSession::create(&path).await.unwrap());
        assert_eq!(
            assert_ok!(session.begin().await),
            Step::SendAndAwait(Packet::Ack { block: 0 })
        );
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 1,
                        data: payload[..512].to_vec()
                    })
                    .await
            ),
            Step::SendAndAwait(Packet::Ack { block: 1 })
        );
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 2,
                        data: payload[512..].to_vec()
                    })
                    .await
            ),
            Step::SendAndFinish(Packet::Ack { block: 2 }, Outcome::Success)
        );
        assert_ok!(session.finish().await);

        // Reading the file back yields byte-identical content.
        let mut read_back = Transfer::Read(ReadSession::open(&path).await.unwrap());
        assert_eq!(
            assert_ok!(read_back.begin().await),
            Step::SendAndAwait(Packet::Data {
                block: 1,
                data: payload[..512].to_vec()
            })
        );
        assert_eq!(
            assert_ok!(read_back.on_packet(&Packet::Ack { block: 1 }).await),
            Step::SendAndAwait(Packet::Data {
                block: 2,
                data: payload[512..].to_vec()
            })
        );
    }

    #[tokio::test]
    async fn test_write_zero_length_upload() {
        let dir = TempDir::new("scratch").unwrap();
        let path = dir.path().join("empty.bin");

        let mut session = Transfer::Write(WriteSession::create(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 1,
                        data: vec![]
                    })
                    .await
            ),
            Step::SendAndFinish(Packet::Ack { block: 1 }, Outcome::Success)
        );
        assert_ok!(session.finish().await);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn test_write_duplicate_block_discarded_silently() {
        let dir = TempDir::new("scratch").unwrap();
        let path = dir.path().join("upload.bin");

        let mut session = Transfer::Write(WriteSession::create(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        let _ = assert_ok!(
            session
                .on_packet(&Packet::Data {
                    block: 1,
                    data: vec![0x11; 512]
                })
                .await
        );

        // A retransmitted DATA 1 is dropped without re-acking.
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 1,
                        data: vec![0x11; 512]
                    })
                    .await
            ),
            Step::AwaitAgain
        );

        // And the duplicate was not written twice.
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 2,
                        data: vec![0x22]
                    })
                    .await
            ),
            Step::SendAndFinish(Packet::Ack { block: 2 }, Outcome::Success)
        );
        assert_ok!(session.finish().await);

        let mut expected = vec![0x11; 512];
        expected.push(0x22);
        assert_eq!(tokio::fs::read(&path).await.unwrap(), expected);
    }

    #[tokio::test]
    async fn test_write_future_block_aborts_and_deletes() {
        let dir = TempDir::new("scratch").unwrap();
        let path = dir.path().join("upload.bin");

        let mut session = Transfer::Write(WriteSession::create(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        let _ = assert_ok!(
            session
                .on_packet(&Packet::Data {
                    block: 1,
                    data: vec![0x11; 512]
                })
                .await
        );
        assert_eq!(
            assert_ok!(
                session
                    .on_packet(&Packet::Data {
                        block: 3,
                        data: vec![0x33]
                    })
                    .await
            ),
            Step::Finish(Outcome::Aborted(AbortReason::FutureBlock {
                expected: 2,
                got: 3
            }))
        );

        session.abort().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_write_non_data_aborts_and_deletes() {
        let dir = TempDir::new("scratch").unwrap();
        let path = dir.path().join("upload.bin");

        let mut session = Transfer::Write(WriteSession::create(&path).await.unwrap());
        let _ = assert_ok!(session.begin().await);
        assert_eq!(
            assert_ok!(session.on_packet(&Packet::Ack { block: 1 }).await),
            Step::Finish(Outcome::Aborted(AbortReason::UnexpectedPacket("ACK")))
        );

        session.abort().await;
        assert!(!path.exists());
    }
}
