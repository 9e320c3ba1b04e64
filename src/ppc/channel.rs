//! Both ends of a PPC socket pair.
//!
//! The parent holds a [`PpcChannel`] per worker and reads one command each
//! time the channel is readable. The worker holds a [`PpcClient`] and blocks
//! in [`PpcClient::call`] until the parent answers.

use bytes::Bytes;
use std::io::{self, ErrorKind, Read};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};

use super::codec::{read_frame, write_frame, Frame, MAX_PAYLOAD};
use super::command::Opcode;
use crate::log::LogRecord;
use crate::types::{Error, Result};

/// Bound on how long the parent spends reading one whole frame.
pub const PARENT_READ_TIMEOUT: Duration = Duration::from_secs(1);

/// Create a connected pair: parent end first, worker end second.
pub fn pair() -> Result<(PpcChannel, PpcClient)> {
    let (parent, child) = UnixStream::pair()
        .map_err(|e| Error::resource(format!("socketpair failed: {}", e)))?;
    Ok((PpcChannel::new(parent)?, PpcClient::new(child)))
}

fn channel_error(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::InvalidData => Error::protocol(e.to_string()),
        _ => Error::Io(e),
    }
}

/// Parent end of a worker's channel.
#[derive(Debug)]
pub struct PpcChannel {
    stream: UnixStream,
}

impl PpcChannel {
    pub fn new(stream: UnixStream) -> Result<Self> {
        stream.set_read_timeout(Some(PARENT_READ_TIMEOUT))?;
        Ok(Self { stream })
    }

    /// Read exactly one command. `None` means the worker closed its end.
    ///
    /// The whole frame must arrive within [`PARENT_READ_TIMEOUT`], however
    /// it is split across reads.
    pub fn read_command(&mut self) -> Result<Option<Frame>> {
        let mut reader = Deadline {
            stream: &self.stream,
            deadline: Instant::now() + PARENT_READ_TIMEOUT,
        };
        read_frame(&mut reader, MAX_PAYLOAD).map_err(channel_error)
    }

    /// Answer the outstanding command.
    pub fn respond(&mut self, result: &Result<Bytes>) -> Result<()> {
        match result {
            Ok(payload) => write_frame(&mut self.stream, Opcode::ResponseOk.as_u8(), payload)?,
            Err(e) => {
                let mut message = e.to_string();
                if message.len() > MAX_PAYLOAD {
                    message = crate::log::truncate_line(&message).to_string();
                }
                write_frame(
                    &mut self.stream,
                    Opcode::ResponseError.as_u8(),
                    message.as_bytes(),
                )?
            }
        }
        Ok(())
    }
}

impl AsRawFd for PpcChannel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl AsFd for PpcChannel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.stream.as_fd()
    }
}

/// Reader that gives up once `deadline` has passed.
struct Deadline<'a> {
    stream: &'a UnixStream,
    deadline: Instant,
}

impl Read for Deadline<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let left = self.deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(io::Error::new(ErrorKind::TimedOut, "ppc frame deadline passed"));
        }
        self.stream.set_read_timeout(Some(left))?;
        match (&*self.stream).read(buf) {
            Err(e) if e.kind() == ErrorKind::WouldBlock => {
                Err(io::Error::new(ErrorKind::TimedOut, "ppc frame deadline passed"))
            }
            other => other,
        }
    }
}

/// Worker end of the channel.
#[derive(Debug)]
pub struct PpcClient {
    stream: UnixStream,
}

impl PpcClient {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    /// Send a command and block for its response.
    pub fn call(&mut self, opcode: Opcode, payload: &[u8]) -> Result<Bytes> {
        if opcode.is_response() {
            return Err(Error::protocol(format!("{} is not a command", opcode)));
        }
        write_frame(&mut self.stream, opcode.as_u8(), payload)?;

        let frame = read_frame(&mut self.stream, MAX_PAYLOAD)
            .map_err(channel_error)?
            .ok_or_else(|| Error::protocol("parent closed the channel"))?;

        match Opcode::try_from(frame.opcode) {
            Ok(Opcode::ResponseOk) => Ok(frame.payload),
            Ok(Opcode::ResponseError) => Err(Error::remote(
                String::from_utf8_lossy(&frame.payload).into_owned(),
            )),
            Ok(other) => Err(Error::protocol(format!("expected a response, got {}", other))),
            Err(e) => Err(e),
        }
    }

    pub fn nop(&mut self) -> Result<()> {
        self.call(Opcode::Nop, &[]).map(|_| ())
    }

    /// Ask the parent to spawn a sibling for this worker's backend.
    pub fn fork_child(&mut self) -> Result<()> {
        self.call(Opcode::ForkChild, &[]).map(|_| ())
    }

    pub fn log_append(&mut self, record: &LogRecord) -> Result<()> {
        let payload = serde_json::to_vec(record)?;
        self.call(Opcode::LogAppend, &payload).map(|_| ())
    }
}

impl AsRawFd for PpcClient {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::thread;

    #[test]
    fn error_response_maps_to_remote() {
        let (mut parent, mut client) = pair().unwrap();
        let server = thread::spawn(move || {
            let frame = parent.read_command().unwrap().unwrap();
            assert_eq!(frame.opcode, Opcode::ForkChild.as_u8());
            parent
                .respond(&Err(Error::resource("backend at ceiling")))
                .unwrap();
        });

        let err = client.fork_child().unwrap_err();
        assert!(matches!(&err, Error::Remote(msg) if msg.contains("backend at ceiling")));
        server.join().unwrap();
    }

    #[test]
    fn closed_worker_end_reads_as_none() {
        let (mut parent, client) = pair().unwrap();
        drop(client);
        assert!(parent.read_command().unwrap().is_none());
    }

    #[test]
    fn garbage_length_is_a_protocol_error() {
        let (parent_stream, mut child_stream) = UnixStream::pair().unwrap();
        let mut parent = PpcChannel::new(parent_stream).unwrap();
        child_stream.write_all(&[1, 0xFF, 0xFF, 0xFF, 0xFF]).unwrap();

        let err = parent.read_command().unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
        assert!(err.closes_channel());
    }

    #[test]
    fn trickled_frame_is_cut_off_at_the_frame_deadline() {
        let (parent_stream, mut child_stream) = UnixStream::pair().unwrap();
        let mut parent = PpcChannel::new(parent_stream).unwrap();

        let worker = thread::spawn(move || {
            // Opcode and length arrive at once; the payload drips in slower
            // than the whole-frame budget allows.
            child_stream.write_all(&[Opcode::LogAppend.as_u8(), 0, 0, 0, 7]).unwrap();
            for byte in b"{\"x\":1}" {
                thread::sleep(Duration::from_millis(400));
                if child_stream.write_all(&[*byte]).is_err() {
                    break;
                }
            }
        });

        let started = Instant::now();
        let err = parent.read_command().unwrap_err();
        let took = started.elapsed();

        assert!(err.closes_channel());
        assert!(took < PARENT_READ_TIMEOUT * 2, "frame read took {:?}", took);
        drop(parent);
        worker.join().unwrap();
    }

    #[test]
    fn client_refuses_to_send_responses() {
        let (_parent, mut client) = pair().unwrap();
        assert!(client.call(Opcode::ResponseOk, b"").is_err());
    }
}
