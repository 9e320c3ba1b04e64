//! PPC round trips between a worker-side client and a parent-side channel.
//!
//! The "parent" runs on a thread and drives the real dispatcher with a
//! recording host.

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use forkd::log::{Level, LogRecord};
use forkd::ppc::{self, write_frame, Dispatcher, Opcode, Origin, PpcChannel, PpcHost};
use forkd::types::{BackendId, Error, Result};
use nix::unistd::Pid;

#[derive(Debug, Default)]
struct Recorded {
    spawns: Vec<BackendId>,
    logs: Vec<LogRecord>,
}

/// Accepts spawns up to `ceiling`, records log lines.
struct RecordingHost {
    ceiling: usize,
    seen: Arc<Mutex<Recorded>>,
}

impl PpcHost for RecordingHost {
    fn request_spawn(&mut self, backend: BackendId) -> Result<()> {
        let mut seen = self.seen.lock().unwrap();
        if seen.spawns.len() >= self.ceiling {
            return Err(Error::resource(format!("{} at ceiling", backend)));
        }
        seen.spawns.push(backend);
        Ok(())
    }

    fn append_log(&mut self, _backend: BackendId, record: &LogRecord) -> Result<()> {
        self.seen.lock().unwrap().logs.push(record.clone());
        Ok(())
    }
}

fn origin() -> Origin {
    Origin {
        pid: Pid::from_raw(1000),
        backend: BackendId::new(2),
    }
}

/// Serve commands on `channel` until the worker hangs up or a
/// channel-closing error occurs. Returns how many commands were answered.
fn serve(mut channel: PpcChannel, ceiling: usize, seen: Arc<Mutex<Recorded>>) -> JoinHandle<usize> {
    thread::spawn(move || {
        let dispatcher = Dispatcher::with_builtins();
        let mut host = RecordingHost { ceiling, seen };
        let mut answered = 0;
        while let Ok(Some(frame)) = channel.read_command() {
            let result = dispatcher.dispatch(&mut host, origin(), frame.opcode, &frame.payload);
            if matches!(&result, Err(e) if e.closes_channel()) {
                break;
            }
            channel.respond(&result).unwrap();
            answered += 1;
        }
        answered
    })
}

#[test]
fn nop_round_trip() {
    let (channel, mut client) = ppc::pair().unwrap();
    let parent = serve(channel, 0, Arc::default());

    client.nop().unwrap();
    assert!(client.call(Opcode::Nop, &[]).unwrap().is_empty());

    drop(client);
    assert_eq!(parent.join().unwrap(), 2);
}

#[test]
fn fork_child_is_refused_past_the_ceiling() {
    let seen = Arc::new(Mutex::new(Recorded::default()));
    let (channel, mut client) = ppc::pair().unwrap();
    let parent = serve(channel, 1, seen.clone());

    client.fork_child().unwrap();
    let err = client.fork_child().unwrap_err();
    assert!(matches!(&err, Error::Remote(msg) if msg.contains("at ceiling")));

    drop(client);
    parent.join().unwrap();
    assert_eq!(seen.lock().unwrap().spawns, vec![BackendId::new(2)]);
}

#[test]
fn log_lines_arrive_in_order() {
    let seen = Arc::new(Mutex::new(Recorded::default()));
    let (channel, mut client) = ppc::pair().unwrap();
    let parent = serve(channel, 0, seen.clone());

    for i in 0..50 {
        client
            .log_append(&LogRecord::new(Level::Info, format!("line {}", i)))
            .unwrap();
    }
    drop(client);
    assert_eq!(parent.join().unwrap(), 50);

    let seen = seen.lock().unwrap();
    let lines: Vec<_> = seen.logs.iter().map(|r| r.line.as_str()).collect();
    let expected: Vec<String> = (0..50).map(|i| format!("line {}", i)).collect();
    assert_eq!(lines, expected);
}

#[test]
fn unknown_opcode_closes_the_channel() {
    let (parent_end, mut worker_end) = UnixStream::pair().unwrap();
    let parent = serve(PpcChannel::new(parent_end).unwrap(), 0, Arc::default());

    write_frame(&mut worker_end, 0x42, b"").unwrap();
    // The parent drops its end instead of answering.
    let frame = ppc::read_frame(&mut worker_end, ppc::MAX_PAYLOAD).unwrap();
    assert!(frame.is_none());
    assert_eq!(parent.join().unwrap(), 0);
}

#[test]
fn truncated_frame_closes_the_channel() {
    let (parent_end, mut worker_end) = UnixStream::pair().unwrap();
    let mut channel = PpcChannel::new(parent_end).unwrap();

    worker_end.write_all(&[Opcode::LogAppend.as_u8(), 0, 0, 0, 9, b'{']).unwrap();
    drop(worker_end);

    let err = channel.read_command().unwrap_err();
    assert!(err.closes_channel());
}
