//! Deadline-bounded byte I/O shared by the handshake clients

use std::io::{self, Read, Write};
use std::thread;
use std::time::{Duration, Instant};

/// Back-off between retries when a non-blocking transport is not ready
const POLL_INTERVAL: Duration = Duration::from_millis(2);

fn not_ready(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Write the whole buffer, retrying partial writes until `deadline`
pub fn send_all<S: Write + ?Sized>(stream: &mut S, mut buf: &[u8], deadline: Instant) -> io::Result<()> {
    while !buf.is_empty() {
        match stream.write(buf) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => buf = &buf[n..],
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if not_ready(&e) => {
                if Instant::now() >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
    stream.flush()
}

/// Fill `buf` completely or fail with `TimedOut` / `UnexpectedEof`
pub fn recv_exact<S: Read + ?Sized>(stream: &mut S, buf: &mut [u8], deadline: Instant) -> io::Result<()> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) if not_ready(&e) => {
                if Instant::now() >= deadline {
                    return Err(io::ErrorKind::TimedOut.into());
                }
                thread::sleep(POLL_INTERVAL);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::VecDeque;
    use std::io::{self, Read, Write};

    /// In-memory stream: reads come from a scripted reply, writes are captured
    #[derive(Debug, Default)]
    pub struct ScriptedStream {
        pub reply: VecDeque<u8>,
        pub written: Vec<u8>,
        /// Cap on bytes accepted per `write` call, to exercise partial writes
        pub write_chunk: Option<usize>,
    }

    impl ScriptedStream {
        pub fn new(reply: &[u8]) -> Self {
            Self {
                reply: reply.iter().copied().collect(),
                written: Vec::new(),
                write_chunk: None,
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.reply.len());
            for slot in buf.iter_mut().take(n) {
                *slot = self.reply.pop_front().unwrap_or_default();
            }
            Ok(n)
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let n = self.write_chunk.map_or(buf.len(), |c| c.min(buf.len()));
            self.written.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
