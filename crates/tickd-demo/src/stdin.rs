//! Line commands read from stdin through the reactor.
//!
//! `quit` (or `exit`) requests termination, `status` logs the clock.
//! End of input unregisters the source; the daemon keeps running.

use std::io::{self, Read};
use std::os::fd::{AsFd, AsRawFd};
use std::rc::Rc;
use std::sync::Arc;

use tickd::{CoreError, Disposition, EventSource, Lifecycle, Payload};

/// Partial lines longer than this are dropped.
const MAX_LINE: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
pub enum Command<'a> {
    Quit,
    Status,
    Empty,
    Unknown(&'a str),
}

impl<'a> Command<'a> {
    pub fn parse(line: &'a str) -> Self {
        match line.trim() {
            "" => Command::Empty,
            "quit" | "exit" => Command::Quit,
            "status" => Command::Status,
            other => Command::Unknown(other),
        }
    }
}

struct Batch {
    lines: Vec<String>,
    closed: bool,
}

/// Splits a non-blocking byte stream into lines.
pub struct CommandReader<R> {
    input: R,
    pending: Vec<u8>,
}

impl CommandReader<std::fs::File> {
    /// Reader over a duplicate of the process stdin, so stdin itself is
    /// left open when the source goes away.
    pub fn stdin() -> io::Result<Self> {
        let fd = io::stdin().as_fd().try_clone_to_owned()?;
        Ok(Self::new(std::fs::File::from(fd)))
    }
}

impl<R: Read + AsRawFd + 'static> CommandReader<R> {
    pub fn new(input: R) -> Self {
        Self {
            input,
            pending: Vec::new(),
        }
    }

    /// Wrap the reader in a reactor source that applies commands to
    /// `lifecycle`.
    pub fn into_source(self, lifecycle: Arc<Lifecycle>) -> Rc<EventSource> {
        let fd = self.input.as_raw_fd();
        EventSource::new(
            fd,
            move |payload| {
                let reader = payload
                    .downcast_mut::<Self>()
                    .ok_or(CoreError::ArgumentInvalid("command source lost its reader"))?;
                match reader.read_batch() {
                    Ok(batch) => {
                        for line in &batch.lines {
                            apply(Command::parse(line), &lifecycle);
                        }
                        if batch.closed {
                            tracing::info!("command input closed");
                            return Ok(Disposition::Remove);
                        }
                        Ok(Disposition::Keep)
                    }
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                        ) =>
                    {
                        Ok(Disposition::Keep)
                    }
                    Err(e) => {
                        tracing::warn!("command input failed: {e}");
                        Ok(Disposition::Remove)
                    }
                }
            },
            |_| {
                tracing::info!("command input hung up");
                Ok(Disposition::Remove)
            },
            Payload::opaque(self),
        )
    }

    fn read_batch(&mut self) -> io::Result<Batch> {
        let mut buf = [0u8; 1024];
        let n = self.input.read(&mut buf)?;
        let closed = n == 0;
        self.pending.extend_from_slice(buf.get(..n).unwrap_or_default());

        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line).trim_end().to_owned());
        }
        if closed && !self.pending.is_empty() {
            lines.push(String::from_utf8_lossy(&self.pending).trim_end().to_owned());
            self.pending.clear();
        }
        if self.pending.len() > MAX_LINE {
            tracing::warn!(bytes = self.pending.len(), "dropping oversized command line");
            self.pending.clear();
        }
        Ok(Batch { lines, closed })
    }
}

fn apply(command: Command<'_>, lifecycle: &Lifecycle) {
    match command {
        Command::Quit => {
            tracing::info!("quit requested");
            lifecycle.terminate();
        }
        Command::Status => tracing::info!(
            app_time = lifecycle.app_time(),
            delta_time = lifecycle.delta_time(),
            "status"
        ),
        Command::Empty => {}
        Command::Unknown(other) => tracing::warn!(command = other, "unknown command"),
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    use tickd::{Reactor, SystemClock};

    use super::*;

    fn pair() -> (UnixStream, UnixStream) {
        let (writer, reader) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        (writer, reader)
    }

    #[test]
    fn parses_commands() {
        assert_eq!(Command::parse("quit"), Command::Quit);
        assert_eq!(Command::parse("  exit \r"), Command::Quit);
        assert_eq!(Command::parse("status"), Command::Status);
        assert_eq!(Command::parse("   "), Command::Empty);
        assert_eq!(Command::parse("reload now"), Command::Unknown("reload now"));
    }

    #[test]
    fn splits_partial_lines() {
        let (mut writer, reader) = pair();
        let mut commands = CommandReader::new(reader);

        writer.write_all(b"status\nqu").unwrap();
        let batch = commands.read_batch().unwrap();
        assert_eq!(batch.lines, vec!["status"]);
        assert!(!batch.closed);

        writer.write_all(b"it\n").unwrap();
        let batch = commands.read_batch().unwrap();
        assert_eq!(batch.lines, vec!["quit"]);
    }

    #[test]
    fn flushes_trailing_line_at_eof() {
        let (mut writer, reader) = pair();
        let mut commands = CommandReader::new(reader);

        writer.write_all(b"quit").unwrap();
        drop(writer);
        let batch = commands.read_batch().unwrap();
        assert!(batch.lines.is_empty());
        assert!(!batch.closed);

        let batch = commands.read_batch().unwrap();
        assert!(batch.closed);
        assert_eq!(batch.lines, vec!["quit"]);
        assert!(commands.pending.is_empty());
    }

    #[test]
    fn drops_oversized_lines() {
        let (mut writer, reader) = pair();
        let mut commands = CommandReader::new(reader);

        for _ in 0..5 {
            writer.write_all(&[b'x'; 1024]).unwrap();
            commands.read_batch().unwrap();
        }
        assert!(commands.pending.len() <= MAX_LINE);
    }

    #[test]
    fn quit_terminates_through_the_reactor() {
        let (mut writer, reader) = pair();
        let lifecycle = Arc::new(Lifecycle::new(Box::new(SystemClock)));
        let mut reactor = Reactor::new().unwrap();
        let source = CommandReader::new(reader).into_source(Arc::clone(&lifecycle));
        reactor.register(&source).unwrap();

        writer.write_all(b"status\nbogus\nquit\n").unwrap();
        reactor.poll(Duration::from_millis(500)).unwrap();

        assert!(lifecycle.is_terminating());
        assert!(reactor.is_registered(&source));
    }

    #[test]
    fn closed_input_unregisters_source() {
        let (writer, reader) = pair();
        let lifecycle = Arc::new(Lifecycle::new(Box::new(SystemClock)));
        let mut reactor = Reactor::new().unwrap();
        let source = CommandReader::new(reader).into_source(Arc::clone(&lifecycle));
        reactor.register(&source).unwrap();

        drop(writer);
        reactor.poll(Duration::from_millis(500)).unwrap();

        assert!(!reactor.is_registered(&source));
        assert!(!lifecycle.is_terminating());
    }
}
