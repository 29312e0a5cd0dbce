//! Half-duplex line link to the ground radio.
//!
//! Serial I/O is blocking, so the port is owned by a dedicated OS thread and
//! driven through [`LinkHandle`]. Only one request/reply exchange can be in
//! flight at a time because the thread serves commands in order.

use crate::error::LinkError;
use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};

const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// A transport that carries newline-terminated text frames.
pub trait LineLink: Send {
    fn connect(&mut self) -> Result<(), LinkError>;

    /// Blocks for at most `timeout`. `Ok(None)` means nothing arrived.
    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError>;

    fn write_line(&mut self, line: &str) -> Result<(), LinkError>;

    fn request_reply(&mut self, line: &str, timeout: Duration) -> Result<Option<String>, LinkError> {
        self.write_line(line)?;
        self.read_line(timeout)
    }

    fn close(&mut self);
}

pub struct SerialLink {
    port_name: String,
    baud_rate: u32,
    port: Option<Box<dyn serialport::SerialPort>>,
    pending: Vec<u8>,
}

impl SerialLink {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            port: None,
            pending: Vec::new(),
        }
    }

    fn port(&mut self) -> Result<&mut Box<dyn serialport::SerialPort>, LinkError> {
        self.port.as_mut().ok_or(LinkError::NotOpen)
    }

    /// Pops one complete line off the pending buffer, without its terminator.
    fn take_line(&mut self) -> Option<String> {
        let end = self.pending.iter().position(|byte| *byte == b'\n')?;
        let mut raw: Vec<u8> = self.pending.drain(..=end).collect();
        while matches!(raw.last(), Some(b'\n' | b'\r')) {
            raw.pop();
        }
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

impl LineLink for SerialLink {
    fn connect(&mut self) -> Result<(), LinkError> {
        let port = serialport::new(&self.port_name, self.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|source| LinkError::Open {
                port: self.port_name.clone(),
                source,
            })?;
        // The radio resets when the port opens.
        std::thread::sleep(SETTLE_DELAY);
        self.port = Some(port);
        self.pending.clear();
        tracing::info!(port = %self.port_name, baud = self.baud_rate, "radio link open");
        Ok(())
    }

    fn read_line(&mut self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let deadline = Instant::now() + timeout;
        let mut chunk = [0u8; 256];
        loop {
            while let Some(line) = self.take_line() {
                if !line.is_empty() {
                    return Ok(Some(line));
                }
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            let read = self.port()?.read(&mut chunk);
            match read {
                Ok(0) => {}
                Ok(read) => self.pending.extend_from_slice(&chunk[..read]),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) => return Err(err.into()),
            }
        }
    }

    fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
        let port = self.port()?;
        port.write_all(line.as_bytes())?;
        port.write_all(b"\n")?;
        port.flush()?;
        Ok(())
    }

    fn request_reply(&mut self, line: &str, timeout: Duration) -> Result<Option<String>, LinkError> {
        self.port()?.clear(serialport::ClearBuffer::Input)?;
        self.pending.clear();
        self.write_line(line)?;
        self.read_line(timeout)
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            tracing::info!(port = %self.port_name, "radio link closed");
        }
    }
}

enum LinkCommand {
    ReadLine {
        timeout: Duration,
        reply: oneshot::Sender<Result<Option<String>, LinkError>>,
    },
    WriteLine {
        line: String,
        reply: oneshot::Sender<Result<(), LinkError>>,
    },
    RequestReply {
        line: String,
        timeout: Duration,
        reply: oneshot::Sender<Result<Option<String>, LinkError>>,
    },
    Close {
        reply: oneshot::Sender<()>,
    },
}

/// Async front for a link owned by the link thread.
#[derive(Clone)]
pub struct LinkHandle {
    tx: mpsc::UnboundedSender<LinkCommand>,
}

impl LinkHandle {
    pub async fn read_line(&self, timeout: Duration) -> Result<Option<String>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkCommand::ReadLine { timeout, reply })
            .map_err(|_| LinkError::Stopped)?;
        rx.await.map_err(|_| LinkError::Stopped)?
    }

    pub async fn write_line(&self, line: &str) -> Result<(), LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkCommand::WriteLine {
                line: line.to_string(),
                reply,
            })
            .map_err(|_| LinkError::Stopped)?;
        rx.await.map_err(|_| LinkError::Stopped)?
    }

    pub async fn request_reply(
        &self,
        line: &str,
        timeout: Duration,
    ) -> Result<Option<String>, LinkError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(LinkCommand::RequestReply {
                line: line.to_string(),
                timeout,
                reply,
            })
            .map_err(|_| LinkError::Stopped)?;
        rx.await.map_err(|_| LinkError::Stopped)?
    }

    /// Releases the port and stops the thread. Safe to call more than once.
    pub async fn close(&self) {
        let (reply, rx) = oneshot::channel();
        if self.tx.send(LinkCommand::Close { reply }).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Opens `link` and moves it onto a dedicated thread.
pub fn spawn_link_thread<L>(mut link: L) -> Result<LinkHandle, LinkError>
where
    L: LineLink + 'static,
{
    link.connect()?;
    let (tx, mut rx) = mpsc::unbounded_channel::<LinkCommand>();

    std::thread::Builder::new()
        .name("radio-link".to_string())
        .spawn(move || {
            while let Some(command) = rx.blocking_recv() {
                match command {
                    LinkCommand::ReadLine { timeout, reply } => {
                        let _ = reply.send(link.read_line(timeout));
                    }
                    LinkCommand::WriteLine { line, reply } => {
                        let _ = reply.send(link.write_line(&line));
                    }
                    LinkCommand::RequestReply {
                        line,
                        timeout,
                        reply,
                    } => {
                        let _ = reply.send(link.request_reply(&line, timeout));
                    }
                    LinkCommand::Close { reply } => {
                        link.close();
                        let _ = reply.send(());
                        return;
                    }
                }
            }
            link.close();
        })?;

    Ok(LinkHandle { tx })
}

#[cfg(test)]
pub(crate) mod scripted {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// In-memory link: reads pop scripted lines, writes are recorded.
    pub struct ScriptedLink {
        pub inbound: VecDeque<Result<Option<String>, LinkError>>,
        pub written: Arc<Mutex<Vec<String>>>,
        pub closed: Arc<Mutex<bool>>,
    }

    impl ScriptedLink {
        pub fn new<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                inbound: lines.into_iter().map(|line| Ok(Some(line.into()))).collect(),
                written: Arc::new(Mutex::new(Vec::new())),
                closed: Arc::new(Mutex::new(false)),
            }
        }
    }

    impl LineLink for ScriptedLink {
        fn connect(&mut self) -> Result<(), LinkError> {
            Ok(())
        }

        fn read_line(&mut self, _timeout: Duration) -> Result<Option<String>, LinkError> {
            self.inbound.pop_front().unwrap_or(Ok(None))
        }

        fn write_line(&mut self, line: &str) -> Result<(), LinkError> {
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }

        fn close(&mut self) {
            *self.closed.lock().unwrap() = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::scripted::ScriptedLink;
    use super::*;

    #[test]
    fn serial_link_splits_buffered_lines() {
        let mut link = SerialLink::new("/dev/null", 9600);
        link.pending.extend_from_slice(b"K*1*2.0\r\n\r\nK*1*3.0\npartial");
        assert_eq!(link.take_line().as_deref(), Some("K*1*2.0"));
        assert_eq!(link.take_line().as_deref(), Some(""));
        assert_eq!(link.take_line().as_deref(), Some("K*1*3.0"));
        assert_eq!(link.take_line(), None);
        assert_eq!(link.pending, b"partial");
    }

    #[test]
    fn unopened_serial_link_reports_not_open() {
        let mut link = SerialLink::new("/dev/null", 9600);
        assert!(matches!(link.write_line("x"), Err(LinkError::NotOpen)));
    }

    #[tokio::test]
    async fn handle_forwards_commands_to_link_thread() {
        let link = ScriptedLink::new(["K*1*2.0"]);
        let written = link.written.clone();
        let closed = link.closed.clone();
        let handle = spawn_link_thread(link).unwrap();

        let line = handle.read_line(Duration::from_millis(10)).await.unwrap();
        assert_eq!(line.as_deref(), Some("K*1*2.0"));
        assert_eq!(handle.read_line(Duration::from_millis(10)).await.unwrap(), None);

        let reply = handle
            .request_reply("K-REQUEST-DATA", Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reply, None);
        handle.write_line("K-ID_ASSIGN-7").await.unwrap();
        assert_eq!(
            *written.lock().unwrap(),
            vec!["K-REQUEST-DATA".to_string(), "K-ID_ASSIGN-7".to_string()]
        );

        handle.close().await;
        assert!(*closed.lock().unwrap());
        assert!(matches!(
            handle.read_line(Duration::from_millis(10)).await,
            Err(LinkError::Stopped)
        ));
    }
}
