/// Handshake between the executor and the processes of a container
///
/// Messages are length-prefixed JSON over a pair of pipes. The parent never
/// starts timing before the tool process reports that it is ready and blocked
/// right before exec.
use crate::types::{BenchError, Result};
use nix::fcntl::OFlag;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::path::PathBuf;

/// Refuse to allocate for garbage length prefixes
const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HandshakeMessage {
    /// Child: the namespaces exist, the id maps may be written
    Unshared,
    /// Parent: id maps are in place, continue with the setup
    Go,
    /// Child: isolation is complete, the tool is about to exec. Pids are
    /// those of the tool and the container init in the host PID namespace.
    Ready { tool_pid: i32, init_pid: i32 },
    /// Parent: measurement has started, exec now
    Start,
    /// Child: building the container or starting the tool failed
    SetupFailed { detail: String },
    /// Child: the tool ended and result files were copied
    Exited {
        exit_code: Option<i32>,
        signal: Option<i32>,
        result_files: Vec<PathBuf>,
        warnings: Vec<String>,
    },
}

/// One direction of the handshake
#[derive(Debug)]
pub struct IpcChannel {
    reader: Option<File>,
    writer: Option<File>,
}

impl IpcChannel {
    /// Create a pipe; returns (reader, writer)
    pub fn new() -> Result<(Self, Self)> {
        let (read_fd, write_fd) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| BenchError::Handshake(format!("Failed to create pipe: {}", e)))?;
        // SAFETY: both descriptors are fresh and owned by nobody else.
        let (reader, writer) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        Ok((
            IpcChannel {
                reader: Some(reader),
                writer: None,
            },
            IpcChannel {
                reader: None,
                writer: Some(writer),
            },
        ))
    }

    pub fn send(&mut self, message: &HandshakeMessage) -> Result<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| BenchError::Handshake("Channel is not writable".to_string()))?;
        let payload = serde_json::to_vec(message)
            .map_err(|e| BenchError::Handshake(format!("Failed to encode message: {}", e)))?;
        let mut frame = Vec::with_capacity(payload.len() + 4);
        frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        frame.extend_from_slice(&payload);
        writer
            .write_all(&frame)
            .map_err(|e| BenchError::Handshake(format!("Failed to send {:?}: {}", message, e)))
    }

    /// Block until the next message. A closed peer yields `Ok(None)`.
    pub fn recv(&mut self) -> Result<Option<HandshakeMessage>> {
        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| BenchError::Handshake("Channel is not readable".to_string()))?;

        let mut len_bytes = [0u8; 4];
        match reader.read_exact(&mut len_bytes) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => {
                return Err(BenchError::Handshake(format!(
                    "Failed to read message length: {}",
                    e
                )))
            }
        }
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(BenchError::Handshake(format!(
                "Message of {} bytes is too large",
                len
            )));
        }

        let mut buffer = vec![0u8; len];
        reader
            .read_exact(&mut buffer)
            .map_err(|e| BenchError::Handshake(format!("Incomplete message: {}", e)))?;
        serde_json::from_slice(&buffer)
            .map(Some)
            .map_err(|e| BenchError::Handshake(format!("Failed to decode message: {}", e)))
    }

    /// Wait for one specific message; a setup failure or a closed peer is an error
    pub fn expect(&mut self, expected: &HandshakeMessage) -> Result<()> {
        match self.recv()? {
            Some(ref message) if message == expected => Ok(()),
            Some(HandshakeMessage::SetupFailed { detail }) => Err(BenchError::Handshake(detail)),
            Some(other) => Err(BenchError::Handshake(format!(
                "Expected {:?}, got {:?}",
                expected, other
            ))),
            None => Err(BenchError::Handshake(format!(
                "Peer exited while waiting for {:?}",
                expected
            ))),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.reader
            .as_ref()
            .or(self.writer.as_ref())
            .map(AsRawFd::as_raw_fd)
    }

    pub fn close(&mut self) {
        self.reader.take();
        self.writer.take();
    }
}

/// Both directions as seen from one side
#[derive(Debug)]
pub struct Handshake {
    pub incoming: IpcChannel,
    pub outgoing: IpcChannel,
}

impl Handshake {
    /// Create the parent and the child end
    pub fn pair() -> Result<(Handshake, Handshake)> {
        let (to_child_read, to_child_write) = IpcChannel::new()?;
        let (to_parent_read, to_parent_write) = IpcChannel::new()?;
        Ok((
            Handshake {
                incoming: to_parent_read,
                outgoing: to_child_write,
            },
            Handshake {
                incoming: to_child_read,
                outgoing: to_parent_write,
            },
        ))
    }

    pub fn send(&mut self, message: &HandshakeMessage) -> Result<()> {
        self.outgoing.send(message)
    }

    pub fn recv(&mut self) -> Result<Option<HandshakeMessage>> {
        self.incoming.recv()
    }

    pub fn expect(&mut self, expected: &HandshakeMessage) -> Result<()> {
        self.incoming.expect(expected)
    }

    pub fn close(&mut self) {
        self.incoming.close();
        self.outgoing.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_cross_the_pipe() {
        let (mut parent, mut child) = Handshake::pair().unwrap();
        let ready = HandshakeMessage::Ready {
            tool_pid: 42,
            init_pid: 41,
        };
        child.send(&ready).unwrap();
        assert_eq!(parent.recv().unwrap(), Some(ready));
        parent.outgoing.send(&HandshakeMessage::Start).unwrap();
        child.expect(&HandshakeMessage::Start).unwrap();

        let exited = HandshakeMessage::Exited {
            exit_code: Some(3),
            signal: None,
            result_files: vec![PathBuf::from("out.txt")],
            warnings: Vec::new(),
        };
        child.send(&exited).unwrap();
        assert_eq!(parent.recv().unwrap(), Some(exited));
    }

    #[test]
    fn test_setup_failure_becomes_error() {
        let (mut parent, mut child) = Handshake::pair().unwrap();
        child
            .send(&HandshakeMessage::SetupFailed {
                detail: "mount refused".to_string(),
            })
            .unwrap();
        match parent.expect(&HandshakeMessage::Go) {
            Err(BenchError::Handshake(detail)) => assert_eq!(detail, "mount refused"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_closed_peer() {
        let (mut parent, mut child) = Handshake::pair().unwrap();
        child.close();
        assert_eq!(parent.recv().unwrap(), None);
        assert!(parent.expect(&HandshakeMessage::Go).is_err());
    }

    #[test]
    fn test_wire_format_is_tagged() {
        let json = serde_json::to_string(&HandshakeMessage::SetupFailed {
            detail: "x".to_string(),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"setup_failed","detail":"x"}"#);
    }
}
