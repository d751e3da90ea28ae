//! TCP line-protocol bus transport
//!
//! Frames are newline-delimited: `<topic> <payload>`. On connect the client
//! sends `SUB <pattern>` so the broker forwards every anchor vector topic.
//! Payloads are UTF-8 JSON and never contain newlines.

use super::{measurement_pattern, BusClient, BusError, BusMessage, BusResult, BusSettings};
use std::io::{BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

struct Connection {
    reader: BufReader<TcpStream>,
    writer: TcpStream,
    /// Bytes of a frame whose newline has not arrived yet.
    partial: String,
}

/// [`BusClient`] over a plain TCP stream.
pub struct TcpLineClient {
    settings: BusSettings,
    connection: Option<Connection>,
}

impl TcpLineClient {
    pub fn new(settings: BusSettings) -> Self {
        Self {
            settings,
            connection: None,
        }
    }

    fn open_stream(&self) -> BusResult<TcpStream> {
        let address = (self.settings.host.as_str(), self.settings.port)
            .to_socket_addrs()
            .map_err(|e| self.connect_failed(e.to_string()))?
            .next()
            .ok_or_else(|| self.connect_failed("no address resolved".to_string()))?;

        let stream = TcpStream::connect_timeout(&address, self.settings.connect_timeout())
            .map_err(|e| self.connect_failed(e.to_string()))?;
        stream
            .set_nodelay(true)
            .map_err(|e| self.connect_failed(e.to_string()))?;
        Ok(stream)
    }

    fn connect_failed(&self, details: String) -> BusError {
        BusError::ConnectFailed {
            host: self.settings.host.clone(),
            port: self.settings.port,
            details,
        }
    }
}

impl BusClient for TcpLineClient {
    fn connect(&mut self) -> BusResult<()> {
        self.disconnect();

        let stream = self.open_stream()?;
        let mut writer = stream
            .try_clone()
            .map_err(|e| self.connect_failed(e.to_string()))?;

        let subscribe = format!("SUB {}\n", measurement_pattern(&self.settings.base_topic));
        writer
            .write_all(subscribe.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| self.connect_failed(e.to_string()))?;

        self.connection = Some(Connection {
            reader: BufReader::new(stream),
            writer,
            partial: String::new(),
        });
        Ok(())
    }

    fn poll(&mut self, timeout: Duration) -> BusResult<Option<BusMessage>> {
        let connection = self.connection.as_mut().ok_or(BusError::NotConnected)?;

        connection
            .reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(|e| BusError::ConnectionLost {
                details: e.to_string(),
            })?;

        match connection.reader.read_line(&mut connection.partial) {
            Ok(0) => {
                self.connection = None;
                Err(BusError::ConnectionLost {
                    details: "peer closed the connection".to_string(),
                })
            }
            Ok(_) => {
                let line = std::mem::take(&mut connection.partial);
                let trimmed = line.trim_end_matches(['\n', '\r']);
                // Frames without a payload separator are dropped; the ingest
                // layer counts malformed payloads, not malformed frames.
                match trimmed.split_once(' ') {
                    Some((topic, payload)) => Ok(Some(BusMessage::new(
                        topic.to_string(),
                        payload.as_bytes().to_vec(),
                    ))),
                    None => Ok(None),
                }
            }
            // A timeout mid-frame keeps the partial bytes for the next poll.
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                Ok(None)
            }
            Err(e) => {
                self.connection = None;
                Err(BusError::ConnectionLost {
                    details: e.to_string(),
                })
            }
        }
    }

    fn publish(&mut self, topic: &str, payload: &[u8]) -> BusResult<()> {
        let connection = self.connection.as_mut().ok_or(BusError::NotConnected)?;

        let mut frame = Vec::with_capacity(topic.len() + payload.len() + 2);
        frame.extend_from_slice(topic.as_bytes());
        frame.push(b' ');
        frame.extend_from_slice(payload);
        frame.push(b'\n');

        if let Err(e) = connection
            .writer
            .write_all(&frame)
            .and_then(|_| connection.writer.flush())
        {
            self.connection = None;
            return Err(BusError::PublishFailed {
                topic: topic.to_string(),
                details: e.to_string(),
            });
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    fn disconnect(&mut self) {
        self.connection = None;
    }
}
