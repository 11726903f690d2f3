//! Provide an interface to the ATDome Controller.
//!
//! [`ATDomeModel`] owns the TCP stream to the controller and performs one
//! framed exchange at a time: write a command terminated by CRLF, then read
//! the reply up to the ">" prompt.

use std::time::Duration;

use tokio::{
    io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    time::timeout,
};

use crate::{
    error::{ATDomeError, ATDomeResult},
    status::{FULL_STATUS_LINES, SHORT_STATUS_LINES},
};

/// Prompt the controller writes at the end of every reply.
pub const PROMPT: u8 = b'>';

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ATDomeCmd {
    MoveAz(f64),
    CloseShutter,
    OpenShutter,
    StopMotion,
    HomeAzimuth,
    OpenShutterDropoutDoor,
    CloseShutterDropoutDoor,
    OpenShutterMainDoor,
    CloseShutterMainDoor,
    GetShortStatus,
    GetFullStatus,
    Unknown,
}

impl ATDomeCmd {
    pub fn get_command(&self) -> String {
        match &self {
            ATDomeCmd::MoveAz(az) => format!("{az:.3} MV"),
            ATDomeCmd::CloseShutter => "SC".to_string(),
            ATDomeCmd::OpenShutter => "SO".to_string(),
            ATDomeCmd::StopMotion => "ST".to_string(),
            ATDomeCmd::HomeAzimuth => "HM".to_string(),
            ATDomeCmd::OpenShutterDropoutDoor => "DN".to_string(),
            ATDomeCmd::CloseShutterDropoutDoor => "UP".to_string(),
            ATDomeCmd::OpenShutterMainDoor => "OP".to_string(),
            ATDomeCmd::CloseShutterMainDoor => "CL".to_string(),
            ATDomeCmd::GetShortStatus => "?".to_string(),
            ATDomeCmd::GetFullStatus => "+".to_string(),
            ATDomeCmd::Unknown => String::new(),
        }
    }

    /// Number of reply lines before the prompt.
    pub fn expected_lines(&self) -> usize {
        match self {
            ATDomeCmd::GetShortStatus => SHORT_STATUS_LINES,
            ATDomeCmd::GetFullStatus => FULL_STATUS_LINES,
            _ => 0,
        }
    }
}

#[derive(Debug)]
pub struct ATDomeModel {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    read_timeout: Duration,
}

impl ATDomeModel {
    /// Open the connection and discard the login banner.
    pub async fn connect(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> ATDomeResult<ATDomeModel> {
        let connect_error = |reason: String| ATDomeError::Connect {
            host: host.to_owned(),
            port,
            reason,
        };

        let stream = timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| connect_error(format!("timed out after {connect_timeout:?}")))?
            .map_err(|err| connect_error(err.to_string()))?;
        let (reader, writer) = stream.into_split();

        let mut model = ATDomeModel {
            reader: BufReader::new(reader),
            writer,
            read_timeout,
        };

        let banner = model
            .read_reply()
            .await
            .map_err(|err| connect_error(format!("reading banner: {err}")))?;
        log::debug!("Discarded banner {:?}.", String::from_utf8_lossy(&banner));

        Ok(model)
    }

    /// Send a command and return the trimmed lines of its reply.
    ///
    /// A read timeout or a closed stream leaves the connection unusable and
    /// is reported as such; a reply with the wrong number of lines is not.
    pub async fn send_and_receive(&mut self, atdome_cmd: &ATDomeCmd) -> ATDomeResult<Vec<String>> {
        let command = atdome_cmd.get_command();
        log::debug!("Sending {command:?}.");
        self.writer
            .write_all(format!("{command}\r\n").as_bytes())
            .await?;
        self.writer.flush().await?;

        let reply = self.read_reply().await?;
        let lines = split_reply(&reply);

        let expected = atdome_cmd.expected_lines();
        if lines.len() != expected {
            return Err(ATDomeError::LineCount {
                command,
                got: lines.len(),
                expected,
            });
        }
        Ok(lines)
    }

    /// Half-close the stream, drain what the controller still sends, and
    /// drop it.
    ///
    /// Shutdown and drain are each bounded by the read timeout.
    pub async fn disconnect(mut self) {
        match timeout(self.read_timeout, self.writer.shutdown()).await {
            Ok(Ok(())) => log::debug!("Connection half-closed."),
            Ok(Err(err)) => log::warn!("Error closing connection: {err}"),
            Err(_) => log::warn!("Timed out closing connection."),
        }

        let mut drained = Vec::new();
        match timeout(self.read_timeout, self.reader.read_to_end(&mut drained)).await {
            Ok(Ok(n_bytes)) => log::debug!("Connection closed; drained {n_bytes} bytes."),
            Ok(Err(err)) => log::debug!("Error draining connection: {err}"),
            Err(_) => log::warn!("Timed out draining connection."),
        }
    }

    async fn read_reply(&mut self) -> ATDomeResult<Vec<u8>> {
        let mut buffer = Vec::new();
        let n_bytes = timeout(
            self.read_timeout,
            self.reader.read_until(PROMPT, &mut buffer),
        )
        .await
        .map_err(|_| ATDomeError::ReadTimeout(self.read_timeout))??;

        if n_bytes == 0 || buffer.last() != Some(&PROMPT) {
            return Err(ATDomeError::UnexpectedStreamEnd);
        }
        Ok(buffer)
    }
}

/// Split a reply on newlines, dropping the final prompt line.
fn split_reply(reply: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(reply);
    let mut lines: Vec<&str> = text.split('\n').collect();
    lines.pop();
    lines.into_iter().map(|line| line.trim().to_owned()).collect()
}
