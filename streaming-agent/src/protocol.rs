// Copyright 2024 lg-capture Authors
// SPDX-License-Identifier: Apache-2.0

//! Stream device protocol
//!
//! Messages exchanged with the display server over the stream port. Every
//! message is an 8 byte little-endian header followed by `size` bytes of
//! payload:
//!
//! ```text
//! +------------------+---------+----------+----------+
//! | protocol_version | padding |   type   |   size   |
//! |       u8         |   u8    |   u16    |   u32    |
//! +------------------+---------+----------+----------+
//! ```
//!
//! All framing is built on [`port::read_all`] and [`port::write_all`].

use std::os::fd::BorrowedFd;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;
use thiserror::Error;

use crate::capture::FrameSize;
use crate::port::{self, PortError};

/// Stream device protocol version
pub const STREAM_DEVICE_PROTOCOL: u8 = 1;

/// Size of [`MessageHeader`] on the wire
pub const HEADER_SIZE: usize = 8;

/// Largest capabilities payload accepted from the server
pub const MAX_CAPABILITIES_SIZE: u32 = 1024;

/// Largest start/stop payload accepted from the server
pub const MAX_START_STOP_SIZE: u32 = 1 + 256;

/// Errors in the stream message layer.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Port(#[from] PortError),

    #[error("Unsupported stream protocol version {0}")]
    UnsupportedVersion(u8),

    #[error("Message of type {msg_type} too large: {size} bytes (limit {limit})")]
    MessageTooLarge { msg_type: u16, size: u32, limit: u32 },

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unexpected message type {0} from server")]
    UnexpectedMessage(u16),
}

/// Video codec identifiers as sent on the wire.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodecType {
    Mjpeg = 1,
    Vp8 = 2,
    H264 = 3,
    Vp9 = 4,
    H265 = 5,
}

impl VideoCodecType {
    /// Short lowercase name, also used as the option scope prefix.
    pub fn name(&self) -> &'static str {
        match self {
            VideoCodecType::Mjpeg => "mjpeg",
            VideoCodecType::Vp8 => "vp8",
            VideoCodecType::H264 => "h264",
            VideoCodecType::Vp9 => "vp9",
            VideoCodecType::H265 => "h265",
        }
    }
}

impl TryFrom<u8> for VideoCodecType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(VideoCodecType::Mjpeg),
            2 => Ok(VideoCodecType::Vp8),
            3 => Ok(VideoCodecType::H264),
            4 => Ok(VideoCodecType::Vp9),
            5 => Ok(VideoCodecType::H265),
            _ => Err("Invalid video codec value"),
        }
    }
}

/// Message types
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Invalid = 0,
    /// Capability exchange (both directions)
    Capabilities = 1,
    /// Compressed frame (agent -> server)
    Data = 2,
    /// Stream format (agent -> server)
    Format = 3,
    CursorSet = 4,
    CursorMove = 5,
    /// Error report (agent -> server)
    NotifyError = 6,
    /// Start or stop streaming (server -> agent)
    StartStop = 7,
}

impl TryFrom<u16> for MessageType {
    type Error = &'static str;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MessageType::Invalid),
            1 => Ok(MessageType::Capabilities),
            2 => Ok(MessageType::Data),
            3 => Ok(MessageType::Format),
            4 => Ok(MessageType::CursorSet),
            5 => Ok(MessageType::CursorMove),
            6 => Ok(MessageType::NotifyError),
            7 => Ok(MessageType::StartStop),
            _ => Err("Invalid message type value"),
        }
    }
}

/// Message header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub protocol_version: u8,
    pub msg_type: u16,
    pub size: u32,
}

impl MessageHeader {
    pub fn new(msg_type: MessageType, size: u32) -> Self {
        Self {
            protocol_version: STREAM_DEVICE_PROTOCOL,
            msg_type: msg_type as u16,
            size,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.protocol_version;
        LittleEndian::write_u16(&mut buf[2..4], self.msg_type);
        LittleEndian::write_u32(&mut buf[4..8], self.size);
        buf
    }

    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Self {
        Self {
            protocol_version: buf[0],
            msg_type: LittleEndian::read_u16(&buf[2..4]),
            size: LittleEndian::read_u32(&buf[4..8]),
        }
    }
}

/// Messages the server sends to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerMessage {
    /// Server capability bits
    Capabilities(Vec<u8>),
    /// Codecs the client accepts; empty means stop streaming
    StartStop(Vec<VideoCodecType>),
}

fn payload_size(len: usize) -> Result<u32, ProtocolError> {
    u32::try_from(len).map_err(|_| ProtocolError::Malformed(format!("payload of {len} bytes")))
}

/// Write a message made of a header and `payload`.
pub fn write_message(
    fd: BorrowedFd<'_>,
    msg_type: MessageType,
    payload: &[u8],
) -> Result<(), ProtocolError> {
    let header = MessageHeader::new(msg_type, payload_size(payload.len())?);
    port::write_all(fd, &header.encode())?;
    port::write_all(fd, payload)?;
    Ok(())
}

/// Announce the size and codec of the frames that follow.
pub fn send_format(
    fd: BorrowedFd<'_>,
    size: FrameSize,
    codec: VideoCodecType,
) -> Result<(), ProtocolError> {
    let mut payload = [0u8; 12];
    LittleEndian::write_u32(&mut payload[0..4], size.width);
    LittleEndian::write_u32(&mut payload[4..8], size.height);
    payload[8] = codec as u8;
    write_message(fd, MessageType::Format, &payload)
}

/// Send one compressed frame.
pub fn send_data(fd: BorrowedFd<'_>, frame: &[u8]) -> Result<(), ProtocolError> {
    write_message(fd, MessageType::Data, frame)
}

/// Send the agent's capabilities. None are defined yet.
pub fn send_capabilities(fd: BorrowedFd<'_>) -> Result<(), ProtocolError> {
    write_message(fd, MessageType::Capabilities, &[])
}

/// Report an error to the server.
pub fn send_error(fd: BorrowedFd<'_>, code: u32, message: &str) -> Result<(), ProtocolError> {
    let mut payload = vec![0u8; 4];
    LittleEndian::write_u32(&mut payload[0..4], code);
    payload.extend_from_slice(message.as_bytes());
    payload.push(0);
    write_message(fd, MessageType::NotifyError, &payload)
}

/// Read one message header and its payload.
///
/// `limit` bounds the payload size per message type; `None` accepts any
/// size.
pub fn read_message(
    fd: BorrowedFd<'_>,
    limit: impl Fn(u16) -> Option<u32>,
) -> Result<(MessageHeader, Vec<u8>), ProtocolError> {
    let mut buf = [0u8; HEADER_SIZE];
    port::read_all(fd, &mut buf)?;
    let header = MessageHeader::decode(&buf);

    if header.protocol_version != STREAM_DEVICE_PROTOCOL {
        return Err(ProtocolError::UnsupportedVersion(header.protocol_version));
    }
    if let Some(limit) = limit(header.msg_type) {
        if header.size > limit {
            return Err(ProtocolError::MessageTooLarge {
                msg_type: header.msg_type,
                size: header.size,
                limit,
            });
        }
    }

    let mut payload = vec![0u8; header.size as usize];
    port::read_all(fd, &mut payload)?;
    Ok((header, payload))
}

/// Payload limits for messages coming from the server.
pub fn server_message_limit(msg_type: u16) -> Option<u32> {
    match MessageType::try_from(msg_type) {
        Ok(MessageType::Capabilities) => Some(MAX_CAPABILITIES_SIZE),
        Ok(MessageType::StartStop) => Some(MAX_START_STOP_SIZE),
        _ => Some(0),
    }
}

/// Read and decode the next server message.
pub fn read_server_message(fd: BorrowedFd<'_>) -> Result<ServerMessage, ProtocolError> {
    let (header, payload) = read_message(fd, server_message_limit)?;
    parse_server_message(&header, &payload)
}

/// Decode a server message payload.
pub fn parse_server_message(
    header: &MessageHeader,
    payload: &[u8],
) -> Result<ServerMessage, ProtocolError> {
    match MessageType::try_from(header.msg_type) {
        Ok(MessageType::Capabilities) => Ok(ServerMessage::Capabilities(payload.to_vec())),
        Ok(MessageType::StartStop) => {
            let (&count, codecs) = payload
                .split_first()
                .ok_or_else(|| ProtocolError::Malformed("empty start/stop message".to_string()))?;
            if codecs.len() != count as usize {
                return Err(ProtocolError::Malformed(format!(
                    "start/stop lists {count} codecs but carries {}",
                    codecs.len()
                )));
            }
            let codecs = codecs
                .iter()
                .filter_map(|&id| match VideoCodecType::try_from(id) {
                    Ok(codec) => Some(codec),
                    Err(_) => {
                        log::debug!("Ignoring unknown codec {id} in start/stop");
                        None
                    }
                })
                .collect();
            Ok(ServerMessage::StartStop(codecs))
        }
        _ => Err(ProtocolError::UnexpectedMessage(header.msg_type)),
    }
}

/// Encode a start/stop payload, as the server would send it.
pub fn encode_start_stop(codecs: &[VideoCodecType]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(codecs.len() + 1);
    payload.push(codecs.len() as u8);
    payload.extend(codecs.iter().map(|&codec| codec as u8));
    payload
}

/// Decode a format payload.
pub fn parse_format(payload: &[u8]) -> Result<(FrameSize, VideoCodecType), ProtocolError> {
    if payload.len() != 12 {
        return Err(ProtocolError::Malformed(format!(
            "format message of {} bytes",
            payload.len()
        )));
    }
    let size = FrameSize::new(
        LittleEndian::read_u32(&payload[0..4]),
        LittleEndian::read_u32(&payload[4..8]),
    );
    let codec = VideoCodecType::try_from(payload[8]).map_err(|e| ProtocolError::Malformed(e.to_string()))?;
    Ok((size, codec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::AsFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_header_layout() {
        let header = MessageHeader::new(MessageType::Format, 0x0102_0304);
        assert_eq!(header.encode(), [1, 0, 3, 0, 4, 3, 2, 1]);
        assert_eq!(MessageHeader::decode(&header.encode()), header);
    }

    #[test]
    fn test_codec_type_try_from() {
        assert_eq!(VideoCodecType::try_from(1).unwrap(), VideoCodecType::Mjpeg);
        assert_eq!(VideoCodecType::try_from(5).unwrap(), VideoCodecType::H265);
        assert!(VideoCodecType::try_from(0).is_err());
        assert!(VideoCodecType::try_from(6).is_err());
    }

    #[test]
    fn test_codec_names() {
        for codec in [
            VideoCodecType::Mjpeg,
            VideoCodecType::Vp8,
            VideoCodecType::H264,
            VideoCodecType::Vp9,
            VideoCodecType::H265,
        ] {
            assert_eq!(serde_json::to_value(codec).unwrap(), codec.name());
        }
    }

    #[test]
    fn test_format_message() {
        let (agent, server) = UnixStream::pair().unwrap();
        send_format(agent.as_fd(), FrameSize::new(1920, 1080), VideoCodecType::Mjpeg).unwrap();

        let (header, payload) = read_message(server.as_fd(), |_| None).unwrap();
        assert_eq!(header.msg_type, MessageType::Format as u16);
        assert_eq!(header.size, 12);
        let (size, codec) = parse_format(&payload).unwrap();
        assert_eq!(size, FrameSize::new(1920, 1080));
        assert_eq!(codec, VideoCodecType::Mjpeg);
    }

    #[test]
    fn test_data_message() {
        let (agent, server) = UnixStream::pair().unwrap();
        send_data(agent.as_fd(), b"frame bytes").unwrap();

        let (header, payload) = read_message(server.as_fd(), |_| None).unwrap();
        assert_eq!(header.msg_type, MessageType::Data as u16);
        assert_eq!(payload, b"frame bytes");
    }

    #[test]
    fn test_error_message() {
        let (agent, server) = UnixStream::pair().unwrap();
        send_error(agent.as_fd(), 7, "boom").unwrap();

        let (header, payload) = read_message(server.as_fd(), |_| None).unwrap();
        assert_eq!(header.msg_type, MessageType::NotifyError as u16);
        assert_eq!(LittleEndian::read_u32(&payload[0..4]), 7);
        assert_eq!(&payload[4..], b"boom\0");
    }

    #[test]
    fn test_start_stop_parsing() {
        let header = MessageHeader::new(MessageType::StartStop, 4);
        let payload = [3, 1, 9, 3];
        assert_eq!(
            parse_server_message(&header, &payload).unwrap(),
            ServerMessage::StartStop(vec![VideoCodecType::Mjpeg, VideoCodecType::H264])
        );

        let stop = encode_start_stop(&[]);
        let header = MessageHeader::new(MessageType::StartStop, 1);
        assert_eq!(
            parse_server_message(&header, &stop).unwrap(),
            ServerMessage::StartStop(Vec::new())
        );
    }

    #[test]
    fn test_start_stop_count_mismatch() {
        let header = MessageHeader::new(MessageType::StartStop, 2);
        assert!(matches!(
            parse_server_message(&header, &[2, 1]),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            parse_server_message(&header, &[]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_unexpected_server_message() {
        let header = MessageHeader::new(MessageType::Data, 0);
        assert!(matches!(
            parse_server_message(&header, &[]),
            Err(ProtocolError::UnexpectedMessage(2))
        ));
    }

    #[test]
    fn test_read_server_message() {
        let (agent, server) = UnixStream::pair().unwrap();
        write_message(
            server.as_fd(),
            MessageType::StartStop,
            &encode_start_stop(&[VideoCodecType::Vp8]),
        )
        .unwrap();

        assert_eq!(
            read_server_message(agent.as_fd()).unwrap(),
            ServerMessage::StartStop(vec![VideoCodecType::Vp8])
        );
    }

    #[test]
    fn test_oversized_message_rejected() {
        let (agent, server) = UnixStream::pair().unwrap();
        write_message(server.as_fd(), MessageType::Capabilities, &[0u8; 2048]).unwrap();

        assert!(matches!(
            read_server_message(agent.as_fd()),
            Err(ProtocolError::MessageTooLarge { size: 2048, limit: 1024, .. })
        ));
    }

    #[test]
    fn test_bad_protocol_version() {
        let (agent, server) = UnixStream::pair().unwrap();
        let mut header = MessageHeader::new(MessageType::Capabilities, 0).encode();
        header[0] = 9;
        port::write_all(server.as_fd(), &header).unwrap();

        assert!(matches!(
            read_server_message(agent.as_fd()),
            Err(ProtocolError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_truncated_message_is_eof() {
        let (agent, server) = UnixStream::pair().unwrap();
        let header = MessageHeader::new(MessageType::Capabilities, 4).encode();
        port::write_all(server.as_fd(), &header).unwrap();
        port::write_all(server.as_fd(), &[1, 2]).unwrap();
        drop(server);

        match read_server_message(agent.as_fd()) {
            Err(ProtocolError::Port(e)) => assert!(e.is_eof()),
            other => panic!("unexpected result: {other:?}"),
        }
    }
}
