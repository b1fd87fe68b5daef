//! Wire framing: `[u32 length][u8 kind][bincode body]`, big-endian header.

use bytes::{BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::err::{GraphFlowError, Result, StatusCode};
use crate::rpc::{RpcMessage, ServiceId};

const HEADER_SIZE: usize = 5;
// Sanity bound on a single frame; anything larger is a corrupt length.
const MAX_FRAME_BYTES: usize = 1 << 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum FrameKind {
    Request = 0,
    Response = 1,
    Error = 2,
    Register = 3,
    RegisterAck = 4,
    Shutdown = 5,
}

impl FrameKind {
    fn from_u8(value: u8) -> Result<Self> {
        match value {
            0 => Ok(FrameKind::Request),
            1 => Ok(FrameKind::Response),
            2 => Ok(FrameKind::Error),
            3 => Ok(FrameKind::Register),
            4 => Ok(FrameKind::RegisterAck),
            5 => Ok(FrameKind::Shutdown),
            other => Err(GraphFlowError::Deserialization(format!(
                "unknown frame kind {}",
                other
            ))),
        }
    }
}

/// A server-side failure correlated back to the request it aborted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub service_id: ServiceId,
    pub msg_seq: u64,
    pub status: StatusCode,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterBody {
    /// Negative when the client has not been assigned an id yet.
    pub client_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RegisterAckBody {
    pub client_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ShutdownBody {
    pub client_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Request(RpcMessage),
    Response(RpcMessage),
    Error(ErrorBody),
    Register(RegisterBody),
    RegisterAck(RegisterAckBody),
    Shutdown(ShutdownBody),
}

fn encode_body(frame: &Frame) -> Result<(FrameKind, Vec<u8>)> {
    let encoded = match frame {
        Frame::Request(msg) => (FrameKind::Request, bincode::serialize(msg)),
        Frame::Response(msg) => (FrameKind::Response, bincode::serialize(msg)),
        Frame::Error(body) => (FrameKind::Error, bincode::serialize(body)),
        Frame::Register(body) => (FrameKind::Register, bincode::serialize(body)),
        Frame::RegisterAck(body) => (FrameKind::RegisterAck, bincode::serialize(body)),
        Frame::Shutdown(body) => (FrameKind::Shutdown, bincode::serialize(body)),
    };
    let (kind, body) = encoded;
    let body = body.map_err(|e| GraphFlowError::internal(e.to_string()))?;
    Ok((kind, body))
}

fn decode<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T> {
    bincode::deserialize(body).map_err(|e| GraphFlowError::Deserialization(e.to_string()))
}

fn map_write_err(e: std::io::Error) -> GraphFlowError {
    match e.kind() {
        std::io::ErrorKind::BrokenPipe
        | std::io::ErrorKind::ConnectionReset
        | std::io::ErrorKind::ConnectionAborted => {
            GraphFlowError::ConnectionClosed(e.to_string())
        }
        _ => GraphFlowError::Io(e),
    }
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let (kind, body) = encode_body(frame)?;
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_u8(kind as u8);
    buf.extend_from_slice(&body);
    writer.write_all(&buf).await.map_err(map_write_err)?;
    writer.flush().await.map_err(map_write_err)?;
    Ok(())
}

pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame> {
    let mut header = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            GraphFlowError::ConnectionClosed("peer closed the connection".into())
        } else {
            GraphFlowError::Io(e)
        }
    })?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(GraphFlowError::Deserialization(format!(
            "frame of {} bytes exceeds the {} byte limit",
            len, MAX_FRAME_BYTES
        )));
    }
    let kind = FrameKind::from_u8(header[4])?;
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            GraphFlowError::ConnectionClosed("peer closed mid-frame".into())
        } else {
            GraphFlowError::Io(e)
        }
    })?;
    match kind {
        FrameKind::Request => Ok(Frame::Request(decode(&body)?)),
        FrameKind::Response => Ok(Frame::Response(decode(&body)?)),
        FrameKind::Error => Ok(Frame::Error(decode(&body)?)),
        FrameKind::Register => Ok(Frame::Register(decode(&body)?)),
        FrameKind::RegisterAck => Ok(Frame::RegisterAck(decode(&body)?)),
        FrameKind::Shutdown => Ok(Frame::Shutdown(decode(&body)?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::Tensor;

    #[tokio::test]
    async fn frame_round_trip_through_a_buffer() {
        let msg = RpcMessage {
            service_id: 901231,
            msg_seq: 23,
            client_id: 0,
            server_id: 1,
            data: vec![1, 2, 3],
            tensors: vec![Tensor::from_slice(&[7i64, 8, 9])],
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &Frame::Request(msg.clone())).await.unwrap();
        write_frame(
            &mut buf,
            &Frame::Error(ErrorBody {
                service_id: 901231,
                msg_seq: 23,
                status: StatusCode::HandlerNotFound,
                message: "no such handler".into(),
            }),
        )
        .await
        .unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Request(back) => assert_eq!(back, msg),
            other => panic!("unexpected frame {:?}", other),
        }
        match read_frame(&mut cursor).await.unwrap() {
            Frame::Error(body) => {
                assert_eq!(body.status, StatusCode::HandlerNotFound);
                assert_eq!(body.msg_seq, 23);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        // The buffer is drained; a further read reports a closed peer.
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(GraphFlowError::ConnectionClosed(_))
        ));
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let buf = vec![0, 0, 0, 0, 99];
        let mut cursor = std::io::Cursor::new(buf);
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(GraphFlowError::Deserialization(_))
        ));
    }
}
