//! Length-prefixed CBOR framing for the object protocol.
//!
//! Every message is a 4-byte big-endian length followed by the CBOR body.
//! The frame limit follows the configured batch sizes, so a peer can never
//! be asked to buffer more than one full batch.

use std::io;

use async_trait::async_trait;
use futures::prelude::*;
use libp2p::StreamProtocol;
use libp2p::request_response;
use resin_core::RemoteConfig;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::protocol::{PROTOCOL_NAME, Request, Response};

/// Upper bound on the encoding of one id plus its CBOR headers.
const ID_OVERHEAD: usize = 80;
/// Headroom for message envelopes and error texts.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

/// Largest frame a peer with `config` may send or accept.
pub fn message_limit(config: &RemoteConfig) -> usize {
    let ids = config
        .has_batch_size
        .max(config.get_batch_size)
        .max(config.max_batch_records);
    config
        .max_batch_bytes
        .saturating_add(ids.saturating_mul(ID_OVERHEAD))
        .saturating_add(ENVELOPE_OVERHEAD)
        .min(u32::MAX as usize)
}

/// Codec for [`Request`] and [`Response`] frames.
#[derive(Debug, Clone)]
pub struct ResinCodec {
    max_message_size: usize,
}

impl ResinCodec {
    pub fn new(config: &RemoteConfig) -> Self {
        ResinCodec {
            max_message_size: message_limit(config),
        }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn too_large(&self, len: usize) -> io::Error {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "frame of {len} bytes exceeds limit of {} bytes",
                self.max_message_size
            ),
        )
    }

    async fn read_frame<T, M>(&self, io: &mut T) -> io::Result<M>
    where
        T: AsyncRead + Unpin + Send,
        M: DeserializeOwned,
    {
        let mut prefix = [0u8; 4];
        io.read_exact(&mut prefix).await?;
        let len = u32::from_be_bytes(prefix) as usize;
        if len > self.max_message_size {
            return Err(self.too_large(len));
        }

        let mut body = Vec::new();
        (&mut *io).take(len as u64).read_to_end(&mut body).await?;
        if body.len() != len {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        ciborium::from_reader(body.as_slice())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }

    async fn write_frame<T, M>(&self, io: &mut T, message: &M) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
        M: Serialize,
    {
        // reserve the prefix, patch it once the body length is known
        let mut frame = vec![0u8; 4];
        ciborium::into_writer(message, &mut frame)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let len = frame.len() - 4;
        if len > self.max_message_size {
            return Err(self.too_large(len));
        }
        frame[..4].copy_from_slice(&(len as u32).to_be_bytes());
        io.write_all(&frame).await
    }
}

impl Default for ResinCodec {
    fn default() -> Self {
        ResinCodec::new(&RemoteConfig::default())
    }
}

#[async_trait]
impl request_response::Codec for ResinCodec {
    type Protocol = StreamProtocol;
    type Request = Request;
    type Response = Response;

    async fn read_request<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.read_frame(io).await
    }

    async fn read_response<T>(&mut self, _: &StreamProtocol, io: &mut T) -> io::Result<Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        self.read_frame(io).await
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        request: Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.write_frame(io, &request).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        response: Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        self.write_frame(io, &response).await
    }
}

/// Returns the protocol identifier.
pub fn protocol() -> StreamProtocol {
    StreamProtocol::new(PROTOCOL_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::io::Cursor;
    use resin_core::Id;

    fn small_codec() -> ResinCodec {
        ResinCodec::new(&RemoteConfig {
            has_batch_size: 10,
            get_batch_size: 10,
            max_batch_records: 10,
            max_batch_bytes: 1024,
            ..RemoteConfig::default()
        })
    }

    #[tokio::test]
    async fn framed_message_roundtrip() {
        let codec = ResinCodec::default();
        let request = Request::Has {
            ids: vec![Id::from_bytes([3; 32]), Id::from_bytes([4; 32])],
        };
        let mut wire = Cursor::new(Vec::new());
        codec.write_frame(&mut wire, &request).await.unwrap();

        let bytes = wire.into_inner();
        assert_eq!(
            u32::from_be_bytes(bytes[..4].try_into().unwrap()) as usize,
            bytes.len() - 4
        );

        let mut reader = Cursor::new(bytes);
        let decoded: Request = codec.read_frame(&mut reader).await.unwrap();
        assert!(matches!(decoded, Request::Has { ids } if ids.len() == 2));
    }

    #[test]
    fn limit_follows_batch_configuration() {
        let codec = small_codec();
        assert_eq!(
            codec.max_message_size(),
            1024 + 10 * ID_OVERHEAD + ENVELOPE_OVERHEAD
        );
        assert!(
            ResinCodec::default().max_message_size() > RemoteConfig::default().max_batch_bytes
        );
    }

    #[tokio::test]
    async fn full_batch_fits_in_a_frame() {
        let codec = small_codec();
        let request = Request::Put {
            records: (0..10)
                .map(|n| (Id::from_bytes([n; 32]), vec![n; 1024 / 10]).into())
                .collect(),
        };
        let mut wire = Cursor::new(Vec::new());
        codec.write_frame(&mut wire, &request).await.unwrap();
    }

    #[tokio::test]
    async fn oversized_frames_are_rejected() {
        let codec = small_codec();
        let request = Request::Put {
            records: vec![(Id::from_bytes([1; 32]), vec![0; 200 * 1024]).into()],
        };
        let mut wire = Cursor::new(Vec::new());
        let err = codec.write_frame(&mut wire, &request).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let mut bytes = (u32::MAX).to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 8]);
        let mut reader = Cursor::new(bytes);
        let err = codec.read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn truncated_body_is_an_error() {
        let codec = ResinCodec::default();
        let mut bytes = 100u32.to_be_bytes().to_vec();
        bytes.extend_from_slice(&[0; 10]);
        let mut reader = Cursor::new(bytes);
        let err = codec.read_frame::<_, Request>(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
