//! `tokio-util` codec adapter over the tunnel frame format

use bytes::BytesMut;
use peertunnel_proto::{CodecError, TunnelCodec, TunnelMessage};
use tokio_util::codec::{Decoder, Encoder};

/// Frames `TunnelMessage`s on a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = TunnelMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        TunnelCodec::decode(src)
    }
}

impl Encoder<TunnelMessage> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: TunnelMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        TunnelCodec::encode_into(&item, dst)
    }
}
