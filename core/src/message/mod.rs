// Message module — peer wire types and length-prefixed framing

pub mod codec;
pub mod types;

pub use codec::{
    decode_peer_frame, encode_peer_frame, read_frame, read_frame_or_skip, write_frame, FrameError,
    InboundFrame, SkippedFrame, FRAME_OVERHEAD,
};
pub use types::{Operation, PeerFrame, RequestEnvelope, ResponseEnvelope, ResponseStatus};
