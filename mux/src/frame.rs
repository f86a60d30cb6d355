// Copyright (c) 2024 Botho Foundation

//! The mplex wire frame: `⟨varint header⟩⟨varint length⟩⟨payload⟩`, where
//! `header = (stream_id << 3) | flag`.

use crate::error::MuxError;
use bth_p2p_identity::{varint, IdentityError};

/// The frame flag, carrying both the stream operation and which side
/// (initiator or receiver of the stream) the frame is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    /// A new stream was opened by the sender.
    NewStream = 0,
    /// A data frame about a stream the *recipient* opened.
    MessageReceiver = 1,
    /// A data frame about a stream the *sender* opened.
    MessageInitiator = 2,
    /// A half-close about a stream the *recipient* opened.
    CloseReceiver = 3,
    /// A half-close about a stream the *sender* opened.
    CloseInitiator = 4,
    /// A reset about a stream the *recipient* opened.
    ResetReceiver = 5,
    /// A reset about a stream the *sender* opened.
    ResetInitiator = 6,
}

impl Flag {
    fn try_from_u8(value: u8) -> Result<Self, MuxError> {
        match value {
            0 => Ok(Flag::NewStream),
            1 => Ok(Flag::MessageReceiver),
            2 => Ok(Flag::MessageInitiator),
            3 => Ok(Flag::CloseReceiver),
            4 => Ok(Flag::CloseInitiator),
            5 => Ok(Flag::ResetReceiver),
            6 => Ok(Flag::ResetInitiator),
            other => Err(MuxError::UnknownFlag(other)),
        }
    }
}

/// One decoded mplex frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// The stream this frame concerns.
    pub stream_id: u64,
    /// What kind of frame this is, and whose stream-open perspective it's
    /// relative to.
    pub flag: Flag,
    /// The frame's payload. Empty for control frames (close/reset).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Encode this frame to its wire representation.
    pub fn encode(&self) -> Vec<u8> {
        let header = (self.stream_id << 3) | (self.flag as u64);
        let mut out = Vec::with_capacity(self.payload.len() + 10);
        varint::encode(header, &mut out);
        varint::encode(self.payload.len() as u64, &mut out);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Attempt to decode one frame from the front of `input`.
    ///
    /// Returns `Ok(None)` if `input` does not yet contain a complete frame
    /// (the caller should read more bytes and retry); `Ok(Some((frame,
    /// consumed)))` on success. A payload declared larger than
    /// `max_frame_size` fails with [`MuxError::FrameTooLarge`] immediately,
    /// without waiting for the bytes to arrive.
    pub fn try_decode(input: &[u8], max_frame_size: usize) -> Result<Option<(Frame, usize)>, MuxError> {
        let mut offset = 0;

        let header = match varint::decode(&input[offset..]) {
            Ok((value, size)) => {
                offset += size;
                value
            }
            Err(IdentityError::InsufficientData) => return Ok(None),
            Err(_) => return Err(MuxError::InvalidFrameHeader),
        };

        let length = match varint::decode(&input[offset..]) {
            Ok((value, size)) => {
                offset += size;
                value as usize
            }
            Err(IdentityError::InsufficientData) => return Ok(None),
            Err(_) => return Err(MuxError::InvalidFrameHeader),
        };

        if length > max_frame_size {
            return Err(MuxError::FrameTooLarge);
        }
        if input.len() < offset + length {
            return Ok(None);
        }

        let stream_id = header >> 3;
        let flag = Flag::try_from_u8((header & 0x7) as u8)?;
        let payload = input[offset..offset + length].to_vec();
        offset += length;

        Ok(Some((
            Frame {
                stream_id,
                flag,
                payload,
            },
            offset,
        )))
    }
}
