//! Classification of raw queue frames and extraction of their payloads.

use crate::error::DecodeError;

use super::messages::{ImageDescriptor, MessageKind, PacketOutput, ServerPacket};

/// Parse one raw frame into a typed packet.
///
/// `process_completed` must carry a `success` flag; whether it is true is the
/// caller's concern.
pub fn decode(raw: &[u8]) -> Result<ServerPacket, DecodeError> {
    let packet: ServerPacket = serde_json::from_slice(raw).map_err(DecodeError::Malformed)?;

    if packet.kind == MessageKind::ProcessCompleted && packet.success.is_none() {
        return Err(DecodeError::MissingSuccessFlag);
    }

    Ok(packet)
}

/// The cumulative transcript in `data[0]` of a text-generation packet
pub fn text_output(packet: &ServerPacket) -> Result<&str, DecodeError> {
    transcript(packet.output.as_ref())
}

/// The transcript string of an output block
pub fn transcript(output: Option<&PacketOutput>) -> Result<&str, DecodeError> {
    let output = output.ok_or(DecodeError::NoOutput)?;
    let first = output.data.first().ok_or(DecodeError::EmptyData)?;
    first.as_str().ok_or_else(|| DecodeError::UnexpectedShape {
        message: format!("expected transcript string, got {}", first),
    })
}

/// Isolate the bot's latest turn from a cumulative transcript.
///
/// The remote echoes the whole conversation on every update. The turn starts
/// after the last `bot_token`. When the model has already started the next
/// human turn, the turn ends before it and loses the separator the remote puts
/// in front of the human token. The remote does not always emit the human
/// token's trailing colon, so the colon is ignored when searching.
///
/// This is a string heuristic: a speaker token appearing inside generated text
/// moves the boundaries.
pub fn extract_bot_turn(
    transcript: &str,
    bot_token: &str,
    human_token: &str,
) -> Result<String, DecodeError> {
    let bot_at = transcript
        .rfind(bot_token)
        .ok_or(DecodeError::MissingBotToken)?;
    let start = bot_at + bot_token.len();

    let human_marker = human_token.trim_end_matches(':');
    let human_at = if human_marker.is_empty() {
        None
    } else {
        transcript.rfind(human_marker).filter(|&at| at >= start)
    };

    let turn = match human_at {
        Some(end) => strip_trailing_separator(&transcript[start..end]),
        None => &transcript[start..],
    };

    Ok(turn.trim_start().to_string())
}

fn strip_trailing_separator(text: &str) -> &str {
    match text.chars().next_back() {
        Some(c) if c.is_whitespace() => &text[..text.len() - c.len_utf8()],
        _ => text,
    }
}

/// The image descriptors in `data[0]` of a completed image-generation packet
pub fn image_descriptors(output: Option<&PacketOutput>) -> Result<Vec<ImageDescriptor>, DecodeError> {
    let output = output.ok_or(DecodeError::NoOutput)?;
    let first = output.data.first().ok_or(DecodeError::NoImages)?;

    let images: Vec<ImageDescriptor> =
        serde_json::from_value(first.clone()).map_err(|e| DecodeError::UnexpectedShape {
            message: format!("expected image descriptor list: {}", e),
        })?;

    if images.is_empty() {
        return Err(DecodeError::NoImages);
    }

    Ok(images)
}
