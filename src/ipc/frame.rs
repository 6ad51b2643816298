//! Fixed-size IPC frame codec.
//!
//! Layout (big-endian):
//! ```text
//! +---------+----------+----------------------+----------+----------------------+
//! | tag u32 | len u16  | path [1024 bytes]    | len u16  | old_path [1024 bytes]|
//! +---------+----------+----------------------+----------+----------------------+
//! ```
//! Unused field bytes are zero. `old_path` is only meaningful for renames.

use bytes::{Buf, BufMut, BytesMut};
use tracing::warn;

use super::{IpcError, Result};
use crate::event::{Event, EventKind};

/// Bytes reserved for each path field.
pub const PATH_FIELD_LEN: usize = 1024;
/// Total encoded size of one frame.
pub const FRAME_LEN: usize = 4 + 2 * (2 + PATH_FIELD_LEN);

// Frames must fit one atomic pipe write.
#[cfg(target_os = "linux")]
const _: () = assert!(FRAME_LEN <= nix::libc::PIPE_BUF);

/// Encode an event into exactly [`FRAME_LEN`] bytes.
///
/// Paths longer than [`PATH_FIELD_LEN`] are cut at the last character
/// boundary that fits.
pub fn encode(event: &Event) -> BytesMut {
    let mut buf = BytesMut::with_capacity(FRAME_LEN);
    buf.put_u32(event.kind().tag());
    put_path(&mut buf, event.path().unwrap_or_default());
    put_path(&mut buf, event.old_path().unwrap_or_default());
    debug_assert_eq!(buf.len(), FRAME_LEN);
    buf
}

/// Decode one frame back into an event.
pub fn decode(mut frame: &[u8]) -> Result<Event> {
    if frame.len() != FRAME_LEN {
        return Err(IpcError::Malformed(format!(
            "expected {} bytes, got {}",
            FRAME_LEN,
            frame.len()
        )));
    }

    let tag = frame.get_u32();
    let kind = EventKind::from_tag(tag).ok_or(IpcError::UnknownTag(tag))?;
    let path = get_path(&mut frame)?;
    let old_path = get_path(&mut frame)?;

    Ok(match kind {
        EventKind::Upload => Event::Upload { path },
        EventKind::Remove => Event::Remove { path },
        EventKind::Rename => Event::Rename { old_path, path },
        EventKind::Shutdown => Event::Shutdown,
    })
}

/// Longest prefix of `path` that fits a field without splitting a character.
pub fn truncate_path(path: &str) -> &str {
    if path.len() <= PATH_FIELD_LEN {
        return path;
    }
    let mut end = PATH_FIELD_LEN;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    &path[..end]
}

fn put_path(buf: &mut BytesMut, path: &str) {
    let fitted = truncate_path(path);
    if fitted.len() < path.len() {
        warn!(
            length = path.len(),
            limit = PATH_FIELD_LEN,
            "Path too long for IPC frame, truncating"
        );
    }
    // PATH_FIELD_LEN fits in u16
    buf.put_u16(fitted.len() as u16);
    buf.put_slice(fitted.as_bytes());
    buf.put_bytes(0, PATH_FIELD_LEN - fitted.len());
}

fn get_path(frame: &mut &[u8]) -> Result<String> {
    let len = frame.get_u16() as usize;
    if len > PATH_FIELD_LEN {
        return Err(IpcError::Malformed(format!(
            "path length {} exceeds {}",
            len, PATH_FIELD_LEN
        )));
    }
    let field = &frame[..PATH_FIELD_LEN];
    let path = std::str::from_utf8(&field[..len])
        .map_err(|e| IpcError::Malformed(format!("path is not UTF-8: {}", e)))?
        .to_string();
    frame.advance(PATH_FIELD_LEN);
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_has_fixed_size() {
        assert_eq!(encode(&Event::Shutdown).len(), FRAME_LEN);
        assert_eq!(encode(&Event::upload("/a")).len(), FRAME_LEN);
        assert_eq!(encode(&Event::rename("/a", "/b")).len(), FRAME_LEN);
    }

    #[test]
    fn test_round_trip_preserves_tag_and_paths() {
        for event in [
            Event::upload("/data/in.bin"),
            Event::remove("/data/gone.bin"),
            Event::rename("/data/old.bin", "/data/new.bin"),
            Event::Shutdown,
        ] {
            assert_eq!(decode(&encode(&event)).unwrap(), event);
        }
    }

    #[test]
    fn test_long_path_is_truncated() {
        let long = "a".repeat(PATH_FIELD_LEN + 50);
        let decoded = decode(&encode(&Event::upload(long.clone()))).unwrap();
        assert_eq!(decoded, Event::upload(&long[..PATH_FIELD_LEN]));
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        // 'é' is two bytes; place one across the field limit
        let path = format!("{}é", "a".repeat(PATH_FIELD_LEN - 1));
        let fitted = truncate_path(&path);
        assert_eq!(fitted.len(), PATH_FIELD_LEN - 1);
        assert!(fitted.chars().all(|c| c == 'a'));
    }

    #[test]
    fn test_unknown_tag_is_reported() {
        let mut frame = encode(&Event::upload("/x"));
        frame[..4].copy_from_slice(&9u32.to_be_bytes());
        assert!(matches!(decode(&frame), Err(IpcError::UnknownTag(9))));
    }

    #[test]
    fn test_short_frame_is_malformed() {
        assert!(matches!(decode(&[0u8; 10]), Err(IpcError::Malformed(_))));
    }

    #[test]
    fn test_bad_length_is_malformed() {
        let mut frame = encode(&Event::upload("/x"));
        frame[4..6].copy_from_slice(&u16::MAX.to_be_bytes());
        assert!(matches!(decode(&frame), Err(IpcError::Malformed(_))));
    }
}
