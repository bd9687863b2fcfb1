// Ultralytics 🚀 AGPL-3.0 License - https://ultralytics.com/license
//! Wire codec: text commands out, header lines and length-prefixed segments in.
//!
//! All readers are generic over `Read`/`BufRead` so the framing can be
//! exercised against in-memory buffers.

use std::io::{self, BufRead, Read, Write};
use tracing::debug;

use super::{Command, FrameMetadata, FRAME_HEADER, MAX_SEGMENT_LEN, PHOTO_HEADER};
use crate::error::{Result, VisionError};

fn lost(context: &str, e: io::Error) -> VisionError {
    VisionError::ConnectionLost(format!("{}: {}", context, e))
}

/// 发送一条命令 (`cmd + "\n"`)
pub fn write_command<W: Write>(writer: &mut W, cmd: Command) -> Result<()> {
    let line = format!("{}\n", cmd.as_str());
    writer
        .write_all(line.as_bytes())
        .and_then(|_| writer.flush())
        .map_err(|e| lost("write failed", e))
}

/// Reads one `\n`-terminated line. Invalid UTF-8 is replaced, not rejected.
pub fn read_line<R: BufRead>(reader: &mut R) -> Result<String> {
    let mut buf = Vec::with_capacity(64);
    loop {
        match reader.read_until(b'\n', &mut buf) {
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(lost("read line failed", e)),
        }
    }

    if buf.last() != Some(&b'\n') {
        return Err(VisionError::ConnectionLost(
            "connection closed by server".to_string(),
        ));
    }
    buf.pop();
    if buf.last() == Some(&b'\r') {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Reads exactly `n` bytes or fails; a short read is never returned.
pub fn read_exact<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                return Err(VisionError::ConnectionLost(format!(
                    "connection lost while reading data ({} of {} bytes)",
                    filled, n
                )))
            }
            Ok(k) => filled += k,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(lost("read failed", e)),
        }
    }
    Ok(buf)
}

/// 读取4字节大端长度前缀
pub fn read_len<R: Read>(reader: &mut R) -> Result<usize> {
    let raw = read_exact(reader, 4)?;
    let len = i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]);
    // a bad prefix means we can no longer find the next message boundary
    if len < 0 || len as usize > MAX_SEGMENT_LEN {
        return Err(VisionError::ConnectionLost(format!(
            "invalid segment length {}",
            len
        )));
    }
    Ok(len as usize)
}

fn read_segment<R: Read>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    match read_len(reader)? {
        0 => Ok(None),
        n => read_exact(reader, n).map(Some),
    }
}

/// Reads the body of a `GET_FRAME` reply whose header line is `header`.
///
/// Both segments are consumed before the JSON is parsed, so a `Decode` error
/// leaves the stream aligned on the next reply.
pub fn read_frame_response<R: BufRead>(
    reader: &mut R,
    header: &str,
) -> Result<(FrameMetadata, Option<Vec<u8>>)> {
    if !header.starts_with(FRAME_HEADER) {
        debug!(header, "no frame in reply");
        return Ok((FrameMetadata::no_frame(header), None));
    }

    let meta_len = read_len(reader)?;
    let meta_bytes = read_exact(reader, meta_len)?;
    let image = read_segment(reader)?;

    let metadata = serde_json::from_slice::<FrameMetadata>(&meta_bytes)
        .map_err(|e| VisionError::Decode(format!("frame metadata: {}", e)))?;
    Ok((metadata, image))
}

/// Reads the body of a `TAKE_PHOTO` reply. `None` means the capture failed.
pub fn read_photo_response<R: BufRead>(reader: &mut R, header: &str) -> Result<Option<Vec<u8>>> {
    if !header.starts_with(PHOTO_HEADER) {
        debug!(header, "photo capture refused");
        return Ok(None);
    }
    read_segment(reader)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn frame_bytes(meta: &str, image: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(meta.len() as i32).to_be_bytes());
        out.extend_from_slice(meta.as_bytes());
        out.extend_from_slice(&(image.len() as i32).to_be_bytes());
        out.extend_from_slice(image);
        out
    }

    #[test]
    fn test_write_command_appends_newline() {
        let mut out = Vec::new();
        write_command(&mut out, Command::GetFrame).unwrap();
        assert_eq!(out, b"GET_FRAME\n");
    }

    #[test]
    fn test_read_line_lossy() {
        let mut cur = Cursor::new(b"FR\xffME\nrest".to_vec());
        assert_eq!(read_line(&mut cur).unwrap(), "FR\u{fffd}ME");
    }

    #[test]
    fn test_read_line_closed_before_newline() {
        let mut cur = Cursor::new(b"OK:TRACK".to_vec());
        assert!(matches!(
            read_line(&mut cur),
            Err(VisionError::ConnectionLost(_))
        ));

        let mut empty = Cursor::new(Vec::new());
        assert!(matches!(
            read_line(&mut empty),
            Err(VisionError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_read_exact_short_stream() {
        let mut cur = Cursor::new(vec![7u8; 10]);
        match read_exact(&mut cur, 50) {
            Err(VisionError::ConnectionLost(msg)) => assert!(msg.contains("10 of 50")),
            other => panic!("expected ConnectionLost, got {other:?}"),
        }
    }

    /// Reader that hands out at most three bytes per call.
    struct Trickle(Cursor<Vec<u8>>);

    impl Read for Trickle {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(3);
            self.0.read(&mut buf[..n])
        }
    }

    #[test]
    fn test_read_exact_accumulates_partial_reads() {
        let data: Vec<u8> = (0..50).collect();
        let mut r = Trickle(Cursor::new(data.clone()));
        assert_eq!(read_exact(&mut r, 50).unwrap(), data);
    }

    #[test]
    fn test_read_len_rejects_negative() {
        let mut cur = Cursor::new((-1i32).to_be_bytes().to_vec());
        assert!(matches!(
            read_len(&mut cur),
            Err(VisionError::ConnectionLost(_))
        ));
    }

    #[test]
    fn test_frame_with_image() {
        let body = frame_bytes(r#"{"faceDetected":true,"faceNum":1,"faces":[{"x":1,"y":2,"w":3,"h":4}]}"#, b"\xff\xd8jpeg");
        let mut cur = Cursor::new(body);
        let (meta, image) = read_frame_response(&mut cur, "FRAME").unwrap();
        assert!(meta.has_face());
        assert_eq!(image.as_deref(), Some(&b"\xff\xd8jpeg"[..]));
    }

    #[test]
    fn test_frame_without_image() {
        let mut cur = Cursor::new(frame_bytes(r#"{"faceDetected":false}"#, b""));
        let (meta, image) = read_frame_response(&mut cur, "FRAME").unwrap();
        assert!(!meta.face_detected);
        assert!(image.is_none());
    }

    #[test]
    fn test_non_frame_header() {
        let mut cur = Cursor::new(Vec::new());
        let (meta, image) = read_frame_response(&mut cur, "ERROR_NO_CAMERA").unwrap();
        assert_eq!(meta.error.as_deref(), Some("ERROR_NO_CAMERA"));
        assert!(image.is_none());
    }

    #[test]
    fn test_bad_json_keeps_stream_aligned() {
        let mut body = frame_bytes("{not json", b"img");
        body.extend_from_slice(b"OK:NEXT\n");
        let mut cur = Cursor::new(body);

        assert!(matches!(
            read_frame_response(&mut cur, "FRAME"),
            Err(VisionError::Decode(_))
        ));
        assert_eq!(read_line(&mut cur).unwrap(), "OK:NEXT");
    }

    #[test]
    fn test_photo_reply() {
        let mut body = 5i32.to_be_bytes().to_vec();
        body.extend_from_slice(b"photo");
        let mut cur = Cursor::new(body);
        assert_eq!(
            read_photo_response(&mut cur, "PHOTO").unwrap().as_deref(),
            Some(&b"photo"[..])
        );

        let mut cur = Cursor::new(0i32.to_be_bytes().to_vec());
        assert!(read_photo_response(&mut cur, "PHOTO").unwrap().is_none());

        let mut cur = Cursor::new(Vec::new());
        assert!(read_photo_response(&mut cur, "ERR:CAPTURE_FAILED")
            .unwrap()
            .is_none());
    }
}
