use std::io;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::message::{CaptureFailedReason, Message};

/// Upper bound on the variable-length suffix of a single message. Anything
/// larger is a protocol violation, not data.
pub const MAX_SUFFIX_LEN: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("unknown message kind {0}")]
    UnknownKind(u16),
    #[error("message suffix of {0} bytes exceeds the {MAX_SUFFIX_LEN} byte limit")]
    SuffixTooLarge(u64),
    #[error("unknown capture-failed reason {0}")]
    UnknownReason(u32),
    #[error("malformed configuration payload: {0}")]
    Config(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Encode a message into its wire form:
/// `kind: u16 | suffix_len: u64 | fixed header | suffix`, all little-endian.
pub fn encode(message: &Message) -> Vec<u8> {
    let mut header = Vec::with_capacity(32);
    let mut suffix: Vec<u8> = Vec::new();

    match message {
        Message::Ready
        | Message::Shutdown
        | Message::Start
        | Message::CaptureStarted
        | Message::ExecTargetApp => {}
        Message::CaptureReady { pids } => {
            for pid in pids {
                WriteBytesExt::write_i32::<LittleEndian>(&mut suffix, *pid).unwrap();
            }
        }
        Message::CaptureFailed { reason } => {
            WriteBytesExt::write_u32::<LittleEndian>(&mut header, reason.to_wire()).unwrap();
        }
        Message::CaptureConfiguration(config) => {
            suffix = serde_json::to_vec(config).expect("config serializes");
        }
        Message::CpuStateChange {
            monotonic_delta_ns,
            cpu,
            online,
        } => {
            WriteBytesExt::write_u64::<LittleEndian>(&mut header, *monotonic_delta_ns).unwrap();
            WriteBytesExt::write_i32::<LittleEndian>(&mut header, *cpu).unwrap();
            WriteBytesExt::write_u8(&mut header, u8::from(*online)).unwrap();
        }
        Message::AnnotationNewConn { uid } | Message::AnnotationCloseConn { uid } => {
            WriteBytesExt::write_u32::<LittleEndian>(&mut header, *uid).unwrap();
        }
        Message::AnnotationRecvBytes { uid, bytes }
        | Message::AnnotationSendBytes { uid, bytes }
        | Message::GpuTimelineRecv { uid, bytes }
        | Message::GpuTimelineHandshakeTag { uid, bytes } => {
            WriteBytesExt::write_u32::<LittleEndian>(&mut header, *uid).unwrap();
            suffix.extend_from_slice(bytes);
        }
        Message::GpuTimelineConfiguration(config) => {
            suffix = serde_json::to_vec(config).expect("config serializes");
        }
        Message::PerfettoRecvBytes { bytes } | Message::ApcFrameData { bytes } => {
            suffix.extend_from_slice(bytes);
        }
    }

    let mut out = Vec::with_capacity(2 + 8 + header.len() + suffix.len());
    WriteBytesExt::write_u16::<LittleEndian>(&mut out, message.kind()).unwrap();
    WriteBytesExt::write_u64::<LittleEndian>(&mut out, suffix.len() as u64).unwrap();
    out.extend_from_slice(&header);
    out.extend_from_slice(&suffix);
    out
}

/// Write one whole message.
pub async fn write_message<W>(writer: &mut W, message: &Message) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message);
    writer.write_all(&bytes).await?;
    writer.flush().await
}

/// Read one whole message. `Ok(None)` means the peer closed the stream at a
/// frame boundary; EOF in the middle of a frame is an error.
pub async fn read_message<R>(reader: &mut R) -> Result<Option<Message>, WireError>
where
    R: AsyncRead + Unpin,
{
    // Distinguish a clean close (zero bytes before the next frame) from a
    // truncated frame.
    let mut first = [0u8; 1];
    loop {
        match reader.read(&mut first).await {
            Ok(0) => return Ok(None),
            Ok(_) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    let mut second = [0u8; 1];
    reader.read_exact(&mut second).await?;
    let kind = u16::from_le_bytes([first[0], second[0]]);

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes).await?;
    let suffix_len = u64::from_le_bytes(len_bytes);
    if suffix_len > MAX_SUFFIX_LEN {
        return Err(WireError::SuffixTooLarge(suffix_len));
    }

    let header_len = fixed_header_len(kind).ok_or(WireError::UnknownKind(kind))?;
    let mut header = vec![0u8; header_len];
    reader.read_exact(&mut header).await?;
    let mut suffix = vec![0u8; suffix_len as usize];
    reader.read_exact(&mut suffix).await?;

    decode_body(kind, &header, suffix).map(Some)
}

fn fixed_header_len(kind: u16) -> Option<usize> {
    match kind {
        1..=5 | 7 | 8 | 14 | 17 | 18 => Some(0),
        6 => Some(4),
        9 => Some(13),
        10..=13 | 15 | 16 => Some(4),
        _ => None,
    }
}

fn decode_body(kind: u16, mut header: &[u8], suffix: Vec<u8>) -> Result<Message, WireError> {
    let message = match kind {
        1 => Message::Ready,
        2 => Message::Shutdown,
        3 => Message::Start,
        4 => Message::CaptureStarted,
        5 => {
            let mut pids = Vec::with_capacity(suffix.len() / 4);
            let mut rest = &suffix[..suffix.len() - suffix.len() % 4];
            while !rest.is_empty() {
                pids.push(ReadBytesExt::read_i32::<LittleEndian>(&mut rest)?);
            }
            Message::CaptureReady { pids }
        }
        6 => {
            let raw = ReadBytesExt::read_u32::<LittleEndian>(&mut header)?;
            let reason =
                CaptureFailedReason::from_wire(raw).ok_or(WireError::UnknownReason(raw))?;
            Message::CaptureFailed { reason }
        }
        7 => Message::ExecTargetApp,
        8 => Message::CaptureConfiguration(serde_json::from_slice(&suffix)?),
        9 => {
            let monotonic_delta_ns = ReadBytesExt::read_u64::<LittleEndian>(&mut header)?;
            let cpu = ReadBytesExt::read_i32::<LittleEndian>(&mut header)?;
            let online = ReadBytesExt::read_u8(&mut header)? != 0;
            Message::CpuStateChange {
                monotonic_delta_ns,
                cpu,
                online,
            }
        }
        10 => Message::AnnotationNewConn {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
        },
        11 => Message::AnnotationRecvBytes {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
            bytes: suffix,
        },
        12 => Message::AnnotationSendBytes {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
            bytes: suffix,
        },
        13 => Message::AnnotationCloseConn {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
        },
        14 => Message::GpuTimelineConfiguration(serde_json::from_slice(&suffix)?),
        15 => Message::GpuTimelineRecv {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
            bytes: suffix,
        },
        16 => Message::GpuTimelineHandshakeTag {
            uid: ReadBytesExt::read_u32::<LittleEndian>(&mut header)?,
            bytes: suffix,
        },
        17 => Message::PerfettoRecvBytes { bytes: suffix },
        18 => Message::ApcFrameData { bytes: suffix },
        other => return Err(WireError::UnknownKind(other)),
    };
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::super::message::{CaptureConfig, GpuTimelineConfig};
    use super::*;

    fn sample_messages() -> Vec<Message> {
        vec![
            Message::Ready,
            Message::Shutdown,
            Message::Start,
            Message::CaptureStarted,
            Message::CaptureReady {
                pids: vec![1, 99, -3],
            },
            Message::CaptureFailed {
                reason: CaptureFailedReason::WaitForCoresReadyFailed,
            },
            Message::ExecTargetApp,
            Message::CaptureConfiguration(CaptureConfig {
                sample_frequency: 997,
                data_buffer_size: 1 << 16,
                aux_buffer_size: 0,
                one_shot_limit: 10_000,
                live_mode: true,
                command: Some(vec!["ls".into(), "-l".into()]),
                wait_process: None,
                android_package: Some("com.example.app".into()),
            }),
            Message::CpuStateChange {
                monotonic_delta_ns: 123_456_789,
                cpu: 3,
                online: false,
            },
            Message::AnnotationNewConn { uid: 17 },
            Message::AnnotationRecvBytes {
                uid: 17,
                bytes: b"hello".to_vec(),
            },
            Message::AnnotationSendBytes {
                uid: 17,
                bytes: vec![0, 1, 2, 255],
            },
            Message::AnnotationCloseConn { uid: 17 },
            Message::GpuTimelineConfiguration(GpuTimelineConfig {
                enabled: true,
                layer_libs: vec!["libGpuTimeline.so".into()],
                package_name: None,
            }),
            Message::GpuTimelineRecv {
                uid: 18,
                bytes: vec![9; 300],
            },
            Message::GpuTimelineHandshakeTag {
                uid: 18,
                bytes: b"ESTATE".to_vec(),
            },
            Message::PerfettoRecvBytes {
                bytes: vec![5; 1024],
            },
            Message::ApcFrameData {
                bytes: vec![1, 2, 3],
            },
        ]
    }

    #[tokio::test]
    async fn every_variant_round_trips() {
        for message in sample_messages() {
            let mut stream: &[u8] = &encode(&message);
            let decoded = read_message(&mut stream).await.unwrap().unwrap();
            assert_eq!(decoded, message, "{} did not round trip", message.name());
            assert!(stream.is_empty(), "{} left trailing bytes", message.name());
        }
    }

    #[tokio::test]
    async fn messages_are_read_back_to_back() {
        let mut bytes = Vec::new();
        for message in sample_messages() {
            bytes.extend_from_slice(&encode(&message));
        }
        let mut stream: &[u8] = &bytes;
        for expected in sample_messages() {
            let decoded = read_message(&mut stream).await.unwrap().unwrap();
            assert_eq!(decoded, expected);
        }
        assert!(read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn clean_eof_is_not_an_error() {
        let mut stream: &[u8] = &[];
        assert!(read_message(&mut stream).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let bytes = encode(&Message::AnnotationRecvBytes {
            uid: 1,
            bytes: vec![0; 64],
        });
        let mut stream: &[u8] = &bytes[..bytes.len() - 1];
        assert!(read_message(&mut stream).await.is_err());
    }

    #[tokio::test]
    async fn unknown_kind_is_rejected() {
        let mut bytes = encode(&Message::Ready);
        bytes[0] = 0xfe;
        bytes[1] = 0xff;
        let mut stream: &[u8] = &bytes;
        match read_message(&mut stream).await {
            Err(WireError::UnknownKind(0xfffe)) => {}
            other => panic!("expected unknown kind error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_suffix_is_rejected() {
        let mut bytes = encode(&Message::Ready);
        bytes[2..10].copy_from_slice(&(MAX_SUFFIX_LEN + 1).to_le_bytes());
        let mut stream: &[u8] = &bytes;
        assert!(matches!(
            read_message(&mut stream).await,
            Err(WireError::SuffixTooLarge(_))
        ));
    }
}
