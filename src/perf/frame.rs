use std::io;

use byteorder::{LittleEndian, WriteBytesExt};

/// Upper bound on one APC frame, matching the transport's chunk limit.
pub const MAX_FRAME_PAYLOAD: usize = 100 * 1024;

/// Target size for one perf-data batch; kept well under the frame bound so a
/// full batch plus its headers always fits.
pub const DATA_BATCH_TARGET: usize = 64 * 1024;

/// Frame type tags on the capture stream.
pub mod frame_type {
    pub const SUMMARY: u32 = 1;
    pub const CORE_NAME: u32 = 2;
    pub const CPU_ONLINE: u32 = 3;
    pub const PERF_DATA: u32 = 4;
    pub const PERF_AUX: u32 = 5;
    pub const COUNTERS: u32 = 6;
    pub const KEYS: u32 = 7;
    pub const KALLSYMS: u32 = 8;
    pub const PROCESS: u32 = 9;
}

// frame type + cpu + tail + size
const AUX_HEADER_SIZE: usize = 4 + 4 + 8 + 4;

/// Emit `PERF_AUX` frames covering `[tail, head)` of the aux ring.
///
/// The effective region is clamped to the buffer length (a lapped producer
/// loses the overwritten span), and each frame carries at most
/// `MAX_FRAME_PAYLOAD - header` bytes. A region that straddles the wrap
/// boundary is copied from its two spans directly into the frame.
pub fn encode_aux_frames<F>(
    cpu: i32,
    tail: u64,
    head: u64,
    region: &[u8],
    mut emit: F,
) -> io::Result<()>
where
    F: FnMut(Vec<u8>) -> io::Result<()>,
{
    if head <= tail {
        return Ok(());
    }
    let length = region.len() as u64;
    let buffer_mask = length - 1;
    let max_chunk = (MAX_FRAME_PAYLOAD - AUX_HEADER_SIZE) as u64;

    let total = (head - tail).min(length);
    let mut tail = head - total;

    while tail < head {
        let this_head = (tail + max_chunk).min(head);
        let size = (this_head - tail) as usize;

        let tail_masked = (tail & buffer_mask) as usize;
        let head_masked = (this_head & buffer_mask) as usize;
        let wrapped = head_masked < tail_masked;

        let first_size = if wrapped {
            length as usize - tail_masked
        } else {
            size
        };
        let second_size = if wrapped { head_masked } else { 0 };

        let mut frame = Vec::with_capacity(AUX_HEADER_SIZE + size);
        frame.write_u32::<LittleEndian>(frame_type::PERF_AUX).unwrap();
        frame.write_i32::<LittleEndian>(cpu).unwrap();
        frame.write_u64::<LittleEndian>(tail).unwrap();
        frame.write_u32::<LittleEndian>(size as u32).unwrap();
        frame.extend_from_slice(&region[tail_masked..tail_masked + first_size]);
        frame.extend_from_slice(&region[..second_size]);
        emit(frame)?;

        tail = this_head;
    }
    Ok(())
}

/// Accumulates perf data records into `PERF_DATA` frames:
/// `{ frame type, cpu, block length, record bytes }`, flushed whenever the
/// batch target is reached.
pub struct DataFrameBuilder {
    cpu: i32,
    frame: Vec<u8>,
}

// frame type + cpu + block length
const DATA_HEADER_SIZE: usize = 4 + 4 + 4;

impl DataFrameBuilder {
    pub fn new(cpu: i32) -> Self {
        DataFrameBuilder {
            cpu,
            frame: Vec::new(),
        }
    }

    /// Append one record given as up to two contiguous spans (the second is
    /// the wrapped part). Flushes the current frame first if the record
    /// would push it past the batch target.
    pub fn push_record<F>(
        &mut self,
        first: &[u8],
        second: &[u8],
        emit: &mut F,
    ) -> io::Result<()>
    where
        F: FnMut(Vec<u8>) -> io::Result<()>,
    {
        let record_len = first.len() + second.len();
        if !self.frame.is_empty() && self.frame.len() + record_len > DATA_BATCH_TARGET {
            self.flush(emit)?;
        }
        if self.frame.is_empty() {
            self.frame
                .write_u32::<LittleEndian>(frame_type::PERF_DATA)
                .unwrap();
            self.frame.write_i32::<LittleEndian>(self.cpu).unwrap();
            // Patched with the block length on flush.
            self.frame.write_u32::<LittleEndian>(0).unwrap();
        }
        self.frame.extend_from_slice(first);
        self.frame.extend_from_slice(second);
        Ok(())
    }

    /// Emit the pending frame, if any.
    pub fn flush<F>(&mut self, emit: &mut F) -> io::Result<()>
    where
        F: FnMut(Vec<u8>) -> io::Result<()>,
    {
        if self.frame.is_empty() {
            return Ok(());
        }
        let block_len = (self.frame.len() - DATA_HEADER_SIZE) as u32;
        self.frame[8..12].copy_from_slice(&block_len.to_le_bytes());
        emit(std::mem::take(&mut self.frame))
    }
}

fn write_string(frame: &mut Vec<u8>, value: &str) {
    frame
        .write_u32::<LittleEndian>(value.len() as u32)
        .unwrap();
    frame.extend_from_slice(value.as_bytes());
}

/// The capture-level summary frame.
pub fn summary_frame(
    monotonic_raw_start: u64,
    monotonic_start: u64,
    page_size: u32,
    uname: &str,
) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.write_u32::<LittleEndian>(frame_type::SUMMARY).unwrap();
    frame
        .write_u64::<LittleEndian>(monotonic_raw_start)
        .unwrap();
    frame.write_u64::<LittleEndian>(monotonic_start).unwrap();
    frame.write_u32::<LittleEndian>(page_size).unwrap();
    write_string(&mut frame, uname);
    frame
}

/// Name and identification of one core.
pub fn core_name_frame(cpu: i32, cpuid: u32, name: &str) -> Vec<u8> {
    let mut frame = Vec::new();
    frame
        .write_u32::<LittleEndian>(frame_type::CORE_NAME)
        .unwrap();
    frame.write_i32::<LittleEndian>(cpu).unwrap();
    frame.write_u32::<LittleEndian>(cpuid).unwrap();
    write_string(&mut frame, name);
    frame
}

/// One hot-plug edge on the capture timeline.
pub fn cpu_online_frame(monotonic_delta: u64, cpu: i32, online: bool) -> Vec<u8> {
    let mut frame = Vec::new();
    frame
        .write_u32::<LittleEndian>(frame_type::CPU_ONLINE)
        .unwrap();
    frame.write_u64::<LittleEndian>(monotonic_delta).unwrap();
    frame.write_i32::<LittleEndian>(cpu).unwrap();
    frame.write_u8(u8::from(online)).unwrap();
    frame
}

/// One counter sample.
pub fn counter_frame(monotonic_delta: u64, cpu: i32, key: u32, value: u64) -> Vec<u8> {
    let mut frame = Vec::new();
    frame
        .write_u32::<LittleEndian>(frame_type::COUNTERS)
        .unwrap();
    frame.write_u64::<LittleEndian>(monotonic_delta).unwrap();
    frame.write_i32::<LittleEndian>(cpu).unwrap();
    frame.write_u32::<LittleEndian>(key).unwrap();
    frame.write_u64::<LittleEndian>(value).unwrap();
    frame
}

/// One chunk of /proc/kallsyms; the symbol table is streamed as a sequence
/// of these.
pub fn kallsyms_frame(offset: u64, chunk: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(16 + chunk.len());
    frame
        .write_u32::<LittleEndian>(frame_type::KALLSYMS)
        .unwrap();
    frame.write_u64::<LittleEndian>(offset).unwrap();
    frame
        .write_u32::<LittleEndian>(chunk.len() as u32)
        .unwrap();
    frame.extend_from_slice(chunk);
    frame
}

/// Static properties of one traced process: command name, command line and
/// the maps table, each length-prefixed.
pub fn process_frame(pid: i32, comm: &[u8], cmdline: &[u8], maps: &[u8]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame
        .write_u32::<LittleEndian>(frame_type::PROCESS)
        .unwrap();
    frame.write_i32::<LittleEndian>(pid).unwrap();
    for part in [comm, cmdline, maps] {
        frame.write_u32::<LittleEndian>(part.len() as u32).unwrap();
        frame.extend_from_slice(part);
    }
    frame
}

/// The key-to-event-id mapping table sent before counters start flowing.
pub fn keys_frame(mappings: &[(u32, u64)]) -> Vec<u8> {
    let mut frame = Vec::new();
    frame.write_u32::<LittleEndian>(frame_type::KEYS).unwrap();
    frame
        .write_u32::<LittleEndian>(mappings.len() as u32)
        .unwrap();
    for (key, id) in mappings {
        frame.write_u32::<LittleEndian>(*key).unwrap();
        frame.write_u64::<LittleEndian>(*id).unwrap();
    }
    frame
}

#[cfg(test)]
mod tests {
    use byteorder::ReadBytesExt;

    use super::*;

    fn parse_aux_header(frame: &[u8]) -> (u32, i32, u64, u32) {
        let mut cursor: &[u8] = frame;
        (
            cursor.read_u32::<LittleEndian>().unwrap(),
            cursor.read_i32::<LittleEndian>().unwrap(),
            cursor.read_u64::<LittleEndian>().unwrap(),
            cursor.read_u32::<LittleEndian>().unwrap(),
        )
    }

    #[test]
    fn aux_frames_cover_the_region_in_order() {
        let region: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        let mut frames = Vec::new();
        encode_aux_frames(2, 100, 1100, &region, |f| {
            frames.push(f);
            Ok(())
        })
        .unwrap();

        assert_eq!(frames.len(), 1);
        let (kind, cpu, tail, size) = parse_aux_header(&frames[0]);
        assert_eq!(kind, frame_type::PERF_AUX);
        assert_eq!(cpu, 2);
        assert_eq!(tail, 100);
        assert_eq!(size, 1000);
        assert_eq!(&frames[0][AUX_HEADER_SIZE..], &region[100..1100]);
    }

    #[test]
    fn aux_frames_handle_the_wrap_boundary() {
        let region: Vec<u8> = (0..1024u32).map(|i| (i % 256) as u8).collect();
        let mut frames = Vec::new();
        // [1000, 1100) in a 1024-byte ring wraps at 1024.
        encode_aux_frames(0, 1000, 1100, &region, |f| {
            frames.push(f);
            Ok(())
        })
        .unwrap();

        assert_eq!(frames.len(), 1);
        let mut expected = Vec::new();
        expected.extend_from_slice(&region[1000 % 1024..]);
        expected.extend_from_slice(&region[..1100 % 1024]);
        assert_eq!(&frames[0][AUX_HEADER_SIZE..], &expected[..]);
    }

    #[test]
    fn aux_overrun_is_clamped_to_the_buffer_length() {
        // The producer lapped us: only the last `len` bytes survive.
        let region = vec![7u8; 1024];
        let mut frames = Vec::new();
        encode_aux_frames(1, 0, 16 * 1024, &region, |f| {
            frames.push(f);
            Ok(())
        })
        .unwrap();
        let total: usize = frames
            .iter()
            .map(|f| f.len() - AUX_HEADER_SIZE)
            .sum();
        assert_eq!(total, 1024);
        let (_, _, tail, _) = parse_aux_header(&frames[0]);
        assert_eq!(tail, 16 * 1024 - 1024);
    }

    #[test]
    fn aux_frames_respect_the_payload_bound() {
        let region = vec![1u8; 1 << 20];
        let mut frames = Vec::new();
        encode_aux_frames(0, 0, 1 << 19, &region, |f| {
            frames.push(f);
            Ok(())
        })
        .unwrap();
        assert!(frames.len() > 1);
        for frame in &frames {
            assert!(frame.len() <= MAX_FRAME_PAYLOAD);
        }
        let total: usize = frames.iter().map(|f| f.len() - AUX_HEADER_SIZE).sum();
        assert_eq!(total, 1 << 19);
    }

    #[test]
    fn data_builder_batches_and_patches_block_length() {
        let mut frames = Vec::new();
        let mut emit = |f: Vec<u8>| {
            frames.push(f);
            Ok(())
        };
        let mut builder = DataFrameBuilder::new(3);
        builder.push_record(&[1u8; 100], &[], &mut emit).unwrap();
        builder.push_record(&[2u8; 50], &[3u8; 10], &mut emit).unwrap();
        builder.flush(&mut emit).unwrap();

        assert_eq!(frames.len(), 1);
        let frame = &frames[0];
        let mut cursor: &[u8] = frame;
        assert_eq!(
            cursor.read_u32::<LittleEndian>().unwrap(),
            frame_type::PERF_DATA
        );
        assert_eq!(cursor.read_i32::<LittleEndian>().unwrap(), 3);
        assert_eq!(cursor.read_u32::<LittleEndian>().unwrap(), 160);
        assert_eq!(frame.len(), DATA_HEADER_SIZE + 160);
    }

    #[test]
    fn data_builder_flushes_when_the_target_is_reached() {
        let mut frames = Vec::new();
        let mut emit = |f: Vec<u8>| {
            frames.push(f);
            Ok(())
        };
        let mut builder = DataFrameBuilder::new(0);
        let record = vec![0u8; 24 * 1024];
        for _ in 0..3 {
            builder.push_record(&record, &[], &mut emit).unwrap();
        }
        builder.flush(&mut emit).unwrap();

        // 72 KiB of records against a 64 KiB target: two frames.
        assert_eq!(frames.len(), 2);
        for frame in &frames {
            assert!(frame.len() <= DATA_HEADER_SIZE + DATA_BATCH_TARGET);
        }
    }

    #[test]
    fn misc_frames_carry_their_tags() {
        use byteorder::LittleEndian as LE;
        let mut s: &[u8] = &summary_frame(1, 2, 4096, "Linux test");
        assert_eq!(s.read_u32::<LE>().unwrap(), frame_type::SUMMARY);
        let mut c: &[u8] = &core_name_frame(0, 0xd0a, "Cortex-A55");
        assert_eq!(c.read_u32::<LE>().unwrap(), frame_type::CORE_NAME);
        let mut o: &[u8] = &cpu_online_frame(5, 1, true);
        assert_eq!(o.read_u32::<LE>().unwrap(), frame_type::CPU_ONLINE);
        let mut k: &[u8] = &counter_frame(5, 1, 7, 1_000_000);
        assert_eq!(k.read_u32::<LE>().unwrap(), frame_type::COUNTERS);
        let mut m: &[u8] = &keys_frame(&[(1, 42)]);
        assert_eq!(m.read_u32::<LE>().unwrap(), frame_type::KEYS);
    }
}
