use std::{
    collections::HashSet,
    io::{Read, Seek, SeekFrom},
};

use crate::{error::FlashError, gpt::SECTOR_SIZE};

pub trait PartStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> PartStream for T {}

/// One contiguous payload and the sector it lands on.
pub struct FlashPart {
    pub start_sector: u64,
    pub progress_text: Option<String>,
    stream: Box<dyn PartStream>,
}

impl FlashPart {
    pub fn new(start_sector: u64, stream: impl PartStream + 'static) -> Self {
        Self {
            start_sector,
            progress_text: None,
            stream: Box::new(stream),
        }
    }

    pub fn with_progress_text(mut self, text: impl Into<String>) -> Self {
        self.progress_text = Some(text.into());
        self
    }

    pub fn len(&mut self) -> std::io::Result<u64> {
        let len = self.stream.seek(SeekFrom::End(0))?;
        self.stream.rewind()?;
        Ok(len)
    }

    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.stream.rewind()
    }

    /// Reads up to `buf.len()` bytes at `offset`, then rewinds.
    pub fn peek(&mut self, offset: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream.seek(SeekFrom::Start(offset))?;
        let read = read_full(&mut self.stream, buf)?;
        self.stream.rewind()?;
        Ok(read)
    }
}

fn read_full(stream: &mut dyn PartStream, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match stream.read(&mut buf[filled..])? {
            0 => break,
            read => filled += read,
        }
    }
    Ok(filled)
}

#[derive(Debug, Clone, Copy)]
struct PlannedChunk {
    part: usize,
    chunk_index: u32,
}

/// A payload chunk read from a part, padded to the chunk size.
pub struct Chunk {
    pub index: u32,
    pub data: Vec<u8>,
}

/// Every chunk of every part, in the order they go over the wire.
pub struct ChunkQueue {
    parts: Vec<FlashPart>,
    chunk_size: usize,
    plan: Vec<PlannedChunk>,
    position: usize,
}

impl ChunkQueue {
    pub fn new(mut parts: Vec<FlashPart>, chunk_size: usize) -> Result<Self, FlashError> {
        let mut plan = Vec::new();
        let mut seen = HashSet::new();

        for (part_idx, part) in parts.iter_mut().enumerate() {
            let start = part.start_sector * SECTOR_SIZE as u64;
            if start % chunk_size as u64 != 0 {
                return Err(FlashError::InvalidLayout(format!(
                    "flash part at sector {:#X} does not start on a {chunk_size:#X} byte chunk",
                    part.start_sector
                )));
            }

            let first_chunk = start / chunk_size as u64;
            let chunk_count = part.len()?.div_ceil(chunk_size as u64);

            for chunk_index in first_chunk..first_chunk + chunk_count {
                let chunk_index = u32::try_from(chunk_index).map_err(|_| {
                    FlashError::InvalidLayout(format!("chunk {chunk_index:#X} is out of range"))
                })?;

                if !seen.insert(chunk_index) {
                    return Err(FlashError::InvalidLayout(format!(
                        "chunk {chunk_index:#X} is written by more than one flash part"
                    )));
                }

                plan.push(PlannedChunk {
                    part: part_idx,
                    chunk_index,
                });
            }
        }

        Ok(Self {
            parts,
            chunk_size,
            plan,
            position: 0,
        })
    }

    pub fn total_chunks(&self) -> usize {
        self.plan.len()
    }

    /// Chunks already handed out since the last rewind.
    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.plan.len() - self.position
    }

    pub fn rewind(&mut self) -> std::io::Result<()> {
        self.position = 0;
        self.parts.iter_mut().try_for_each(FlashPart::rewind)
    }

    /// Progress label of the part the chunk at `position` belongs to.
    pub fn progress_text(&self, position: usize) -> Option<&str> {
        let planned = self.plan.get(position)?;
        self.parts[planned.part].progress_text.as_deref()
    }

    /// Reads the next `count` chunks, continuing where the previous call
    /// stopped.
    pub fn next_chunks(&mut self, count: usize) -> std::io::Result<Vec<Chunk>> {
        let end = (self.position + count).min(self.plan.len());
        let mut chunks = Vec::with_capacity(end - self.position);

        for planned in &self.plan[self.position..end] {
            let mut data = vec![0u8; self.chunk_size];
            read_full(&mut self.parts[planned.part].stream, &mut data)?;
            chunks.push(Chunk {
                index: planned.chunk_index,
                data,
            });
        }

        self.position = end;
        Ok(chunks)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn chunks_resume_across_calls() {
        let data = (0..0x2800u32).map(|x| x as u8).collect::<Vec<_>>();
        let parts = vec![
            FlashPart::new(0, Cursor::new(vec![0xEEu8; 0x1000])),
            FlashPart::new(0x40, Cursor::new(data.clone())).with_progress_text("MainOS"),
        ];

        let mut queue = ChunkQueue::new(parts, 0x1000).unwrap();
        assert_eq!(queue.total_chunks(), 4);

        let first = queue.next_chunks(2).unwrap();
        assert_eq!(first[0].index, 0);
        assert_eq!(first[1].index, 8);
        assert_eq!(first[1].data, data[..0x1000]);
        assert_eq!(queue.progress_text(2), Some("MainOS"));

        let rest = queue.next_chunks(5).unwrap();
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[1].index, 10);
        assert_eq!(rest[1].data[..0x800], data[0x2000..]);
        assert!(rest[1].data[0x800..].iter().all(|byte| *byte == 0));
        assert_eq!(queue.remaining(), 0);

        queue.rewind().unwrap();
        assert_eq!(queue.next_chunks(2).unwrap()[1].data, data[..0x1000]);
    }

    #[test]
    fn misaligned_part_is_rejected() {
        let parts = vec![FlashPart::new(3, Cursor::new(vec![0u8; 0x200]))];
        assert!(matches!(
            ChunkQueue::new(parts, 0x1000),
            Err(FlashError::InvalidLayout(_))
        ));
    }

    #[test]
    fn overlapping_parts_are_rejected() {
        let parts = vec![
            FlashPart::new(0, Cursor::new(vec![0u8; 0x2000])),
            FlashPart::new(8, Cursor::new(vec![0u8; 0x200])),
        ];
        assert!(matches!(
            ChunkQueue::new(parts, 0x1000),
            Err(FlashError::InvalidLayout(_))
        ));
    }
}
