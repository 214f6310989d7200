//! File data pipeline
//!
//! Regular file contents are cut into blocks, compressed on worker threads
//! and written to the image in submission order. Sequence numbers are
//! assigned at enqueue time and define the apply order no matter which
//! worker finishes first, so the output is byte-identical for any worker
//! count. The apply step, run on the submitting thread, also maintains the
//! block location log used for whole-file deduplication and packs sub-block
//! tails into shared fragment blocks.

use std::collections::{BTreeMap, VecDeque};
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

use deku::prelude::*;
use tracing::{instrument, trace};

use crate::compressor::FilesystemCompressor;
use crate::error::SqfsError;
use crate::fragment::Fragment;

/// Submit-side flags, also carried through the pipeline
pub const BLK_FIRST_BLOCK: u32 = 1 << 0;
pub const BLK_LAST_BLOCK: u32 = 1 << 1;
/// Pad the image to the device block size before and after this file
pub const BLK_ALIGN: u32 = 1 << 2;
/// A sub-block tail destined for a shared fragment block
pub const BLK_IS_FRAGMENT: u32 = 1 << 3;
/// A closed fragment block on its way to disk
pub const BLK_FRAGMENT_BLOCK: u32 = 1 << 4;
/// Set by the worker when compression paid off
pub const BLK_IS_COMPRESSED: u32 = 1 << 5;
pub const BLK_DONT_COMPRESS: u32 = 1 << 6;
pub const BLK_DONT_HASH: u32 = 1 << 7;
/// Store a short tail as a block of its own instead of a fragment
pub const BLK_DONT_FRAGMENT: u32 = 1 << 8;

/// Flags a caller may pass into [`DataWriter::write_file`]
pub const BLK_USER_SETTABLE: u32 =
    BLK_ALIGN | BLK_DONT_COMPRESS | BLK_DONT_HASH | BLK_DONT_FRAGMENT;

// bitflag for data size fields signifying that the data is uncompressed
const DATA_STORED_UNCOMPRESSED: u32 = 1 << 24;

#[derive(Copy, Clone, Debug, PartialEq, Eq, DekuRead, DekuWrite)]
#[deku(endian = "endian", ctx = "endian: deku::ctx::Endian")]
pub struct DataSize(u32);

impl DataSize {
    pub fn new(size: u32, uncompressed: bool) -> Self {
        let mut value = size;
        if uncompressed {
            value |= DATA_STORED_UNCOMPRESSED;
        }
        Self(value)
    }

    pub fn uncompressed(&self) -> bool {
        self.0 & DATA_STORED_UNCOMPRESSED != 0
    }

    pub fn size(&self) -> u32 {
        self.0 & !DATA_STORED_UNCOMPRESSED
    }

    pub fn raw(&self) -> u32 {
        self.0
    }
}

/// 64 bit dedup hash: on-disk size (with the uncompressed bit) over the
/// CRC32 of the uncompressed payload
fn mk_blk_hash(chksum: u32, size: u32) -> u64 {
    (u64::from(size) << 32) | u64::from(chksum)
}

fn crc32(bytes: &[u8]) -> u32 {
    let mut crc = flate2::Crc::new();
    crc.update(bytes);
    crc.sum()
}

/// Output file contract of the data writer: sequential writes plus the
/// ability to cut the file back after a duplicate is detected
pub trait SqfsFile: Write + Seek {
    fn truncate(&mut self, size: u64) -> io::Result<()>;
}

impl SqfsFile for std::fs::File {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }
}

impl SqfsFile for Cursor<Vec<u8>> {
    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.get_mut().truncate(size as usize);
        Ok(())
    }
}

/// One unit of work in the pipeline
#[derive(Debug)]
struct Block {
    sequence: u32,
    /// Block index within the owning file, or the fragment table index for
    /// fragment blocks
    index: u32,
    flags: u32,
    /// Index into the writer's packed file list, unused for fragment blocks
    file_id: u32,
    checksum: u32,
    data: Vec<u8>,
}

/// Block location log entry
#[derive(Debug, Clone, Copy)]
struct BlkInfo {
    offset: u64,
    hash: u64,
}

/// In-memory fragment record used for tail deduplication
#[derive(Debug, Clone, Copy)]
struct FragInfo {
    index: u32,
    offset: u32,
    hash: u64,
}

/// Where a packed file ended up
#[derive(Debug, Default, Clone)]
pub struct PackedFile {
    pub start_block: u64,
    pub block_sizes: Vec<DataSize>,
    /// `(fragment table index, offset inside the fragment block)`
    pub fragment: Option<(u32, u32)>,
    pub file_len: u64,
}

/// Counters surfaced to the progress sink of the caller
#[derive(Debug, Default, Clone, Copy)]
pub struct PackStats {
    pub file_count: u64,
    pub bytes_read: u64,
    pub blocks_written: u64,
    pub frag_count: u64,
    pub frag_blocks_written: u64,
    pub duplicate_blocks: u64,
    pub duplicate_frags: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeStatus {
    Ok,
    Failed,
    Cancelled,
}

struct PipeState {
    queue: VecDeque<Block>,
    /// Reorder buffer of completed blocks keyed by sequence number
    done: BTreeMap<u32, Block>,
    backlog: usize,
    enqueue_id: u32,
    dequeue_id: u32,
    status: PipeStatus,
    first_error: Option<SqfsError>,
}

impl PipeState {
    fn fail(&mut self, error: SqfsError) {
        if self.status == PipeStatus::Ok {
            self.status = PipeStatus::Failed;
            self.first_error = Some(error);
        }
    }

    fn take_error(&mut self) -> SqfsError {
        self.first_error.take().unwrap_or(SqfsError::Cancelled)
    }
}

struct Shared {
    state: Mutex<PipeState>,
    /// New work or shutdown
    queue_cond: Condvar,
    /// A result landed in the reorder buffer
    done_cond: Condvar,
}

/// Compress and checksum one block on a worker thread
fn do_block(block: &mut Block, cmp: &FilesystemCompressor) -> Result<(), SqfsError> {
    if block.flags & BLK_DONT_HASH == 0 {
        block.checksum = crc32(&block.data);
    }

    // fragment tails travel uncompressed, the shared fragment block is
    // compressed instead
    if !block.data.is_empty()
        && block.flags & (BLK_IS_FRAGMENT | BLK_DONT_COMPRESS) == 0
    {
        if let Some(cb) = cmp.compress(&block.data)? {
            block.data = cb;
            block.flags |= BLK_IS_COMPRESSED;
        }
    }
    Ok(())
}

fn worker_proc(shared: Arc<Shared>, cmp: FilesystemCompressor) {
    let mut finished: Option<Block> = None;
    let mut result: Result<(), SqfsError> = Ok(());

    loop {
        let mut state = shared.state.lock().unwrap();
        if let Some(block) = finished.take() {
            match std::mem::replace(&mut result, Ok(())) {
                Ok(()) => {
                    state.done.insert(block.sequence, block);
                    shared.done_cond.notify_all();
                },
                Err(error) => {
                    // block is dropped, the sticky error wakes everybody
                    state.fail(error);
                    shared.queue_cond.notify_all();
                    shared.done_cond.notify_all();
                },
            }
        }

        while state.queue.is_empty() && state.status == PipeStatus::Ok {
            state = shared.queue_cond.wait(state).unwrap();
        }
        if state.status != PipeStatus::Ok {
            break;
        }

        let mut block = state.queue.pop_front().unwrap();
        drop(state);

        result = do_block(&mut block, &cmp);
        finished = Some(block);
    }
}

/// Parallel block compressor and ordered image writer
pub struct DataWriter<W: SqfsFile> {
    file: W,
    file_size: u64,
    block_size: u32,
    devblksz: u64,
    max_backlog: usize,
    cmp: FilesystemCompressor,

    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
    /// Sticky: once the backlog filled up for the first time, every later
    /// enqueue wakes the workers
    notify_threads: bool,

    // the submitter is the only one to touch the file and these tables
    blocks: Vec<BlkInfo>,
    start: u64,
    file_start: usize,
    fragments: Vec<Fragment>,
    frag_list: Vec<FragInfo>,
    frag_block: Option<Block>,
    files: Vec<PackedFile>,
    stats: PackStats,
    finished: bool,
}

impl<W: SqfsFile> DataWriter<W> {
    /// `file` is taken at its current end; everything before it (superblock,
    /// compressor options) stays untouched
    #[instrument(skip_all)]
    pub fn new(
        mut file: W,
        cmp: FilesystemCompressor,
        block_size: u32,
        num_workers: usize,
        max_backlog: usize,
        devblksz: u64,
    ) -> Result<Self, SqfsError> {
        let num_workers = num_workers.max(1);
        let file_size = file.seek(SeekFrom::End(0))?;

        let shared = Arc::new(Shared {
            state: Mutex::new(PipeState {
                queue: VecDeque::new(),
                done: BTreeMap::new(),
                backlog: 0,
                enqueue_id: 0,
                dequeue_id: 0,
                status: PipeStatus::Ok,
                first_error: None,
            }),
            queue_cond: Condvar::new(),
            done_cond: Condvar::new(),
        });

        let mut workers = Vec::with_capacity(num_workers);
        for i in 0..num_workers {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("blk-compress-{i}"))
                .spawn(move || worker_proc(shared, cmp))?;
            workers.push(handle);
        }

        Ok(Self {
            file,
            file_size,
            block_size,
            devblksz,
            max_backlog,
            cmp,
            shared,
            workers,
            notify_threads: false,
            blocks: vec![],
            start: 0,
            file_start: 0,
            fragments: vec![],
            frag_list: vec![],
            frag_block: None,
            files: vec![],
            stats: PackStats::default(),
            finished: false,
        })
    }

    /// Cut `size` bytes from `reader` into blocks and submit them.
    ///
    /// A tail shorter than the block size becomes a fragment unless
    /// `BLK_DONT_FRAGMENT` is given. Returns the id later used to look the
    /// result up in [`Self::into_parts`].
    #[instrument(skip_all)]
    pub fn write_file<R: Read>(
        &mut self,
        reader: &mut R,
        size: u64,
        flags: u32,
    ) -> Result<u32, SqfsError> {
        let flags = flags & BLK_USER_SETTABLE;
        let file_id = self.files.len() as u32;
        self.files.push(PackedFile {
            file_len: size,
            ..PackedFile::default()
        });
        self.stats.file_count += 1;
        self.stats.bytes_read += size;

        let block_size = u64::from(self.block_size);
        let full_blocks = size / block_size;
        let tail = (size % block_size) as usize;
        let tail_is_fragment = tail > 0 && flags & BLK_DONT_FRAGMENT == 0;
        let block_count = full_blocks + u64::from(tail > 0 && !tail_is_fragment);

        for i in 0..block_count {
            let len = if i < full_blocks {
                block_size as usize
            } else {
                tail
            };
            let mut data = vec![0u8; len];
            reader.read_exact(&mut data)?;

            let mut block_flags = flags;
            if i == 0 {
                block_flags |= BLK_FIRST_BLOCK;
            }
            if i == block_count - 1 {
                block_flags |= BLK_LAST_BLOCK;
            }
            self.enqueue(Block {
                sequence: 0,
                index: i as u32,
                flags: block_flags,
                file_id,
                checksum: 0,
                data,
            })?;
        }

        if tail_is_fragment {
            let mut data = vec![0u8; tail];
            reader.read_exact(&mut data)?;
            self.enqueue(Block {
                sequence: 0,
                index: 0,
                flags: flags | BLK_IS_FRAGMENT,
                file_id,
                checksum: 0,
                data,
            })?;
        }

        Ok(file_id)
    }

    fn current_backlog(&self) -> usize {
        self.shared.state.lock().unwrap().backlog
    }

    fn enqueue(&mut self, block: Block) -> Result<(), SqfsError> {
        while self.current_backlog() > self.max_backlog {
            self.wait_completed()?;
        }

        if self.current_backlog() == self.max_backlog {
            self.notify_threads = true;
        }

        self.append_to_work_queue(Some(block), self.notify_threads)
    }

    fn append_to_work_queue(
        &mut self,
        block: Option<Block>,
        signal_threads: bool,
    ) -> Result<(), SqfsError> {
        let mut state = self.shared.state.lock().unwrap();
        match state.status {
            PipeStatus::Ok => {},
            PipeStatus::Failed => return Err(state.take_error()),
            PipeStatus::Cancelled => return Err(SqfsError::Cancelled),
        }

        if let Some(mut block) = block {
            block.sequence = state.enqueue_id;
            state.enqueue_id = state.enqueue_id.wrapping_add(1);
            state.queue.push_back(block);
            state.backlog += 1;
        }

        if signal_threads {
            self.shared.queue_cond.notify_all();
        }
        Ok(())
    }

    /// Pull the applicable prefix out of the reorder buffer and apply it,
    /// waiting for workers when nothing lines up yet
    fn wait_completed(&mut self) -> Result<(), SqfsError> {
        let batch;
        {
            let mut state = self.shared.state.lock().unwrap();
            loop {
                let queue = Self::try_dequeue(&mut state);
                if !queue.is_empty() {
                    batch = queue;
                    break;
                }
                if state.status != PipeStatus::Ok {
                    return Err(state.take_error());
                }
                state = self.shared.done_cond.wait(state).unwrap();
            }
        }

        if let Err(error) = self.process_done_queue(batch) {
            let mut state = self.shared.state.lock().unwrap();
            if state.status == PipeStatus::Ok {
                state.status = PipeStatus::Failed;
                self.shared.queue_cond.notify_all();
            }
            return Err(error);
        }
        Ok(())
    }

    fn try_dequeue(state: &mut PipeState) -> VecDeque<Block> {
        let mut queue = VecDeque::new();
        while let Some((&sequence, _)) = state.done.first_key_value() {
            if sequence != state.dequeue_id {
                break;
            }
            let (_, block) = state.done.pop_first().unwrap();
            state.dequeue_id = state.dequeue_id.wrapping_add(1);
            queue.push_back(block);
        }
        queue
    }

    fn process_done_queue(&mut self, mut queue: VecDeque<Block>) -> Result<(), SqfsError> {
        while let Some(block) = queue.pop_front() {
            self.shared.state.lock().unwrap().backlog -= 1;

            if block.flags & BLK_IS_FRAGMENT != 0 {
                let sequence = block.sequence;
                let closed = self.process_completed_fragment(block)?;

                if let Some(mut frag_block) = closed {
                    // the closed fragment block is squeezed back into the
                    // pipeline at the fragment's position, so the on-disk
                    // layout only depends on submission order
                    let mut state = self.shared.state.lock().unwrap();
                    debug_assert!(state
                        .done
                        .first_key_value()
                        .map_or(true, |(&k, _)| k > sequence));
                    debug_assert!(state.dequeue_id > sequence);

                    state.dequeue_id = sequence;
                    frag_block.sequence = sequence;
                    state.queue.push_front(frag_block);
                    state.backlog += 1;
                    for block in queue.drain(..) {
                        state.done.insert(block.sequence, block);
                    }
                    self.shared.queue_cond.notify_all();
                    break;
                }
            } else {
                self.process_completed_block(block)?;
            }
        }
        Ok(())
    }

    /// Zero-pad the file to the device block size; the padding is logged so
    /// a dedup match can never run through it
    fn align_file(&mut self, flags: u32) -> Result<(), SqfsError> {
        if flags & BLK_ALIGN == 0 || self.devblksz == 0 {
            return Ok(());
        }

        let diff = self.file_size % self.devblksz;
        if diff == 0 {
            return Ok(());
        }
        let padding = vec![0u8; (self.devblksz - diff) as usize];

        let chksum = crc32(&padding);
        let offset = self.file_size;
        self.file.write_all(&padding)?;
        self.file_size += padding.len() as u64;

        self.store_block_location(
            offset,
            padding.len() as u32 | DATA_STORED_UNCOMPRESSED,
            chksum,
        );
        Ok(())
    }

    fn store_block_location(&mut self, offset: u64, size: u32, chksum: u32) {
        self.blocks.push(BlkInfo {
            offset,
            hash: mk_blk_hash(chksum, size),
        });
    }

    /// Smallest index of an earlier run of the location log matching this
    /// file's run; the file's own start when there is none
    fn deduplicate_blocks(&self, count: usize) -> usize {
        for i in 0..self.file_start {
            let mut j = 0;
            while j < count {
                if self.blocks[i + j].hash != self.blocks[self.file_start + j].hash {
                    break;
                }
                j += 1;
            }
            if j == count {
                return i;
            }
        }
        self.file_start
    }

    fn process_completed_block(&mut self, block: Block) -> Result<(), SqfsError> {
        if block.flags & BLK_FIRST_BLOCK != 0 {
            self.start = self.file_size;
            self.file_start = self.blocks.len();
            self.align_file(block.flags)?;
        }

        if !block.data.is_empty() {
            let mut out = block.data.len() as u32;
            if block.flags & BLK_IS_COMPRESSED == 0 {
                out |= DATA_STORED_UNCOMPRESSED;
            }
            let offset = self.file_size;

            if block.flags & BLK_FRAGMENT_BLOCK != 0 {
                self.fragments[block.index as usize] = Fragment::new(offset, DataSize(out));
                self.stats.frag_blocks_written += 1;
            } else {
                let packed = &mut self.files[block.file_id as usize];
                debug_assert_eq!(packed.block_sizes.len(), block.index as usize);
                packed.block_sizes.push(DataSize(out));
                self.stats.blocks_written += 1;
            }

            self.store_block_location(offset, out, block.checksum);
            self.file.write_all(&block.data)?;
            self.file_size += block.data.len() as u64;
        }

        if block.flags & BLK_LAST_BLOCK != 0 {
            self.align_file(block.flags)?;

            let count = self.blocks.len() - self.file_start;
            if count == 0 {
                return Ok(());
            }

            let start = self.deduplicate_blocks(count);
            self.files[block.file_id as usize].start_block = self.blocks[start].offset;

            if start >= self.file_start {
                return Ok(());
            }

            trace!(
                "duplicate block run, rewinding to {:#x}",
                self.blocks[start].offset
            );
            self.stats.duplicate_blocks += count as u64;

            let end = start + count;
            if end >= self.file_start {
                self.blocks.truncate(end);
            } else {
                self.blocks.truncate(self.file_start);
            }

            self.file.truncate(self.start)?;
            self.file.seek(SeekFrom::Start(self.start))?;
            self.file_size = self.start;
        }

        Ok(())
    }

    /// Dedup the tail against every fragment seen so far, append it to the
    /// open fragment block otherwise. Returns the previous fragment block
    /// when this tail made it overflow.
    fn process_completed_fragment(
        &mut self,
        frag: Block,
    ) -> Result<Option<Block>, SqfsError> {
        let size = frag.data.len() as u32;
        let hash = mk_blk_hash(frag.checksum, size);

        if let Some(info) = self.frag_list.iter().find(|info| info.hash == hash) {
            trace!("duplicate fragment, reusing {}:{}", info.index, info.offset);
            self.files[frag.file_id as usize].fragment = Some((info.index, info.offset));
            self.stats.duplicate_frags += 1;
            return Ok(None);
        }

        let mut closed = None;
        if let Some(frag_block) = &self.frag_block {
            if frag_block.data.len() + frag.data.len() > self.block_size as usize {
                closed = self.frag_block.take();
            }
        }

        if self.frag_block.is_none() {
            let index = self.fragments.len() as u32;
            self.fragments.push(Fragment::new(0, DataSize::new(0, true)));
            self.frag_block = Some(Block {
                sequence: 0,
                index,
                flags: BLK_FRAGMENT_BLOCK | (frag.flags & BLK_DONT_COMPRESS),
                file_id: u32::MAX,
                checksum: 0,
                data: Vec::with_capacity(self.block_size as usize),
            });
        }

        let frag_block = self.frag_block.as_mut().unwrap();
        let offset = frag_block.data.len() as u32;
        self.frag_list.push(FragInfo {
            index: frag_block.index,
            offset,
            hash,
        });
        self.files[frag.file_id as usize].fragment = Some((frag_block.index, offset));
        frag_block.data.extend_from_slice(&frag.data);
        self.stats.frag_count += 1;
        Ok(closed)
    }

    /// Drain the pipeline, join every worker, then compress and apply the
    /// still-open fragment block on the calling thread.
    ///
    /// Must be called exactly once, also on the error path; the first error
    /// observed anywhere in the pipeline is returned.
    #[instrument(skip_all)]
    pub fn finish(&mut self) -> Result<(), SqfsError> {
        self.finished = true;

        // wakes the workers even when enqueue never had to
        let mut result = self.append_to_work_queue(None, true);

        if result.is_ok() {
            while self.current_backlog() > 0 {
                if let Err(error) = self.wait_completed() {
                    result = Err(error);
                    break;
                }
            }
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.status == PipeStatus::Ok {
                state.status = PipeStatus::Cancelled;
            }
            self.shared.queue_cond.notify_all();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }

        result?;

        if let Some(mut frag_block) = self.frag_block.take() {
            do_block(&mut frag_block, &self.cmp)?;
            self.process_completed_block(frag_block)?;
        }
        Ok(())
    }

    /// Tear the writer apart after [`Self::finish`]
    pub fn into_parts(self) -> (W, Vec<PackedFile>, Vec<Fragment>, PackStats) {
        debug_assert!(self.finished);
        (self.file, self.files, self.fragments, self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compressor::Compressor;

    fn writer(num_workers: usize) -> DataWriter<Cursor<Vec<u8>>> {
        let cmp = FilesystemCompressor::new(Compressor::Gzip, None, 4096).unwrap();
        DataWriter::new(Cursor::new(vec![]), cmp, 4096, num_workers, 10, 0).unwrap()
    }

    #[test]
    fn test_datasize_bits() {
        let compressed = DataSize::new(100, false);
        assert!(!compressed.uncompressed());
        assert_eq!(compressed.size(), 100);

        let raw = DataSize::new(4096, true);
        assert!(raw.uncompressed());
        assert_eq!(raw.size(), 4096);
        assert_eq!(raw.raw(), 4096 | (1 << 24));
    }

    #[test]
    fn test_blk_hash_packs_size_and_checksum() {
        assert_eq!(mk_blk_hash(0xdead_beef, 0x123), 0x0000_0123_dead_beef);
    }

    #[test]
    fn test_identical_files_are_deduplicated() {
        let mut writer = writer(1);
        let contents = vec![0x42u8; 4096 * 2];

        let a = writer
            .write_file(&mut Cursor::new(contents.clone()), contents.len() as u64, 0)
            .unwrap();
        let b = writer
            .write_file(&mut Cursor::new(contents.clone()), contents.len() as u64, 0)
            .unwrap();
        writer.finish().unwrap();

        let (file, files, _fragments, stats) = writer.into_parts();
        assert_eq!(files[a as usize].start_block, files[b as usize].start_block);
        assert_eq!(files[a as usize].block_sizes, files[b as usize].block_sizes);
        assert_eq!(stats.duplicate_blocks, 2);

        // the image holds one copy of the two compressed blocks
        let disk_len: u64 = files[a as usize]
            .block_sizes
            .iter()
            .map(|s| u64::from(s.size()))
            .sum();
        assert_eq!(file.get_ref().len() as u64, disk_len);
    }

    #[test]
    fn test_fragment_tail_deduplicated() {
        let mut writer = writer(2);
        let contents = b"short tail that fits a fragment".to_vec();

        let a = writer
            .write_file(&mut Cursor::new(contents.clone()), contents.len() as u64, 0)
            .unwrap();
        let b = writer
            .write_file(&mut Cursor::new(contents.clone()), contents.len() as u64, 0)
            .unwrap();
        writer.finish().unwrap();

        let (_, files, fragments, stats) = writer.into_parts();
        let frag_a = files[a as usize].fragment.unwrap();
        let frag_b = files[b as usize].fragment.unwrap();
        assert_eq!(frag_a, frag_b);
        assert_eq!(fragments.len(), 1);
        assert_eq!(stats.duplicate_frags, 1);
        assert!(files[a as usize].block_sizes.is_empty());
    }

    #[test]
    fn test_fragment_block_reinjection_keeps_layout() {
        // enough distinct tails to overflow the 4 KiB fragment block twice,
        // interleaved with full blocks, repeated for both worker counts
        let build = |workers| {
            let mut writer = writer(workers);
            for i in 0u32..8 {
                let tail = vec![i as u8; 1500];
                writer
                    .write_file(&mut Cursor::new(tail), 1500, 0)
                    .unwrap();
                let full = vec![0x80 | i as u8; 4096];
                writer.write_file(&mut Cursor::new(full), 4096, 0).unwrap();
            }
            writer.finish().unwrap();
            let (file, files, fragments, _) = writer.into_parts();
            (file.into_inner(), files, fragments)
        };

        let (image_1, files_1, fragments_1) = build(1);
        let (image_4, files_4, fragments_4) = build(4);

        assert!(fragments_1.len() >= 2);
        assert_eq!(image_1, image_4);
        assert_eq!(fragments_1, fragments_4);
        for (a, b) in files_1.iter().zip(&files_4) {
            assert_eq!(a.start_block, b.start_block);
            assert_eq!(a.fragment, b.fragment);
        }
    }

    #[test]
    fn test_finish_flushes_open_fragment_block() {
        let mut writer = writer(1);
        writer
            .write_file(&mut Cursor::new(vec![7u8; 100]), 100, 0)
            .unwrap();
        writer.finish().unwrap();

        let (file, files, fragments, _) = writer.into_parts();
        assert_eq!(fragments.len(), 1);
        assert_eq!(files[0].fragment, Some((0, 0)));
        assert_eq!(u64::from(fragments[0].start), 0);
        assert!(!file.get_ref().is_empty());
    }

    #[test]
    fn test_dont_fragment_stores_tail_as_block() {
        let mut writer = writer(1);
        writer
            .write_file(
                &mut Cursor::new(vec![7u8; 100]),
                100,
                BLK_DONT_FRAGMENT,
            )
            .unwrap();
        writer.finish().unwrap();

        let (_, files, fragments, _) = writer.into_parts();
        assert!(fragments.is_empty());
        assert_eq!(files[0].fragment, None);
        assert_eq!(files[0].block_sizes.len(), 1);
    }
}
