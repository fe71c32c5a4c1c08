//! Lock-free Single-Producer Single-Consumer 字节 Ring Buffer
//!
//! 设计目标：
//! - 零锁：读写两端各自只写自己的游标，只读对方的游标，不需要 CAS 或 Mutex
//! - 零分配：容量在创建时确定，之后绝不分配
//! - 缓存友好：两个游标各自独占一个 cache line，避免 false sharing
//! - 内存锁定：可选 mlock 防止实时路径上的 page fault
//!
//! 容量总是 2 的幂。始终保留一个字节用于区分"满"和"空"：
//! `write == read` 定义为空，因此最多可同时存放 `capacity - 1` 字节。
//!
//! 用法：`RingBuffer::new` 创建后调用 [`RingBuffer::split`]，
//! 把 [`Writer`] 交给写线程、[`Reader`] 交给读线程。
//! 每一端只能被一个线程使用，这一约束由 `&mut self` 保证。

use std::cell::UnsafeCell;
use std::collections::TryReserveError;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

/// Ring buffer 错误
#[derive(Debug, thiserror::Error)]
pub enum RingBufferError {
    #[error("ring buffer size {0} cannot be rounded up to a power of two")]
    CapacityOverflow(usize),
    #[error("failed to allocate {size} bytes for ring buffer")]
    Alloc {
        size: usize,
        #[source]
        source: TryReserveError,
    },
    #[error("failed to lock ring buffer memory")]
    Mlock(#[source] std::io::Error),
    #[error("writer and reader belong to different ring buffers")]
    Mismatched,
}

/// 读写两端共享的存储
///
/// 游标保存的是已经 mask 过的下标（0..size）。
/// 写端只 store `write_ptr`，读端只 store `read_ptr`。
struct Shared {
    buf: Box<[UnsafeCell<u8>]>,
    size: usize,
    mask: usize,
    write_ptr: CachePadded<AtomicUsize>,
    read_ptr: CachePadded<AtomicUsize>,
    mlocked: AtomicBool,
}

// SAFETY: 缓冲区只通过 Writer/Reader 访问。写端只触碰 [write, read-1) 区间，
// 读端只触碰 [read, write) 区间，两个区间不相交；
// 游标的 Release/Acquire 保证字节在游标推进之前对另一端可见。
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    fn with_size(sz: usize) -> Result<Self, RingBufferError> {
        let size = sz
            .checked_next_power_of_two()
            .ok_or(RingBufferError::CapacityOverflow(sz))?;

        let mut storage: Vec<UnsafeCell<u8>> = Vec::new();
        storage
            .try_reserve_exact(size)
            .map_err(|source| RingBufferError::Alloc { size, source })?;
        storage.resize_with(size, || UnsafeCell::new(0));

        Ok(Self {
            buf: storage.into_boxed_slice(),
            size,
            mask: size - 1,
            write_ptr: CachePadded::new(AtomicUsize::new(0)),
            read_ptr: CachePadded::new(AtomicUsize::new(0)),
            mlocked: AtomicBool::new(false),
        })
    }

    #[inline]
    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.buf.as_ptr())
    }

    #[inline]
    fn read_space_of(&self, w: usize, r: usize) -> usize {
        if w > r {
            w - r
        } else {
            w.wrapping_sub(r).wrapping_add(self.size) & self.mask
        }
    }

    #[inline]
    fn write_space_of(&self, w: usize, r: usize) -> usize {
        if w > r {
            (r.wrapping_sub(w).wrapping_add(self.size) & self.mask) - 1
        } else if w < r {
            r - w - 1
        } else {
            self.size - 1
        }
    }

    /// 把从 `start` 开始、长度 `len` 的区间拆成最多两段连续区域
    #[inline]
    fn split_at_end(&self, start: usize, len: usize) -> (usize, usize) {
        let end = start + len;
        if end > self.size {
            (self.size - start, end & self.mask)
        } else {
            (len, 0)
        }
    }

    #[inline]
    fn read_space(&self) -> usize {
        let w = self.write_ptr.load(Ordering::Acquire);
        let r = self.read_ptr.load(Ordering::Acquire);
        self.read_space_of(w, r)
    }

    #[inline]
    fn write_space(&self) -> usize {
        let w = self.write_ptr.load(Ordering::Acquire);
        let r = self.read_ptr.load(Ordering::Acquire);
        self.write_space_of(w, r)
    }

    fn mlock(&self) -> Result<(), RingBufferError> {
        if self.mlocked.load(Ordering::Acquire) {
            return Ok(());
        }

        let result = os::mlock(self.base() as *const u8, self.size);
        match result {
            Ok(()) => {
                self.mlocked.store(true, Ordering::Release);
                log::debug!("Ring buffer memory locked: {} bytes", self.size);
                Ok(())
            }
            Err(e) => {
                log::warn!("Failed to lock ring buffer memory: {}", e);
                Err(RingBufferError::Mlock(e))
            }
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        if self.mlocked.load(Ordering::Acquire) {
            os::munlock(self.base() as *const u8, self.size);
            log::debug!("Ring buffer memory unlocked");
        }
    }
}

#[cfg(unix)]
mod os {
    pub fn mlock(ptr: *const u8, len: usize) -> std::io::Result<()> {
        // SAFETY: ptr/len 描述的是 Shared 持有的整块存储
        let result = unsafe { libc::mlock(ptr as *const libc::c_void, len) };
        if result == 0 {
            Ok(())
        } else {
            Err(std::io::Error::last_os_error())
        }
    }

    pub fn munlock(ptr: *const u8, len: usize) {
        // SAFETY: 同上，只解锁之前锁定的区域
        unsafe {
            libc::munlock(ptr as *const libc::c_void, len);
        }
    }
}

#[cfg(not(unix))]
mod os {
    pub fn mlock(_ptr: *const u8, _len: usize) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "mlock is not available on this platform",
        ))
    }

    pub fn munlock(_ptr: *const u8, _len: usize) {}
}

/// SPSC 无锁字节环形缓冲区（未拆分状态）
///
/// 未拆分时持有者拥有独占访问权，因此 [`reset`](Self::reset) 只在这里提供。
pub struct RingBuffer {
    shared: Arc<Shared>,
}

impl RingBuffer {
    /// 创建至少能容纳 `sz` 字节的 Ring Buffer
    ///
    /// 实际容量是不小于 `sz` 的最小 2 的幂，内容清零。
    /// 只有分配失败时才返回错误，不会重试。
    pub fn new(sz: usize) -> Result<Self, RingBufferError> {
        let shared = Shared::with_size(sz)?;
        log::debug!(
            "Ring buffer created: requested {} bytes, capacity {}",
            sz,
            shared.size
        );
        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    /// 容量（字节，2 的幂）
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.size
    }

    /// 当前可读字节数
    #[inline]
    pub fn read_space(&self) -> usize {
        self.shared.read_space()
    }

    /// 当前可写字节数（始终保留一个字节）
    #[inline]
    pub fn write_space(&self) -> usize {
        self.shared.write_space()
    }

    /// 锁定缓冲区内存，防止被换页
    ///
    /// 失败只是被报告，缓冲区依然可用。
    pub fn mlock(&self) -> Result<(), RingBufferError> {
        self.shared.mlock()
    }

    /// 检查内存是否已锁定
    pub fn is_memory_locked(&self) -> bool {
        self.shared.mlocked.load(Ordering::Acquire)
    }

    /// 把两个游标都归零
    ///
    /// 需要独占访问：只能在没有读写线程活动时调用，
    /// 这里用 `&mut self` 表达（拆分后的两端先要 [`reunite`](Self::reunite)）。
    pub fn reset(&mut self) {
        self.shared.read_ptr.store(0, Ordering::Release);
        self.shared.write_ptr.store(0, Ordering::Release);
    }

    /// 拆分为写端和读端
    pub fn split(self) -> (Writer, Reader) {
        let writer = Writer {
            shared: Arc::clone(&self.shared),
        };
        let reader = Reader {
            shared: self.shared,
        };
        (writer, reader)
    }

    /// 把同一个缓冲区的两端重新合并
    pub fn reunite(writer: Writer, reader: Reader) -> Result<Self, RingBufferError> {
        if !Arc::ptr_eq(&writer.shared, &reader.shared) {
            return Err(RingBufferError::Mismatched);
        }
        drop(reader);
        Ok(Self {
            shared: writer.shared,
        })
    }
}

/// 写端：只能被一个线程使用
pub struct Writer {
    shared: Arc<Shared>,
}

impl Writer {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.size
    }

    #[inline]
    pub fn write_space(&self) -> usize {
        self.shared.write_space()
    }

    /// 读端当前可读字节数（仅供参考）
    #[inline]
    pub fn read_space(&self) -> usize {
        self.shared.read_space()
    }

    /// 写入最多 `src.len()` 字节
    ///
    /// 返回实际写入的字节数，空间不足时截断。
    /// 此函数是 wait-free 的，绝不阻塞
    #[inline]
    pub fn write(&mut self, src: &[u8]) -> usize {
        let s = &*self.shared;
        let w = s.write_ptr.load(Ordering::Relaxed);
        let r = s.read_ptr.load(Ordering::Acquire);

        let to_write = src.len().min(s.write_space_of(w, r));
        if to_write == 0 {
            return 0;
        }

        let (n1, n2) = s.split_at_end(w, to_write);
        // SAFETY: [w, w + to_write) 位于写端独占区间，读端不会访问
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), s.base().add(w), n1);
            if n2 > 0 {
                std::ptr::copy_nonoverlapping(src.as_ptr().add(n1), s.base(), n2);
            }
        }

        s.write_ptr.store((w + to_write) & s.mask, Ordering::Release);
        to_write
    }

    /// 手动推进写游标（配合 [`write_vector`](Self::write_vector) 使用）
    ///
    /// 超出可写空间的部分被截断，读游标永远不会越过写游标。
    #[inline]
    pub fn write_advance(&mut self, cnt: usize) {
        let s = &*self.shared;
        let w = s.write_ptr.load(Ordering::Relaxed);
        let r = s.read_ptr.load(Ordering::Acquire);

        let space = s.write_space_of(w, r);
        debug_assert!(cnt <= space, "write_advance past free space");
        let cnt = cnt.min(space);

        s.write_ptr.store((w + cnt) & s.mask, Ordering::Release);
    }

    /// 零拷贝写入：返回当前可写的最多两段连续区域
    ///
    /// 数据不回绕时第二段长度为 0。写完后调用 `write_advance` 提交。
    pub fn write_vector(&mut self) -> [&mut [u8]; 2] {
        let s = &*self.shared;
        let w = s.write_ptr.load(Ordering::Relaxed);
        let r = s.read_ptr.load(Ordering::Acquire);

        let free = s.write_space_of(w, r);
        let (n1, n2) = s.split_at_end(w, free);
        // SAFETY: 两段都位于写端独占区间且互不重叠，借用期间 &mut self 阻止其他写操作
        unsafe {
            [
                std::slice::from_raw_parts_mut(s.base().add(w), n1),
                std::slice::from_raw_parts_mut(s.base(), n2),
            ]
        }
    }

    pub fn is_memory_locked(&self) -> bool {
        self.shared.mlocked.load(Ordering::Acquire)
    }
}

/// 读端：只能被一个线程使用
pub struct Reader {
    shared: Arc<Shared>,
}

impl Reader {
    #[inline]
    pub fn capacity(&self) -> usize {
        self.shared.size
    }

    #[inline]
    pub fn read_space(&self) -> usize {
        self.shared.read_space()
    }

    /// 写端当前可写字节数（仅供参考）
    #[inline]
    pub fn write_space(&self) -> usize {
        self.shared.write_space()
    }

    #[inline]
    fn copy_out(&self, dest: &mut [u8]) -> (usize, usize) {
        let s = &*self.shared;
        let r = s.read_ptr.load(Ordering::Relaxed);
        let w = s.write_ptr.load(Ordering::Acquire);

        let to_read = dest.len().min(s.read_space_of(w, r));
        if to_read == 0 {
            return (r, 0);
        }

        let (n1, n2) = s.split_at_end(r, to_read);
        // SAFETY: [r, r + to_read) 已经由写端 Release 提交，写端不会再触碰
        unsafe {
            std::ptr::copy_nonoverlapping(s.base().add(r), dest.as_mut_ptr(), n1);
            if n2 > 0 {
                std::ptr::copy_nonoverlapping(s.base(), dest.as_mut_ptr().add(n1), n2);
            }
        }
        (r, to_read)
    }

    /// 读取最多 `dest.len()` 字节
    ///
    /// 返回实际读取的字节数。
    /// 此函数是 wait-free 的，绝不阻塞
    #[inline]
    pub fn read(&mut self, dest: &mut [u8]) -> usize {
        let (r, n) = self.copy_out(dest);
        if n > 0 {
            let s = &*self.shared;
            s.read_ptr.store((r + n) & s.mask, Ordering::Release);
        }
        n
    }

    /// 与 `read` 相同但不推进读游标
    #[inline]
    pub fn peek(&self, dest: &mut [u8]) -> usize {
        self.copy_out(dest).1
    }

    /// 手动推进读游标（配合 [`read_vector`](Self::read_vector) 使用）
    ///
    /// 超出可读数据的部分被截断。
    #[inline]
    pub fn read_advance(&mut self, cnt: usize) {
        let s = &*self.shared;
        let r = s.read_ptr.load(Ordering::Relaxed);
        let w = s.write_ptr.load(Ordering::Acquire);

        let available = s.read_space_of(w, r);
        debug_assert!(cnt <= available, "read_advance past written data");
        let cnt = cnt.min(available);

        s.read_ptr.store((r + cnt) & s.mask, Ordering::Release);
    }

    /// 零拷贝读取：返回当前可读的最多两段连续区域
    ///
    /// 数据不回绕时第二段长度为 0。处理完后调用 `read_advance` 消费。
    pub fn read_vector(&self) -> [&[u8]; 2] {
        let s = &*self.shared;
        let r = s.read_ptr.load(Ordering::Relaxed);
        let w = s.write_ptr.load(Ordering::Acquire);

        let available = s.read_space_of(w, r);
        let (n1, n2) = s.split_at_end(r, available);
        // SAFETY: 两段都是已提交的数据，读游标推进前写端不会覆盖
        unsafe {
            [
                std::slice::from_raw_parts(s.base().add(r) as *const u8, n1),
                std::slice::from_raw_parts(s.base() as *const u8, n2),
            ]
        }
    }

    pub fn is_memory_locked(&self) -> bool {
        self.shared.mlocked.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| seed.wrapping_add(i as u8).wrapping_mul(31)).collect()
    }

    #[test]
    fn test_capacity_rounding() {
        for sz in 1..=10_000usize {
            let rb = RingBuffer::new(sz).unwrap();
            assert_eq!(rb.capacity(), sz.next_power_of_two(), "sz = {}", sz);
            assert!(rb.capacity().is_power_of_two());
        }
    }

    #[test]
    fn test_starts_zeroed_and_empty() {
        let rb = RingBuffer::new(16).unwrap();
        assert_eq!(rb.read_space(), 0);
        assert_eq!(rb.write_space(), 15);

        let (_writer, reader) = rb.split();
        let [a, b] = reader.read_vector();
        assert!(a.is_empty() && b.is_empty());
    }

    #[test]
    fn test_write_then_read_exact() {
        let rb = RingBuffer::new(64).unwrap();
        let (mut writer, mut reader) = rb.split();

        for n in 0..64 {
            let data = pattern(n, n as u8);
            let written = writer.write(&data);
            assert_eq!(written, n.min(63));

            let mut out = vec![0u8; written];
            assert_eq!(reader.read(&mut out), written);
            assert_eq!(&out[..], &data[..written]);
            assert_eq!(reader.read_space(), 0);
        }
    }

    #[test]
    fn test_write_truncates_to_free_space() {
        let rb = RingBuffer::new(8).unwrap();
        let (mut writer, mut reader) = rb.split();

        assert_eq!(writer.write(&[1, 2, 3, 4, 5, 6, 7, 8, 9]), 7);
        assert_eq!(writer.write(&[10]), 0);

        let mut out = [0u8; 16];
        assert_eq!(reader.read(&mut out), 7);
        assert_eq!(&out[..7], &[1, 2, 3, 4, 5, 6, 7]);
        assert_eq!(reader.read(&mut out), 0);
    }

    #[test]
    fn test_full_and_empty() {
        let rb = RingBuffer::new(32).unwrap();
        let cap = rb.capacity();
        let (mut writer, mut reader) = rb.split();

        // 先错开游标，让"满"发生在回绕位置
        writer.write(&[0u8; 20]);
        reader.read_advance(20);

        assert_eq!(writer.write(&pattern(cap - 1, 3)), cap - 1);
        assert_eq!(writer.write_space(), 0);
        assert_eq!(reader.read_space(), cap - 1);

        let mut out = vec![0u8; cap];
        assert_eq!(reader.read(&mut out), cap - 1);
        assert_eq!(reader.read_space(), 0);
        assert_eq!(writer.write_space(), cap - 1);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let rb = RingBuffer::new(16).unwrap();
        let (mut writer, mut reader) = rb.split();

        // 让数据跨过缓冲区末尾
        writer.write(&[0u8; 12]);
        reader.read_advance(12);
        let data = pattern(10, 7);
        assert_eq!(writer.write(&data), 10);

        let mut peeked = [0u8; 10];
        assert_eq!(reader.peek(&mut peeked), 10);
        assert_eq!(reader.read_space(), 10);

        let mut read = [0u8; 10];
        assert_eq!(reader.read(&mut read), 10);
        assert_eq!(peeked, read);
        assert_eq!(&read[..], &data[..]);
    }

    #[test]
    fn test_vectors_track_space_across_wrap() {
        let rb = RingBuffer::new(32).unwrap();
        let (mut writer, mut reader) = rb.split();
        let chunks = [5usize, 13, 7, 31, 1, 17, 22, 3, 9, 30];

        let mut out = vec![0u8; 64];
        for (i, &chunk) in chunks.iter().cycle().take(200).enumerate() {
            writer.write(&pattern(chunk, i as u8));

            let [w1, w2] = writer.write_vector();
            let write_total = w1.len() + w2.len();
            assert_eq!(write_total, writer.write_space());

            let [r1, r2] = reader.read_vector();
            assert_eq!(r1.len() + r2.len(), reader.read_space());

            let take = (chunk * 3 / 4).max(1);
            reader.read(&mut out[..take]);
        }
    }

    #[test]
    fn test_vector_write_matches_copying_write() {
        let copying = RingBuffer::new(16).unwrap();
        let zero_copy = RingBuffer::new(16).unwrap();
        let (mut cw, mut cr) = copying.split();
        let (mut zw, mut zr) = zero_copy.split();

        let mut round = 0u8;
        for chunk in [6usize, 9, 11, 4, 15, 2, 13, 8] {
            let data = pattern(chunk, round);
            round = round.wrapping_add(1);

            let written = cw.write(&data);

            let [first, second] = zw.write_vector();
            let n1 = written.min(first.len());
            first[..n1].copy_from_slice(&data[..n1]);
            let n2 = written - n1;
            second[..n2].copy_from_slice(&data[n1..written]);
            zw.write_advance(written);

            let mut a = vec![0u8; 16];
            let mut b = vec![0u8; 16];
            let got_a = cr.read(&mut a);
            let got_b = zr.read(&mut b);
            assert_eq!(got_a, got_b);
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_read_vector_then_advance() {
        let rb = RingBuffer::new(8).unwrap();
        let (mut writer, mut reader) = rb.split();

        writer.write(&[0u8; 6]);
        reader.read_advance(6);
        writer.write(&[1, 2, 3, 4, 5]);

        let [a, b] = reader.read_vector();
        assert_eq!(a, &[1, 2]);
        assert_eq!(b, &[3, 4, 5]);

        reader.read_advance(3);
        let mut rest = [0u8; 4];
        assert_eq!(reader.read(&mut rest), 2);
        assert_eq!(&rest[..2], &[4, 5]);
    }

    #[test]
    fn test_reset_requires_reunite() {
        let rb = RingBuffer::new(8).unwrap();
        let (mut writer, reader) = rb.split();
        writer.write(&[1, 2, 3]);

        let mut rb = RingBuffer::reunite(writer, reader).unwrap();
        assert_eq!(rb.read_space(), 3);
        rb.reset();
        assert_eq!(rb.read_space(), 0);
        assert_eq!(rb.write_space(), 7);
    }

    #[test]
    fn test_reunite_rejects_foreign_halves() {
        let (w1, _r1) = RingBuffer::new(8).unwrap().split();
        let (_w2, r2) = RingBuffer::new(8).unwrap().split();
        assert!(matches!(
            RingBuffer::reunite(w1, r2),
            Err(RingBufferError::Mismatched)
        ));
    }

    #[test]
    fn test_mlock_is_best_effort() {
        let rb = RingBuffer::new(4096).unwrap();
        // RLIMIT_MEMLOCK 可能很小，失败也不影响使用
        let locked = rb.mlock().is_ok();
        assert_eq!(rb.is_memory_locked(), locked);

        let (mut writer, mut reader) = rb.split();
        assert_eq!(writer.write(b"still usable"), 12);
        let mut out = [0u8; 12];
        assert_eq!(reader.read(&mut out), 12);
        assert_eq!(&out, b"still usable");
    }

    #[test]
    fn test_cross_thread_stream() {
        const TOTAL: usize = 1 << 20;

        let rb = RingBuffer::new(1000).unwrap();
        let (mut writer, mut reader) = rb.split();

        let producer = std::thread::spawn(move || {
            let mut sent = 0usize;
            let mut chunk = [0u8; 97];
            while sent < TOTAL {
                let n = chunk.len().min(TOTAL - sent);
                for (i, b) in chunk[..n].iter_mut().enumerate() {
                    *b = ((sent + i) % 251) as u8;
                }
                let mut off = 0;
                while off < n {
                    let written = writer.write(&chunk[off..n]);
                    if written == 0 {
                        std::thread::yield_now();
                    }
                    off += written;
                }
                sent += n;
            }
        });

        let mut received = 0usize;
        let mut buf = [0u8; 61];
        while received < TOTAL {
            let n = reader.read(&mut buf);
            if n == 0 {
                std::thread::yield_now();
                continue;
            }
            for (i, &b) in buf[..n].iter().enumerate() {
                assert_eq!(b, ((received + i) % 251) as u8);
            }
            received += n;
        }

        producer.join().unwrap();
        assert_eq!(reader.read_space(), 0);
    }

    #[test]
    fn test_cache_padded_cursors() {
        assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() >= 64);
    }
}
