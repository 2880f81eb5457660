//! Kernel binder transport.
//!
//! One `BinderDriver` owns one open binder node plus its read-only mmap
//! window. Client stubs drive [`BinderDriver::transact`]; host services
//! enter the looper and pump [`BinderDriver::poll_once`] from their own
//! thread. Every structure here mirrors the kernel uapi (`binder.h`) for
//! 64-bit hosts.

use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::fd::AsRawFd;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use nix::poll::{PollFd, PollFlags, poll};
use nix::sys::mman::{MapFlags, ProtFlags, mmap, munmap};

use crate::parcel::Parcel;

/// Receive window: 1 MiB minus two guard pages, as libbinder sizes it.
const BINDER_VM_SIZE: usize = 1024 * 1024 - 8192;

const BINDER_CURRENT_PROTOCOL_VERSION: i32 = 8;

pub const TF_ONE_WAY: u32 = 0x01;
pub const TF_STATUS_CODE: u32 = 0x08;
pub const TF_ACCEPT_FDS: u32 = 0x10;

// _IO macro family, for the driver command stream (not ioctl numbers).
const fn bio(kind: u8, nr: u8) -> u32 {
    ((kind as u32) << 8) | nr as u32
}
const fn biow(kind: u8, nr: u8, size: usize) -> u32 {
    (1 << 30) | ((size as u32) << 16) | ((kind as u32) << 8) | nr as u32
}
const fn bior(kind: u8, nr: u8, size: usize) -> u32 {
    (2 << 30) | ((size as u32) << 16) | ((kind as u32) << 8) | nr as u32
}

const TRANSACTION_DATA_SIZE: usize = std::mem::size_of::<BinderTransactionData>();
const PTR_COOKIE_SIZE: usize = 16;

const BC_TRANSACTION: u32 = biow(b'c', 0, TRANSACTION_DATA_SIZE);
const BC_REPLY: u32 = biow(b'c', 1, TRANSACTION_DATA_SIZE);
const BC_FREE_BUFFER: u32 = biow(b'c', 3, 8);
const BC_INCREFS: u32 = biow(b'c', 4, 4);
const BC_ACQUIRE: u32 = biow(b'c', 5, 4);
const BC_INCREFS_DONE: u32 = biow(b'c', 8, PTR_COOKIE_SIZE);
const BC_ACQUIRE_DONE: u32 = biow(b'c', 9, PTR_COOKIE_SIZE);
const BC_ENTER_LOOPER: u32 = bio(b'c', 12);
const BC_EXIT_LOOPER: u32 = bio(b'c', 13);
const BC_DEAD_BINDER_DONE: u32 = biow(b'c', 16, 8);

const BR_ERROR: u32 = bior(b'r', 0, 4);
const BR_OK: u32 = bio(b'r', 1);
const BR_TRANSACTION: u32 = bior(b'r', 2, TRANSACTION_DATA_SIZE);
const BR_REPLY: u32 = bior(b'r', 3, TRANSACTION_DATA_SIZE);
const BR_DEAD_REPLY: u32 = bio(b'r', 5);
const BR_TRANSACTION_COMPLETE: u32 = bio(b'r', 6);
const BR_INCREFS: u32 = bior(b'r', 7, PTR_COOKIE_SIZE);
const BR_ACQUIRE: u32 = bior(b'r', 8, PTR_COOKIE_SIZE);
const BR_RELEASE: u32 = bior(b'r', 9, PTR_COOKIE_SIZE);
const BR_DECREFS: u32 = bior(b'r', 10, PTR_COOKIE_SIZE);
const BR_NOOP: u32 = bio(b'r', 12);
const BR_SPAWN_LOOPER: u32 = bio(b'r', 13);
const BR_DEAD_BINDER: u32 = bior(b'r', 15, 8);
const BR_FAILED_REPLY: u32 = bio(b'r', 17);

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct BinderWriteRead {
    write_size: u64,
    write_consumed: u64,
    write_buffer: u64,
    read_size: u64,
    read_consumed: u64,
    read_buffer: u64,
}

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct BinderTransactionData {
    /// Handle for outgoing calls, local object pointer for incoming ones.
    target: u64,
    cookie: u64,
    code: u32,
    flags: u32,
    sender_pid: i32,
    sender_euid: u32,
    data_size: u64,
    offsets_size: u64,
    data_buffer: u64,
    data_offsets: u64,
}

#[repr(C)]
struct BinderVersion {
    protocol_version: i32,
}

nix::ioctl_readwrite!(binder_write_read, b'b', 1, BinderWriteRead);
nix::ioctl_write_ptr!(binder_set_max_threads, b'b', 5, u32);
nix::ioctl_readwrite!(binder_version, b'b', 9, BinderVersion);

#[derive(Debug, thiserror::Error)]
pub enum TransactError {
    #[error("remote object is dead")]
    DeadBinder,
    #[error("transaction failed with driver status {0}")]
    Failed(i32),
    #[error("binder driver error: {0}")]
    Driver(#[from] nix::Error),
    #[error("malformed driver stream: {0}")]
    Protocol(String),
}

/// A request that arrived at one of our local objects.
pub struct IncomingTransaction {
    /// The local object pointer we registered with the service manager.
    pub target: u64,
    pub code: u32,
    pub flags: u32,
    pub parcel: Parcel,
}

/// Outcome of dispatching an incoming transaction.
pub enum Dispatch {
    Reply(Parcel),
    /// Explicit protocol error surfaced to the caller as a status reply.
    Error(i32),
}

struct Mapping {
    addr: *mut std::ffi::c_void,
    len: usize,
}

// The mapping is read-only and owned exclusively by this driver.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Drop for Mapping {
    fn drop(&mut self) {
        if let Err(err) = unsafe { munmap(self.addr, self.len) } {
            tracing::warn!("munmap of binder window failed: {err}");
        }
    }
}

pub struct BinderDriver {
    file: File,
    _map: Mapping,
    /// Serializes write/read cycles; the kernel keeps per-thread state but
    /// this driver object is deliberately single-streamed.
    io: Mutex<()>,
}

impl BinderDriver {
    /// Open a binder node and map its receive window.
    pub fn open(device: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(device)
            .with_context(|| format!("failed to open {}", device.display()))?;

        let mut version = BinderVersion { protocol_version: 0 };
        unsafe { binder_version(file.as_raw_fd(), &mut version) }
            .context("BINDER_VERSION ioctl failed")?;
        if version.protocol_version != BINDER_CURRENT_PROTOCOL_VERSION {
            anyhow::bail!(
                "kernel binder protocol {} != expected {}",
                version.protocol_version,
                BINDER_CURRENT_PROTOCOL_VERSION
            );
        }

        let addr = unsafe {
            mmap(
                None,
                NonZeroUsize::new(BINDER_VM_SIZE).unwrap(),
                ProtFlags::PROT_READ,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_NORESERVE,
                Some(&file),
                0,
            )
        }
        .with_context(|| format!("failed to map {}", device.display()))?;

        let max_threads: u32 = 0;
        unsafe { binder_set_max_threads(file.as_raw_fd(), &max_threads) }
            .context("BINDER_SET_MAX_THREADS ioctl failed")?;

        Ok(Self {
            file,
            _map: Mapping { addr, len: BINDER_VM_SIZE },
            io: Mutex::new(()),
        })
    }

    fn write_read(&self, write: &mut Vec<u8>, read: Option<&mut Vec<u8>>) -> Result<usize, TransactError> {
        let (read_ptr, read_size) = match &read {
            Some(buf) => (buf.as_ptr() as u64, buf.len() as u64),
            None => (0, 0),
        };
        let mut bwr = BinderWriteRead {
            write_size: write.len() as u64,
            write_consumed: 0,
            write_buffer: write.as_ptr() as u64,
            read_size,
            read_consumed: 0,
            read_buffer: read_ptr,
        };
        unsafe { binder_write_read(self.file.as_raw_fd(), &mut bwr) }?;
        write.drain(..bwr.write_consumed as usize);
        Ok(bwr.read_consumed as usize)
    }

    /// Synchronous call into a remote object. For oneway flags the call
    /// returns an empty parcel as soon as the kernel queued it.
    pub fn transact(
        &self,
        handle: u32,
        code: u32,
        request: &Parcel,
        flags: u32,
    ) -> Result<Parcel, TransactError> {
        let _guard = self.io.lock().unwrap();

        let data = BinderTransactionData {
            target: handle as u64,
            cookie: 0,
            code,
            flags: flags | TF_ACCEPT_FDS,
            sender_pid: 0,
            sender_euid: 0,
            data_size: request.data().len() as u64,
            offsets_size: (request.objects().len() * 8) as u64,
            data_buffer: request.data().as_ptr() as u64,
            data_offsets: request.objects().as_ptr() as u64,
        };
        let mut write = Vec::with_capacity(4 + TRANSACTION_DATA_SIZE);
        write.extend_from_slice(&BC_TRANSACTION.to_le_bytes());
        write.extend_from_slice(struct_bytes(&data));

        let oneway = flags & TF_ONE_WAY != 0;
        let mut read = vec![0u8; 4096];

        loop {
            let consumed = self.write_read(&mut write, Some(&mut read))?;
            let mut stream = CommandStream::new(&read[..consumed]);
            while let Some(cmd) = stream.next_command()? {
                match cmd {
                    BR_NOOP | BR_OK | BR_SPAWN_LOOPER => {}
                    BR_TRANSACTION_COMPLETE => {
                        if oneway {
                            self.flush(&mut write)?;
                            return Ok(Parcel::new());
                        }
                    }
                    BR_DEAD_REPLY => {
                        self.flush(&mut write)?;
                        return Err(TransactError::DeadBinder);
                    }
                    BR_FAILED_REPLY => {
                        self.flush(&mut write)?;
                        return Err(TransactError::Failed(-1));
                    }
                    BR_ERROR => {
                        let status = stream.read_i32()?;
                        self.flush(&mut write)?;
                        return Err(TransactError::Failed(status));
                    }
                    BR_REPLY => {
                        let reply = stream.read_transaction_data()?;
                        let parcel = self.copy_reply(&reply);
                        write.extend_from_slice(&BC_FREE_BUFFER.to_le_bytes());
                        write.extend_from_slice(&reply.data_buffer.to_le_bytes());
                        self.flush(&mut write)?;
                        if reply.flags & TF_STATUS_CODE != 0 {
                            let mut parcel = parcel?;
                            let status = parcel.read_i32().unwrap_or(-1);
                            if status != 0 {
                                return Err(TransactError::Failed(status));
                            }
                            return Ok(Parcel::new());
                        }
                        return parcel;
                    }
                    BR_INCREFS | BR_ACQUIRE => {
                        let (ptr, cookie) = stream.read_ptr_cookie()?;
                        let done = if cmd == BR_INCREFS { BC_INCREFS_DONE } else { BC_ACQUIRE_DONE };
                        write.extend_from_slice(&done.to_le_bytes());
                        write.extend_from_slice(&ptr.to_le_bytes());
                        write.extend_from_slice(&cookie.to_le_bytes());
                    }
                    BR_RELEASE | BR_DECREFS => {
                        let _ = stream.read_ptr_cookie()?;
                    }
                    BR_DEAD_BINDER => {
                        let cookie = stream.read_u64()?;
                        write.extend_from_slice(&BC_DEAD_BINDER_DONE.to_le_bytes());
                        write.extend_from_slice(&cookie.to_le_bytes());
                    }
                    other => {
                        return Err(TransactError::Protocol(format!(
                            "unexpected return command {other:#x}"
                        )));
                    }
                }
            }
        }
    }

    fn copy_reply(&self, data: &BinderTransactionData) -> Result<Parcel, TransactError> {
        // Reply payloads live in our mmap window until BC_FREE_BUFFER.
        let bytes = unsafe {
            std::slice::from_raw_parts(data.data_buffer as *const u8, data.data_size as usize)
        }
        .to_vec();
        let objects = unsafe {
            std::slice::from_raw_parts(
                data.data_offsets as *const u64,
                (data.offsets_size / 8) as usize,
            )
        }
        .to_vec();
        Ok(Parcel::from_bytes(bytes, objects))
    }

    fn flush(&self, write: &mut Vec<u8>) -> Result<(), TransactError> {
        while !write.is_empty() {
            self.write_read(write, None)?;
        }
        Ok(())
    }

    /// Take a strong reference on a handle we intend to keep.
    pub fn acquire(&self, handle: u32) -> Result<(), TransactError> {
        let _guard = self.io.lock().unwrap();
        let mut write = Vec::with_capacity(16);
        write.extend_from_slice(&BC_INCREFS.to_le_bytes());
        write.extend_from_slice(&handle.to_le_bytes());
        write.extend_from_slice(&BC_ACQUIRE.to_le_bytes());
        write.extend_from_slice(&handle.to_le_bytes());
        self.flush(&mut write)
    }

    /// Mark the calling thread as this driver's looper thread.
    pub fn enter_looper(&self) -> Result<(), TransactError> {
        let _guard = self.io.lock().unwrap();
        let mut write = BC_ENTER_LOOPER.to_le_bytes().to_vec();
        self.flush(&mut write)
    }

    pub fn exit_looper(&self) {
        let _guard = self.io.lock().unwrap();
        let mut write = BC_EXIT_LOOPER.to_le_bytes().to_vec();
        let _ = self.flush(&mut write);
    }

    /// Wait up to `timeout_ms` for incoming work and dispatch it. Returns
    /// false on timeout, true when at least one command was handled, so
    /// callers can interleave liveness checks.
    ///
    /// The io lock is released before the handler runs, so a handler may
    /// issue its own transactions on this driver (taking a reference on a
    /// received callback object, for instance).
    pub fn poll_once(
        &self,
        timeout_ms: u16,
        dispatch: &mut dyn FnMut(IncomingTransaction) -> Dispatch,
    ) -> Result<bool, TransactError> {
        {
            let mut fds = [PollFd::new(&self.file, PollFlags::POLLIN)];
            if poll(&mut fds, timeout_ms.into())? == 0 {
                return Ok(false);
            }
        }

        // Phase 1: drain the kernel stream under the lock. Transaction
        // payloads are copied out and their kernel buffers freed right
        // away, so nothing below depends on the mmap window.
        let mut pending = Vec::new();
        {
            let _guard = self.io.lock().unwrap();
            let mut write = Vec::new();
            let mut read = vec![0u8; 4096];
            let consumed = self.write_read(&mut write, Some(&mut read))?;

            let mut stream = CommandStream::new(&read[..consumed]);
            while let Some(cmd) = stream.next_command()? {
                match cmd {
                    BR_NOOP | BR_OK | BR_SPAWN_LOOPER | BR_TRANSACTION_COMPLETE => {}
                    BR_INCREFS | BR_ACQUIRE => {
                        let (ptr, cookie) = stream.read_ptr_cookie()?;
                        let done =
                            if cmd == BR_INCREFS { BC_INCREFS_DONE } else { BC_ACQUIRE_DONE };
                        write.extend_from_slice(&done.to_le_bytes());
                        write.extend_from_slice(&ptr.to_le_bytes());
                        write.extend_from_slice(&cookie.to_le_bytes());
                    }
                    BR_RELEASE | BR_DECREFS => {
                        let _ = stream.read_ptr_cookie()?;
                    }
                    BR_DEAD_BINDER => {
                        let cookie = stream.read_u64()?;
                        write.extend_from_slice(&BC_DEAD_BINDER_DONE.to_le_bytes());
                        write.extend_from_slice(&cookie.to_le_bytes());
                    }
                    BR_ERROR => {
                        let status = stream.read_i32()?;
                        tracing::warn!("binder looper error status {status}");
                    }
                    BR_TRANSACTION => {
                        let data = stream.read_transaction_data()?;
                        let parcel = self.copy_reply(&data)?;
                        write.extend_from_slice(&BC_FREE_BUFFER.to_le_bytes());
                        write.extend_from_slice(&data.data_buffer.to_le_bytes());
                        pending.push((data, parcel));
                    }
                    other => {
                        return Err(TransactError::Protocol(format!(
                            "unexpected return command {other:#x}"
                        )));
                    }
                }
            }
            self.flush(&mut write)?;
        }

        // Phase 2: dispatch and reply without holding the lock.
        for (data, parcel) in pending {
            let oneway = data.flags & TF_ONE_WAY != 0;
            let outcome = dispatch(IncomingTransaction {
                target: data.target,
                code: data.code,
                flags: data.flags,
                parcel,
            });
            if oneway {
                continue;
            }
            let (reply, flags) = match outcome {
                Dispatch::Reply(parcel) => (parcel, 0),
                Dispatch::Error(status) => {
                    let mut parcel = Parcel::new();
                    parcel.write_i32(status);
                    (parcel, TF_STATUS_CODE)
                }
            };
            let reply_data = BinderTransactionData {
                target: 0,
                cookie: 0,
                code: 0,
                flags,
                sender_pid: 0,
                sender_euid: 0,
                data_size: reply.data().len() as u64,
                offsets_size: (reply.objects().len() * 8) as u64,
                data_buffer: reply.data().as_ptr() as u64,
                data_offsets: reply.objects().as_ptr() as u64,
            };
            let _guard = self.io.lock().unwrap();
            let mut write = Vec::with_capacity(4 + TRANSACTION_DATA_SIZE);
            write.extend_from_slice(&BC_REPLY.to_le_bytes());
            write.extend_from_slice(struct_bytes(&reply_data));
            // The reply parcel stays alive until the ioctl returns.
            self.flush(&mut write)?;
        }
        Ok(true)
    }
}

fn struct_bytes<T>(value: &T) -> &[u8] {
    unsafe {
        std::slice::from_raw_parts(value as *const T as *const u8, std::mem::size_of::<T>())
    }
}

/// Sequential reader over the kernel's return-command stream.
struct CommandStream<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> CommandStream<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn next_command(&mut self) -> Result<Option<u32>, TransactError> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        Ok(Some(self.read_u32()?))
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], TransactError> {
        if self.pos + n > self.buf.len() {
            return Err(TransactError::Protocol(format!(
                "truncated command stream at {}",
                self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_u32(&mut self) -> Result<u32, TransactError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn read_i32(&mut self) -> Result<i32, TransactError> {
        Ok(self.read_u32()? as i32)
    }

    fn read_u64(&mut self) -> Result<u64, TransactError> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    fn read_ptr_cookie(&mut self) -> Result<(u64, u64), TransactError> {
        Ok((self.read_u64()?, self.read_u64()?))
    }

    fn read_transaction_data(&mut self) -> Result<BinderTransactionData, TransactError> {
        let bytes = self.take(TRANSACTION_DATA_SIZE)?;
        let mut data = BinderTransactionData::default();
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                &mut data as *mut BinderTransactionData as *mut u8,
                TRANSACTION_DATA_SIZE,
            );
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uapi_struct_sizes_match_the_64_bit_abi() {
        assert_eq!(std::mem::size_of::<BinderWriteRead>(), 48);
        assert_eq!(std::mem::size_of::<BinderTransactionData>(), 64);
    }

    #[test]
    fn command_codes_match_the_kernel_header() {
        // Spot-check against the values in linux/android/binder.h.
        assert_eq!(BC_TRANSACTION, 0x4040_6300);
        assert_eq!(BC_REPLY, 0x4040_6301);
        assert_eq!(BC_FREE_BUFFER, 0x4008_6303);
        assert_eq!(BC_ENTER_LOOPER, 0x0000_630c);
        assert_eq!(BR_TRANSACTION, 0x8040_7202);
        assert_eq!(BR_REPLY, 0x8040_7203);
        assert_eq!(BR_TRANSACTION_COMPLETE, 0x0000_7206);
        assert_eq!(BR_NOOP, 0x0000_720c);
        assert_eq!(BR_DEAD_REPLY, 0x0000_7205);
    }

    #[test]
    fn command_stream_walks_mixed_commands() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BR_NOOP.to_le_bytes());
        buf.extend_from_slice(&BR_ERROR.to_le_bytes());
        buf.extend_from_slice(&(-11i32).to_le_bytes());
        buf.extend_from_slice(&BR_DEAD_BINDER.to_le_bytes());
        buf.extend_from_slice(&0xdead_beefu64.to_le_bytes());

        let mut stream = CommandStream::new(&buf);
        assert_eq!(stream.next_command().unwrap(), Some(BR_NOOP));
        assert_eq!(stream.next_command().unwrap(), Some(BR_ERROR));
        assert_eq!(stream.read_i32().unwrap(), -11);
        assert_eq!(stream.next_command().unwrap(), Some(BR_DEAD_BINDER));
        assert_eq!(stream.read_u64().unwrap(), 0xdead_beef);
        assert_eq!(stream.next_command().unwrap(), None);
    }

    #[test]
    fn command_stream_rejects_truncation() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&BR_TRANSACTION.to_le_bytes());
        buf.extend_from_slice(&[0u8; 10]); // far less than a transaction_data
        let mut stream = CommandStream::new(&buf);
        assert_eq!(stream.next_command().unwrap(), Some(BR_TRANSACTION));
        assert!(stream.read_transaction_data().is_err());
    }

    #[test]
    fn transaction_data_round_trips_through_bytes() {
        let data = BinderTransactionData {
            target: 7,
            code: 42,
            flags: TF_ONE_WAY,
            data_size: 128,
            ..Default::default()
        };
        let bytes = struct_bytes(&data);
        let mut stream = CommandStream::new(bytes);
        let back = stream.read_transaction_data().unwrap();
        assert_eq!(back.target, 7);
        assert_eq!(back.code, 42);
        assert_eq!(back.flags, TF_ONE_WAY);
        assert_eq!(back.data_size, 128);
    }
}
